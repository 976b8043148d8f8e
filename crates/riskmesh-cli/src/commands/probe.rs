use std::time::Instant;

use riskmesh_core::{ProviderId, SourceOrchestrator};

use crate::cli::ProbeArgs;
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &ProbeArgs, orchestrator: &SourceOrchestrator) -> Result<CommandResult, CliError> {
    let provider = ProviderId::parse(&args.provider)?;
    let started = Instant::now();
    let record = orchestrator.monitor().probe_now(&provider).await?;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Ok(CommandResult::ok(serde_json::to_value(&record)?)
        .with_source_chain(vec![provider.to_string()])
        .with_latency(latency_ms))
}
