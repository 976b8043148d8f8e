use serde_json::json;

use riskmesh_core::SourceOrchestrator;

use crate::cli::{CacheArgs, CacheCommand};
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &CacheArgs, orchestrator: &SourceOrchestrator) -> Result<CommandResult, CliError> {
    let cache = orchestrator.cache();

    let data = match &args.command {
        CacheCommand::Invalidate { pattern } => {
            let removed = cache.invalidate_pattern(pattern).await;
            json!({ "pattern": pattern, "removed": removed })
        }
        CacheCommand::Purge => {
            let purged = cache.purge_expired().await;
            json!({ "purged": purged })
        }
        CacheCommand::Stats => serde_json::to_value(cache.stats())?,
    };

    let mut result = CommandResult::ok(data);
    if !cache.has_durable_tier() {
        result = result.with_warning("durable cache tier is not available; only this process's memory was affected");
    }
    Ok(result)
}
