use serde::Serialize;

use riskmesh_core::{CircuitState, HealthState, ProviderId, SourceOrchestrator};

use crate::cli::SourcesArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourceSummary {
    id: ProviderId,
    name: String,
    enabled: bool,
    circuit: CircuitState,
    health: HealthState,
    categories: Vec<String>,
}

pub fn run(args: &SourcesArgs, orchestrator: &SourceOrchestrator) -> Result<CommandResult, CliError> {
    let statuses = orchestrator.get_all_source_status();
    let none_configured = statuses.is_empty();

    let mut result = if args.verbose {
        CommandResult::ok(serde_json::json!({ "sources": statuses }))
    } else {
        let sources = statuses
            .into_iter()
            .map(|status| SourceSummary {
                health: status
                    .health
                    .as_ref()
                    .map_or(HealthState::Unknown, |record| record.status),
                categories: status.categories.keys().map(ToString::to_string).collect(),
                circuit: status.circuit.state,
                enabled: status.enabled,
                name: status.name,
                id: status.provider,
            })
            .collect::<Vec<_>>();
        CommandResult::ok(serde_json::json!({ "sources": sources }))
    };

    if none_configured {
        result = result.with_warning("no providers configured; set RISKMESH_CONFIG or pass --config");
    }
    Ok(result)
}
