use std::time::Duration;

use riskmesh_core::{Category, FetchOptions, ProviderId, Query, SourceOrchestrator, SourceType};
use serde_json::Value;
use tracing::debug;

use crate::cli::{FetchArgs, SourceTypeArg};
use crate::error::CliError;
use crate::output::EnvelopeError;

use super::CommandResult;

pub async fn run(
    args: &FetchArgs,
    timeout_ms: Option<u64>,
    orchestrator: &SourceOrchestrator,
) -> Result<CommandResult, CliError> {
    let category = Category::parse(&args.category)?;
    let raw_query: Value = serde_json::from_str(&args.query)?;
    let query = Query::from_value(raw_query)?;

    for raw in &args.disable {
        let provider = ProviderId::parse(raw)?;
        orchestrator.set_source_enabled(&provider, false)?;
        debug!(provider = %provider, "disabled for this invocation");
    }

    let mut options = FetchOptions::default();
    if args.skip_cache {
        options = options.skip_cache();
    }
    if let Some(max_cost) = args.max_cost {
        options = options.with_max_cost(max_cost);
    }
    if let Some(source_type) = args.source_type {
        options = options.with_source_type(to_source_type(source_type));
    }
    if let Some(timeout_ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(timeout_ms));
    }

    match orchestrator.fetch(&category, &query, &options).await {
        Ok(result) => {
            let source_chain = if result.cache_hit() {
                vec![String::from("cache")]
            } else {
                result.attempted_sources.iter().map(ToString::to_string).collect()
            };
            let cache_hit = result.cache_hit();
            let mut warnings = result.warnings;
            warnings.extend(result.skipped.iter().map(|skipped| {
                format!("skipped '{}': {}", skipped.provider, skipped.detail)
            }));

            Ok(CommandResult::ok(result.payload)
                .with_request_id(result.request_id.into())
                .with_source_chain(source_chain)
                .with_errors(result.errors.iter().map(EnvelopeError::from).collect())
                .with_warnings(warnings)
                .with_latency(result.latency_ms)
                .with_cache_hit(cache_hit))
        }
        Err(failure) => {
            let mut errors = failure.errors.iter().map(EnvelopeError::from).collect::<Vec<_>>();
            errors.push(EnvelopeError::from(&failure));
            let warnings = failure
                .skipped
                .iter()
                .map(|skipped| format!("skipped '{}': {}", skipped.provider, skipped.detail))
                .collect();

            Ok(CommandResult::ok(Value::Null)
                .with_request_id(failure.request_id.into())
                .with_source_chain(failure.attempted_sources.iter().map(ToString::to_string).collect())
                .with_errors(errors)
                .with_warnings(warnings)
                .with_latency(failure.latency_ms))
        }
    }
}

fn to_source_type(source_type: SourceTypeArg) -> SourceType {
    match source_type {
        SourceTypeArg::Government => SourceType::Government,
        SourceTypeArg::Commercial => SourceType::Commercial,
        SourceTypeArg::Community => SourceType::Community,
    }
}
