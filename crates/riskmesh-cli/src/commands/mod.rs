mod cache;
mod fetch;
mod probe;
mod sources;

use riskmesh_core::{OrchestratorConfig, SourceOrchestrator};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::metadata::{Metadata, RequestId};
use crate::output::{Envelope, EnvelopeError};

pub struct CommandResult {
    pub request_id: RequestId,
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<EnvelopeError>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub source_chain: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            request_id: RequestId::new_v4(),
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
            latency_ms: 0,
            cache_hit: false,
            source_chain: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_errors(mut self, errors: Vec<EnvelopeError>) -> Self {
        self.errors.extend(errors);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_source_chain(mut self, source_chain: Vec<String>) -> Self {
        self.source_chain = source_chain;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<Envelope, CliError> {
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_path(path)?,
        None => OrchestratorConfig::from_env()?,
    };
    let orchestrator = config.into_builder()?.build()?;

    let command_result = match &cli.command {
        Command::Fetch(args) => fetch::run(args, cli.timeout_ms, &orchestrator).await?,
        Command::Sources(args) => sources::run(args, &orchestrator)?,
        Command::Cache(args) => cache::run(args, &orchestrator).await?,
        Command::Probe(args) => probe::run(args, &orchestrator).await?,
    };
    shutdown(&orchestrator).await;

    let CommandResult {
        request_id,
        data,
        warnings,
        errors,
        latency_ms,
        cache_hit,
        source_chain,
    } = command_result;

    let mut meta = Metadata::new(request_id, source_chain, latency_ms, cache_hit);
    for warning in warnings {
        meta.push_warning(warning);
    }

    Ok(Envelope { meta, data, errors })
}

async fn shutdown(orchestrator: &SourceOrchestrator) {
    orchestrator.stop().await;
}
