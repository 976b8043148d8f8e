//! CLI argument definitions for riskmesh.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fetch` | Fetch hazard data for a category and query |
//! | `sources` | List providers with circuit, quota and health state |
//! | `cache` | Invalidate, purge or inspect the response cache |
//! | `probe` | Run one synthetic health probe |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `RISKMESH_CONFIG` | Configuration file |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--timeout-ms` | none | Overall fetch deadline in ms |
//!
//! # Examples
//!
//! ```bash
//! riskmesh fetch earthquake_risk --query '{"lat": 37.77, "lon": -122.41}'
//! riskmesh fetch flood_risk --query '{"lat": 29.95, "lon": -90.07}' --max-cost 0.01
//! riskmesh sources --verbose --pretty
//! riskmesh cache invalidate 'flood_risk:*'
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// riskmesh - environmental-hazard data orchestration CLI
#[derive(Debug, Parser)]
#[command(
    name = "riskmesh",
    author,
    version,
    about = "Environmental-hazard data orchestration CLI",
    long_about = "riskmesh queries seismic, flood, storm, fire and geocoding providers through one \
orchestrator with caching, quotas, circuit breaking and fallback.\n\
\n\
Use 'riskmesh <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Configuration file. Defaults to RISKMESH_CONFIG, then $RISKMESH_HOME/config.json.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Overall deadline for a fetch in milliseconds.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch hazard data for one category and query.
    ///
    /// # Examples
    ///
    ///   riskmesh fetch earthquake_risk --query '{"lat": 37.77, "lon": -122.41}'
    ///   riskmesh fetch flood_risk --query '{"lat": 29.95, "lon": -90.07}' --skip-cache
    ///   riskmesh fetch geocoding --query '{"address": "1 Main St"}' --disable NOMINATIM
    Fetch(FetchArgs),

    /// List registered providers.
    Sources(SourcesArgs),

    /// Manage the response cache.
    Cache(CacheArgs),

    /// Run one synthetic health probe and print the health record.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Category such as earthquake_risk or flood_risk.
    pub category: String,

    /// Query as a JSON object.
    #[arg(long, default_value = "{}")]
    pub query: String,

    /// Do not read the cache; the fresh payload is still stored.
    #[arg(long, default_value_t = false)]
    pub skip_cache: bool,

    /// Only consider providers costing at most this much per call.
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// Only consider providers of this type.
    #[arg(long, value_enum)]
    pub source_type: Option<SourceTypeArg>,

    /// Disable a provider for this invocation (repeatable).
    #[arg(long = "disable", value_name = "PROVIDER")]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceTypeArg {
    Government,
    Commercial,
    Community,
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Include circuit, quota and health details.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Delete every key matching a glob (`*`, `?`) from both tiers.
    Invalidate {
        pattern: String,
    },
    /// Remove expired entries from both tiers.
    Purge,
    /// Show hit/miss counters and tier sizes.
    Stats,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Provider id, e.g. USGS.
    pub provider: String,
}
