use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use pawnstorm_core::{
    engine::UciConfig,
    types::{DEFAULT_CATALOG_HOST, DEFAULT_CATALOG_PORT, DEFAULT_MAX_FRAME_BYTES, DEFAULT_WORKER_ROLE},
};
use std::path::PathBuf;

/// Runtime configuration for the `pawnstorm-worker` binary.
///
/// A worker is identified solely by its logical name; the orchestrator finds
/// it by looking that name up in the catalog. All values are parsed from CLI
/// arguments or environment variables, with defaults suitable for a campus
/// cluster where the catalog is reachable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pawnstorm-worker",
    version,
    about = "Serves bounded chess searches to a pawnstorm orchestrator"
)]
pub struct CliArgs {
    /// Logical name this worker registers under, e.g. `alpha-03`.
    ///
    /// Must match `<BASE_NAME>-<NN>` on the orchestrator side.
    ///
    /// Environment variable: `WORKER_NAME`
    #[arg(long, env = "WORKER_NAME")]
    pub name: String,

    /// Address to listen on. Port 0 picks a free port, which is what the
    /// catalog heartbeat advertises.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:0"))]
    pub listen_addr: String,

    /// Path to a UCI engine binary.
    ///
    /// Environment variable: `ENGINE_PATH`
    #[arg(long, env = "ENGINE_PATH", default_value = "bin/stockfish")]
    pub engine_path: PathBuf,

    /// Extra arguments passed to the engine, whitespace separated.
    ///
    /// Environment variable: `ENGINE_ARGS`
    #[arg(long, env = "ENGINE_ARGS", default_value_t = String::new())]
    pub engine_args: String,

    /// How long the engine may take to answer `uci` and `isready`.
    ///
    /// Environment variable: `ENGINE_INIT_TIMEOUT_MS`
    #[arg(long, env = "ENGINE_INIT_TIMEOUT_MS", default_value_t = 30_000)]
    pub engine_init_timeout_ms: u64,

    /// Slack past the due time before the engine is told to `stop`, and again
    /// before it is considered hung.
    ///
    /// Environment variable: `SEARCH_GRACE_MS`
    #[arg(long, env = "SEARCH_GRACE_MS", default_value_t = 500)]
    pub search_grace_ms: u64,

    /// Catalog host receiving heartbeats.
    ///
    /// Environment variable: `CATALOG_HOST`
    #[arg(long, env = "CATALOG_HOST", default_value_t = String::from(DEFAULT_CATALOG_HOST))]
    pub catalog_host: String,

    /// Catalog UDP port.
    ///
    /// Environment variable: `CATALOG_PORT`
    #[arg(long, env = "CATALOG_PORT", default_value_t = DEFAULT_CATALOG_PORT)]
    pub catalog_port: u16,

    /// Owner reported in heartbeats.
    ///
    /// Environment variable: `CATALOG_OWNER`
    #[arg(long, env = "CATALOG_OWNER", default_value_t = String::from("pawnstorm"))]
    pub owner: String,

    /// Role tag reported in heartbeats. The orchestrator only considers
    /// records carrying the same tag.
    ///
    /// Environment variable: `WORKER_ROLE`
    #[arg(long, env = "WORKER_ROLE", default_value_t = String::from(DEFAULT_WORKER_ROLE))]
    pub role: String,

    /// Seconds between catalog heartbeats.
    ///
    /// Environment variable: `HEARTBEAT_SECS`
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 60)]
    pub heartbeat_secs: u64,

    /// Do not register with the catalog (for static deployments).
    ///
    /// Environment variable: `NO_HEARTBEAT`
    #[arg(long, env = "NO_HEARTBEAT", default_value_t = false)]
    pub no_heartbeat: bool,

    /// Largest protocol frame accepted or produced, in bytes.
    ///
    /// Environment variable: `MAX_FRAME_BYTES`
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

/// Where and how often to heartbeat.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub owner: String,
    pub role: String,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub listen_addr: String,
    pub engine: UciConfig,
    pub catalog: Option<CatalogConfig>,
    pub max_frame_bytes: usize,
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.name.trim().is_empty() || args.name.chars().any(char::is_whitespace) {
            bail!("WORKER_NAME must be a single non-empty word");
        }

        if args.max_frame_bytes < 256 {
            bail!(
                "MAX_FRAME_BYTES ({}) is too small to hold a position",
                args.max_frame_bytes
            );
        }

        if args.engine_init_timeout_ms == 0 {
            bail!("ENGINE_INIT_TIMEOUT_MS must be greater than 0");
        }

        let catalog = if args.no_heartbeat {
            None
        } else {
            if args.heartbeat_secs == 0 {
                bail!("HEARTBEAT_SECS must be greater than 0");
            }
            Some(CatalogConfig {
                endpoint: format!("{}:{}", args.catalog_host, args.catalog_port),
                owner: args.owner,
                role: args.role,
                interval: Duration::from_secs(args.heartbeat_secs),
            })
        };

        let mut engine = UciConfig::new(args.engine_path);
        engine.args = args
            .engine_args
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        engine.init_timeout = Duration::from_millis(args.engine_init_timeout_ms);
        engine.search_grace = Duration::from_millis(args.search_grace_ms);

        Ok(Self {
            name: args.name,
            listen_addr: args.listen_addr,
            engine,
            catalog,
            max_frame_bytes: args.max_frame_bytes,
        })
    }
}
