use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::time::Duration;
use pawnstorm_core::{
    options::EngineOption,
    types::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_WORKER_ROLE, default_catalog_url, worker_name},
};
use std::path::PathBuf;

/// Command line for the `pawnstorm-client` binary.
///
/// Cluster settings come before the mode, e.g.
/// `pawnstorm-client --base-name alpha --num-workers 4 selfplay`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pawnstorm-client",
    version,
    about = "Plays chess by fanning each turn out to a cluster of pawnstorm workers"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Play against the cluster from the terminal, entering moves in UCI
    /// notation (`e2e4`, `e7e8q`). Type `quit` to leave.
    Play {
        /// Take the black pieces instead of white.
        #[arg(long, default_value_t = false)]
        black: bool,
    },

    /// Let the cluster play both sides.
    Selfplay {
        /// Stop after this many plies even if the game is still going.
        #[arg(long, default_value_t = 200)]
        plies: usize,
    },

    /// Play a series of games against a local UCI engine, alternating
    /// colours, and report the win-draw-loss record.
    Match {
        #[arg(long, default_value_t = 10)]
        games: usize,

        /// Path to the opponent's UCI binary.
        ///
        /// Environment variable: `OPPONENT_PATH`
        #[arg(long, env = "OPPONENT_PATH", default_value = "bin/stockfish")]
        opponent: PathBuf,

        /// `;`-separated `name value` options for the opponent, e.g.
        /// `Threads 1;Hash 1024`.
        ///
        /// Environment variable: `OPPONENT_OPTIONS`
        #[arg(long, env = "OPPONENT_OPTIONS", default_value_t = String::new())]
        opponent_options: String,

        /// Opponent think time per move.
        ///
        /// Environment variable: `OPPONENT_MOVETIME_MS`
        #[arg(long, env = "OPPONENT_MOVETIME_MS", default_value_t = 100)]
        opponent_movetime_ms: u64,

        /// Adjudicate a draw after this many plies.
        #[arg(long, default_value_t = 400)]
        max_plies: usize,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Workers are named `<BASE_NAME>-00` through `<BASE_NAME>-<N-1>`.
    ///
    /// Environment variable: `BASE_NAME`
    #[arg(long, env = "BASE_NAME")]
    pub base_name: String,

    /// Number of workers to connect to.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 1)]
    pub num_workers: usize,

    /// Wall time budget for one turn.
    ///
    /// Environment variable: `TURN_TIME_MS`
    #[arg(long, env = "TURN_TIME_MS", default_value_t = 1_000)]
    pub turn_time_ms: u64,

    /// Portion of the turn reserved for network round trips. Workers are told
    /// to finish this much before the turn ends.
    ///
    /// Environment variable: `LATENCY_BUFFER_MS`
    #[arg(long, env = "LATENCY_BUFFER_MS", default_value_t = 50)]
    pub latency_buffer_ms: u64,

    /// Catalog record dump used to locate workers.
    ///
    /// Environment variable: `CATALOG_URL`
    #[arg(long, env = "CATALOG_URL", default_value_t = default_catalog_url())]
    pub catalog_url: String,

    /// Role tag workers register under.
    ///
    /// Environment variable: `WORKER_ROLE`
    #[arg(long, env = "WORKER_ROLE", default_value_t = String::from(DEFAULT_WORKER_ROLE))]
    pub role: String,

    /// Comma-separated `name=host:port` pairs. When set, the catalog is not
    /// consulted at all.
    ///
    /// Environment variable: `STATIC_WORKERS`
    #[arg(long, env = "STATIC_WORKERS")]
    pub static_workers: Option<String>,

    /// Initial delay before reconnecting a worker. Background reconnects
    /// double it on every failure.
    ///
    /// Environment variable: `CONNECT_BACKOFF_MS`
    #[arg(long, env = "CONNECT_BACKOFF_MS", default_value_t = 1_000)]
    pub connect_backoff_ms: u64,

    /// How long to wait for `ready_ok` before reconnecting.
    ///
    /// Environment variable: `ACK_TIMEOUT_MS`
    #[arg(long, env = "ACK_TIMEOUT_MS", default_value_t = 5_000)]
    pub ack_timeout_ms: u64,

    /// Send/acknowledge cycles per worker before a broadcast gives up.
    ///
    /// Environment variable: `MAX_BARRIER_ATTEMPTS`
    #[arg(long, env = "MAX_BARRIER_ATTEMPTS", default_value_t = 5)]
    pub max_barrier_attempts: usize,

    /// Largest protocol frame accepted or produced, in bytes.
    ///
    /// Environment variable: `MAX_FRAME_BYTES`
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// `;`-separated `name value` options sent to every worker engine with
    /// each new game, e.g. `Threads 4;Hash 4096`.
    ///
    /// Environment variable: `ENGINE_OPTIONS`
    #[arg(long, env = "ENGINE_OPTIONS", default_value_t = String::new())]
    pub engine_options: String,
}

/// Tunables for an [`Orchestrator`](crate::client::orchestrator::Orchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_name: String,
    pub num_workers: usize,
    pub turn_time: Duration,
    pub latency_buffer: Duration,
    pub connect_backoff: Duration,
    /// Ceiling for the doubling reconnect delay.
    pub max_backoff: Duration,
    pub ack_timeout: Duration,
    pub max_barrier_attempts: usize,
    pub max_frame_bytes: usize,
}

impl OrchestratorConfig {
    pub fn new(base_name: impl Into<String>, num_workers: usize) -> Self {
        Self {
            base_name: base_name.into(),
            num_workers,
            turn_time: Duration::from_secs(1),
            latency_buffer: Duration::from_millis(50),
            connect_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            max_barrier_attempts: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Logical names of every worker, in connection order.
    pub fn worker_names(&self) -> Vec<String> {
        (0..self.num_workers)
            .map(|i| worker_name(&self.base_name, i))
            .collect()
    }
}

/// How worker names are turned into addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Catalog { url: String, role: String },
    Static(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub orchestrator: OrchestratorConfig,
    pub discovery: Discovery,
    pub engine_options: Vec<EngineOption>,
}

impl TryFrom<ClusterArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: ClusterArgs) -> Result<Self, Self::Error> {
        if args.base_name.trim().is_empty() {
            bail!("BASE_NAME must not be empty");
        }

        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.latency_buffer_ms >= args.turn_time_ms {
            bail!(
                "LATENCY_BUFFER_MS ({}) must be less than TURN_TIME_MS ({})",
                args.latency_buffer_ms,
                args.turn_time_ms
            );
        }

        if args.max_barrier_attempts == 0 {
            bail!("MAX_BARRIER_ATTEMPTS must be greater than 0");
        }

        if args.ack_timeout_ms == 0 {
            bail!("ACK_TIMEOUT_MS must be greater than 0");
        }

        let discovery = match args.static_workers.as_deref() {
            Some(raw) => Discovery::Static(parse_static_workers(raw)?),
            None => Discovery::Catalog {
                url: args.catalog_url,
                role: args.role,
            },
        };

        let engine_options = EngineOption::parse_all(&split_options(&args.engine_options))
            .context("invalid ENGINE_OPTIONS")?;

        Ok(Self {
            orchestrator: OrchestratorConfig {
                base_name: args.base_name,
                num_workers: args.num_workers,
                turn_time: Duration::from_millis(args.turn_time_ms),
                latency_buffer: Duration::from_millis(args.latency_buffer_ms),
                connect_backoff: Duration::from_millis(args.connect_backoff_ms),
                max_backoff: Duration::from_millis(args.connect_backoff_ms.max(1) * 32),
                ack_timeout: Duration::from_millis(args.ack_timeout_ms),
                max_barrier_attempts: args.max_barrier_attempts,
                max_frame_bytes: args.max_frame_bytes,
            },
            discovery,
            engine_options,
        })
    }
}

/// Splits a `;`-separated option list, dropping empty entries.
pub fn split_options(raw: &str) -> Vec<&str> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_static_workers(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut workers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, endpoint)) = entry.split_once('=') else {
            bail!("STATIC_WORKERS entry {entry:?} is not of the form name=host:port");
        };
        if !endpoint.contains(':') {
            bail!("STATIC_WORKERS entry {entry:?} is missing a port");
        }
        workers.push((name.trim().to_owned(), endpoint.trim().to_owned()));
    }
    if workers.is_empty() {
        bail!("STATIC_WORKERS is set but lists no workers");
    }
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<(ClientConfig, Mode)> {
        let mut full = vec!["pawnstorm-client"];
        full.extend_from_slice(argv);
        let args = CliArgs::try_parse_from(full)?;
        Ok((ClientConfig::try_from(args.cluster)?, args.mode))
    }

    #[test]
    fn catalog_is_the_default_directory() {
        let (config, mode) = parse(&[
            "--base-name",
            "alpha",
            "--num-workers",
            "3",
            "--engine-options",
            "Threads 2; Hash 64",
            "selfplay",
        ])
        .unwrap();

        assert_eq!(mode, Mode::Selfplay { plies: 200 });
        assert_eq!(
            config.discovery,
            Discovery::Catalog {
                url: "http://catalog.cse.nd.edu:9097/query.json".to_owned(),
                role: "chess-worker".to_owned(),
            }
        );
        assert_eq!(
            config.orchestrator.worker_names(),
            vec!["alpha-00", "alpha-01", "alpha-02"]
        );
        assert_eq!(
            config.engine_options,
            vec![EngineOption::new("Threads", "2"), EngineOption::new("Hash", "64")]
        );
    }

    #[test]
    fn static_workers_bypass_the_catalog() {
        let (config, _) = parse(&[
            "--base-name",
            "w",
            "--static-workers",
            "w-00=127.0.0.1:7000, w-01=localhost:7001",
            "play",
        ])
        .unwrap();

        assert_eq!(
            config.discovery,
            Discovery::Static(vec![
                ("w-00".to_owned(), "127.0.0.1:7000".to_owned()),
                ("w-01".to_owned(), "localhost:7001".to_owned()),
            ])
        );
    }

    #[test]
    fn latency_buffer_must_fit_in_the_turn() {
        let err = parse(&[
            "--base-name",
            "w",
            "--turn-time-ms",
            "100",
            "--latency-buffer-ms",
            "100",
            "play",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("LATENCY_BUFFER_MS"));
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(parse(&["--base-name", "w", "--num-workers", "0", "play"]).is_err());
        assert!(parse(&["--base-name", "w", "--static-workers", "w-00", "play"]).is_err());
        assert!(parse(&["--base-name", "w", "--engine-options", "Skill Level 3", "play"]).is_err());
    }
}
