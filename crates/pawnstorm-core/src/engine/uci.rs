use super::{SearchEngine, SearchOutcome};
use crate::{Error, Result, options::EngineOption};
use async_trait::async_trait;
use core::time::Duration;
use std::{collections::HashSet, path::PathBuf, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{Instant, timeout, timeout_at},
};

/// How to launch and supervise a UCI engine process.
#[derive(Debug, Clone)]
pub struct UciConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Bound on the `uci`/`isready` handshakes.
    pub init_timeout: Duration,
    /// Extra time granted past the search budget before `stop` is sent, and
    /// again after it before the engine is declared hung.
    pub search_grace: Duration,
}

impl UciConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            init_timeout: Duration::from_secs(30),
            search_grace: Duration::from_millis(500),
        }
    }
}

/// A UCI engine running as a child process.
///
/// The child is killed when this handle is dropped; call
/// [`SearchEngine::quit`] first for a clean exit.
pub struct UciEngine {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    config: UciConfig,
    name: Option<String>,
    advertised: HashSet<String>,
}

impl UciEngine {
    pub async fn spawn(config: UciConfig) -> Result<Self> {
        let mut child = Command::new(&config.path)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::engine(format!(
                    "failed to spawn engine at {}: {e}",
                    config.path.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::engine("engine stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::engine("engine stdout unavailable"))?;

        let mut engine = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout).lines(),
            config,
            name: None,
            advertised: HashSet::new(),
        };
        engine.initialize().await?;
        tracing::info!(
            engine = engine.name().unwrap_or("unknown"),
            options = engine.advertised.len(),
            "UCI engine ready"
        );
        Ok(engine)
    }

    /// The engine's self-reported `id name`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.write_line("uci").await?;
        let limit = self.config.init_timeout;
        timeout(limit, async {
            loop {
                let line = self.read_line().await?;
                if let Some(name) = line.strip_prefix("id name ") {
                    self.name = Some(name.trim().to_owned());
                } else if let Some(rest) = line.strip_prefix("option name ") {
                    if let Some(name) = parse_option_name(rest) {
                        self.advertised.insert(name.to_ascii_lowercase());
                    }
                } else if line.trim() == "uciok" {
                    return Ok::<_, Error>(());
                }
            }
        })
        .await
        .map_err(|_| Error::engine("timed out waiting for uciok"))??;
        self.sync_ready().await
    }

    async fn sync_ready(&mut self) -> Result<()> {
        self.write_line("isready").await?;
        let limit = self.config.init_timeout;
        timeout(limit, async {
            loop {
                if self.read_line().await?.trim() == "readyok" {
                    return Ok::<_, Error>(());
                }
            }
        })
        .await
        .map_err(|_| Error::engine("timed out waiting for readyok"))?
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        tracing::trace!(">> {line}");
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        match self.stdout.next_line().await? {
            Some(line) => {
                tracing::trace!("<< {line}");
                Ok(line)
            }
            None => Err(Error::engine("engine exited unexpectedly")),
        }
    }
}

#[async_trait]
impl SearchEngine for UciEngine {
    async fn configure(&mut self, options: &[EngineOption]) -> Result<()> {
        // Checked up front so a rejected batch leaves the engine untouched.
        if !self.advertised.is_empty() {
            if let Some(unknown) = options
                .iter()
                .find(|o| !self.advertised.contains(&o.name.to_ascii_lowercase()))
            {
                return Err(Error::engine(format!(
                    "engine does not support option {:?}",
                    unknown.name
                )));
            }
        }

        for option in options {
            let cmd = match &option.value {
                Some(value) => format!("setoption name {} value {}", option.name, value),
                None => format!("setoption name {}", option.name),
            };
            self.write_line(&cmd).await?;
        }
        self.sync_ready().await
    }

    async fn new_game(&mut self) -> Result<()> {
        self.write_line("ucinewgame").await?;
        self.sync_ready().await
    }

    async fn set_position(&mut self, fen: &str) -> Result<()> {
        self.write_line(&format!("position fen {fen}")).await
    }

    async fn search_best_move(
        &mut self,
        budget: Duration,
        allowed: &[String],
    ) -> Result<SearchOutcome> {
        let mut go = format!("go movetime {}", budget.as_millis().max(1));
        if !allowed.is_empty() {
            go.push_str(" searchmoves ");
            go.push_str(&allowed.join(" "));
        }
        self.write_line(&go).await?;

        let grace = self.config.search_grace;
        let mut deadline = Instant::now() + budget + grace;
        let mut stop_sent = false;
        let mut last = InfoUpdate::default();

        loop {
            let line = match timeout_at(deadline, self.read_line()).await {
                Ok(line) => line?,
                Err(_) if !stop_sent => {
                    tracing::warn!(budget_ms = budget.as_millis() as u64, "search overran, sending stop");
                    self.write_line("stop").await?;
                    stop_sent = true;
                    deadline = Instant::now() + grace;
                    continue;
                }
                Err(_) => return Err(Error::engine("engine ignored stop")),
            };

            if let Some(update) = parse_info(&line) {
                last.merge(update);
            } else if let Some(best) = parse_bestmove(&line) {
                if best == "(none)" || best == "0000" {
                    return Err(Error::engine("engine found no move"));
                }
                return Ok(SearchOutcome {
                    best_move: best.to_owned(),
                    score: last.score_cp.unwrap_or(0),
                    mate: last.mate.unwrap_or(0),
                    nodes: last.nodes.unwrap_or(0),
                });
            }
        }
    }

    async fn quit(&mut self) -> Result<()> {
        // Best effort; the engine may already be gone.
        let _ = self.write_line("quit").await;
        match timeout(Duration::from_millis(300), self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Score and node fields of one `info` line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct InfoUpdate {
    score_cp: Option<i32>,
    mate: Option<i32>,
    nodes: Option<u64>,
    has_score: bool,
}

impl InfoUpdate {
    // A new score replaces both halves of the previous one.
    fn merge(&mut self, other: Self) {
        if other.has_score {
            self.has_score = true;
            self.score_cp = Some(other.score_cp.unwrap_or(0));
            self.mate = Some(other.mate.unwrap_or(0));
        }
        if other.nodes.is_some() {
            self.nodes = other.nodes;
        }
    }
}

/// Parses an `info` line. Lines for secondary PVs and free-form
/// `info string` lines yield nothing.
fn parse_info(line: &str) -> Option<InfoUpdate> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "info" {
        return None;
    }
    let mut update = InfoUpdate::default();
    while let Some(token) = tokens.next() {
        match token {
            "string" => break,
            "multipv" if tokens.next() != Some("1") => return Some(InfoUpdate::default()),
            "nodes" => update.nodes = tokens.next().and_then(|v| v.parse().ok()),
            "score" => match (tokens.next(), tokens.next().and_then(|v| v.parse().ok())) {
                (Some("cp"), Some(v)) => {
                    update.score_cp = Some(v);
                    update.has_score = true;
                }
                (Some("mate"), Some(v)) => {
                    update.mate = Some(v);
                    update.has_score = true;
                }
                _ => {}
            },
            _ => {}
        }
    }
    Some(update)
}

fn parse_bestmove(line: &str) -> Option<&str> {
    let mut tokens = line.split_whitespace();
    match tokens.next()? {
        "bestmove" => tokens.next(),
        _ => None,
    }
}

// `option name <words...> type <kind> ...`
fn parse_option_name(rest: &str) -> Option<String> {
    let name = match rest.find(" type ") {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}
