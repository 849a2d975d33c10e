//! Turn orchestration across a worker cluster.
//!
//! The [`Orchestrator`] owns the authoritative game and one
//! [`WorkerConnection`] per worker. Position changes are pushed with a strict
//! barrier ([`Orchestrator::new_game`], [`Orchestrator::new_pos`]): every
//! worker must acknowledge the new version before the call returns. A turn
//! ([`Orchestrator::run`]) is the opposite: the legal moves are split across
//! whoever is ready, replies are gathered until one shared deadline, and
//! anything missing is simply not counted.

use crate::client::{config::OrchestratorConfig, connection::WorkerConnection, directory::Directory};
use chrono::{DateTime, TimeDelta, Utc};
use core::time::Duration;
use futures::{StreamExt, future::join_all, stream::FuturesUnordered};
use pawnstorm_core::{
    Error, Result,
    game::GameState,
    messages::{Message, NewGame, NewPos, ParseMoves, Results},
    options::EngineOption,
    types::{JobId, PosId},
};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tokio::time::Instant;


/// What one call to [`Orchestrator::run`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The move that was played, in UCI notation.
    pub best_move: String,
    pub score: i32,
    pub mate: i32,
    /// Nodes searched by every worker that answered.
    pub nodes: u64,
    /// Workers whose results arrived in time.
    pub responders: usize,
    /// Workers that were sent a share of the moves.
    pub dispatched: usize,
    /// `true` when no usable result arrived and a random move was played.
    pub fallback: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    conns: Vec<WorkerConnection>,
    game: GameState,
    pos_id: PosId,
    job_id: JobId,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, directory: Arc<dyn Directory>) -> Self {
        let conns = config
            .worker_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| WorkerConnection::new(i, name, Arc::clone(&directory), &config))
            .collect();
        Self {
            config,
            conns,
            game: GameState::new(),
            pos_id: 0,
            job_id: 0,
        }
    }

    pub const fn game(&self) -> &GameState {
        &self.game
    }

    pub const fn pos_id(&self) -> PosId {
        self.pos_id
    }

    pub fn connections(&self) -> &[WorkerConnection] {
        &self.conns
    }

    /// Connects every worker in order, retrying each once after the
    /// configured backoff. Fails on the first worker that cannot be reached
    /// twice.
    pub async fn connect_all(&self) -> Result<()> {
        for conn in &self.conns {
            if let Err(first) = conn.connect().await {
                tracing::warn!(worker = conn.name(), "Connect failed, retrying: {first}");
                tokio::time::sleep(self.config.connect_backoff).await;
                conn.connect().await.map_err(|e| Error::ConnectFailed {
                    index: conn.index(),
                    source: Box::new(e),
                })?;
            }
        }
        tracing::info!(workers = self.conns.len(), "All workers connected");
        Ok(())
    }

    /// Starts a new game on every worker, configuring their engines with
    /// `options`. The local game is replaced only once all of them agree.
    pub async fn new_game(&mut self, game: GameState, options: &[EngineOption]) -> Result<()> {
        let msg = Message::NewGame(NewGame {
            options: options.iter().map(ToString::to_string).collect(),
            position: game.fen(),
            pos_id: self.pos_id,
        });
        self.send_all(&msg, self.pos_id).await?;
        self.game = game;
        tracing::info!(pos_id = self.pos_id, fen = %self.game.fen(), "New game");
        Ok(())
    }

    /// Pushes a new position to every worker under a fresh version.
    ///
    /// The version is consumed even if the broadcast fails, since some
    /// workers may already have accepted it; a retry goes out under the next
    /// one.
    pub async fn new_pos(&mut self, game: GameState) -> Result<()> {
        self.pos_id += 1;
        let msg = Message::NewPos(NewPos {
            position: game.fen(),
            pos_id: self.pos_id,
        });
        self.send_all(&msg, self.pos_id).await?;
        self.game = game;
        tracing::debug!(pos_id = self.pos_id, "Position pushed");
        Ok(())
    }

    /// Applies a move made outside the cluster, e.g. by a human.
    pub fn play_move(&mut self, uci: &str) -> Result<()> {
        self.game.play(uci)
    }

    /// Plays one move for the side to move.
    ///
    /// Every ready worker gets a round-robin share of the legal moves and
    /// the same due time. Replies are gathered concurrently until the turn
    /// deadline; the best one is played. With no usable reply a random legal
    /// move is played instead, so a turn only fails when nobody could be
    /// asked at all or the game is already over.
    pub async fn run(&mut self) -> Result<TurnOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.turn_time;
        let due_time = due_in(
            self.config
                .turn_time
                .saturating_sub(self.config.latency_buffer),
        );

        let ready: Vec<WorkerConnection> = self
            .conns
            .iter()
            .filter(|c| c.is_ready())
            .cloned()
            .collect();
        if ready.is_empty() {
            return Err(Error::NoReadyWorkers);
        }
        let moves = self.game.legal_moves();
        if moves.is_empty() || self.game.is_over() {
            return Err(Error::GameOver);
        }

        let position = self.game.fen();
        let shares = partition_moves(&moves, ready.len());
        let mut jobs = Vec::with_capacity(ready.len());
        for (conn, share) in ready.into_iter().zip(shares) {
            if share.is_empty() {
                continue;
            }
            self.job_id += 1;
            conn.set_last_job_id(self.job_id);
            jobs.push((
                conn,
                ParseMoves {
                    position: position.clone(),
                    pos_id: self.pos_id,
                    moves: share,
                    due_time,
                    job_id: self.job_id,
                },
            ));
        }
        let dispatched = jobs.len();

        let mut pending: FuturesUnordered<_> = jobs
            .into_iter()
            .enumerate()
            .map(|(order, (conn, job))| dispatch(order, conn, job))
            .collect();
        let mut arrived = Vec::with_capacity(dispatched);
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((order, Some(results)))) => arrived.push((order, results)),
                Ok(Some((_, None))) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(outstanding = pending.len(), "Turn deadline reached");
                    break;
                }
            }
        }
        drop(pending);

        // Rank in dispatch order so ties do not depend on network timing.
        arrived.sort_by_key(|(order, _)| *order);
        let results: Vec<Results> = arrived.into_iter().map(|(_, r)| r).collect();
        let responders = results.len();

        if let Some(best) = aggregate(&results) {
            match self.game.play(&best.best_move) {
                Ok(()) => {
                    tracing::info!(
                        best_move = %best.best_move,
                        score = best.score,
                        mate = best.mate,
                        nodes = best.nodes,
                        responders,
                        dispatched,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Turn complete"
                    );
                    return Ok(TurnOutcome {
                        best_move: best.best_move,
                        score: best.score,
                        mate: best.mate,
                        nodes: best.nodes,
                        responders,
                        dispatched,
                        fallback: false,
                    });
                }
                Err(e) => tracing::warn!("Best reply does not apply, falling back: {e}"),
            }
        }

        let nodes = results
            .iter()
            .fold(0_u64, |acc, r| acc.saturating_add(r.nodes));
        let best_move = moves
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(Error::GameOver)?;
        self.game.play(&best_move)?;
        tracing::warn!(
            best_move = %best_move,
            responders,
            dispatched,
            "No usable results, played a random move"
        );

        Ok(TurnOutcome {
            best_move,
            score: 0,
            mate: 0,
            nodes,
            responders,
            dispatched,
            fallback: true,
        })
    }

    /// Sends `stop` to every worker and closes all connections.
    pub async fn shutdown(&self) {
        join_all(self.conns.iter().map(|c| c.close())).await;
        tracing::info!("Disconnected from all workers");
    }

    /// Sends `exit` to every worker, which stops the worker processes, and
    /// closes all connections.
    pub async fn terminate_workers(&self) {
        join_all(self.conns.iter().map(|c| c.terminate())).await;
        tracing::info!("Asked all workers to exit");
    }

    /// Broadcasts `msg` to every worker in order, waiting for each one to
    /// acknowledge `pos_id` before moving on.
    async fn send_all(&self, msg: &Message, pos_id: PosId) -> Result<()> {
        for conn in &self.conns {
            self.acknowledge(conn, msg, pos_id).await?;
        }
        Ok(())
    }

    async fn acknowledge(&self, conn: &WorkerConnection, msg: &Message, pos_id: PosId) -> Result<()> {
        let attempts = self.config.max_barrier_attempts;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.connect_backoff).await;
                if let Err(e) = conn.connect().await {
                    tracing::warn!(worker = conn.name(), attempt, "Reconnect failed: {e}");
                    continue;
                }
            }

            if let Err(e) = conn.send(msg).await {
                if !e.is_transport() {
                    return Err(e);
                }
                tracing::warn!(worker = conn.name(), attempt, "Broadcast send failed: {e}");
                continue;
            }

            let ack_deadline = Instant::now() + self.config.ack_timeout;
            loop {
                let remaining = ack_deadline.saturating_duration_since(Instant::now());
                match conn.recv(Some(remaining)).await {
                    Ok(Some(Message::ReadyOk(ack))) if ack.pos_id == pos_id => return Ok(()),
                    Ok(Some(Message::Error(reply))) => {
                        return Err(Error::WorkerRejected {
                            worker: conn.name().to_owned(),
                            reason: reply.reason,
                        });
                    }
                    Ok(Some(other)) => {
                        tracing::debug!(
                            worker = conn.name(),
                            kind = other.kind(),
                            "Discarding reply while waiting for ready_ok"
                        );
                    }
                    Ok(None) => {
                        tracing::warn!(worker = conn.name(), attempt, "No ready_ok in time");
                        conn.disconnect().await;
                        break;
                    }
                    Err(e) if e.is_transport() => break,
                    Err(e) => tracing::debug!(worker = conn.name(), "Discarding bad frame: {e}"),
                }
            }
        }

        Err(Error::BarrierFailed {
            worker: conn.name().to_owned(),
            attempts,
        })
    }
}

/// Sends one job and waits for its results.
///
/// Acks and results for older jobs are skipped. An `error` reply or a broken
/// connection ends the wait with nothing; so does being dropped at the turn
/// deadline.
async fn dispatch(order: usize, conn: WorkerConnection, job: ParseMoves) -> (usize, Option<Results>) {
    let job_id = job.job_id;
    if let Err(e) = conn.send(&Message::ParseMoves(job)).await {
        tracing::debug!(worker = conn.name(), "Skipping worker this turn: {e}");
        return (order, None);
    }

    loop {
        match conn.recv(None).await {
            Ok(Some(Message::Results(results))) if results.job_id == job_id => {
                return (order, Some(results));
            }
            Ok(Some(Message::Results(stale))) => {
                tracing::debug!(
                    worker = conn.name(),
                    job_id = stale.job_id,
                    latest = conn.last_job_id(),
                    "Ignoring stale results"
                );
            }
            Ok(Some(Message::Working(_))) | Ok(None) => {}
            Ok(Some(Message::Error(reply))) => {
                tracing::warn!(worker = conn.name(), job_id, "Worker refused job: {}", reply.reason);
                return (order, None);
            }
            Ok(Some(other)) => {
                tracing::debug!(worker = conn.name(), kind = other.kind(), "Ignoring message");
            }
            Err(e) if e.is_transport() => return (order, None),
            Err(e) => tracing::debug!(worker = conn.name(), "Discarding bad frame: {e}"),
        }
    }
}

fn due_in(d: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Deals `moves` round-robin into `n` shares: move `i` goes to share
/// `i % n`. Shares differ in size by at most one.
pub fn partition_moves(moves: &[String], n: usize) -> Vec<Vec<String>> {
    let mut shares: Vec<Vec<String>> = vec![Vec::new(); n];
    if n == 0 {
        return shares;
    }
    for (i, m) in moves.iter().enumerate() {
        shares[i % n].push(m.clone());
    }
    shares
}

/// Folds results into the one to play.
///
/// The strictly highest score wins and the earliest result wins ties; mate
/// distance is carried along but not ranked. Nodes are summed over every
/// result.
pub fn aggregate(results: &[Results]) -> Option<Results> {
    let (first, rest) = results.split_first()?;
    let mut best = first;
    let mut nodes = first.nodes;
    for r in rest {
        nodes = nodes.saturating_add(r.nodes);
        if r.score > best.score {
            best = r;
        }
    }
    Some(Results {
        nodes,
        ..best.clone()
    })
}
