//! Per-worker protocol state machine.
//!
//! A [`Session`] owns the engine handle together with the worker's mirror of
//! the orchestrator's game: the last accepted `pos_id`, the last `job_id`
//! and the reconstructed position. It outlives individual connections, so a
//! client that reconnects picks up exactly where it left off.

use crate::server::telemetry::{
    increment_nodes_searched, increment_protocol_errors, increment_requests,
    increment_stale_rejections, record_search_duration,
};
use chrono::Utc;
use core::time::Duration;
use futures::{Sink, SinkExt};
use pawnstorm_core::{
    Error, Result,
    engine::SearchEngine,
    game::GameState,
    messages::{Message, NewGame, NewPos, ParseMoves, ReadyOk, Results, Working},
    options::EngineOption,
    types::{JobId, PosId},
};
use std::time::Instant;

/// What the connection loop should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading from the same connection.
    Continue,
    /// Drop this connection and wait for the next one.
    Close,
    /// Stop serving altogether.
    Exit,
}

/// A search the worker has acknowledged with `working`.
#[derive(Debug)]
struct Job {
    budget: Duration,
    allowed: Vec<String>,
}

pub struct Session<E> {
    engine: E,
    pos_id: PosId,
    job_id: JobId,
    game: GameState,
}

impl<E: SearchEngine> Session<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            pos_id: 0,
            job_id: 0,
            game: GameState::new(),
        }
    }

    pub const fn pos_id(&self) -> PosId {
        self.pos_id
    }

    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    pub const fn game(&self) -> &GameState {
        &self.game
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Applies one inbound message and writes any replies to `out`.
    ///
    /// Failures of the request itself are answered with an `error` message
    /// and leave the session usable. Only a failure to write to `out` is
    /// returned as an error, since the connection is then gone.
    pub async fn handle<S>(&mut self, msg: Message, out: &mut S) -> Result<Flow>
    where
        S: Sink<Message, Error = Error> + Unpin,
    {
        increment_requests();
        tracing::debug!(kind = msg.kind(), pos_id = self.pos_id, "Handling message");

        let reply = match msg {
            Message::NewGame(req) => self.new_game(req).await,
            Message::NewPos(req) => self.new_pos(req).await,
            Message::ParseMoves(req) => match self.accept_job(req) {
                Ok(job) => {
                    out.send(Message::Working(Working {
                        pos_id: self.pos_id,
                        job_id: self.job_id,
                    }))
                    .await?;
                    self.search(job).await
                }
                Err(e) => Err(e),
            },
            Message::Stop => return Ok(Flow::Close),
            Message::Exit => return Ok(Flow::Exit),
            other => Err(Error::UnexpectedMessage {
                kind: other.kind().to_owned(),
            }),
        };

        match reply {
            Ok(msg) => out.send(msg).await?,
            Err(e) => self.reject(e, out).await?,
        }
        Ok(Flow::Continue)
    }

    /// Reports a request-level failure to the peer.
    pub async fn reject<S>(&self, err: Error, out: &mut S) -> Result<()>
    where
        S: Sink<Message, Error = Error> + Unpin,
    {
        increment_protocol_errors();
        tracing::warn!(pos_id = self.pos_id, "Rejecting request: {err}");
        out.send(Message::error(err.to_string())).await
    }

    async fn new_game(&mut self, req: NewGame) -> Result<Message> {
        // A new game always resets the version, even if the rest fails.
        self.pos_id = req.pos_id;

        let options = EngineOption::parse_all(&req.options)?;
        self.engine.configure(&options).await?;

        let game = GameState::from_fen(&req.position)?;
        self.engine.new_game().await?;
        self.engine.set_position(&game.fen()).await?;
        self.game = game;

        tracing::info!(pos_id = self.pos_id, options = options.len(), "New game");
        Ok(Message::ReadyOk(ReadyOk {
            pos_id: self.pos_id,
        }))
    }

    async fn new_pos(&mut self, req: NewPos) -> Result<Message> {
        if req.pos_id <= self.pos_id {
            increment_stale_rejections();
            return Err(Error::StalePosition {
                received: req.pos_id,
                current: self.pos_id,
            });
        }

        let game = GameState::from_fen(&req.position)?;
        self.engine.set_position(&game.fen()).await?;
        self.pos_id = req.pos_id;
        self.game = game;

        tracing::debug!(pos_id = self.pos_id, "Position updated");
        Ok(Message::ReadyOk(ReadyOk {
            pos_id: self.pos_id,
        }))
    }

    fn accept_job(&mut self, req: ParseMoves) -> Result<Job> {
        if req.pos_id < self.pos_id {
            increment_stale_rejections();
            return Err(Error::StalePosition {
                received: req.pos_id,
                current: self.pos_id,
            });
        }

        let game = GameState::from_fen(&req.position)?;
        self.pos_id = req.pos_id;
        self.job_id = req.job_id;
        self.game = game;

        let allowed = self.game.filter_legal(&req.moves);
        if allowed.len() < req.moves.len() {
            tracing::debug!(
                job_id = self.job_id,
                dropped = req.moves.len() - allowed.len(),
                "Ignoring moves that are not legal here"
            );
        }

        let remaining = req.due_time - Utc::now();
        let budget = remaining.to_std().map_err(|_| Error::DeadlinePassed {
            due: req.due_time.to_rfc3339(),
            late_ms: -remaining.num_milliseconds(),
        })?;

        Ok(Job { budget, allowed })
    }

    async fn search(&mut self, job: Job) -> Result<Message> {
        let started = Instant::now();
        self.engine.set_position(&self.game.fen()).await?;
        let outcome = self
            .engine
            .search_best_move(job.budget, &job.allowed)
            .await?;

        let elapsed = started.elapsed();
        record_search_duration(elapsed.as_secs_f64() * 1000.0);
        increment_nodes_searched(outcome.nodes);
        tracing::info!(
            job_id = self.job_id,
            best_move = %outcome.best_move,
            score = outcome.score,
            mate = outcome.mate,
            nodes = outcome.nodes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Search finished"
        );

        Ok(Message::Results(Results {
            job_id: self.job_id,
            best_move: outcome.best_move,
            score: outcome.score,
            mate: outcome.mate,
            nodes: outcome.nodes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::FakeEngine;
    use chrono::TimeDelta;
    use core::convert::Infallible;

    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

    async fn drive(session: &mut Session<FakeEngine>, msg: Message) -> (Flow, Vec<Message>) {
        let mut replies = Vec::new();
        let flow = {
            let mut out = (&mut replies).sink_map_err(|never: Infallible| -> Error { match never {} });
            session.handle(msg, &mut out).await.unwrap()
        };
        (flow, replies)
    }

    fn new_game(options: &[&str], position: &str, pos_id: PosId) -> Message {
        Message::NewGame(NewGame {
            options: options.iter().map(|s| (*s).to_owned()).collect(),
            position: position.to_owned(),
            pos_id,
        })
    }

    fn parse_moves(position: &str, pos_id: PosId, job_id: JobId, moves: &[&str]) -> Message {
        Message::ParseMoves(ParseMoves {
            position: position.to_owned(),
            pos_id,
            moves: moves.iter().map(|s| (*s).to_owned()).collect(),
            due_time: Utc::now() + TimeDelta::milliseconds(500),
            job_id,
        })
    }

    fn start_fen() -> String {
        GameState::new().fen()
    }

    #[tokio::test]
    async fn new_game_configures_and_acknowledges() {
        let engine = FakeEngine::default();
        let mut session = Session::new(engine.clone());

        let (flow, replies) = drive(&mut session, new_game(&["Threads 2"], AFTER_E4, 4)).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(replies, vec![Message::ReadyOk(ReadyOk { pos_id: 4 })]);
        assert_eq!(session.pos_id(), 4);
        assert_eq!(session.game().fen(), AFTER_E4);
        assert_eq!(
            engine.calls(),
            vec![
                "configure Threads 2".to_owned(),
                "new_game".to_owned(),
                format!("position {AFTER_E4}"),
            ]
        );
    }

    #[tokio::test]
    async fn option_with_too_many_tokens_is_rejected() {
        let mut session = Session::new(FakeEngine::default());
        let (_, replies) = drive(&mut session, new_game(&["Skill Level 3"], AFTER_E4, 0)).await;

        let [Message::Error(reply)] = replies.as_slice() else {
            panic!("expected one error, got {replies:?}");
        };
        assert!(reply.reason.contains("Unable to decode option"));
        assert_eq!(session.game().fen(), start_fen());
    }

    #[tokio::test]
    async fn engine_rejection_leaves_position_but_resets_version() {
        let mut session = Session::new(FakeEngine::default());
        drive(&mut session, new_game(&[], &start_fen(), 0)).await;
        drive(
            &mut session,
            Message::NewPos(NewPos {
                position: AFTER_E4.to_owned(),
                pos_id: 3,
            }),
        )
        .await;

        let (_, replies) = drive(&mut session, new_game(&["bad"], &start_fen(), 0)).await;

        assert!(matches!(replies.as_slice(), [Message::Error(_)]));
        assert_eq!(session.pos_id(), 0);
        assert_eq!(session.game().fen(), AFTER_E4);
    }

    #[tokio::test]
    async fn new_pos_must_move_forward() {
        let mut session = Session::new(FakeEngine::default());
        drive(&mut session, new_game(&[], &start_fen(), 5)).await;

        let same = Message::NewPos(NewPos {
            position: AFTER_E4.to_owned(),
            pos_id: 5,
        });
        let (_, replies) = drive(&mut session, same).await;
        let [Message::Error(reply)] = replies.as_slice() else {
            panic!("expected one error, got {replies:?}");
        };
        assert!(reply.reason.starts_with("Stale position"));
        assert_eq!(session.pos_id(), 5);
        assert_eq!(session.game().fen(), start_fen());

        let next = Message::NewPos(NewPos {
            position: AFTER_E4.to_owned(),
            pos_id: 6,
        });
        let (_, replies) = drive(&mut session, next).await;
        assert_eq!(replies, vec![Message::ReadyOk(ReadyOk { pos_id: 6 })]);
        assert_eq!(session.game().fen(), AFTER_E4);
    }

    #[tokio::test]
    async fn invalid_fen_keeps_mirrored_state() {
        let mut session = Session::new(FakeEngine::default());
        let msg = Message::NewPos(NewPos {
            position: "not a position".to_owned(),
            pos_id: 1,
        });
        let (_, replies) = drive(&mut session, msg).await;

        assert!(matches!(replies.as_slice(), [Message::Error(_)]));
        assert_eq!(session.pos_id(), 0);
        assert_eq!(session.game().fen(), start_fen());
    }

    #[tokio::test]
    async fn parse_moves_acknowledges_then_reports() {
        let engine = FakeEngine::default();
        let mut session = Session::new(engine.clone());
        let msg = parse_moves(&start_fen(), 2, 9, &["g1f3", "e2e5", "zz", "d2d4"]);

        let (flow, replies) = drive(&mut session, msg).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], Message::Working(Working { pos_id: 2, job_id: 9 }));
        let Message::Results(results) = &replies[1] else {
            panic!("expected results, got {:?}", replies[1]);
        };
        assert_eq!(results.job_id, 9);
        assert_eq!(results.best_move, "g1f3");
        assert_eq!(session.job_id(), 9);
        assert!(engine.calls().contains(&"search g1f3,d2d4".to_owned()));
    }

    #[tokio::test]
    async fn unknown_moves_only_means_unrestricted_search() {
        let engine = FakeEngine::default();
        let mut session = Session::new(engine.clone());
        let msg = parse_moves(&start_fen(), 0, 1, &["a1a8"]);

        let (_, replies) = drive(&mut session, msg).await;

        assert!(matches!(replies.as_slice(), [Message::Working(_), Message::Results(_)]));
        assert!(engine.calls().contains(&"search ".to_owned()));
    }

    #[tokio::test]
    async fn parse_moves_with_older_version_is_stale() {
        let mut session = Session::new(FakeEngine::default());
        drive(&mut session, new_game(&[], &start_fen(), 7)).await;

        let (_, replies) = drive(&mut session, parse_moves(AFTER_E4, 6, 1, &[])).await;

        assert!(matches!(replies.as_slice(), [Message::Error(_)]));
        assert_eq!(session.game().fen(), start_fen());
        assert_eq!(session.job_id(), 0);
    }

    #[tokio::test]
    async fn overdue_job_is_rejected_without_working() {
        let mut session = Session::new(FakeEngine::default());
        let msg = Message::ParseMoves(ParseMoves {
            position: start_fen(),
            pos_id: 0,
            moves: vec![],
            due_time: Utc::now() - TimeDelta::seconds(2),
            job_id: 3,
        });

        let (_, replies) = drive(&mut session, msg).await;

        let [Message::Error(reply)] = replies.as_slice() else {
            panic!("expected one error, got {replies:?}");
        };
        assert!(reply.reason.starts_with("Process time was negative"));
    }

    #[tokio::test]
    async fn control_messages_change_flow() {
        let mut session = Session::new(FakeEngine::default());
        assert_eq!(drive(&mut session, Message::Stop).await, (Flow::Close, vec![]));
        assert_eq!(drive(&mut session, Message::Exit).await, (Flow::Exit, vec![]));
    }

    #[tokio::test]
    async fn client_bound_messages_are_refused() {
        let mut session = Session::new(FakeEngine::default());
        let (flow, replies) =
            drive(&mut session, Message::ReadyOk(ReadyOk { pos_id: 1 })).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            replies,
            vec![Message::error("Unexpected message type: ready_ok")]
        );
    }
}
