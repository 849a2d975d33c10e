//! Error types for the distributed engine.
//!
//! This module defines the central `Error` enum shared by the worker and the
//! orchestrator. Worker-side variants are rendered with `Display` and shipped
//! back to the client as the `reason` of an `error` message, so their text is
//! part of the observable protocol.
//!
//! ## Error Cases
//! - `Io`, `NotConnected`: transport failures on a worker connection.
//! - `Json`, `UnknownMessageType`, `FrameTooLarge`: a frame that could not be
//!   decoded into a protocol message.
//! - `UnexpectedMessage`: a valid message the receiver never accepts.
//! - `WorkerNotFound`, `DiscoveryUnavailable`: naming service lookups.
//! - `ConnectFailed`, `WorkerRejected`, `BarrierFailed`: orchestrator barrier
//!   operations.
//! - `StalePosition`: a position version older than the one already accepted.
//! - `InvalidFen`, `IllegalMove`, `GameOver`: rules violations.
//! - `InvalidOption`, `Engine`, `DeadlinePassed`: engine configuration and
//!   search failures.
//! - `NoReadyWorkers`: a turn was requested with nobody to dispatch to.

use crate::types::PosId;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for workers and the orchestrator.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Socket or pipe failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection has no open stream.
    #[error("Worker {name} is not connected")]
    NotConnected { name: String },

    /// A frame was not valid JSON for the message it claimed to be.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// A well-formed frame carried a `type` tag nobody understands.
    #[error("Unknown message type: {kind}")]
    UnknownMessageType { kind: String },

    /// A known message sent in the wrong direction.
    #[error("Unexpected message type: {kind}")]
    UnexpectedMessage { kind: String },

    /// A frame exceeded the configured maximum length and was discarded.
    #[error("Message exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// The naming service has no live record for this worker.
    #[error("No catalog entry for worker {name}")]
    WorkerNotFound { name: String },

    /// The naming service could not be queried.
    #[error("Catalog unavailable: {reason}")]
    DiscoveryUnavailable { reason: String },

    /// A worker could not be connected even after a retry.
    #[error("Unable to connect worker {index}: {source}")]
    ConnectFailed {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    /// A worker answered a barrier message with `error`.
    #[error("Worker {worker} rejected the request: {reason}")]
    WorkerRejected { worker: String, reason: String },

    /// A worker never acknowledged a barrier message.
    #[error("Worker {worker} did not acknowledge after {attempts} attempts")]
    BarrierFailed { worker: String, attempts: usize },

    /// A position update older than the last one accepted.
    #[error("Stale position: pos_id {received} (current {current})")]
    StalePosition { received: PosId, current: PosId },

    /// A position string that does not describe a legal setup.
    #[error("Invalid FEN {fen:?}: {reason}")]
    InvalidFen { fen: String, reason: String },

    /// A move string that is unparseable or illegal in the position.
    #[error("Illegal move {uci:?}: {reason}")]
    IllegalMove { uci: String, reason: String },

    /// The position already has an outcome.
    #[error("Game is over")]
    GameOver,

    /// An engine option string with too many tokens, or none.
    #[error("Unable to decode option: {option:?}")]
    InvalidOption { option: String },

    /// The external engine misbehaved or went away.
    #[error("Engine error: {reason}")]
    Engine { reason: String },

    /// The due time had already passed when the job arrived.
    #[error("Process time was negative: due {due} is {late_ms}ms in the past")]
    DeadlinePassed { due: String, late_ms: i64 },

    /// `run` was called while every connection is down.
    #[error("No workers are ready")]
    NoReadyWorkers,
}

impl Error {
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Returns `true` for transport failures that warrant a reconnect.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NotConnected { .. })
    }
}
