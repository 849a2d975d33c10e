//! Protocol messages exchanged between the orchestrator and its workers.
//!
//! Every message is a single JSON object whose `type` field selects the
//! variant; the remaining fields are the variant payload. Decoding reads the
//! tag first so an unrecognised `type` is reported as such rather than as a
//! generic JSON error.

use crate::{
    Error, Result,
    types::{JobId, PosId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;

/// Every tag this crate can decode.
pub const MESSAGE_TYPES: [&str; 9] = [
    "new_game",
    "new_pos",
    "parse_moves",
    "stop",
    "exit",
    "ready_ok",
    "working",
    "results",
    "error",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // client -> worker
    NewGame(NewGame),
    NewPos(NewPos),
    ParseMoves(ParseMoves),
    Stop,
    Exit,
    // worker -> client
    ReadyOk(ReadyOk),
    Working(Working),
    Results(Results),
    Error(ErrorReply),
}

/// Starts a new game on the worker and configures its engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGame {
    /// Engine options, each formatted as `"name value"` or `"name"`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: Vec<String>,
    pub position: String,
    pub pos_id: PosId,
}

/// Replaces the worker's position outside the regular turn flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPos {
    pub position: String,
    pub pos_id: PosId,
}

/// Asks a worker to search a subset of the legal moves until `due_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseMoves {
    pub position: String,
    pub pos_id: PosId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub moves: Vec<String>,
    pub due_time: DateTime<Utc>,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyOk {
    pub pos_id: PosId,
}

/// Sent as soon as a `parse_moves` job is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Working {
    pub pos_id: PosId,
    pub job_id: JobId,
}

/// Outcome of one search job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Results {
    pub job_id: JobId,
    pub best_move: String,
    /// Centipawns from the side to move; `0` when only a mate score is known.
    pub score: i32,
    /// Moves to mate, negative when being mated; `0` when none was found.
    pub mate: i32,
    pub nodes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub reason: String,
}

impl Message {
    /// The wire tag of this message.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewGame(_) => "new_game",
            Self::NewPos(_) => "new_pos",
            Self::ParseMoves(_) => "parse_moves",
            Self::Stop => "stop",
            Self::Exit => "exit",
            Self::ReadyOk(_) => "ready_ok",
            Self::Working(_) => "working",
            Self::Results(_) => "results",
            Self::Error(_) => "error",
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            reason: reason.into(),
        })
    }

    /// Decodes one frame, checking the `type` tag before the payload.
    pub fn decode(frame: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Tag<'a> {
            #[serde(rename = "type", borrow)]
            kind: Cow<'a, str>,
        }

        let tag: Tag<'_> = serde_json::from_str(frame)?;
        if !MESSAGE_TYPES.contains(&tag.kind.as_ref()) {
            return Err(Error::UnknownMessageType {
                kind: tag.kind.into_owned(),
            });
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Encodes the message as compact JSON, which never contains a raw
    /// newline.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// Peers written against nil-able slices send `null` for an empty list.
fn null_as_empty<'de, D, T>(deserializer: D) -> core::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
