//! Search engine capability.
//!
//! Workers drive their engine only through [`SearchEngine`], so the request
//! state machine is indifferent to whether moves come from an external UCI
//! process ([`UciEngine`]) or something in-process.

use crate::{Result, options::EngineOption};
use async_trait::async_trait;
use core::time::Duration;

mod uci;

pub use uci::{UciConfig, UciEngine};

/// Best line found by one bounded search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Move in UCI notation.
    pub best_move: String,
    /// Centipawns from the side to move; `0` when only a mate score is known.
    pub score: i32,
    /// Moves to mate, `0` when none.
    pub mate: i32,
    pub nodes: u64,
}

#[async_trait]
pub trait SearchEngine: Send {
    /// Applies engine options, in order.
    async fn configure(&mut self, options: &[EngineOption]) -> Result<()>;

    /// Clears anything the engine remembers between games.
    async fn new_game(&mut self) -> Result<()>;

    async fn set_position(&mut self, fen: &str) -> Result<()>;

    /// Searches the current position for at most `budget`.
    ///
    /// With a non-empty `allowed`, only those root moves are considered.
    async fn search_best_move(
        &mut self,
        budget: Duration,
        allowed: &[String],
    ) -> Result<SearchOutcome>;

    /// Shuts the engine down. Further calls may fail.
    async fn quit(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<E: SearchEngine + ?Sized> SearchEngine for Box<E> {
    async fn configure(&mut self, options: &[EngineOption]) -> Result<()> {
        (**self).configure(options).await
    }

    async fn new_game(&mut self) -> Result<()> {
        (**self).new_game().await
    }

    async fn set_position(&mut self, fen: &str) -> Result<()> {
        (**self).set_position(fen).await
    }

    async fn search_best_move(
        &mut self,
        budget: Duration,
        allowed: &[String],
    ) -> Result<SearchOutcome> {
        (**self).search_best_move(budget, allowed).await
    }

    async fn quit(&mut self) -> Result<()> {
        (**self).quit().await
    }
}
