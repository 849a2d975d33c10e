use async_trait::async_trait;
use core::time::Duration;
use pawnstorm_core::{
    Error, Result,
    engine::{SearchEngine, SearchOutcome},
    options::EngineOption,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// In-process engine that records every call and answers instantly.
///
/// The best move is the first allowed move, or `e2e4` for an unrestricted
/// search. An option named `bad` is refused.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl SearchEngine for FakeEngine {
    async fn configure(&mut self, options: &[EngineOption]) -> Result<()> {
        if options.iter().any(|o| o.name == "bad") {
            return Err(Error::engine("bad option"));
        }
        let joined: Vec<String> = options.iter().map(ToString::to_string).collect();
        self.log(format!("configure {}", joined.join(", ")));
        Ok(())
    }

    async fn new_game(&mut self) -> Result<()> {
        self.log("new_game".to_owned());
        Ok(())
    }

    async fn set_position(&mut self, fen: &str) -> Result<()> {
        self.log(format!("position {fen}"));
        Ok(())
    }

    async fn search_best_move(
        &mut self,
        _budget: Duration,
        allowed: &[String],
    ) -> Result<SearchOutcome> {
        self.log(format!("search {}", allowed.join(",")));
        Ok(SearchOutcome {
            best_move: allowed
                .first()
                .cloned()
                .unwrap_or_else(|| "e2e4".to_owned()),
            score: 12,
            mate: 0,
            nodes: 1000,
        })
    }

    async fn quit(&mut self) -> Result<()> {
        self.log("quit".to_owned());
        Ok(())
    }
}
