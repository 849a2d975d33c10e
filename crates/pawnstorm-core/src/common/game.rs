//! Game state over the `shakmaty` rules engine.
//!
//! Positions cross the wire as FEN and moves as UCI strings. The orchestrator
//! owns the authoritative [`GameState`]; workers rebuild a fresh one from
//! every FEN they receive and never replay history.

use crate::{Error, Result};
use shakmaty::{
    CastlingMode, Chess, Color, EnPassantMode, KnownOutcome, Outcome, Position,
    fen::{Epd, Fen},
    uci::UciMove,
};
use std::collections::HashMap;

/// Result of a game from the board's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    InProgress,
    WhiteWon,
    BlackWon,
    Draw,
}

#[derive(Debug, Clone)]
pub struct GameState {
    position: Chess,
    history: Vec<String>,
    // Occurrences of each position, keyed without move counters.
    repetitions: HashMap<String, u8>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::with_position(Chess::default())
    }
}

impl GameState {
    /// The standard starting position.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fen(fen: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidFen {
            fen: fen.to_owned(),
            reason,
        };
        let parsed: Fen = fen.trim().parse().map_err(|e| invalid(format!("{e}")))?;
        let position: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|e| invalid(format!("{e}")))?;
        Ok(Self::with_position(position))
    }

    fn with_position(position: Chess) -> Self {
        let mut state = Self {
            position,
            history: Vec::new(),
            repetitions: HashMap::new(),
        };
        state.record_repetition();
        state
    }

    /// Canonical FEN of the current position.
    ///
    /// En passant squares are only written when a capture is actually legal,
    /// so re-parsing and re-serializing the output is the identity.
    pub fn fen(&self) -> String {
        Fen::from_position(&self.position, EnPassantMode::Legal).to_string()
    }

    pub const fn position(&self) -> &Chess {
        &self.position
    }

    pub fn turn(&self) -> Color {
        self.position.turn()
    }

    /// Moves played since this state was created, in UCI notation.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Every legal move, in UCI notation, in generator order.
    pub fn legal_moves(&self) -> Vec<String> {
        self.position
            .legal_moves()
            .iter()
            .map(|m| m.to_uci(CastlingMode::Standard).to_string())
            .collect()
    }

    /// Keeps the requested moves that are legal here, in request order.
    /// Anything unparseable or illegal is dropped.
    pub fn filter_legal(&self, requested: &[String]) -> Vec<String> {
        let legal = self.legal_moves();
        requested
            .iter()
            .filter(|m| legal.contains(m))
            .cloned()
            .collect()
    }

    /// Plays a UCI move, leaving the state untouched if it is illegal.
    pub fn play(&mut self, uci: &str) -> Result<()> {
        if self.is_over() {
            return Err(Error::GameOver);
        }
        let illegal = |reason: String| Error::IllegalMove {
            uci: uci.to_owned(),
            reason,
        };
        let parsed: UciMove = uci.parse().map_err(|e| illegal(format!("{e}")))?;
        let m = parsed
            .to_move(&self.position)
            .map_err(|e| illegal(format!("{e}")))?;
        self.position.play_unchecked(m);
        self.history.push(uci.to_owned());
        self.record_repetition();
        Ok(())
    }

    pub fn outcome(&self) -> GameOutcome {
        match self.position.outcome() {
            Outcome::Known(KnownOutcome::Decisive {
                winner: Color::White,
            }) => GameOutcome::WhiteWon,
            Outcome::Known(KnownOutcome::Decisive {
                winner: Color::Black,
            }) => GameOutcome::BlackWon,
            Outcome::Known(KnownOutcome::Draw) => GameOutcome::Draw,
            Outcome::Unknown if self.is_rule_draw() => GameOutcome::Draw,
            Outcome::Unknown => GameOutcome::InProgress,
        }
    }

    pub fn is_over(&self) -> bool {
        self.outcome() != GameOutcome::InProgress
    }

    // Fifty-move rule and threefold repetition are claimed automatically.
    fn is_rule_draw(&self) -> bool {
        self.position.halfmoves() >= 100
            || self
                .repetitions
                .get(&self.repetition_key())
                .is_some_and(|n| *n >= 3)
    }

    fn repetition_key(&self) -> String {
        Epd::from_position(&self.position, EnPassantMode::Legal).to_string()
    }

    fn record_repetition(&mut self) {
        *self.repetitions.entry(self.repetition_key()).or_insert(0) += 1;
    }
}
