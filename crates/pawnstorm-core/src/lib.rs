#![doc = include_str!("../README.md")]

mod common;
pub mod engine;

pub use common::*;
// Public re-export so downstream crates can reach the rules engine via
// `pawnstorm_core::shakmaty`
pub use shakmaty;
