pub mod catalog;
pub mod codec;
pub mod error;
pub mod game;
pub mod messages;
pub mod options;
pub mod types;

pub use error::{Error, Result};
