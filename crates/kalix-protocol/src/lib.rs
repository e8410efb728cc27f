//! Wire codec for the Kalix engine stdio protocol.
//!
//! Decodes engine output lines into a closed message enum, encodes controller
//! commands, and parses the compact time-series encoding returned by
//! `get_result`.

pub mod commands;
pub mod message;
pub mod series;

pub use commands::*;
pub use message::*;
pub use series::*;
