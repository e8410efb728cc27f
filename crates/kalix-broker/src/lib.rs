//! Sequential, caching fetch queue for engine output series.

pub mod broker;
pub mod error;

pub use broker::*;
pub use error::*;
