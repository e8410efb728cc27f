//! Engine process sessions for the Kalix controller.
//!
//! Launches engine processes, frames their stdio conversation, tracks each
//! session through its lifecycle state machine and publishes session events
//! to channel subscribers.

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod locator;
pub mod program;
pub mod registry;
pub mod router;
pub mod session;
pub mod sync_utils;
pub mod transcript;

pub use config::*;
pub use conversation::*;
pub use error::*;
pub use events::*;
pub use locator::*;
pub use program::*;
pub use registry::*;
pub use router::*;
pub use session::*;
pub use sync_utils::*;
pub use transcript::*;
