//! Workflow programs driven by engine session messages.

pub mod error;
pub mod optimisation;
pub mod run_model;
pub mod sources;
pub mod workflow;

pub use error::*;
pub use optimisation::*;
pub use run_model::*;
pub use sources::*;
pub use workflow::*;
