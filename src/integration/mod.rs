//! Wiring of the conversation machine to its collaborators
//!
//! - [`config`]: `BriefConfig` from defaults, TOML and environment
//! - [`orchestrator`]: the async runtime and the UI handle

pub mod config;
pub mod orchestrator;

pub use config::BriefConfig;
pub use orchestrator::{OnEnd, Orchestrator, OrchestratorHandle, OrchestratorParts};
