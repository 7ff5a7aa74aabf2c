pub mod analytics;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrations;
pub mod logging;
pub mod programs;

pub use config::EngineConfig;
pub use engine::{EngineServices, ProgramEngine, RunHandle, RunPhase};
pub use error::{Error, Result};
pub use programs::{Program, RunRequest, RunResult};
