pub mod config;
pub mod correlation;
pub mod counting;
pub mod detection;
pub mod error;
pub mod evaluation;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod session;
pub mod tracking;
pub mod video;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, Termination, TrackerFailure};
pub use pipeline::{Engine, RunHooks, RunReport, StopSignal};
