//! error — typed failures surfaced by the engine
//!
//! Adapter internals (ONNX Runtime, FFmpeg, image buffers) report through
//! `anyhow` with context; the engine folds those into [`EngineError`] at the
//! seams so callers can tell a fatal setup failure from a benign end of run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("video source failure: {0:#}")]
    Video(#[source] anyhow::Error),

    #[error("detector failure: {0:#}")]
    Detector(#[source] anyhow::Error),

    #[error("session persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("operator verdict failure: {0:#}")]
    Evaluation(#[source] anyhow::Error),

    #[error("render failure: {0:#}")]
    Render(#[source] anyhow::Error),
}

/// Why a single correlation-tracker instance produced no box this frame.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TrackerFailure {
    #[error("seed box is too small to build a template")]
    Degenerate,

    #[error("correlation peak {score:.3} below threshold")]
    LostTarget { score: f32 },

    #[error("tracked box left the frame")]
    OutOfFrame,
}

/// How a run ended. Neither variant is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The video source was exhausted.
    StreamEnded,
    /// A stop signal or a quit from the frame sink ended the run early.
    Stopped,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
