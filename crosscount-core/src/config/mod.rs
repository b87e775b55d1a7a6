//! config — engine settings
//!
//! Settings come from an optional TOML file and are then overridden by CLI
//! flags. Every field has a default so a partial file is valid.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_ROI_Y_CUTOFF: u32 = 90;
pub const DEFAULT_SKIP_INTERVAL: u32 = 15;
pub const DEFAULT_MAX_FRAME_WIDTH: u32 = 800;
pub const DEFAULT_MAX_DISAPPEARED_FRAMES: u32 = 15;
/// Minimum detector score for a box to be reported.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
/// IoU above which overlapping boxes of one class are suppressed.
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.4;
/// COCO ids: person, bicycle, car, motorcycle, bus, truck.
pub const DEFAULT_ALLOWED_CLASSES: [u32; 6] = [0, 1, 2, 3, 5, 7];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// File path or stream URL understood by FFmpeg.
    pub video_source: String,
    /// Rows above this line are excluded from detection.
    pub roi_y_cutoff: u32,
    /// Run detection every `skip_interval` processed frames.
    pub skip_interval: u32,
    /// Frames wider than this are downscaled before processing.
    pub max_frame_width: u32,
    /// Consecutive unmatched frames tolerated before a track is dropped.
    pub max_disappeared_frames: u32,
    pub verbose: bool,
    /// Pause for an operator verdict on every crossing.
    pub evaluation_mode: bool,
    pub allowed_classes: BTreeSet<u32>,
    pub confidence_threshold: f32,
    pub overlap_threshold: f32,
    /// Identifier the session is opened under.
    pub device_id: String,
    /// Expected crossings per class label, used by the evaluation report.
    pub ground_truth: BTreeMap<String, u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_source: String::new(),
            roi_y_cutoff: DEFAULT_ROI_Y_CUTOFF,
            skip_interval: DEFAULT_SKIP_INTERVAL,
            max_frame_width: DEFAULT_MAX_FRAME_WIDTH,
            max_disappeared_frames: DEFAULT_MAX_DISAPPEARED_FRAMES,
            verbose: false,
            evaluation_mode: false,
            allowed_classes: DEFAULT_ALLOWED_CLASSES.into_iter().collect(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            device_id: "local".to_string(),
            ground_truth: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Read a TOML settings file. Missing keys fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;
        toml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// Persist the effective settings so a run can be reproduced.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        let text = self.to_toml()?;
        std::fs::write(path, text)
            .map_err(|e| EngineError::Config(format!("failed to write {}: {e}", path.display())))
    }

    pub fn to_toml(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply cross-field rules. Evaluation needs the operator to see frames,
    /// so it implies verbose.
    pub fn normalized(mut self) -> Self {
        if self.evaluation_mode {
            self.verbose = true;
        }
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.skip_interval == 0 {
            return Err(EngineError::Config("skip_interval must be positive".into()));
        }
        if self.max_frame_width == 0 {
            return Err(EngineError::Config("max_frame_width must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(EngineError::Config(format!(
                "overlap_threshold {} outside [0, 1]",
                self.overlap_threshold
            )));
        }
        if self.allowed_classes.is_empty() {
            return Err(EngineError::Config("allowed_classes is empty".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "video_source: {}, max_disappeared: {}, skip_frames: {}, y_roi: {}, max_width: {}",
            self.video_source,
            self.max_disappeared_frames,
            self.skip_interval,
            self.roi_y_cutoff,
            self.max_frame_width
        )
    }
}
