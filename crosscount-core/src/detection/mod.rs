//! detection — detector contract, class table and the ROI / allow-list adapter
//!
//! The detector itself is a black box behind [`ObjectDetector`]; the bundled
//! ONNX implementation lives in [`yolo`]. [`DetectionAdapter`] is the thin
//! layer the engine talks to: it hides the rows above the ROI cutoff from the
//! model, maps boxes back to full-frame coordinates, drops classes that are not
//! allowed, and reseeds the correlation trackers from what survives.

pub mod yolo;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::correlation::{CorrelationStage, TrackerFactory};
use crate::error::{EngineError, EngineResult};
use crate::video::{LumaFrame, RgbFrame};

pub use yolo::YoloDetector;

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Axis-aligned box in integer pixel coordinates of the processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Integer centre point of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Centroid {
    pub x: i32,
    pub y: i32,
}

impl Centroid {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Centroid) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

impl BBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Midpoint truncated toward zero.
    pub fn centroid(&self) -> Centroid {
        Centroid {
            x: ((self.left + self.right) as f64 / 2.0) as i32,
            y: ((self.top + self.bottom) as f64 / 2.0) as i32,
        }
    }

    pub fn shifted_y(&self, dy: i32) -> Self {
        Self::new(self.left, self.top + dy, self.right, self.bottom + dy)
    }

    /// Clip to `[0, width] × [0, height]`.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as i32, height as i32);
        Self::new(
            self.left.clamp(0, w),
            self.top.clamp(0, h),
            self.right.clamp(0, w),
            self.bottom.clamp(0, h),
        )
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix = (self.right.min(other.right) - self.left.max(other.left)).max(0);
        let iy = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0);
        let inter = (ix as i64 * iy as i64) as f32;
        if inter == 0.0 {
            return 0.0;
        }
        let area = |b: &BBox| (b.width().max(0) as i64 * b.height().max(0) as i64) as f32;
        inter / (area(self) + area(other) - inter)
    }
}

// ── Detector contract ────────────────────────────────────────────────────────

/// One box as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub score: f32,
    pub bbox: BBox,
}

/// A box the rest of the pipeline consumes; the score has served its purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BBox,
}

pub trait ObjectDetector {
    /// Boxes in the coordinates of `frame`, already thresholded and
    /// non-max suppressed.
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        overlap_threshold: f32,
    ) -> Result<Vec<RawDetection>>;
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        overlap_threshold: f32,
    ) -> Result<Vec<RawDetection>> {
        (**self).detect(frame, confidence_threshold, overlap_threshold)
    }
}

// ── Class names ──────────────────────────────────────────────────────────────

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorbike", "aeroplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "sofa", "pottedplant",
    "bed", "diningtable", "toilet", "tvmonitor", "laptop", "mouse", "remote", "keyboard",
    "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase",
    "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Maps model class ids to human-readable labels.
#[derive(Debug, Clone)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn coco() -> Self {
        Self {
            names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// One label per line; blank lines are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read class names from {}", path.display()))?;
        Ok(Self::from_lines(&text))
    }

    pub fn from_lines(text: &str) -> Self {
        Self {
            names: text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn label(&self, class_id: u32) -> String {
        self.names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl Default for ClassNames {
    fn default() -> Self {
        Self::coco()
    }
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct DetectionAdapter<D> {
    detector: D,
    allowed_classes: BTreeSet<u32>,
    roi_y_cutoff: u32,
    confidence_threshold: f32,
    overlap_threshold: f32,
}

impl<D: ObjectDetector> DetectionAdapter<D> {
    pub fn new(
        detector: D,
        allowed_classes: BTreeSet<u32>,
        roi_y_cutoff: u32,
        confidence_threshold: f32,
        overlap_threshold: f32,
    ) -> Self {
        Self {
            detector,
            allowed_classes,
            roi_y_cutoff,
            confidence_threshold,
            overlap_threshold,
        }
    }

    /// Detect below the ROI cutoff and reseed every correlation tracker.
    ///
    /// On detector failure the live trackers are left untouched so the caller
    /// can fall back to tracking for this frame.
    pub fn detect<F: TrackerFactory>(
        &mut self,
        frame: &RgbFrame,
        luma: &LumaFrame,
        stage: &mut CorrelationStage<F>,
    ) -> EngineResult<Vec<Detection>> {
        let detections = if self.roi_y_cutoff >= frame.height {
            Vec::new()
        } else {
            let roi = frame.crop_rows(self.roi_y_cutoff);
            let raw = self
                .detector
                .detect(&roi, self.confidence_threshold, self.overlap_threshold)
                .map_err(EngineError::Detector)?;
            self.accept(raw)
        };

        debug!(accepted = detections.len(), "detection pass");
        stage.reseed(luma, &detections);
        Ok(detections)
    }

    fn accept(&self, raw: Vec<RawDetection>) -> Vec<Detection> {
        let offset = self.roi_y_cutoff as i32;
        raw.into_iter()
            .filter(|d| self.allowed_classes.contains(&d.class_id))
            .map(|d| Detection {
                class_id: d.class_id,
                bbox: d.bbox.shifted_y(offset),
            })
            .collect()
    }
}
