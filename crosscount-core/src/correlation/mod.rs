//! correlation — per-object visual trackers between detection passes
//!
//! A tracker is started from a box on one frame and then advanced frame by
//! frame. The stage owns one instance per accepted detection, tagged with the
//! class it was seeded with, and never filters what they report.

pub mod template;

use tracing::debug;

use crate::detection::{BBox, Detection};
use crate::error::TrackerFailure;
use crate::video::LumaFrame;

pub use template::{TemplateConfig, TemplateTracker, TemplateTrackerFactory};

pub trait VisualTracker {
    /// Follow the target onto `frame` and report its new box.
    fn advance(&mut self, frame: &LumaFrame) -> Result<BBox, TrackerFailure>;
}

pub trait TrackerFactory {
    type Tracker: VisualTracker;

    fn start(&self, frame: &LumaFrame, bbox: BBox) -> Result<Self::Tracker, TrackerFailure>;
}

struct LabelledTracker<T> {
    class_id: u32,
    tracker: T,
}

pub struct CorrelationStage<F: TrackerFactory> {
    factory: F,
    trackers: Vec<LabelledTracker<F::Tracker>>,
}

impl<F: TrackerFactory> CorrelationStage<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            trackers: Vec::new(),
        }
    }

    /// Throw away every live tracker and start one per detection.
    pub fn reseed(&mut self, frame: &LumaFrame, detections: &[Detection]) {
        self.trackers.clear();
        for det in detections {
            match self.factory.start(frame, det.bbox) {
                Ok(tracker) => self.trackers.push(LabelledTracker {
                    class_id: det.class_id,
                    tracker,
                }),
                Err(e) => debug!(class_id = det.class_id, ?det.bbox, "tracker not started: {e}"),
            }
        }
    }

    /// Advance every tracker one frame. An instance that fails contributes no
    /// box this frame but stays live.
    pub fn advance(&mut self, frame: &LumaFrame) -> Vec<Detection> {
        let mut out = Vec::with_capacity(self.trackers.len());
        for labelled in &mut self.trackers {
            match labelled.tracker.advance(frame) {
                Ok(bbox) => out.push(Detection {
                    class_id: labelled.class_id,
                    bbox,
                }),
                Err(e) => debug!(class_id = labelled.class_id, "tracker instance failed: {e}"),
            }
        }
        out
    }

    /// Drop every live tracker.
    pub fn clear(&mut self) {
        self.trackers.clear();
    }

    /// Number of live tracker instances.
    pub fn live(&self) -> usize {
        self.trackers.len()
    }
}
