//! template — normalized cross-correlation tracker
//!
//! Each instance keeps a grey-level template of its target and, every frame,
//! searches a window around a Kalman-predicted centre for the offset with the
//! highest normalized cross-correlation. The template drifts slowly toward
//! what it matched so gradual appearance change is absorbed.
//!
//! Search uses every other template pixel in both axes; the winning offset is
//! then re-scored on the full template before it is accepted.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use rayon::prelude::*;

use super::{TrackerFactory, VisualTracker};
use crate::detection::BBox;
use crate::error::TrackerFailure;
use crate::video::LumaFrame;

/// Process noise of the constant-velocity model.
const PROCESS_NOISE: f32 = 4.0;
/// Measurement noise of the correlation peak.
const MEASUREMENT_NOISE: f32 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct TemplateConfig {
    /// Search radius as a fraction of the larger box side.
    pub search_margin: f32,
    pub min_search_radius: i32,
    /// Peaks below this are reported as a lost target.
    pub min_correlation: f32,
    /// Template blend weight given to each new match.
    pub learning_rate: f32,
    /// Smallest box side a template is built for.
    pub min_size: i32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            search_margin: 0.5,
            min_search_radius: 8,
            min_correlation: 0.45,
            learning_rate: 0.1,
            min_size: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateTrackerFactory {
    pub config: TemplateConfig,
}

impl TrackerFactory for TemplateTrackerFactory {
    type Tracker = TemplateTracker;

    fn start(&self, frame: &LumaFrame, bbox: BBox) -> Result<TemplateTracker, TrackerFailure> {
        TemplateTracker::start(frame, bbox, self.config)
    }
}

// ── Kalman prior ─────────────────────────────────────────────────────────────

/// A minimal 2D constant-velocity Kalman filter over the box centre.
struct Kalman2D {
    /// State: [cx, cy, vx, vy]
    x: Vector4<f32>,
    p: Matrix4<f32>,
    f: Matrix4<f32>,
    h: Matrix2x4<f32>,
    q: Matrix4<f32>,
    r: Matrix2<f32>,
}

impl Kalman2D {
    fn new(cx: f32, cy: f32) -> Self {
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        );
        Self {
            x: Vector4::new(cx, cy, 0.0, 0.0),
            p: Matrix4::identity() * 100.0,
            f,
            h: Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            q: Matrix4::identity() * PROCESS_NOISE,
            r: Matrix2::identity() * MEASUREMENT_NOISE,
        }
    }

    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    fn update(&mut self, cx: f32, cy: f32) {
        let z = Vector2::new(cx, cy);
        let y = z - self.h * self.x;
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }

    fn centre(&self) -> (f32, f32) {
        (self.x[0], self.x[1])
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────────

pub struct TemplateTracker {
    template: Vec<f32>,
    tw: i32,
    th: i32,
    bbox: BBox,
    kalman: Kalman2D,
    config: TemplateConfig,
}

impl TemplateTracker {
    pub fn start(
        frame: &LumaFrame,
        bbox: BBox,
        config: TemplateConfig,
    ) -> Result<Self, TrackerFailure> {
        let bbox = bbox.clamped(frame.width, frame.height);
        let (tw, th) = (bbox.width(), bbox.height());
        if tw < config.min_size || th < config.min_size {
            return Err(TrackerFailure::Degenerate);
        }

        let mut template = Vec::with_capacity((tw * th) as usize);
        for y in bbox.top..bbox.bottom {
            for x in bbox.left..bbox.right {
                template.push(frame.at(x as u32, y as u32) as f32);
            }
        }

        let centre = centre_of(&bbox);
        Ok(Self {
            template,
            tw,
            th,
            bbox,
            kalman: Kalman2D::new(centre.0, centre.1),
            config,
        })
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// NCC between the template and the window whose top-left is `(x0, y0)`,
    /// sampling every `step`-th pixel.
    fn score(&self, frame: &LumaFrame, x0: i32, y0: i32, step: usize) -> f32 {
        let (mut n, mut st, mut sw, mut stt, mut sww, mut stw) = (0f64, 0f64, 0f64, 0f64, 0f64, 0f64);
        for ty in (0..self.th).step_by(step) {
            let row = (ty * self.tw) as usize;
            for tx in (0..self.tw).step_by(step) {
                let t = self.template[row + tx as usize] as f64;
                let w = frame.at((x0 + tx) as u32, (y0 + ty) as u32) as f64;
                n += 1.0;
                st += t;
                sw += w;
                stt += t * t;
                sww += w * w;
                stw += t * w;
            }
        }
        let cov = stw - st * sw / n;
        let vt = stt - st * st / n;
        let vw = sww - sw * sw / n;
        if vt <= 1e-6 || vw <= 1e-6 {
            return 0.0;
        }
        (cov / (vt * vw).sqrt()) as f32
    }

    fn learn(&mut self, frame: &LumaFrame) {
        let a = self.config.learning_rate;
        let mut i = 0;
        for y in self.bbox.top..self.bbox.bottom {
            for x in self.bbox.left..self.bbox.right {
                let seen = frame.at(x as u32, y as u32) as f32;
                self.template[i] = (1.0 - a) * self.template[i] + a * seen;
                i += 1;
            }
        }
    }
}

impl VisualTracker for TemplateTracker {
    fn advance(&mut self, frame: &LumaFrame) -> Result<BBox, TrackerFailure> {
        let (fw, fh) = (frame.width as i32, frame.height as i32);
        if self.tw > fw || self.th > fh {
            return Err(TrackerFailure::OutOfFrame);
        }

        self.kalman.predict();
        let (pcx, pcy) = self.kalman.centre();
        let px = (pcx - self.tw as f32 / 2.0).round() as i32;
        let py = (pcy - self.th as f32 / 2.0).round() as i32;
        let radius = ((self.tw.max(self.th) as f32 * self.config.search_margin) as i32)
            .max(self.config.min_search_radius);

        // Only windows that lie fully inside the frame are candidates.
        let x_range = (px - radius).max(0)..=(px + radius).min(fw - self.tw);
        let y_range = (py - radius).max(0)..=(py + radius).min(fh - self.th);
        let candidates: Vec<(i32, i32)> = y_range
            .flat_map(|y| x_range.clone().map(move |x| (x, y)))
            .collect();
        if candidates.is_empty() {
            return Err(TrackerFailure::OutOfFrame);
        }

        let (best_idx, _) = candidates
            .par_iter()
            .enumerate()
            .map(|(i, &(x, y))| (i, self.score(frame, x, y, 2)))
            .reduce(
                || (usize::MAX, f32::MIN),
                |a, b| {
                    if b.1 > a.1 || (b.1 == a.1 && b.0 < a.0) { b } else { a }
                },
            );
        let (bx, by) = candidates[best_idx];

        let score = self.score(frame, bx, by, 1);
        if score < self.config.min_correlation {
            return Err(TrackerFailure::LostTarget { score });
        }

        self.bbox = BBox::new(bx, by, bx + self.tw, by + self.th);
        let (cx, cy) = centre_of(&self.bbox);
        self.kalman.update(cx, cy);
        self.learn(frame);
        Ok(self.bbox)
    }
}

fn centre_of(bbox: &BBox) -> (f32, f32) {
    (
        (bbox.left + bbox.right) as f32 / 2.0,
        (bbox.top + bbox.bottom) as f32 / 2.0,
    )
}
