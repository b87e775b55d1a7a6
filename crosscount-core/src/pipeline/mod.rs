//! pipeline — the per-frame loop
//!
//! Every processed frame takes exactly one of two paths: a detection pass,
//! which reseeds the correlation trackers, or a tracking pass, which advances
//! them. Either way the resulting boxes go through identity assignment and
//! crossing counting, and any crossing is logged to the open session.

mod stopwatch;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::correlation::{CorrelationStage, TrackerFactory};
use crate::counting::{CrossingCounter, Direction, Track};
use crate::detection::{ClassNames, DetectionAdapter, Detection, ObjectDetector};
use crate::error::{EngineError, EngineResult, Termination};
use crate::evaluation::{EvaluationReport, VerdictSource};
use crate::rendering::{FrameSink, Overlay, SinkControl};
use crate::session::{SessionId, SessionLogger, SessionSummary};
use crate::tracking::{CentroidAssigner, TrackId};
use crate::video::FrameSource;

pub use stopwatch::Stopwatch;

/// Frames between timing summaries in the log.
const PROFILE_EVERY: u64 = 300;

// ── Scheduling ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Track,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameScheduler {
    skip_interval: u32,
}

impl FrameScheduler {
    pub fn new(skip_interval: u32) -> EngineResult<Self> {
        if skip_interval == 0 {
            return Err(EngineError::Config("skip_interval must be positive".into()));
        }
        Ok(Self { skip_interval })
    }

    /// Path for the frame with this zero-based processed index.
    pub fn stage(&self, processed: u64) -> Stage {
        if processed % self.skip_interval as u64 == 0 {
            Stage::Detect
        } else {
            Stage::Track
        }
    }
}

// ── Stop signal ──────────────────────────────────────────────────────────────

/// Cloneable handle that ends a run after the frame in progress.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Run hooks and report ─────────────────────────────────────────────────────

/// Optional collaborators for one run.
#[derive(Default)]
pub struct RunHooks<'a> {
    pub sink: Option<&'a mut dyn FrameSink>,
    pub verdicts: Option<&'a mut dyn VerdictSource>,
    /// Called after every processed frame with the processed count.
    pub progress: Option<&'a mut dyn FnMut(u64)>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: SessionId,
    /// Every track seen during the run, including ones no longer live.
    pub tracks: BTreeMap<TrackId, Track>,
    pub elapsed_seconds: f64,
    pub average_fps: f64,
    pub frames_processed: u64,
    pub termination: Termination,
    pub summary: SessionSummary,
    pub evaluation: Option<EvaluationReport>,
}

#[derive(Default)]
struct StageTimings {
    frames: u64,
    detect_frames: u64,
    detect: Duration,
    track: Duration,
    assign: Duration,
}

impl StageTimings {
    fn maybe_log(&self) {
        if self.frames == 0 || self.frames % PROFILE_EVERY != 0 {
            return;
        }
        let per_frame = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / self.frames as f64);
        info!(
            frames = self.frames,
            detect_frames = self.detect_frames,
            detect_ms_per_frame = per_frame(self.detect),
            track_ms_per_frame = per_frame(self.track),
            assign_ms_per_frame = per_frame(self.assign),
            "pipeline timings"
        );
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine<D, F: TrackerFactory, L> {
    config: EngineConfig,
    class_names: ClassNames,
    scheduler: FrameScheduler,
    adapter: DetectionAdapter<D>,
    stage: CorrelationStage<F>,
    assigner: CentroidAssigner,
    logger: L,
    stop: StopSignal,
}

impl<D, F, L> Engine<D, F, L>
where
    D: ObjectDetector,
    F: TrackerFactory,
    L: SessionLogger,
{
    pub fn new(config: EngineConfig, detector: D, factory: F, logger: L) -> EngineResult<Self> {
        let config = config.normalized();
        config.validate()?;
        let adapter = DetectionAdapter::new(
            detector,
            config.allowed_classes.clone(),
            config.roi_y_cutoff,
            config.confidence_threshold,
            config.overlap_threshold,
        );
        Ok(Self {
            scheduler: FrameScheduler::new(config.skip_interval)?,
            assigner: CentroidAssigner::new(config.max_disappeared_frames),
            stage: CorrelationStage::new(factory),
            class_names: ClassNames::coco(),
            adapter,
            logger,
            stop: StopSignal::new(),
            config,
        })
    }

    pub fn with_class_names(mut self, class_names: ClassNames) -> Self {
        self.class_names = class_names;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// Process `source` until it ends or a stop is requested.
    ///
    /// Only setup failures and a broken source, sink or operator prompt end
    /// the run with an error; the session is closed first where possible.
    pub fn run<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        mut hooks: RunHooks<'_>,
    ) -> EngineResult<RunReport> {
        if self.config.evaluation_mode && hooks.verdicts.is_none() {
            return Err(EngineError::Config(
                "evaluation mode needs an operator verdict source".into(),
            ));
        }

        // Identities and trackers belong to one session.
        self.assigner = CentroidAssigner::new(self.config.max_disappeared_frames);
        self.stage.clear();

        let session_id = self
            .logger
            .open_session(&self.config.device_id)
            .map_err(EngineError::Persistence)?;
        info!(%session_id, device_id = %self.config.device_id, "session opened");

        let mut stopwatch = Stopwatch::start();
        let mut timings = StageTimings::default();
        let mut counter: Option<CrossingCounter> = None;
        let mut processed = 0u64;

        let outcome = loop {
            if self.stop.is_raised() {
                break Ok(Termination::Stopped);
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(Termination::StreamEnded),
                Err(e) => break Err(EngineError::Video(e)),
            };
            let counter = counter.get_or_insert_with(|| CrossingCounter::new(frame.height));
            let luma = frame.to_luma();

            let stage = self.scheduler.stage(processed);
            debug!(processed, ?stage, "frame scheduled");
            let started = Instant::now();
            let boxes: Vec<Detection> = match stage {
                Stage::Detect => {
                    timings.detect_frames += 1;
                    let result = self.adapter.detect(&frame, &luma, &mut self.stage);
                    timings.detect += started.elapsed();
                    match result {
                        Ok(boxes) => boxes,
                        Err(e) => {
                            warn!("detection skipped, tracking instead: {e}");
                            let tracked_from = Instant::now();
                            let boxes = self.stage.advance(&luma);
                            timings.track += tracked_from.elapsed();
                            boxes
                        }
                    }
                }
                Stage::Track => {
                    let boxes = self.stage.advance(&luma);
                    timings.track += started.elapsed();
                    boxes
                }
            };

            let assign_start = Instant::now();
            let registry = self.assigner.update(&boxes);
            let events = counter.observe(registry, &self.class_names, Utc::now());
            timings.assign += assign_start.elapsed();

            for event in &events {
                if let Err(e) = self.logger.record_crossing(&session_id, event) {
                    warn!(track_id = event.track_id, "crossing not persisted: {e:#}");
                }
            }

            let mut control = SinkControl::Continue;
            if self.config.verbose {
                if let Some(sink) = hooks.sink.as_deref_mut() {
                    let overlay = Overlay::build(&boxes, registry, counter, self.config.roi_y_cutoff);
                    match sink.present(&frame, &overlay) {
                        Ok(c) => control = c,
                        Err(e) => break Err(EngineError::Render(e)),
                    }
                }
            }

            if self.config.evaluation_mode && !events.is_empty() {
                if let Some(verdicts) = hooks.verdicts.as_deref_mut() {
                    stopwatch.pause();
                    let judged: anyhow::Result<Vec<_>> = events
                        .iter()
                        .map(|event| verdicts.verdict(event).map(|v| (event.track_id, v)))
                        .collect();
                    stopwatch.resume();
                    match judged {
                        Ok(judged) => {
                            for (id, verdict) in judged {
                                counter.record_verdict(id, verdict);
                            }
                        }
                        Err(e) => break Err(EngineError::Evaluation(e)),
                    }
                }
            }

            stopwatch.tick();
            processed += 1;
            timings.frames = processed;
            timings.maybe_log();
            if let Some(progress) = hooks.progress.as_deref_mut() {
                progress(processed);
            }

            if control == SinkControl::Quit {
                break Ok(Termination::Stopped);
            }
        };
        stopwatch.stop();

        let tracks = counter.map(CrossingCounter::into_tracks).unwrap_or_default();
        let summary = match self.logger.close_session(&session_id) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(%session_id, "session not closed cleanly: {e:#}");
                totals(&tracks)
            }
        };
        let finished = match hooks.sink.as_deref_mut() {
            Some(sink) if self.config.verbose => sink.finish().map_err(EngineError::Render),
            _ => Ok(()),
        };
        let termination = outcome?;
        finished?;

        info!(
            %session_id,
            ?termination,
            frames = processed,
            up = summary.up,
            down = summary.down,
            "run finished"
        );

        let evaluation = self
            .config
            .evaluation_mode
            .then(|| EvaluationReport::from_tracks(&tracks, &self.config.ground_truth));

        Ok(RunReport {
            session_id,
            tracks,
            elapsed_seconds: stopwatch.elapsed_seconds(),
            average_fps: stopwatch.fps(),
            frames_processed: processed,
            termination,
            summary,
            evaluation,
        })
    }
}

fn totals(tracks: &BTreeMap<TrackId, Track>) -> SessionSummary {
    let mut summary = SessionSummary::default();
    for direction in tracks.values().filter_map(|t| t.direction) {
        match direction {
            Direction::Up => summary.up += 1,
            Direction::Down => summary.down += 1,
        }
    }
    summary
}
