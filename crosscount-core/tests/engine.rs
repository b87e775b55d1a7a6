//! End-to-end runs of the engine over synthetic frames.
//!
//! The scripted object is a 20×20 car that starts centred at (100, 80) in a
//! 200×100 frame and moves 5 rows up per frame. The detector reports where it
//! is on detection frames; the trackers move their box the same 5 rows up.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, bail};

use crosscount_core::{
    EngineConfig, EngineError, Termination, TrackerFailure,
    correlation::{TrackerFactory, VisualTracker},
    counting::{CrossingEvent, Direction, Verdict},
    detection::{BBox, ObjectDetector, RawDetection},
    evaluation::VerdictSource,
    pipeline::{Engine, RunHooks},
    rendering::{FrameSink, Overlay, SinkControl},
    session::{MemorySessionLogger, SessionId, SessionLogger, SessionRecord, SessionSummary},
    video::{FrameSource, LumaFrame, RgbFrame},
};

const WIDTH: u32 = 200;
const HEIGHT: u32 = 100;
const SKIP: u32 = 5;
const STEP: i32 = -5;

fn car_at(frame_index: i32) -> BBox {
    let cy = 80 + STEP * frame_index;
    BBox::new(90, cy - 10, 110, cy + 10)
}

// ── Fakes ────────────────────────────────────────────────────────────────────

struct Frames {
    remaining: u32,
    pts: i64,
}

impl Frames {
    fn new(count: u32) -> Self {
        Self {
            remaining: count,
            pts: 0,
        }
    }
}

impl FrameSource for Frames {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.pts += 1;
        Ok(Some(RgbFrame {
            data: vec![0; (WIDTH * HEIGHT * 3) as usize],
            width: WIDTH,
            height: HEIGHT,
            pts: self.pts,
        }))
    }
}

/// Reports the car where it is on the n-th detection frame.
struct ScriptedDetector {
    calls: Rc<Cell<u32>>,
    fail_on_call: Option<u32>,
}

impl ScriptedDetector {
    fn new() -> (Self, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        (
            Self {
                calls: calls.clone(),
                fail_on_call: None,
            },
            calls,
        )
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&mut self, frame: &RgbFrame, _: f32, _: f32) -> Result<Vec<RawDetection>> {
        assert_eq!(frame.height, HEIGHT);
        let call = self.calls.get();
        self.calls.set(call + 1);
        if self.fail_on_call == Some(call) {
            bail!("inference backend unavailable");
        }
        Ok(vec![RawDetection {
            class_id: 2,
            score: 0.9,
            bbox: car_at((call * SKIP) as i32),
        }])
    }
}

struct SlidingFactory;

struct SlidingTracker(BBox);

impl VisualTracker for SlidingTracker {
    fn advance(&mut self, _: &LumaFrame) -> Result<BBox, TrackerFailure> {
        self.0 = BBox::new(self.0.left, self.0.top + STEP, self.0.right, self.0.bottom + STEP);
        Ok(self.0)
    }
}

impl TrackerFactory for SlidingFactory {
    type Tracker = SlidingTracker;

    fn start(&self, _: &LumaFrame, bbox: BBox) -> Result<SlidingTracker, TrackerFailure> {
        Ok(SlidingTracker(bbox))
    }
}

#[derive(Default)]
struct RecordingSink {
    overlays: Vec<Overlay>,
    quit_after: Option<usize>,
    finished: bool,
}

impl FrameSink for RecordingSink {
    fn present(&mut self, _: &RgbFrame, overlay: &Overlay) -> Result<SinkControl> {
        self.overlays.push(overlay.clone());
        Ok(match self.quit_after {
            Some(n) if self.overlays.len() >= n => SinkControl::Quit,
            _ => SinkControl::Continue,
        })
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

struct FixedVerdicts {
    verdict: Verdict,
    asked: Vec<CrossingEvent>,
}

impl VerdictSource for FixedVerdicts {
    fn verdict(&mut self, event: &CrossingEvent) -> Result<Verdict> {
        self.asked.push(event.clone());
        Ok(self.verdict)
    }
}

/// Answers like an operator who takes a while to look.
struct SlowVerdicts {
    delay: Duration,
}

impl VerdictSource for SlowVerdicts {
    fn verdict(&mut self, _: &CrossingEvent) -> Result<Verdict> {
        std::thread::sleep(self.delay);
        Ok(Verdict::Correct)
    }
}

struct UnreachableStore;

impl SessionLogger for UnreachableStore {
    fn open_session(&mut self, _: &str) -> Result<SessionId> {
        bail!("connection refused")
    }

    fn record_crossing(&mut self, _: &SessionId, _: &CrossingEvent) -> Result<()> {
        unreachable!()
    }

    fn close_session(&mut self, _: &SessionId) -> Result<SessionSummary> {
        unreachable!()
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        roi_y_cutoff: 0,
        skip_interval: SKIP,
        max_disappeared_frames: 3,
        ..EngineConfig::default()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn counts_one_upward_crossing_over_a_full_stream() {
    let (detector, calls) = ScriptedDetector::new();
    let mut engine =
        Engine::new(config(), detector, SlidingFactory, MemorySessionLogger::new()).unwrap();

    let report = engine.run(&mut Frames::new(12), RunHooks::default()).unwrap();

    assert_eq!(report.termination, Termination::StreamEnded);
    assert_eq!(report.frames_processed, 12);
    // frames 0, 5 and 10
    assert_eq!(calls.get(), 3);
    assert_eq!(report.summary, SessionSummary { up: 1, down: 0 });

    assert_eq!(report.tracks.len(), 1);
    let track = &report.tracks[&0];
    assert_eq!(track.class_label, "car");
    assert_eq!(track.direction, Some(Direction::Up));
    assert_eq!(track.centroid_history().len(), 12);
    assert_eq!(track.centroid_history()[7].y, 45);

    let records = &engine.logger().records;
    assert_eq!(records.len(), 3);
    assert!(matches!(records[0], SessionRecord::SessionStarted { .. }));
    assert!(matches!(
        &records[1],
        SessionRecord::Crossing { track_id: 0, direction: Direction::Up, vehicle_type, .. }
            if vehicle_type == "car"
    ));
    assert!(matches!(records[2], SessionRecord::SessionEnded { up: 1, down: 0, .. }));
}

#[test]
fn detector_failure_falls_back_to_tracking() {
    let (mut detector, calls) = ScriptedDetector::new();
    detector.fail_on_call = Some(1);
    let mut engine =
        Engine::new(config(), detector, SlidingFactory, MemorySessionLogger::new()).unwrap();

    let report = engine.run(&mut Frames::new(9), RunHooks::default()).unwrap();

    assert_eq!(calls.get(), 2);
    assert_eq!(report.tracks.len(), 1);
    assert_eq!(report.tracks[&0].direction, Some(Direction::Up));
    assert_eq!(report.tracks[&0].centroid_history()[5].y, 55);
}

#[test]
fn stop_signal_ends_the_run_between_frames() {
    let (detector, _) = ScriptedDetector::new();
    let mut engine =
        Engine::new(config(), detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    let stop = engine.stop_signal();
    let mut progress = move |frames: u64| {
        if frames == 3 {
            stop.raise();
        }
    };

    let report = engine
        .run(
            &mut Frames::new(12),
            RunHooks {
                progress: Some(&mut progress as &mut dyn FnMut(u64)),
                ..RunHooks::default()
            },
        )
        .unwrap();

    assert_eq!(report.termination, Termination::Stopped);
    assert_eq!(report.frames_processed, 3);
    assert_eq!(report.summary, SessionSummary::default());
    assert!(matches!(
        engine.logger().records.last(),
        Some(SessionRecord::SessionEnded { .. })
    ));
}

#[test]
fn sink_quit_stops_and_finishes_the_sink() {
    let (detector, _) = ScriptedDetector::new();
    let cfg = EngineConfig {
        verbose: true,
        ..config()
    };
    let mut engine = Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    let mut sink = RecordingSink {
        quit_after: Some(8),
        ..RecordingSink::default()
    };

    let report = engine
        .run(
            &mut Frames::new(12),
            RunHooks {
                sink: Some(&mut sink as &mut dyn FrameSink),
                ..RunHooks::default()
            },
        )
        .unwrap();

    assert_eq!(report.termination, Termination::Stopped);
    assert_eq!(report.frames_processed, 8);
    assert!(sink.finished);

    let last = sink.overlays.last().unwrap();
    assert_eq!(last.mid_y, 50);
    assert_eq!(last.markers.len(), 1);
    assert!(last.markers[0].counted);
    assert!(!sink.overlays[6].markers[0].counted);
}

#[test]
fn evaluation_collects_verdicts_and_reports() {
    let (detector, _) = ScriptedDetector::new();
    let mut cfg = EngineConfig {
        evaluation_mode: true,
        ..config()
    };
    cfg.ground_truth.insert("car".into(), 2);
    let mut engine = Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    assert!(engine.config().verbose);

    let mut verdicts = FixedVerdicts {
        verdict: Verdict::Incorrect,
        asked: Vec::new(),
    };
    let mut sink = RecordingSink::default();
    let report = engine
        .run(
            &mut Frames::new(12),
            RunHooks {
                sink: Some(&mut sink as &mut dyn FrameSink),
                verdicts: Some(&mut verdicts as &mut dyn VerdictSource),
                ..RunHooks::default()
            },
        )
        .unwrap();

    assert_eq!(verdicts.asked.len(), 1);
    assert_eq!(verdicts.asked[0].direction, Direction::Up);
    assert_eq!(report.tracks[&0].manual_verdict, Some(Verdict::Incorrect));
    assert_eq!(sink.overlays.len(), 12);

    let evaluation = report.evaluation.unwrap();
    assert_eq!(evaluation.counted, 1);
    assert_eq!(evaluation.incorrect, 1);
    assert_eq!(evaluation.false_rate, 100.0);
    let gt = evaluation.ground_truth.unwrap();
    assert_eq!(gt.missed, 2);
    assert_eq!(gt.accuracy, 0.0);
}

#[test]
fn operator_time_is_excluded_from_elapsed() {
    let (detector, _) = ScriptedDetector::new();
    let cfg = EngineConfig {
        evaluation_mode: true,
        ..config()
    };
    let mut engine = Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    let mut verdicts = SlowVerdicts {
        delay: Duration::from_millis(300),
    };

    let report = engine
        .run(
            &mut Frames::new(12),
            RunHooks {
                verdicts: Some(&mut verdicts as &mut dyn VerdictSource),
                ..RunHooks::default()
            },
        )
        .unwrap();

    assert_eq!(report.tracks[&0].manual_verdict, Some(Verdict::Correct));
    assert!(
        report.elapsed_seconds < 0.15,
        "elapsed {} includes the prompt",
        report.elapsed_seconds
    );
}

#[test]
fn evaluation_without_verdict_source_is_rejected() {
    let (detector, _) = ScriptedDetector::new();
    let cfg = EngineConfig {
        evaluation_mode: true,
        ..config()
    };
    let mut engine = Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    let err = engine.run(&mut Frames::new(1), RunHooks::default()).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(engine.logger().records.is_empty());
}

#[test]
fn second_run_starts_without_earlier_tracks() {
    let (mut detector, calls) = ScriptedDetector::new();
    // first detection of the second run
    detector.fail_on_call = Some(1);
    let mut engine =
        Engine::new(config(), detector, SlidingFactory, MemorySessionLogger::new()).unwrap();

    let first = engine.run(&mut Frames::new(3), RunHooks::default()).unwrap();
    assert_eq!(first.tracks.len(), 1);

    let second = engine.run(&mut Frames::new(2), RunHooks::default()).unwrap();
    assert_eq!(calls.get(), 2);
    assert!(second.tracks.is_empty());
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.summary, SessionSummary::default());
}

#[test]
fn failed_crossing_write_keeps_counting() {
    let (detector, _) = ScriptedDetector::new();
    let logger = MemorySessionLogger::new().failing_crossings();
    let mut engine = Engine::new(config(), detector, SlidingFactory, logger).unwrap();

    let report = engine.run(&mut Frames::new(12), RunHooks::default()).unwrap();

    assert_eq!(report.tracks[&0].direction, Some(Direction::Up));
    assert_eq!(engine.logger().crossings().count(), 0);
    assert_eq!(report.termination, Termination::StreamEnded);
}

#[test]
fn unreachable_session_store_is_fatal() {
    let (detector, calls) = ScriptedDetector::new();
    let mut engine = Engine::new(config(), detector, SlidingFactory, UnreachableStore).unwrap();
    let err = engine.run(&mut Frames::new(5), RunHooks::default()).unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert_eq!(calls.get(), 0);
}

#[test]
fn roi_above_every_row_detects_nothing() {
    let (detector, calls) = ScriptedDetector::new();
    let cfg = EngineConfig {
        roi_y_cutoff: HEIGHT,
        ..config()
    };
    let mut engine = Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()).unwrap();
    let report = engine.run(&mut Frames::new(6), RunHooks::default()).unwrap();
    assert_eq!(calls.get(), 0);
    assert!(report.tracks.is_empty());
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let (detector, _) = ScriptedDetector::new();
    let cfg = EngineConfig {
        skip_interval: 0,
        ..config()
    };
    assert!(matches!(
        Engine::new(cfg, detector, SlidingFactory, MemorySessionLogger::new()),
        Err(EngineError::Config(_))
    ));
}
