use std::time::{Duration, Instant};

/// Wall-clock throughput meter that can be paused while the run is blocked
/// on something other than frame processing.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    started: Instant,
    stopped: Option<Instant>,
    paused: Option<Instant>,
    paused_total: Duration,
    frames: u64,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    fn start_at(now: Instant) -> Self {
        Self {
            started: now,
            stopped: None,
            paused: None,
            paused_total: Duration::ZERO,
            frames: 0,
        }
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    fn pause_at(&mut self, now: Instant) {
        if self.paused.is_none() && self.stopped.is_none() {
            self.paused = Some(now);
        }
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    fn resume_at(&mut self, now: Instant) {
        if let Some(since) = self.paused.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    fn stop_at(&mut self, now: Instant) {
        if self.stopped.is_none() {
            self.resume_at(now);
            self.stopped = Some(now);
        }
    }

    /// Count one processed frame.
    pub fn tick(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    fn elapsed_at(&self, now: Instant) -> Duration {
        let end = self.stopped.unwrap_or(now);
        let open_pause = self
            .paused
            .map_or(Duration::ZERO, |since| end.saturating_duration_since(since));
        end.saturating_duration_since(self.started)
            .saturating_sub(self.paused_total + open_pause)
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Frames per second of unpaused time; zero before any time has passed.
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed_seconds();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}
