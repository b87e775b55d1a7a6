//! counting — one-shot crossing detection per track
//!
//! The reference line is the horizontal midline of the frame. A track is
//! counted the first time its newest centroid is on one side of the line and
//! moving away from where it has been on average: above the line and moving
//! up, or below it and moving down. After that the track only accumulates
//! history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detection::{Centroid, ClassNames};
use crate::tracking::{TrackId, TrackRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator judgement of a counted crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Incorrect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tracking,
    Counted,
}

/// Everything known about one object over its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub class_label: String,
    centroid_history: Vec<Centroid>,
    y_sum: i64,
    pub direction: Option<Direction>,
    pub counted_at: Option<DateTime<Utc>>,
    pub manual_verdict: Option<Verdict>,
}

impl Track {
    pub fn new(id: TrackId, class_label: String, centroid: Centroid) -> Self {
        Self {
            id,
            class_label,
            centroid_history: vec![centroid],
            y_sum: centroid.y as i64,
            direction: None,
            counted_at: None,
            manual_verdict: None,
        }
    }

    pub fn state(&self) -> TrackState {
        if self.counted_at.is_some() {
            TrackState::Counted
        } else {
            TrackState::Tracking
        }
    }

    pub fn last_centroid(&self) -> Option<Centroid> {
        self.centroid_history.last().copied()
    }

    /// Every centroid observed, oldest first.
    pub fn centroid_history(&self) -> &[Centroid] {
        &self.centroid_history
    }

    /// Mean row of the history so far.
    pub fn mean_y(&self) -> f64 {
        self.y_sum as f64 / self.centroid_history.len() as f64
    }

    fn push(&mut self, centroid: Centroid) {
        self.y_sum += centroid.y as i64;
        self.centroid_history.push(centroid);
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ID: {}, Class: {}, Direction: {}, Time Counted: {}",
            self.id,
            self.class_label,
            self.direction.map_or("-", |d| d.as_str()),
            self.counted_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
        )
    }
}

/// Emitted once per track, the frame it is counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub class_label: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

/// Direction implied by a new centroid, if any. `mean_y` is the mean of the
/// prior history, `mid` the reference line.
pub fn crossing_direction(mean_y: f64, y: i32, mid: i32) -> Option<Direction> {
    let signal = y as f64 - mean_y;
    if signal < 0.0 && y < mid {
        Some(Direction::Up)
    } else if signal > 0.0 && y > mid {
        Some(Direction::Down)
    } else {
        None
    }
}

pub struct CrossingCounter {
    mid: i32,
    tracks: BTreeMap<TrackId, Track>,
}

impl CrossingCounter {
    pub fn new(frame_height: u32) -> Self {
        Self {
            mid: (frame_height / 2) as i32,
            tracks: BTreeMap::new(),
        }
    }

    /// Reference line in frame rows.
    pub fn midline(&self) -> i32 {
        self.mid
    }

    /// Feed the current position of every live track. Tracks are kept after
    /// they leave the registry so the final report covers the whole run.
    pub fn observe(
        &mut self,
        registry: &TrackRegistry,
        class_names: &ClassNames,
        now: DateTime<Utc>,
    ) -> Vec<CrossingEvent> {
        let mut events = Vec::new();
        for (id, obj) in registry.iter() {
            let centroid = obj.centroid;
            let Some(track) = self.tracks.get_mut(&id) else {
                let label = class_names.label(obj.class_id);
                self.tracks.insert(id, Track::new(id, label, centroid));
                continue;
            };

            let mean_y = track.mean_y();
            track.push(centroid);

            if track.state() == TrackState::Counted {
                continue;
            }
            if let Some(direction) = crossing_direction(mean_y, centroid.y, self.mid) {
                track.direction = Some(direction);
                track.counted_at = Some(now);
                info!(id, class = %track.class_label, %direction, "crossing counted");
                events.push(CrossingEvent {
                    track_id: id,
                    class_label: track.class_label.clone(),
                    direction,
                    timestamp: now,
                });
            }
        }
        events
    }

    pub fn record_verdict(&mut self, id: TrackId, verdict: Verdict) {
        if let Some(track) = self.tracks.get_mut(&id) {
            track.manual_verdict = Some(verdict);
        }
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> &BTreeMap<TrackId, Track> {
        &self.tracks
    }

    pub fn into_tracks(self) -> BTreeMap<TrackId, Track> {
        self.tracks
    }

    /// Counted tracks per direction.
    pub fn totals(&self) -> (usize, usize) {
        self.tracks
            .values()
            .fold((0, 0), |(up, down), t| match t.direction {
                Some(Direction::Up) => (up + 1, down),
                Some(Direction::Down) => (up, down + 1),
                None => (up, down),
            })
    }
}
