//! session — run lifecycle and crossing persistence
//!
//! A session is opened once before the first frame, receives every crossing
//! event as it is counted, and is closed with per-direction totals when the
//! run ends. [`JsonlSessionLogger`] appends one JSON object per line so the
//! file can be tailed while a run is in progress.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::counting::{CrossingEvent, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-direction crossing totals of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub up: u64,
    pub down: u64,
}

impl SessionSummary {
    fn add(&mut self, direction: Direction) {
        match direction {
            Direction::Up => self.up += 1,
            Direction::Down => self.down += 1,
        }
    }
}

pub trait SessionLogger {
    fn open_session(&mut self, device_id: &str) -> Result<SessionId>;

    fn record_crossing(&mut self, session: &SessionId, event: &CrossingEvent) -> Result<()>;

    fn close_session(&mut self, session: &SessionId) -> Result<SessionSummary>;
}

impl<L: SessionLogger + ?Sized> SessionLogger for Box<L> {
    fn open_session(&mut self, device_id: &str) -> Result<SessionId> {
        (**self).open_session(device_id)
    }

    fn record_crossing(&mut self, session: &SessionId, event: &CrossingEvent) -> Result<()> {
        (**self).record_crossing(session, event)
    }

    fn close_session(&mut self, session: &SessionId) -> Result<SessionSummary> {
        (**self).close_session(session)
    }
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SessionRecord {
    SessionStarted {
        session_id: SessionId,
        device_id: String,
        time_started: DateTime<Utc>,
    },
    Crossing {
        session_id: SessionId,
        track_id: u64,
        vehicle_type: String,
        direction: Direction,
        time_crossed: DateTime<Utc>,
    },
    SessionEnded {
        session_id: SessionId,
        time_ended: DateTime<Utc>,
        up: u64,
        down: u64,
    },
}

// ── JSON lines ───────────────────────────────────────────────────────────────

pub struct JsonlSessionLogger {
    path: PathBuf,
    out: BufWriter<File>,
    open: HashMap<SessionId, SessionSummary>,
}

impl JsonlSessionLogger {
    /// Open `path` for appending, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open session log {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            open: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &SessionRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record).context("failed to encode session record")?;
        self.out.write_all(b"\n")?;
        self.out
            .flush()
            .with_context(|| format!("failed to write session log {}", self.path.display()))
    }
}

impl SessionLogger for JsonlSessionLogger {
    fn open_session(&mut self, device_id: &str) -> Result<SessionId> {
        let session_id = SessionId::new();
        self.append(&SessionRecord::SessionStarted {
            session_id,
            device_id: device_id.to_string(),
            time_started: Utc::now(),
        })?;
        self.open.insert(session_id, SessionSummary::default());
        debug!(%session_id, device_id, log = %self.path.display(), "session record opened");
        Ok(session_id)
    }

    fn record_crossing(&mut self, session: &SessionId, event: &CrossingEvent) -> Result<()> {
        if !self.open.contains_key(session) {
            bail!("session {session} is not open");
        }
        self.append(&SessionRecord::Crossing {
            session_id: *session,
            track_id: event.track_id,
            vehicle_type: event.class_label.clone(),
            direction: event.direction,
            time_crossed: event.timestamp,
        })?;
        if let Some(summary) = self.open.get_mut(session) {
            summary.add(event.direction);
        }
        Ok(())
    }

    fn close_session(&mut self, session: &SessionId) -> Result<SessionSummary> {
        let Some(summary) = self.open.get(session).copied() else {
            bail!("session {session} is not open");
        };
        self.append(&SessionRecord::SessionEnded {
            session_id: *session,
            time_ended: Utc::now(),
            up: summary.up,
            down: summary.down,
        })?;
        self.open.remove(session);
        debug!(session_id = %session, up = summary.up, down = summary.down, "session record closed");
        Ok(summary)
    }
}

// ── In memory ────────────────────────────────────────────────────────────────

/// Keeps every record in a vector. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionLogger {
    pub records: Vec<SessionRecord>,
    open: HashMap<SessionId, SessionSummary>,
    fail_crossings: bool,
}

impl MemorySessionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `record_crossing` fail, as an unreachable store would.
    pub fn failing_crossings(mut self) -> Self {
        self.fail_crossings = true;
        self
    }

    pub fn crossings(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, SessionRecord::Crossing { .. }))
    }
}

impl SessionLogger for MemorySessionLogger {
    fn open_session(&mut self, device_id: &str) -> Result<SessionId> {
        let session_id = SessionId::new();
        self.records.push(SessionRecord::SessionStarted {
            session_id,
            device_id: device_id.to_string(),
            time_started: Utc::now(),
        });
        self.open.insert(session_id, SessionSummary::default());
        Ok(session_id)
    }

    fn record_crossing(&mut self, session: &SessionId, event: &CrossingEvent) -> Result<()> {
        if self.fail_crossings {
            bail!("crossing store unavailable");
        }
        let Some(summary) = self.open.get_mut(session) else {
            bail!("session {session} is not open");
        };
        summary.add(event.direction);
        self.records.push(SessionRecord::Crossing {
            session_id: *session,
            track_id: event.track_id,
            vehicle_type: event.class_label.clone(),
            direction: event.direction,
            time_crossed: event.timestamp,
        });
        Ok(())
    }

    fn close_session(&mut self, session: &SessionId) -> Result<SessionSummary> {
        let Some(summary) = self.open.remove(session) else {
            bail!("session {session} is not open");
        };
        self.records.push(SessionRecord::SessionEnded {
            session_id: *session,
            time_ended: Utc::now(),
            up: summary.up,
            down: summary.down,
        });
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(track_id: u64, direction: Direction) -> CrossingEvent {
        CrossingEvent {
            track_id,
            class_label: "car".into(),
            direction,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn jsonl_log_has_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut logger = JsonlSessionLogger::create(&path).unwrap();
        let id = logger.open_session("cam-7").unwrap();
        logger.record_crossing(&id, &event(0, Direction::Up)).unwrap();
        logger.record_crossing(&id, &event(3, Direction::Down)).unwrap();
        logger.record_crossing(&id, &event(4, Direction::Down)).unwrap();
        let summary = logger.close_session(&id).unwrap();
        assert_eq!(summary, SessionSummary { up: 1, down: 2 });

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<SessionRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 5);
        assert!(matches!(
            &records[0],
            SessionRecord::SessionStarted { device_id, .. } if device_id == "cam-7"
        ));
        assert!(matches!(
            &records[2],
            SessionRecord::Crossing { track_id: 3, direction: Direction::Down, .. }
        ));
        assert!(matches!(
            records[4],
            SessionRecord::SessionEnded { up: 1, down: 2, .. }
        ));
        assert!(text.lines().nth(1).unwrap().contains("\"record\":\"crossing\""));
    }

    #[test]
    fn jsonl_log_appends_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        for _ in 0..2 {
            let mut logger = JsonlSessionLogger::create(&path).unwrap();
            let id = logger.open_session("local").unwrap();
            logger.close_session(&id).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn unknown_session_is_rejected() {
        let mut logger = MemorySessionLogger::new();
        let stray = SessionId::new();
        assert!(logger.record_crossing(&stray, &event(0, Direction::Up)).is_err());
        assert!(logger.close_session(&stray).is_err());

        let id = logger.open_session("local").unwrap();
        logger.close_session(&id).unwrap();
        assert!(logger.close_session(&id).is_err());
    }

    #[test]
    fn memory_logger_tracks_totals() {
        let mut logger = MemorySessionLogger::new();
        let id = logger.open_session("local").unwrap();
        logger.record_crossing(&id, &event(1, Direction::Up)).unwrap();
        assert_eq!(logger.crossings().count(), 1);
        assert_eq!(
            logger.close_session(&id).unwrap(),
            SessionSummary { up: 1, down: 0 }
        );
    }
}
