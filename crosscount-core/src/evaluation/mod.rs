//! evaluation — operator verdicts and accuracy report
//!
//! In evaluation mode every counted crossing is shown to an operator, who
//! marks it correct or incorrect. The report compares those verdicts, and
//! optionally a per-class ground truth, against what the engine counted.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::counting::{CrossingEvent, Track, TrackState, Verdict};
use crate::tracking::TrackId;

pub trait VerdictSource {
    /// Block until the operator judges `event`.
    fn verdict(&mut self, event: &CrossingEvent) -> Result<Verdict>;
}

/// Reads one line per verdict. `n` marks the crossing incorrect, anything
/// else correct.
pub struct PromptVerdicts<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptVerdicts<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl PromptVerdicts<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdin() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> VerdictSource for PromptVerdicts<R, W> {
    fn verdict(&mut self, event: &CrossingEvent) -> Result<Verdict> {
        write!(
            self.output,
            "Track {} ({}) counted {}. Correct? [Y/n] ",
            event.track_id, event.class_label, event.direction
        )?;
        self.output.flush()?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read operator verdict")?;
        if read == 0 {
            bail!("verdict input closed");
        }
        Ok(parse_verdict(&line))
    }
}

pub fn parse_verdict(line: &str) -> Verdict {
    if line.trim().eq_ignore_ascii_case("n") {
        Verdict::Incorrect
    } else {
        Verdict::Correct
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundTruthComparison {
    pub expected: u32,
    /// Expected crossings per class not matched by a correct count.
    pub missed: u32,
    pub missed_rate: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub counted: u32,
    pub correct: u32,
    pub incorrect: u32,
    pub false_rate: f64,
    pub incorrect_by_class: BTreeMap<String, u32>,
    pub ground_truth: Option<GroundTruthComparison>,
}

fn percent(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl EvaluationReport {
    /// Build the report from the final track map. Only counted tracks are
    /// considered; a counted track without a verdict is treated as correct.
    pub fn from_tracks(
        tracks: &BTreeMap<TrackId, Track>,
        ground_truth: &BTreeMap<String, u32>,
    ) -> Self {
        let mut correct_by_class: BTreeMap<&str, u32> = BTreeMap::new();
        let mut incorrect_by_class: BTreeMap<String, u32> = BTreeMap::new();
        let (mut correct, mut incorrect) = (0u32, 0u32);

        for track in tracks.values().filter(|t| t.state() == TrackState::Counted) {
            match track.manual_verdict.unwrap_or(Verdict::Correct) {
                Verdict::Correct => {
                    correct += 1;
                    *correct_by_class.entry(track.class_label.as_str()).or_default() += 1;
                }
                Verdict::Incorrect => {
                    incorrect += 1;
                    *incorrect_by_class.entry(track.class_label.clone()).or_default() += 1;
                }
            }
        }
        let counted = correct + incorrect;

        let ground_truth = (!ground_truth.is_empty()).then(|| {
            let expected: u32 = ground_truth.values().sum();
            let missed = ground_truth
                .iter()
                .map(|(class, &want)| {
                    want.saturating_sub(correct_by_class.get(class.as_str()).copied().unwrap_or(0))
                })
                .sum();
            GroundTruthComparison {
                expected,
                missed,
                missed_rate: percent(missed, counted),
                accuracy: percent(correct, expected),
            }
        });

        Self {
            counted,
            correct,
            incorrect,
            false_rate: percent(incorrect, counted),
            incorrect_by_class,
            ground_truth,
        }
    }
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total Count: {}, Correct: {}, False: {}, FalseRate: {:.2}",
            self.counted, self.correct, self.incorrect, self.false_rate
        )?;
        if let Some(gt) = &self.ground_truth {
            write!(
                f,
                ", Ground Truth: {}, Missed: {}, MissedRate: {:.2}, A: {:.2}",
                gt.expected, gt.missed, gt.missed_rate, gt.accuracy
            )?;
        }
        Ok(())
    }
}
