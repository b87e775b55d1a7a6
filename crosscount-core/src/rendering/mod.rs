//! rendering — verbose-mode overlay
//!
//! Draws what the engine currently believes onto a copy of the frame: the
//! detection cutoff, the counting midline, this frame's boxes and one marker
//! per live track (red once counted, green while still tracking).

use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::counting::{CrossingCounter, TrackState};
use crate::detection::{Centroid, Detection};
use crate::tracking::{TrackId, TrackRegistry};
use crate::video::{Rational, RgbFrame, VideoWriter};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MIDLINE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const ROI_COLOR: Rgb<u8> = Rgb([0, 128, 255]);
const TRACKING_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const COUNTED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const MARKER_RADIUS: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub id: TrackId,
    pub centroid: Centroid,
    pub counted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub mid_y: i32,
    pub roi_y: i32,
    pub boxes: Vec<Detection>,
    pub markers: Vec<Marker>,
}

impl Overlay {
    pub fn build(
        boxes: &[Detection],
        registry: &TrackRegistry,
        counter: &CrossingCounter,
        roi_y: u32,
    ) -> Self {
        let markers = registry
            .iter()
            .map(|(id, obj)| Marker {
                id,
                centroid: obj.centroid,
                counted: counter
                    .track(id)
                    .is_some_and(|t| t.state() == TrackState::Counted),
            })
            .collect();
        Self {
            mid_y: counter.midline(),
            roi_y: roi_y as i32,
            boxes: boxes.to_vec(),
            markers,
        }
    }
}

/// Whether the run should go on after a frame was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Quit,
}

/// Receives every processed frame in verbose mode.
pub trait FrameSink {
    fn present(&mut self, frame: &RgbFrame, overlay: &Overlay) -> Result<SinkControl>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Draw `overlay` onto `frame` in place.
pub fn draw_overlay(frame: &mut RgbFrame, overlay: &Overlay) -> Result<()> {
    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .context("frame buffer does not match its dimensions")?;
    let right = frame.width.saturating_sub(1) as f32;

    draw_line_segment_mut(
        &mut img,
        (0.0, overlay.roi_y as f32),
        (right, overlay.roi_y as f32),
        ROI_COLOR,
    );
    draw_line_segment_mut(
        &mut img,
        (0.0, overlay.mid_y as f32),
        (right, overlay.mid_y as f32),
        MIDLINE_COLOR,
    );

    for det in &overlay.boxes {
        let (w, h) = (det.bbox.width(), det.bbox.height());
        if w <= 0 || h <= 0 {
            continue;
        }
        let rect = Rect::at(det.bbox.left, det.bbox.top).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(&mut img, rect, BOX_COLOR);
    }

    for marker in &overlay.markers {
        let color = if marker.counted {
            COUNTED_COLOR
        } else {
            TRACKING_COLOR
        };
        draw_filled_circle_mut(
            &mut img,
            (marker.centroid.x, marker.centroid.y),
            MARKER_RADIUS,
            color,
        );
    }

    frame.data = img.into_raw();
    Ok(())
}

/// Writes every presented frame, annotated, to an H.264 file.
pub struct AnnotatedVideoSink {
    writer: Option<VideoWriter>,
    scratch: RgbFrame,
}

impl AnnotatedVideoSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Result<Self> {
        let writer = VideoWriter::create(path, width, height, time_base, frame_rate)?;
        Ok(Self {
            writer: Some(writer),
            scratch: RgbFrame {
                data: Vec::new(),
                width,
                height,
                pts: 0,
            },
        })
    }
}

impl FrameSink for AnnotatedVideoSink {
    fn present(&mut self, frame: &RgbFrame, overlay: &Overlay) -> Result<SinkControl> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(SinkControl::Quit);
        };
        self.scratch.data.clear();
        self.scratch.data.extend_from_slice(&frame.data);
        self.scratch.width = frame.width;
        self.scratch.height = frame.height;
        self.scratch.pts = frame.pts;
        draw_overlay(&mut self.scratch, overlay)?;
        writer.write(&self.scratch)?;
        Ok(SinkControl::Continue)
    }

    fn finish(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }
}
