//! YOLOv8 ONNX detector
//!
//! Runs the exported 80-class COCO model on a stretched 640×640 copy of the
//! frame and decodes every proposal to its best class. Suppression is class
//! aware: a car never suppresses an overlapping person.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use super::{BBox, ObjectDetector, RawDetection};
use crate::video::RgbFrame;

/// YOLOv8 input size (square).
const YOLO_SIZE: u32 = 640;
/// Proposal count of the 640 export; used when the output shape is unknown.
const DEFAULT_PROPOSALS: usize = 8400;

/// Wraps the YOLOv8 ONNX session.
pub struct YoloDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref())?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            YOLO_SIZE,
            YOLO_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 640, 640].
        let size = (YOLO_SIZE * YOLO_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(
        &mut self,
        frame: &RgbFrame,
        confidence_threshold: f32,
        overlap_threshold: f32,
    ) -> Result<Vec<RawDetection>> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("YOLOv8 inference failed")?;

        // YOLOv8 output: [1, 4 + classes, proposals], column-major per proposal
        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;

        let rows = shape.get(1).map(|&r| r as usize).unwrap_or(84);
        let num_proposals = shape
            .get(2)
            .map(|&p| p as usize)
            .unwrap_or(DEFAULT_PROPOSALS);
        anyhow::ensure!(rows > 4, "unexpected YOLOv8 output shape {shape:?}");
        let num_classes = rows - 4;

        let scale_x = frame.width as f32 / YOLO_SIZE as f32;
        let scale_y = frame.height as f32 / YOLO_SIZE as f32;

        let candidates: Vec<RawDetection> = (0..num_proposals)
            .into_par_iter()
            .filter_map(|i| {
                let (class_id, score) = (0..num_classes)
                    .map(|c| (c, data[(4 + c) * num_proposals + i]))
                    .fold((0usize, f32::MIN), |best, cur| {
                        if cur.1 > best.1 { cur } else { best }
                    });
                if score < confidence_threshold {
                    return None;
                }

                let cx = data[i];
                let cy = data[num_proposals + i];
                let w = data[2 * num_proposals + i];
                let h = data[3 * num_proposals + i];

                let bbox = BBox::new(
                    ((cx - w / 2.0) * scale_x) as i32,
                    ((cy - h / 2.0) * scale_y) as i32,
                    ((cx + w / 2.0) * scale_x) as i32,
                    ((cy + h / 2.0) * scale_y) as i32,
                )
                .clamped(frame.width, frame.height);

                Some(RawDetection {
                    class_id: class_id as u32,
                    score,
                    bbox,
                })
            })
            .collect();

        let kept = nms(candidates, overlap_threshold);
        debug!(kept = kept.len(), "yolo detections");
        Ok(kept)
    }
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(num_threads())
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_execution_providers([ep::CPUExecutionProvider::default().build()])
        .context("failed to register execution providers")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load YOLOv8 ONNX model {}", model_path.display()))
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy per-class NMS: sort by score descending, suppress same-class boxes
/// overlapping a kept one by more than `iou_thresh`.
fn nms(mut boxes: Vec<RawDetection>, iou_thresh: f32) -> Vec<RawDetection> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<RawDetection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[j].class_id == boxes[i].class_id
                && boxes[i].bbox.iou(&boxes[j].bbox) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}
