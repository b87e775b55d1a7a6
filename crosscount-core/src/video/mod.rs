//! video — FFmpeg bridge
//!
//! Pull-based decoding: the engine asks for one frame at a time so it can stop
//! between frames. Frames wider than the configured maximum are downscaled by
//! the swscale context during RGB conversion, keeping the aspect ratio.
//!
//! [`VideoWriter`] encodes annotated frames back to H.264 for verbose runs.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, encoder, format, frame, media, software::scaling};
use std::path::Path;
use tracing::{debug, info};

pub use ffmpeg_next::util::rational::Rational;

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Bilinear is fast and good enough for both the downscale and the encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// Copy of the rows from `top` to the bottom of the frame.
    pub fn crop_rows(&self, top: u32) -> RgbFrame {
        let top = top.min(self.height);
        let stride = (self.width * 3) as usize;
        RgbFrame {
            data: self.data[top as usize * stride..].to_vec(),
            width: self.width,
            height: self.height - top,
            pts: self.pts,
        }
    }

    /// BT.601 luminance plane, used by the correlation trackers.
    pub fn to_luma(&self) -> LumaFrame {
        let data = self
            .data
            .chunks_exact(3)
            .map(|px| {
                (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32 + 0.5) as u8
            })
            .collect();
        LumaFrame {
            data,
            width: self.width,
            height: self.height,
        }
    }
}

/// Single-channel 8-bit frame.
#[derive(Debug, Clone)]
pub struct LumaFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl LumaFrame {
    #[inline]
    pub fn at(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Anything that yields frames in presentation order.
pub trait FrameSource {
    /// `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Output size for a frame of `width × height` capped at `max_width`.
pub fn fit_width(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width, height);
    }
    let out_h = (height as u64 * max_width as u64 / width as u64).max(1) as u32;
    // swscale wants even dimensions for the YUV round trip
    (max_width & !1, (out_h & !1).max(2))
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct VideoReader {
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    decoded: frame::Video,
    rgb: frame::Video,
    out_width: u32,
    out_height: u32,
    time_base: Rational,
    frame_rate: Rational,
    eof_sent: bool,
    frame_count: u64,
}

impl VideoReader {
    /// Open `source` (file path or stream URL) and prepare an RGB24 scaler
    /// that caps the output width at `max_width`.
    pub fn open<P: AsRef<Path>>(source: P, max_width: u32) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&source).context("could not open video source")?;
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let frame_rate = stream.avg_frame_rate();

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let src_width = decoder.width();
        let src_height = decoder.height();
        let (out_width, out_height) = fit_width(src_width, src_height, max_width);

        let to_rgb = scaling::Context::get(
            decoder.format(),
            src_width,
            src_height,
            format::Pixel::RGB24,
            out_width,
            out_height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            src_width,
            src_height, out_width, out_height, "opened input video stream"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            out_width,
            out_height,
            time_base,
            frame_rate,
            eof_sent: false,
            frame_count: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let row_len = self.out_width as usize * 3;
        let mut data = Vec::with_capacity(row_len * self.out_height as usize);
        for row in 0..self.out_height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frame_count as i64);
        self.frame_count += 1;
        if self.frame_count % 100 == 0 {
            debug!(frame_count = self.frame_count, "decoded frames");
        }

        Ok(RgbFrame {
            data,
            width: self.out_width,
            height: self.out_height,
            pts,
        })
    }
}

impl FrameSource for VideoReader {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// H.264 encoder for fixed-size RGB frames.
pub struct VideoWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl VideoWriter {
    pub fn create<P: AsRef<Path>>(
        output_path: P,
        width: u32,
        height: u32,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx = format::output(&output_path).context("could not create output context")?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let mut out_stream = octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg_next::Dictionary::from_iter([("crf", "23"), ("preset", "veryfast")]),
            )
            .context("failed to open H.264 encoder")?;
        out_stream.set_parameters(&encoder);
        let stream_index = out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .context("failed to write output header")?;
        info!(width, height, "annotated output opened");

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            width,
            height,
            frame_count: 0,
        })
    }

    pub fn write(&mut self, rgb: &RgbFrame) -> Result<()> {
        anyhow::ensure!(
            rgb.width == self.width && rgb.height == self.height,
            "frame is {}x{}, writer expects {}x{}",
            rgb.width,
            rgb.height,
            self.width,
            self.height
        );

        let out_stride = self.rgb_frame.stride(0);
        let row_len = self.width as usize * 3;
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.height as usize {
            let dst = row * out_stride;
            let src = row * row_len;
            plane[dst..dst + row_len].copy_from_slice(&rgb.data[src..src + row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(rgb.pts));
        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()?;
        self.frame_count += 1;
        Ok(())
    }

    /// Flush the encoder and write the container trailer.
    pub fn finish(mut self) -> Result<()> {
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frame_count = self.frame_count, "annotated output finished");
        Ok(())
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain(&mut self) -> Result<()> {
        let dst_tb = self
            .octx
            .stream(self.stream_index)
            .context("output stream vanished")?
            .time_base();
        let mut encoded = ffmpeg_next::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, dst_tb);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}
