/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The fundamental frame data structures of the pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Describes the elementary stream a frame came from: the codec and the
/// codec-specific configuration the decoder needs.  Instances are immutable
/// and shared by `Arc`; an encoded frame pointing at a *different*
/// `StreamInfo` than the decoder is configured for triggers decoder
/// reconfiguration (adaptation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Codec name, e.g. "vp9" or "avc1.42E01E".
    pub codec: String,
    /// Coded frame width in pixels, 0 for audio.
    pub width: u32,
    /// Coded frame height in pixels, 0 for audio.
    pub height: u32,
    /// Codec-specific configuration record (e.g. avcC / vpcC payload).
    pub extra_data: Vec<u8>,
}

/// The pixel layout of a decoded video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, three planes.
    Yuv420p,
    /// Y plane plus interleaved UV plane.
    Nv12,
    /// Packed 8-bit RGB, single plane.
    Rgb24,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 => 1,
        }
    }
}

/// A timed unit of media.  Implemented by both encoded and decoded frames
/// so `FrameBuffer` can hold either.
///
/// All times are in seconds.  `dts` is meaningful only for encoded frames
/// (decode order); decoded frames report their `pts` for both.
pub trait MediaFrame: Send + Sync + 'static {
    fn pts(&self) -> f64;
    fn dts(&self) -> f64;
    fn duration(&self) -> f64;
    fn is_key_frame(&self) -> bool;
    /// Rough number of bytes this frame keeps alive, for quota estimates.
    fn estimate_size(&self) -> usize;
}

/// A demuxed, still-compressed frame.  Immutable after construction.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub stream_info: Arc<StreamInfo>,
    pub pts: f64,
    pub dts: f64,
    pub duration: f64,
    pub is_key_frame: bool,
    /// The compressed payload.
    pub data: Vec<u8>,
    /// Whether `data` still needs to go through the CDM before the decoder
    /// can read it.
    pub is_encrypted: bool,
    /// The timestamp offset that was applied when this frame was demuxed.
    /// Persisted so flush-triggered decodes (which have no input frame) can
    /// still reconstruct output timestamps.
    pub timestamp_offset: f64,
}

impl MediaFrame for EncodedFrame {
    fn pts(&self) -> f64 {
        self.pts
    }
    fn dts(&self) -> f64 {
        self.dts
    }
    fn duration(&self) -> f64 {
        self.duration
    }
    fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.len()
    }
}

/// A fully decoded frame, ready for rendering.  Always held in
/// presentation order; a decoded frame never depends on another frame, so
/// it is always a key frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub stream_info: Arc<StreamInfo>,
    pub pts: f64,
    pub duration: f64,
    pub format: PixelFormat,
    /// Pixel planes, one `Vec` per plane of `format`.
    pub planes: Vec<Vec<u8>>,
    /// Bytes per row for each plane.
    pub strides: Vec<usize>,
}

impl MediaFrame for DecodedFrame {
    fn pts(&self) -> f64 {
        self.pts
    }
    fn dts(&self) -> f64 {
        self.pts
    }
    fn duration(&self) -> f64 {
        self.duration
    }
    fn is_key_frame(&self) -> bool {
        true
    }
    fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.planes.iter().map(Vec::len).sum::<usize>()
    }
}

/// Frame constructors shared by the test modules across the crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn stream_info() -> Arc<StreamInfo> {
        Arc::new(StreamInfo {
            codec: "vp9".to_string(),
            width: 320,
            height: 240,
            extra_data: vec![],
        })
    }

    pub fn encoded_frame(pts: f64, duration: f64, is_key_frame: bool) -> Arc<EncodedFrame> {
        Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts,
            dts: pts,
            duration,
            is_key_frame,
            data: vec![0; 16],
            is_encrypted: false,
            timestamp_offset: 0.0,
        })
    }

    pub fn decoded_frame(pts: f64, duration: f64) -> Arc<DecodedFrame> {
        Arc::new(DecodedFrame {
            stream_info: stream_info(),
            pts,
            duration,
            format: PixelFormat::Yuv420p,
            planes: vec![vec![0; 64], vec![0; 16], vec![0; 16]],
            strides: vec![8, 4, 4],
        })
    }
}
