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

//! The two per-track frame buffers and queries across them.

use crate::buffer::{FrameBuffer, MAX_GAP_SIZE};
use crate::frame::{DecodedFrame, EncodedFrame};
use crate::types::BufferedRanges;

/// One elementary track's buffered media.
///
/// The demuxed buffer holds encoded frames in decode (dts) order and defines
/// the MSE buffered ranges; its contents live until the host removes them.
/// The decoded buffer holds decoded frames in presentation (pts) order and
/// stays small: it only covers a short window ahead of the playhead, with
/// frames dropped once the playhead passes them.
///
/// Fully thread-safe; frames are appended and removed from different threads.
pub struct Stream {
    demuxed_frames: FrameBuffer<EncodedFrame>,
    decoded_frames: FrameBuffer<DecodedFrame>,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            demuxed_frames: FrameBuffer::new(true),
            decoded_frames: FrameBuffer::new(false),
        }
    }

    pub fn demuxed_frames(&self) -> &FrameBuffer<EncodedFrame> {
        &self.demuxed_frames
    }

    pub fn decoded_frames(&self) -> &FrameBuffer<DecodedFrame> {
        &self.decoded_frames
    }

    /// The buffered ranges reported to the host come from the demuxed side.
    pub fn buffered_ranges(&self) -> BufferedRanges {
        self.demuxed_frames.buffered_ranges()
    }

    /// Seconds of decoded content ahead of `time` within the decoded range
    /// containing it (gap-tolerant), or 0 if `time` is not covered.  Used by
    /// the decode loop for backpressure.
    pub fn decoded_ahead_of(&self, time: f64) -> f64 {
        for range in self.decoded_frames.buffered_ranges() {
            if range.end > time {
                if range.start < time + MAX_GAP_SIZE {
                    return range.end - time.max(range.start);
                }
                // Ranges are sorted; nothing later can contain `time`.
                break;
            }
        }
        0.0
    }

    pub fn estimate_size(&self) -> usize {
        self.demuxed_frames.estimate_size() + self.decoded_frames.estimate_size()
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}
