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

//! Picks which decoded frame to put on screen.
//!
//! The host calls [`VideoRenderer::draw_frame`] from its paint loop; the
//! renderer chooses the frame nearest the playhead, tells the host how long
//! to wait before painting again, and trims decoded frames the playhead has
//! passed.

use std::sync::{Arc, Mutex};

use crate::frame::DecodedFrame;
use crate::stream::Stream;

/// Minimum delay, in seconds, between drawing frames.
const MIN_DELAY: f64 = 1.0 / 120.0;

/// Maximum delay, in seconds, between drawing frames.
const MAX_DELAY: f64 = 1.0 / 15.0;

/// How far behind the playhead a displayed frame may trail before the
/// frames behind it are discarded.
const TRAILING_KEEP: f64 = 0.2;

/// What one `draw_frame` call decided.
pub struct DrawResult {
    /// The frame to display, or `None` when nothing is decoded near the
    /// playhead (keep showing whatever is on screen).
    pub frame: Option<Arc<DecodedFrame>>,
    /// Frames the playhead skipped over since the previous draw.
    pub dropped_frame_count: usize,
    /// Whether `frame` differs from the previously drawn one.
    pub is_new_frame: bool,
    /// Seconds until the host should call `draw_frame` again, clamped to
    /// `[MIN_DELAY, MAX_DELAY]`.
    pub delay: f64,
}

struct RenderState {
    /// pts of the last drawn frame, negative before the first draw.
    prev_time: f64,
    is_seeking: bool,
}

pub struct VideoRenderer {
    stream: Arc<Stream>,
    get_time: Box<dyn Fn() -> f64 + Send + Sync>,
    state: Mutex<RenderState>,
}

impl VideoRenderer {
    pub fn new(get_time: Box<dyn Fn() -> f64 + Send + Sync>, stream: Arc<Stream>) -> Self {
        Self {
            stream,
            get_time,
            state: Mutex::new(RenderState {
                prev_time: -1.0,
                is_seeking: false,
            }),
        }
    }

    pub fn draw_frame(&self) -> DrawResult {
        let mut state = self.state.lock().unwrap();

        // Discard frames the playhead has passed, except while seeking
        // (the playhead has jumped, but we keep displaying the old frame).
        if !state.is_seeking && state.prev_time >= 0.0 {
            self.stream
                .decoded_frames()
                .remove(0.0, state.prev_time - TRAILING_KEEP);
        }

        let time = (self.get_time)();
        // While seeking, keep drawing the frame from before the seek so the
        // display doesn't flicker through unrelated frames.
        let ideal_time = if state.is_seeking && state.prev_time >= 0.0 {
            state.prev_time
        } else {
            time
        };
        let ideal_guard = self.stream.decoded_frames().get_frame_near(ideal_time);
        let Some(ideal_frame) = ideal_guard.frame().cloned() else {
            return DrawResult {
                frame: None,
                dropped_frame_count: 0,
                is_new_frame: false,
                delay: MAX_DELAY,
            };
        };
        drop(ideal_guard);

        let next_guard = self.stream.decoded_frames().get_frame_after(ideal_frame.pts);
        let total_delay = next_guard.frame().map_or(0.0, |next| next.pts - time);
        drop(next_guard);
        let delay = total_delay.min(MAX_DELAY).max(MIN_DELAY);

        let is_new_frame = state.prev_time != ideal_frame.pts;
        let mut dropped_frame_count = 0;
        if !state.is_seeking {
            if state.prev_time >= 0.0 {
                dropped_frame_count = self
                    .stream
                    .decoded_frames()
                    .frames_between(state.prev_time, ideal_frame.pts);
            }
            state.prev_time = ideal_frame.pts;
        }

        DrawResult {
            frame: Some(ideal_frame),
            dropped_frame_count,
            is_new_frame,
            delay,
        }
    }

    /// Freezes the display on the current frame until the seek resolves.
    pub fn on_seek(&self) {
        self.state.lock().unwrap().is_seeking = true;
    }

    /// Resumes normal drawing and discards frames from around the old
    /// position, keeping a safety margin on both sides of the playhead so
    /// freshly decoded frames survive.
    pub fn on_seek_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_seeking = false;
        state.prev_time = -1.0;

        let time = (self.get_time)();
        self.stream.decoded_frames().remove(0.0, time - 1.0);
        self.stream.decoded_frames().remove(time + 1.0, f64::INFINITY);
    }
}
