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

//! The polling thread that watches buffering levels and drives the
//! pipeline state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::MAX_GAP_SIZE;
use crate::clock::Clock;
use crate::pipeline::PipelineManager;
use crate::types::{BufferedRanges, MediaReadyState, PipelineStatus};

/// Poll interval.
const POLL_DELAY: f64 = 0.01;

/// Seconds of buffered content needed ahead of the playhead to play.
const NEED_FOR_PLAY: f64 = 0.3;

/// Slack for ranges that stop just short of the duration.
const DURATION_EPSILON: f64 = 0.1;

/// Playback may end early when within this window of the duration...
const END_WINDOW: f64 = 0.5;

/// ...and within this distance of the end of decoded content.  Tracks
/// often carry slightly less media than their nominal duration.
const END_EPSILON: f64 = 0.025;

fn is_buffered_until(ranges: &BufferedRanges, start: f64, end: f64, duration: f64) -> bool {
    ranges.iter().any(|r| {
        r.start <= start + MAX_GAP_SIZE && (r.end >= end || end + DURATION_EPSILON >= duration)
    })
}

fn can_play(ranges: &BufferedRanges, time: f64, duration: f64) -> bool {
    is_buffered_until(ranges, time, time + NEED_FOR_PLAY, duration)
}

/// Whether playback has reached the effective end of the media.
fn at_end(decoded: &BufferedRanges, time: f64, duration: f64) -> bool {
    if duration.is_nan() {
        return false;
    }
    if time >= duration {
        return true;
    }
    duration - time <= END_WINDOW
        && decoded.last().is_some_and(|last| time + END_EPSILON >= last.end)
}

pub type RangesSource = Box<dyn Fn() -> BufferedRanges + Send>;
pub type ReadyStateCallback = Box<dyn Fn(MediaReadyState) + Send>;

/// Polls the buffers every [`POLL_DELAY`] seconds and reports what it sees
/// to the [`PipelineManager`] and, as an HTML-style ready state, to the
/// host.  The ready state callback fires only on transitions.
pub struct PipelineMonitor {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PipelineMonitor {
    pub fn new(
        get_buffered: RangesSource,
        get_decoded: RangesSource,
        ready_state_changed: ReadyStateCallback,
        clock: Arc<dyn Clock>,
        pipeline: Arc<PipelineManager>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("media-monitor".to_string())
            .spawn(move || {
                monitor_loop(
                    get_buffered,
                    get_decoded,
                    ready_state_changed,
                    clock,
                    pipeline,
                    worker_shutdown,
                )
            })
            .expect("failed to spawn monitor thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stops and joins the monitor thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipelineMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(
    get_buffered: RangesSource,
    get_decoded: RangesSource,
    ready_state_changed: ReadyStateCallback,
    clock: Arc<dyn Clock>,
    pipeline: Arc<PipelineManager>,
    shutdown: Arc<AtomicBool>,
) {
    let mut ready_state = MediaReadyState::HaveNothing;

    while !shutdown.load(Ordering::Acquire) {
        let buffered = get_buffered();
        let decoded = get_decoded();
        let time = pipeline.current_time();
        let duration = pipeline.duration();
        let can_play_now = can_play(&buffered, time, duration);

        if at_end(&decoded, time, duration) {
            pipeline.on_ended();
        } else if can_play_now && is_buffered_until(&decoded, time, time, duration) {
            // Don't let the playhead move until something is decoded at
            // the current position; this keeps playback stopped behind
            // decryption or decode failures instead of skipping them.
            pipeline.can_play();
        } else {
            pipeline.stalled();
        }

        let new_state = if pipeline.status() == PipelineStatus::Initializing {
            MediaReadyState::HaveNothing
        } else if can_play_now {
            MediaReadyState::HaveFutureData
        } else if is_buffered_until(&buffered, time, time, duration) {
            MediaReadyState::HaveCurrentData
        } else {
            MediaReadyState::HaveMetadata
        };
        if new_state != ready_state {
            ready_state = new_state;
            log::debug!("ready state changed to {new_state:?}");
            ready_state_changed(new_state);
        }

        clock.sleep(POLL_DELAY);
    }
}
