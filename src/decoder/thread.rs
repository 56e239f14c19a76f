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

//! The thread that walks the encoded buffer through the decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::clock::Clock;
use crate::decoder::{Cdm, FrameDecoder};
use crate::error::MediaError;
use crate::stream::Stream;

/// Seconds of decoded content to keep ahead of the playhead before the
/// loop throttles itself.
const DECODE_BUFFER_SIZE: f64 = 1.0;

/// How close to the duration the last decoded frame must be before the
/// stream counts as fully decoded and the decoder is flushed.
const END_DELTA: f64 = 0.1;

/// Sleep while throttled or starved of input.
const IDLE_DELAY: f64 = 0.025;

/// Retry cadence while a decryption key is missing.
const MISSING_KEY_DELAY: f64 = 0.1;

/// Callbacks the decode loop reports through.  All of these may be invoked
/// on the decoder thread.
pub struct DecoderHooks {
    /// Current playhead position, in seconds.
    pub get_time: Box<dyn Fn() -> f64 + Send>,
    /// Current media duration, in seconds.
    pub get_duration: Box<dyn Fn() -> f64 + Send>,
    /// Invoked once decoded output reaches the playhead after a seek.
    pub seek_done: Box<dyn Fn() + Send>,
    /// Invoked when decoding stalls on a missing decryption key.  Raised
    /// at most once per stall.
    pub on_waiting_for_key: Box<dyn Fn() + Send>,
    /// Invoked on a fatal decode error; the loop stops afterwards.
    pub on_error: Box<dyn Fn(MediaError) + Send>,
}

struct SharedState {
    shutdown: AtomicBool,
    is_seeking: AtomicBool,
    did_flush: AtomicBool,
    /// dts of the last frame pushed into the decoder; NaN right after a
    /// seek, which makes the loop restart from a key frame.
    last_frame_time: Mutex<f64>,
    cdm: Mutex<Option<Arc<dyn Cdm>>>,
}

/// Owns the decoder worker thread.
///
/// The loop keeps roughly [`DECODE_BUFFER_SIZE`] seconds decoded ahead of
/// the playhead.  After a seek it rewinds to the key frame at or before
/// the playhead and decodes forward from there; at end of stream it
/// flushes the decoder once to surface the codec's delayed pictures.
pub struct DecoderThread {
    shared: Arc<SharedState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderThread {
    pub fn new(
        decoder: FrameDecoder,
        stream: Arc<Stream>,
        clock: Arc<dyn Clock>,
        hooks: DecoderHooks,
    ) -> Self {
        let shared = Arc::new(SharedState {
            shutdown: AtomicBool::new(false),
            is_seeking: AtomicBool::new(false),
            did_flush: AtomicBool::new(false),
            last_frame_time: Mutex::new(f64::NAN),
            cdm: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("media-decoder".to_string())
            .spawn(move || decode_loop(decoder, stream, clock, hooks, worker_shared))
            .expect("failed to spawn decoder thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Tells the loop the playhead moved: restart from a key frame and
    /// signal `seek_done` once decoded output catches up.
    pub fn on_seek(&self) {
        *self.shared.last_frame_time.lock().unwrap() = f64::NAN;
        self.shared.is_seeking.store(true, Ordering::Release);
        self.shared.did_flush.store(false, Ordering::Release);
    }

    pub fn set_cdm(&self, cdm: Option<Arc<dyn Cdm>>) {
        *self.shared.cdm.lock().unwrap() = cdm;
    }

    /// Stops and joins the worker thread.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    mut decoder: FrameDecoder,
    stream: Arc<Stream>,
    clock: Arc<dyn Clock>,
    hooks: DecoderHooks,
    shared: Arc<SharedState>,
) {
    let mut raised_waiting_event = false;

    while !shared.shutdown.load(Ordering::Acquire) {
        let cur_time = (hooks.get_time)();
        let last_time = *shared.last_frame_time.lock().unwrap();

        let guard = if last_time.is_nan() {
            // Fresh start or just seeked: the decoder state is for some
            // other position, so restart from a key frame.
            decoder.reset();
            stream.demuxed_frames().get_key_frame_before(cur_time)
        } else {
            stream.demuxed_frames().get_frame_after(last_time)
        };

        if stream.decoded_ahead_of(cur_time) > DECODE_BUFFER_SIZE {
            drop(guard);
            clock.sleep(IDLE_DELAY);
            continue;
        }

        let frame = guard.frame().cloned();
        if frame.is_none() {
            let at_end = !last_time.is_nan()
                && last_time + END_DELTA >= (hooks.get_duration)()
                && !shared.did_flush.load(Ordering::Acquire);
            if at_end {
                // Decode one last time with no input, which flushes the
                // decoder's delayed pictures.
                shared.did_flush.store(true, Ordering::Release);
            } else {
                drop(guard);
                clock.sleep(IDLE_DELAY);
                continue;
            }
        }

        let cdm = shared.cdm.lock().unwrap().clone();
        let decoded = decoder.decode_frame(frame.as_ref(), cdm.as_deref());
        // The guard is released only after the decode finishes, so the
        // frame can't be deleted out from under the decoder.
        drop(guard);

        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(MediaError::KeyNotFound) => {
                // The key may still arrive; notify the host once and poll.
                if !raised_waiting_event {
                    raised_waiting_event = true;
                    (hooks.on_waiting_for_key)();
                }
                clock.sleep(MISSING_KEY_DELAY);
                continue;
            }
            Err(e) => {
                log::error!("fatal decode error: {e}");
                (hooks.on_error)(e);
                break;
            }
        };

        raised_waiting_event = false;
        let last_pts = decoded.last().map(|f| f.pts);
        for decoded_frame in decoded {
            stream.decoded_frames().append_frame(decoded_frame);
        }

        if let Some(frame) = frame {
            // Leave `last_frame_time` alone if a seek reset it while this
            // iteration was decoding.
            let updated = {
                let mut t = shared.last_frame_time.lock().unwrap();
                let unchanged = t.to_bits() == last_time.to_bits();
                if unchanged {
                    *t = frame.dts;
                }
                unchanged
            };
            if updated && last_pts.is_some_and(|pts| pts >= cur_time) {
                let was_seeking = shared
                    .is_seeking
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if was_seeking {
                    (hooks.seek_done)();
                }
            }
        }
    }
}
