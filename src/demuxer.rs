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

//! Container parsing runs on its own thread, decoupled from the host.
//!
//! The host implements [`Demuxer`] (the actual container parser);
//! [`DemuxerThread`] owns the worker that feeds appended bytes through it,
//! filters the produced frames against the append window, and pushes the
//! survivors into the track's demuxed buffer.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::frame::EncodedFrame;
use crate::stream::Stream;
use crate::task::TaskRunner;

/// The kind of encrypted init data found in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitDataType {
    Cenc,
    KeyIds,
    WebM,
}

/// Demuxer events, delivered while a `demux` call is in progress.  These
/// may arrive on the demuxer worker thread.
pub trait DemuxerClient: Send + Sync + 'static {
    /// Called once the first init segment has been processed.  `duration`
    /// is the stream duration estimated from it, or infinity if unknown.
    fn on_loaded_metadata(&self, duration: f64);

    /// Called when *new* encrypted init data is seen; not repeated for
    /// init data already reported.
    fn on_encrypted_init_data(&self, data_type: InitDataType, data: &[u8]);
}

/// A synchronous container parser.  Only used from a single worker thread
/// after construction.
///
/// A demuxer may be handed segments from a new source mid-stream: first the
/// new init segment, then its media segments.  Frames from the new source
/// must carry a different `stream_info` than before, even for the same
/// codec.
pub trait Demuxer: Send + 'static {
    /// Resets partial parse state to read a fresh stream, e.g. after a
    /// seek discards buffered input.
    fn reset(&mut self);

    /// Parses `data` into zero or more encoded frames, with `timestamp_offset`
    /// added to their timestamps.
    fn demux(
        &mut self,
        timestamp_offset: f64,
        data: &[u8],
        client: &dyn DemuxerClient,
    ) -> Result<Vec<EncodedFrame>>;
}

pub type AppendCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct PendingAppend {
    timestamp_offset: f64,
    window_start: f64,
    window_end: f64,
    data: Vec<u8>,
    on_complete: AppendCallback,
}

struct State {
    pending: Option<PendingAppend>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    new_data: Condvar,
}

/// Owns the demuxer worker thread.
///
/// Appends are handed over one at a time; completion callbacks are posted
/// to the task runner, never run on the worker.  An append made after the
/// worker hit a fatal error, or still queued when the thread is stopped,
/// completes with [`MediaError::Detached`].
pub struct DemuxerThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DemuxerThread {
    /// Spawns the worker.  `factory` runs on the worker thread; if it
    /// fails, the error is held until the first append supplies a callback
    /// to deliver it to.
    pub fn new<F>(
        factory: F,
        stream: Arc<Stream>,
        client: Arc<dyn DemuxerClient>,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Demuxer>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: None,
                shutdown: false,
            }),
            new_data: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("media-demuxer".to_string())
            .spawn(move || {
                Worker {
                    shared: worker_shared,
                    stream,
                    client,
                    task_runner,
                    need_key_frame: true,
                }
                .run(factory)
            })
            .expect("failed to spawn demuxer thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Hands `data` to the worker to demux.
    ///
    /// Frames entirely inside `[window_start, window_end]` are buffered;
    /// frames outside are dropped, and frames after a drop are skipped
    /// until the next key frame.  `on_complete` is posted to the task
    /// runner exactly once.
    ///
    /// Only one append may be in flight at a time; the caller must wait
    /// for `on_complete` before appending again.
    pub fn append_data(
        &self,
        timestamp_offset: f64,
        window_start: f64,
        window_end: f64,
        data: Vec<u8>,
        on_complete: AppendCallback,
    ) {
        debug_assert!(!data.is_empty());
        let mut state = self.shared.state.lock().unwrap();
        debug_assert!(state.pending.is_none(), "append already in flight");
        state.pending = Some(PendingAppend {
            timestamp_offset,
            window_start,
            window_end,
            data,
            on_complete,
        });
        self.shared.new_data.notify_all();
    }

    /// Stops and joins the worker thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.new_data.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    shared: Arc<Shared>,
    stream: Arc<Stream>,
    client: Arc<dyn DemuxerClient>,
    task_runner: Arc<dyn TaskRunner>,
    need_key_frame: bool,
}

impl Worker {
    fn run<F>(mut self, factory: F)
    where
        F: FnOnce() -> Result<Box<dyn Demuxer>>,
    {
        let mut demuxer = match factory() {
            Ok(demuxer) => demuxer,
            Err(e) => {
                // An error before the first append has no callback to
                // report to; hold it until one arrives.
                log::warn!("demuxer init failed: {e}");
                if let Some(pending) = self.wait_for_append() {
                    self.complete(pending.on_complete, Err(e));
                }
                self.reject_remaining_appends();
                return;
            }
        };

        while let Some(pending) = self.wait_for_append() {
            let PendingAppend {
                timestamp_offset,
                window_start,
                window_end,
                data,
                on_complete,
            } = pending;

            match demuxer.demux(timestamp_offset, &data, self.client.as_ref()) {
                Ok(frames) => {
                    self.push_frames(frames, window_start, window_end);
                    self.complete(on_complete, Ok(()));
                }
                Err(e) => {
                    self.complete(on_complete, Err(e));
                    self.reject_remaining_appends();
                    return;
                }
            }
        }
    }

    /// After a fatal error the worker can't demux anymore, but every
    /// append must still resolve its callback; complete them with
    /// `Detached` until shutdown.
    fn reject_remaining_appends(&self) {
        while let Some(pending) = self.wait_for_append() {
            self.complete(pending.on_complete, Err(MediaError::Detached));
        }
    }

    /// Blocks until an append arrives.  Returns `None` on shutdown; a
    /// pending append at shutdown is completed with `Detached` first.
    fn wait_for_append(&self) -> Option<PendingAppend> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(pending) = state.pending.take() {
                if state.shutdown {
                    drop(state);
                    self.complete(pending.on_complete, Err(MediaError::Detached));
                    return None;
                }
                return Some(pending);
            }
            if state.shutdown {
                return None;
            }
            state = self.shared.new_data.wait(state).unwrap();
        }
    }

    fn push_frames(&mut self, frames: Vec<EncodedFrame>, window_start: f64, window_end: f64) {
        for frame in frames {
            if frame.pts < window_start || frame.pts + frame.duration > window_end {
                // A dropped frame breaks the dependency chain for
                // everything up to the next key frame.
                self.need_key_frame = true;
                log::trace!("dropping frame outside append window, pts={}", frame.pts);
                continue;
            }
            if self.need_key_frame {
                if frame.is_key_frame {
                    self.need_key_frame = false;
                } else {
                    log::trace!(
                        "dropping frame while looking for key frame, pts={}",
                        frame.pts
                    );
                    continue;
                }
            }
            self.stream.demuxed_frames().append_frame(Arc::new(frame));
        }
    }

    fn complete(&self, on_complete: AppendCallback, result: Result<()>) {
        self.task_runner
            .post_task(Box::new(move || on_complete(result)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::InlineTaskRunner;
    use std::sync::mpsc;
    use std::time::Duration;

    struct NullClient;
    impl DemuxerClient for NullClient {
        fn on_loaded_metadata(&self, _duration: f64) {}
        fn on_encrypted_init_data(&self, _data_type: InitDataType, _data: &[u8]) {}
    }

    /// Emits one preset batch of frames per demux call.
    struct FakeDemuxer {
        batches: Vec<Vec<EncodedFrame>>,
    }

    impl Demuxer for FakeDemuxer {
        fn reset(&mut self) {}

        fn demux(
            &mut self,
            _timestamp_offset: f64,
            _data: &[u8],
            _client: &dyn DemuxerClient,
        ) -> Result<Vec<EncodedFrame>> {
            if self.batches.is_empty() {
                return Err(MediaError::InvalidContainerData);
            }
            Ok(self.batches.remove(0))
        }
    }

    fn frame(pts: f64, duration: f64, key: bool) -> EncodedFrame {
        EncodedFrame {
            stream_info: crate::frame::test_support::stream_info(),
            pts,
            dts: pts,
            duration,
            is_key_frame: key,
            data: vec![0; 8],
            is_encrypted: false,
            timestamp_offset: 0.0,
        }
    }

    fn append_and_wait(
        thread: &DemuxerThread,
        window_start: f64,
        window_end: f64,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        thread.append_data(
            0.0,
            window_start,
            window_end,
            vec![1, 2, 3],
            Box::new(move |result| tx.send(result).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn spawn(batches: Vec<Vec<EncodedFrame>>, stream: Arc<Stream>) -> DemuxerThread {
        DemuxerThread::new(
            move || Ok(Box::new(FakeDemuxer { batches }) as Box<dyn Demuxer>),
            stream,
            Arc::new(NullClient),
            Arc::new(InlineTaskRunner),
        )
    }

    #[test]
    fn buffers_demuxed_frames() {
        let stream = Arc::new(Stream::new());
        let batch = vec![frame(0.0, 1.0, true), frame(1.0, 1.0, false)];
        let thread = spawn(vec![batch], Arc::clone(&stream));

        append_and_wait(&thread, 0.0, f64::INFINITY).unwrap();

        let ranges = stream.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (0.0, 2.0));
    }

    #[test]
    fn drops_frames_outside_append_window() {
        let stream = Arc::new(Stream::new());
        let batch = vec![
            frame(0.0, 1.0, true),
            frame(1.0, 1.0, true),
            frame(2.0, 1.0, true),
            frame(3.0, 1.0, true),
        ];
        let thread = spawn(vec![batch], Arc::clone(&stream));

        append_and_wait(&thread, 1.0, 3.0).unwrap();

        let ranges = stream.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (1.0, 3.0));
    }

    #[test]
    fn skips_dependent_frames_after_a_window_drop() {
        let stream = Arc::new(Stream::new());
        // Frame at 0 is clipped by the window; the non-key frames that
        // depend on it must be skipped too, up to the key frame at 3.
        let batch = vec![
            frame(0.0, 1.0, true),
            frame(1.0, 1.0, false),
            frame(2.0, 1.0, false),
            frame(3.0, 1.0, true),
            frame(4.0, 1.0, false),
        ];
        let thread = spawn(vec![batch], Arc::clone(&stream));

        append_and_wait(&thread, 0.5, f64::INFINITY).unwrap();

        let ranges = stream.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (3.0, 5.0));
    }

    #[test]
    fn key_frame_gate_spans_appends() {
        let stream = Arc::new(Stream::new());
        // The worker starts out needing a key frame; an append made of
        // only dependent frames buffers nothing, even across calls.
        let batches = vec![
            vec![frame(0.0, 1.0, false)],
            vec![frame(1.0, 1.0, false), frame(2.0, 1.0, true)],
        ];
        let thread = spawn(batches, Arc::clone(&stream));

        append_and_wait(&thread, 0.0, f64::INFINITY).unwrap();
        assert!(stream.buffered_ranges().is_empty());

        append_and_wait(&thread, 0.0, f64::INFINITY).unwrap();
        let ranges = stream.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (2.0, 3.0));
    }

    #[test]
    fn demux_error_fails_the_append() {
        let stream = Arc::new(Stream::new());
        let thread = spawn(vec![], Arc::clone(&stream));

        let result = append_and_wait(&thread, 0.0, f64::INFINITY);
        assert!(matches!(result, Err(MediaError::InvalidContainerData)));
    }

    #[test]
    fn appends_after_a_fatal_error_still_resolve() {
        let stream = Arc::new(Stream::new());
        let thread = spawn(vec![], Arc::clone(&stream));

        let result = append_and_wait(&thread, 0.0, f64::INFINITY);
        assert!(matches!(result, Err(MediaError::InvalidContainerData)));

        // The worker can't demux anymore, but later appends must still
        // resolve their callbacks rather than hang.
        let result = append_and_wait(&thread, 0.0, f64::INFINITY);
        assert!(matches!(result, Err(MediaError::Detached)));
    }

    #[test]
    fn init_error_waits_for_first_append() {
        let stream = Arc::new(Stream::new());
        let thread = DemuxerThread::new(
            || Err(MediaError::NotSupported),
            stream,
            Arc::new(NullClient),
            Arc::new(InlineTaskRunner),
        );

        // The construction error surfaces through the first append; later
        // appends resolve with Detached.
        let result = append_and_wait(&thread, 0.0, f64::INFINITY);
        assert!(matches!(result, Err(MediaError::NotSupported)));

        let result = append_and_wait(&thread, 0.0, f64::INFINITY);
        assert!(matches!(result, Err(MediaError::Detached)));
    }

    #[test]
    fn stop_while_parked_joins_cleanly() {
        let stream = Arc::new(Stream::new());
        // A failed factory leaves the worker parked waiting for the first
        // append; stop must still wake and join it.
        let mut thread = DemuxerThread::new(
            || Err(MediaError::NotSupported),
            stream,
            Arc::new(NullClient),
            Arc::new(InlineTaskRunner),
        );
        thread.stop();
    }
}
