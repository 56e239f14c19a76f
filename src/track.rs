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

//! The host-facing facade: one fully wired playback pipeline for a single
//! elementary track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::decoder::{Cdm, DecoderBackend, DecoderHooks, DecoderThread, FrameDecoder};
use crate::demuxer::{AppendCallback, Demuxer, DemuxerClient, DemuxerThread, InitDataType};
use crate::error::{MediaError, Result};
use crate::monitor::PipelineMonitor;
use crate::pipeline::PipelineManager;
use crate::renderer::{DrawResult, VideoRenderer};
use crate::stream::Stream;
use crate::task::TaskRunner;
use crate::types::{BufferedRanges, MediaReadyState, PipelineStatus, VideoPlaybackQuality};

/// Host callbacks.  All fields default to no-ops, so hosts only fill in
/// what they listen to.  Callbacks may arrive on pipeline worker threads.
pub struct TrackCallbacks {
    /// First init segment processed; gives the estimated duration.
    pub on_loaded_metadata: Box<dyn Fn(f64) + Send + Sync>,
    pub on_ready_state_changed: Box<dyn Fn(MediaReadyState) + Send + Sync>,
    pub on_pipeline_status_changed: Box<dyn Fn(PipelineStatus) + Send + Sync>,
    /// New encrypted init data found in the container.
    pub on_encrypted_init_data: Box<dyn Fn(InitDataType, Vec<u8>) + Send + Sync>,
    /// Decoding stalled on a missing decryption key.
    pub on_waiting_for_key: Box<dyn Fn() + Send + Sync>,
    /// A fatal pipeline error; playback stops.
    pub on_error: Box<dyn Fn(MediaError) + Send + Sync>,
}

impl Default for TrackCallbacks {
    fn default() -> Self {
        Self {
            on_loaded_metadata: Box::new(|_| {}),
            on_ready_state_changed: Box::new(|_| {}),
            on_pipeline_status_changed: Box::new(|_| {}),
            on_encrypted_init_data: Box::new(|_, _| {}),
            on_waiting_for_key: Box::new(|| {}),
            on_error: Box::new(|_| {}),
        }
    }
}

/// Bridges demuxer events to the pipeline and the host.
struct ClientBridge {
    callbacks: Arc<TrackCallbacks>,
    pipeline: Arc<PipelineManager>,
}

impl DemuxerClient for ClientBridge {
    fn on_loaded_metadata(&self, duration: f64) {
        if duration.is_finite() && self.pipeline.duration().is_nan() {
            self.pipeline.set_duration(duration);
        }
        if self.pipeline.status() == PipelineStatus::Initializing {
            self.pipeline.done_initializing();
        }
        (self.callbacks.on_loaded_metadata)(duration);
    }

    fn on_encrypted_init_data(&self, data_type: InitDataType, data: &[u8]) {
        (self.callbacks.on_encrypted_init_data)(data_type, data.to_vec());
    }
}

/// One media track, fully assembled: demuxer thread, decoder thread,
/// renderer, pipeline state machine, and the monitor driving it.
pub struct Track {
    stream: Arc<Stream>,
    pipeline: Arc<PipelineManager>,
    renderer: Arc<VideoRenderer>,
    decoder_thread: Arc<DecoderThread>,
    demuxer_thread: DemuxerThread,
    monitor: PipelineMonitor,
    append_in_flight: Arc<AtomicBool>,
    quality: Arc<Mutex<VideoPlaybackQuality>>,
}

impl Track {
    pub fn new<F>(
        demuxer_factory: F,
        backend: Box<dyn DecoderBackend>,
        callbacks: TrackCallbacks,
        clock: Arc<dyn Clock>,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Demuxer>> + Send + 'static,
    {
        let callbacks = Arc::new(callbacks);
        let stream = Arc::new(Stream::new());

        // The seek observers (decoder thread, renderer) don't exist yet
        // when the pipeline is built, so the seek callback fans out
        // through this list, filled in below.
        let seek_listeners: Arc<Mutex<Vec<Box<dyn Fn() + Send + Sync>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let pipeline = {
            let callbacks = Arc::clone(&callbacks);
            let seek_listeners = Arc::clone(&seek_listeners);
            Arc::new(PipelineManager::new(
                Box::new(move |status| (callbacks.on_pipeline_status_changed)(status)),
                Box::new(move || {
                    for listener in seek_listeners.lock().unwrap().iter() {
                        listener();
                    }
                }),
                Arc::clone(&clock),
            ))
        };

        let renderer = {
            let pipeline = Arc::clone(&pipeline);
            Arc::new(VideoRenderer::new(
                Box::new(move || pipeline.current_time()),
                Arc::clone(&stream),
            ))
        };

        let decoder_thread = {
            let get_time_pipeline = Arc::clone(&pipeline);
            let get_duration_pipeline = Arc::clone(&pipeline);
            let seek_done_renderer = Arc::clone(&renderer);
            let waiting_callbacks = Arc::clone(&callbacks);
            let error_callbacks = Arc::clone(&callbacks);
            let error_pipeline = Arc::clone(&pipeline);
            Arc::new(DecoderThread::new(
                FrameDecoder::new(backend),
                Arc::clone(&stream),
                Arc::clone(&clock),
                DecoderHooks {
                    get_time: Box::new(move || get_time_pipeline.current_time()),
                    get_duration: Box::new(move || get_duration_pipeline.duration()),
                    seek_done: Box::new(move || seek_done_renderer.on_seek_done()),
                    on_waiting_for_key: Box::new(move || {
                        (waiting_callbacks.on_waiting_for_key)()
                    }),
                    on_error: Box::new(move |e| {
                        error_pipeline.on_error();
                        (error_callbacks.on_error)(e);
                    }),
                },
            ))
        };

        {
            let mut listeners = seek_listeners.lock().unwrap();
            let decoder_thread = Arc::clone(&decoder_thread);
            listeners.push(Box::new(move || decoder_thread.on_seek()));
            let renderer = Arc::clone(&renderer);
            listeners.push(Box::new(move || renderer.on_seek()));
        }

        let demuxer_thread = DemuxerThread::new(
            demuxer_factory,
            Arc::clone(&stream),
            Arc::new(ClientBridge {
                callbacks: Arc::clone(&callbacks),
                pipeline: Arc::clone(&pipeline),
            }),
            task_runner,
        );

        let monitor = {
            let buffered_stream = Arc::clone(&stream);
            let decoded_stream = Arc::clone(&stream);
            let ready_callbacks = Arc::clone(&callbacks);
            PipelineMonitor::new(
                Box::new(move || buffered_stream.buffered_ranges()),
                Box::new(move || decoded_stream.decoded_frames().buffered_ranges()),
                Box::new(move |state| (ready_callbacks.on_ready_state_changed)(state)),
                clock,
                Arc::clone(&pipeline),
            )
        };

        Self {
            stream,
            pipeline,
            renderer,
            decoder_thread,
            demuxer_thread,
            monitor,
            append_in_flight: Arc::new(AtomicBool::new(false)),
            quality: Arc::new(Mutex::new(VideoPlaybackQuality::default())),
        }
    }

    /// Hands a media segment to the demuxer.  At most one append may be in
    /// flight; the next may start once `on_complete` runs.
    pub fn append_data(
        &self,
        timestamp_offset: f64,
        window_start: f64,
        window_end: f64,
        data: Vec<u8>,
        on_complete: AppendCallback,
    ) {
        let was_in_flight = self.append_in_flight.swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_flight, "append already in flight");

        let in_flight = Arc::clone(&self.append_in_flight);
        self.demuxer_thread.append_data(
            timestamp_offset,
            window_start,
            window_end,
            data,
            Box::new(move |result| {
                in_flight.store(false, Ordering::Release);
                on_complete(result);
            }),
        );
    }

    /// Removes buffered media in `[start, end)`, MSE coded frame removal
    /// semantics.
    pub fn remove(&self, start: f64, end: f64) {
        self.stream.demuxed_frames().remove(start, end);
    }

    pub fn buffered_ranges(&self) -> BufferedRanges {
        self.stream.buffered_ranges()
    }

    /// Declares that no further appends are coming: the duration becomes
    /// the end of the buffered media.
    pub fn end_of_stream(&self) {
        if let Some(last) = self.stream.buffered_ranges().last() {
            self.pipeline.set_duration(last.end);
        }
    }

    pub fn current_time(&self) -> f64 {
        self.pipeline.current_time()
    }

    /// Seeks to `time`.
    pub fn set_current_time(&self, time: f64) {
        self.pipeline.set_current_time(time);
    }

    pub fn duration(&self) -> f64 {
        self.pipeline.duration()
    }

    pub fn set_duration(&self, duration: f64) {
        self.pipeline.set_duration(duration);
    }

    pub fn play(&self) {
        self.pipeline.play();
    }

    pub fn pause(&self) {
        self.pipeline.pause();
    }

    pub fn playback_rate(&self) -> f64 {
        self.pipeline.playback_rate()
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.pipeline.set_playback_rate(rate);
    }

    pub fn pipeline_status(&self) -> PipelineStatus {
        self.pipeline.status()
    }

    pub fn set_cdm(&self, cdm: Option<Arc<dyn Cdm>>) {
        self.decoder_thread.set_cdm(cdm);
    }

    /// Throws away decoder state and re-decodes from the key frame at or
    /// before the playhead, e.g. after the host replaces the CDM.
    pub fn reset_decoder(&self) {
        self.decoder_thread.on_seek();
    }

    /// Picks the frame to display; called from the host's paint loop.
    pub fn draw_frame(&self) -> DrawResult {
        let result = self.renderer.draw_frame();
        let mut quality = self.quality.lock().unwrap();
        if result.is_new_frame {
            quality.total_video_frames += 1;
        }
        quality.dropped_video_frames += result.dropped_frame_count as u64;
        result
    }

    pub fn playback_quality(&self) -> VideoPlaybackQuality {
        self.quality.lock().unwrap().clone()
    }

    /// Rough bytes held by this track's buffers.
    pub fn estimate_size(&self) -> usize {
        self.stream.estimate_size()
    }

    /// Stops and joins every pipeline thread.  The track is inert after
    /// this; drop it.
    pub fn stop(&mut self) {
        self.demuxer_thread.stop();
        self.decoder_thread.stop();
        self.monitor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test_support::{FakeBackend, FakeCdm};
    use crate::demuxer::DemuxerClient;
    use crate::frame::EncodedFrame;
    use crate::task::TaskQueue;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Produces a fixed batch of frames per append and reports metadata on
    /// the first one.
    struct ScriptedDemuxer {
        duration: f64,
        batches: Vec<Vec<EncodedFrame>>,
        reported_metadata: bool,
    }

    impl Demuxer for ScriptedDemuxer {
        fn reset(&mut self) {}

        fn demux(
            &mut self,
            _timestamp_offset: f64,
            _data: &[u8],
            client: &dyn DemuxerClient,
        ) -> Result<Vec<EncodedFrame>> {
            if !self.reported_metadata {
                self.reported_metadata = true;
                client.on_loaded_metadata(self.duration);
            }
            if self.batches.is_empty() {
                return Err(MediaError::InvalidContainerData);
            }
            Ok(self.batches.remove(0))
        }
    }

    fn frame(pts: f64, key: bool, encrypted: bool) -> EncodedFrame {
        EncodedFrame {
            stream_info: crate::frame::test_support::stream_info(),
            pts,
            dts: pts,
            duration: 0.1,
            is_key_frame: key,
            data: vec![(pts * 10.0).round() as u8],
            is_encrypted: encrypted,
            timestamp_offset: 0.0,
        }
    }

    /// 10fps frames with a key frame on every whole second.
    fn clear_segment(start: f64, end: f64) -> Vec<EncodedFrame> {
        let mut frames = Vec::new();
        let mut tick = (start * 10.0).round() as i64;
        while (tick as f64) * 0.1 < end - 1e-9 {
            let pts = tick as f64 * 0.1;
            frames.push(frame(pts, tick % 10 == 0, false));
            tick += 1;
        }
        frames
    }

    /// Captured `log` output from the worker threads is the main debugging
    /// aid for these tests; run with `RUST_LOG=trace` to see it.
    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn make_track(batches: Vec<Vec<EncodedFrame>>, duration: f64) -> Track {
        init_logs();
        Track::new(
            move || {
                Ok(Box::new(ScriptedDemuxer {
                    duration,
                    batches,
                    reported_metadata: false,
                }) as Box<dyn Demuxer>)
            },
            Box::new(FakeBackend::new(0)),
            TrackCallbacks::default(),
            Arc::new(crate::clock::SystemClock::new()),
            Arc::new(TaskQueue::new()),
        )
    }

    fn append_and_wait(track: &Track, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        track.append_data(
            0.0,
            0.0,
            f64::INFINITY,
            data,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn appends_buffer_and_load_metadata() {
        let mut track = make_track(vec![clear_segment(0.0, 2.0)], 30.0);
        append_and_wait(&track, vec![0]).unwrap();

        let ranges = track.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0.0);
        assert!((track.duration() - 30.0).abs() < 1e-9);
        assert_ne!(track.pipeline_status(), PipelineStatus::Initializing);
        track.stop();
    }

    #[test]
    fn plays_through_appended_media() {
        let mut track = make_track(vec![clear_segment(0.0, 2.0)], 30.0);
        append_and_wait(&track, vec![0]).unwrap();

        track.play();
        let deadline = Instant::now() + Duration::from_secs(5);
        while track.pipeline_status() != PipelineStatus::Playing {
            assert!(Instant::now() < deadline, "never started playing");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Once playing, the renderer has something to draw.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let result = track.draw_frame();
            if result.frame.is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "never drew a frame");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(track.playback_quality().total_video_frames >= 1);
        track.stop();
    }

    #[test]
    fn seek_restarts_decoding_at_new_position() {
        let mut track = make_track(vec![clear_segment(0.0, 3.0)], 30.0);
        append_and_wait(&track, vec![0]).unwrap();

        track.set_current_time(1.5);
        track.play();

        let deadline = Instant::now() + Duration::from_secs(5);
        while track.pipeline_status() != PipelineStatus::Playing {
            assert!(Instant::now() < deadline, "seek never resolved");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(track.current_time() >= 1.5);
        track.stop();
    }

    #[test]
    fn waiting_for_key_fires_until_key_arrives() {
        // A clear prefix followed by encrypted content: playback must
        // decode the prefix, then stall raising waiting-for-key.
        let mut segment = clear_segment(0.0, 0.3);
        segment.push(frame(0.3, true, true));
        segment.push(frame(0.4, false, true));

        let (waiting_tx, waiting_rx) = mpsc::channel();
        let callbacks = TrackCallbacks {
            on_waiting_for_key: Box::new(move || {
                let _ = waiting_tx.send(());
            }),
            ..Default::default()
        };
        let cdm = Arc::new(FakeCdm {
            known: Mutex::new(false),
        });

        init_logs();
        let mut track = Track::new(
            move || {
                Ok(Box::new(ScriptedDemuxer {
                    duration: 30.0,
                    batches: vec![segment],
                    reported_metadata: false,
                }) as Box<dyn Demuxer>)
            },
            Box::new(FakeBackend::new(0)),
            callbacks,
            Arc::new(crate::clock::SystemClock::new()),
            Arc::new(TaskQueue::new()),
        );
        track.set_cdm(Some(Arc::clone(&cdm) as Arc<dyn Cdm>));
        append_and_wait(&track, vec![0]).unwrap();
        track.play();

        // The decoder hits the encrypted frame and reports the stall once.
        waiting_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Supplying the key lets decoding proceed past the stall.
        *cdm.known.lock().unwrap() = true;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let guard = track.stream.decoded_frames().get_frame_near(0.4);
            let done = guard.frame().is_some_and(|f| f.pts >= 0.39);
            drop(guard);
            if done {
                break;
            }
            assert!(Instant::now() < deadline, "never decoded past the key stall");
            std::thread::sleep(Duration::from_millis(10));
        }
        track.stop();
    }

    #[test]
    fn remove_trims_buffered_ranges() {
        let mut track = make_track(vec![clear_segment(0.0, 2.0)], 30.0);
        append_and_wait(&track, vec![0]).unwrap();

        track.remove(0.0, 1.0);
        let ranges = track.buffered_ranges();
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].start >= 1.0);
        track.stop();
    }

    #[test]
    fn end_of_stream_pins_duration_to_buffered_end() {
        let mut track = make_track(vec![clear_segment(0.0, 1.0)], f64::INFINITY);
        append_and_wait(&track, vec![0]).unwrap();

        track.end_of_stream();
        assert!((track.duration() - 1.0).abs() < 1e-6);
        track.stop();
    }
}
