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

//! The playback status state machine.
//!
//! Tracks where the playhead is and what the pipeline is doing about it.
//! The playhead is not sampled from any real renderer; it is extrapolated
//! from wall time while playing, which keeps this component independent of
//! the media path.  The monitor feeds buffering observations in through
//! [`PipelineManager::stalled`] and [`PipelineManager::can_play`].

use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::types::PipelineStatus;

pub type StatusCallback = Box<dyn Fn(PipelineStatus) + Send + Sync>;
pub type SeekCallback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    status: PipelineStatus,
    /// Media time at the last sync point.
    prev_media_time: f64,
    /// Wall time of the last sync point.
    prev_wall_time: f64,
    playback_rate: f64,
    /// NaN until the duration is known.
    duration: f64,
    /// Whether play() was requested before initialization finished.
    autoplay: bool,
}

impl Inner {
    /// Media time at the given wall time, extrapolated from the last sync
    /// point while playing and clamped to the duration.
    fn time_for(&self, wall_time: f64) -> f64 {
        if self.status != PipelineStatus::Playing {
            return self.prev_media_time;
        }
        let time = self.prev_media_time + (wall_time - self.prev_wall_time) * self.playback_rate;
        if self.duration.is_nan() {
            time
        } else {
            time.min(self.duration)
        }
    }
}

pub struct PipelineManager {
    on_status_changed: StatusCallback,
    on_seek: SeekCallback,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl PipelineManager {
    pub fn new(on_status_changed: StatusCallback, on_seek: SeekCallback, clock: Arc<dyn Clock>) -> Self {
        let now = clock.monotonic_time();
        Self {
            on_status_changed,
            on_seek,
            clock,
            inner: Mutex::new(Inner {
                status: PipelineStatus::Initializing,
                prev_media_time: 0.0,
                prev_wall_time: now,
                playback_rate: 1.0,
                duration: f64::NAN,
                autoplay: false,
            }),
        }
    }

    /// Leaves `Initializing` once metadata is loaded.  Starts stalled if
    /// play() already happened, paused otherwise.
    pub fn done_initializing(&self) {
        let new_status = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == PipelineStatus::Errored {
                return;
            }
            debug_assert_eq!(inner.status, PipelineStatus::Initializing);
            inner.status = if inner.autoplay {
                PipelineStatus::Stalled
            } else {
                PipelineStatus::Paused
            };
            inner.status
        };
        (self.on_status_changed)(new_status);
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.lock().unwrap().status
    }

    pub fn duration(&self) -> f64 {
        self.inner.lock().unwrap().duration
    }

    /// Updates the duration.  If the playhead is past the new duration,
    /// this seeks it back to the duration.
    pub fn set_duration(&self, duration: f64) {
        let mut fire = None;
        let mut seeked = false;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.duration = duration;

            let wall_time = self.clock.monotonic_time();
            if !duration.is_nan() && inner.time_for(wall_time) > duration {
                seeked = true;
                inner.prev_media_time = duration;
                inner.prev_wall_time = wall_time;
                match inner.status {
                    PipelineStatus::Playing | PipelineStatus::Stalled => {
                        inner.status = PipelineStatus::SeekingPlay;
                        fire = Some(inner.status);
                    }
                    PipelineStatus::Paused | PipelineStatus::Ended => {
                        inner.status = PipelineStatus::SeekingPause;
                        fire = Some(inner.status);
                    }
                    _ => {}
                }
            }
        }
        if seeked {
            (self.on_seek)();
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    pub fn current_time(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.time_for(self.clock.monotonic_time())
    }

    /// Moves the playhead.  Ignored until initialized and after an error.
    pub fn set_current_time(&self, time: f64) {
        let mut fire = None;
        let mut seeked = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != PipelineStatus::Initializing
                && inner.status != PipelineStatus::Errored
            {
                seeked = true;
                inner.prev_media_time = if inner.duration.is_nan() {
                    time
                } else {
                    time.min(inner.duration)
                };
                inner.prev_wall_time = self.clock.monotonic_time();
                match inner.status {
                    PipelineStatus::Playing
                    | PipelineStatus::Stalled
                    | PipelineStatus::SeekingPlay => {
                        inner.status = PipelineStatus::SeekingPlay;
                        fire = Some(inner.status);
                    }
                    PipelineStatus::Paused
                    | PipelineStatus::Ended
                    | PipelineStatus::SeekingPause => {
                        inner.status = PipelineStatus::SeekingPause;
                        fire = Some(inner.status);
                    }
                    _ => {}
                }
            }
        }
        if seeked {
            (self.on_seek)();
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.lock().unwrap().playback_rate
    }

    pub fn set_playback_rate(&self, rate: f64) {
        let mut inner = self.inner.lock().unwrap();
        self.sync_point(&mut inner);
        inner.playback_rate = rate;
    }

    pub fn play(&self) {
        let mut fire = None;
        let mut seeked = false;
        {
            let mut inner = self.inner.lock().unwrap();
            self.sync_point(&mut inner);
            match inner.status {
                PipelineStatus::Paused => {
                    // Assume stalled; the monitor promotes to Playing
                    // almost immediately if data is there.
                    inner.status = PipelineStatus::Stalled;
                    fire = Some(inner.status);
                }
                PipelineStatus::Ended => {
                    // Replay from the start.
                    seeked = true;
                    inner.prev_media_time = 0.0;
                    inner.status = PipelineStatus::SeekingPlay;
                    fire = Some(inner.status);
                }
                PipelineStatus::SeekingPause => {
                    inner.status = PipelineStatus::SeekingPlay;
                    fire = Some(inner.status);
                }
                PipelineStatus::Initializing => {
                    inner.autoplay = true;
                }
                _ => {}
            }
        }
        if seeked {
            (self.on_seek)();
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    pub fn pause(&self) {
        let mut fire = None;
        {
            let mut inner = self.inner.lock().unwrap();
            self.sync_point(&mut inner);
            match inner.status {
                PipelineStatus::Playing | PipelineStatus::Stalled => {
                    inner.status = PipelineStatus::Paused;
                    fire = Some(inner.status);
                }
                PipelineStatus::SeekingPlay => {
                    inner.status = PipelineStatus::SeekingPause;
                    fire = Some(inner.status);
                }
                PipelineStatus::Initializing => {
                    inner.autoplay = false;
                }
                _ => {}
            }
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    /// Reported by the monitor when playback ran out of usable data.
    pub fn stalled(&self) {
        let mut fire = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == PipelineStatus::Playing {
                self.sync_point(&mut inner);
                inner.status = PipelineStatus::Stalled;
                fire = Some(inner.status);
            }
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    /// Reported by the monitor when enough data is buffered to move.
    pub fn can_play(&self) {
        let mut fire = None;
        {
            let mut inner = self.inner.lock().unwrap();
            self.sync_point(&mut inner);
            match inner.status {
                PipelineStatus::Stalled | PipelineStatus::SeekingPlay => {
                    inner.status = PipelineStatus::Playing;
                    fire = Some(inner.status);
                }
                PipelineStatus::SeekingPause => {
                    inner.status = PipelineStatus::Paused;
                    fire = Some(inner.status);
                }
                _ => {}
            }
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    /// Reported by the monitor when the playhead reaches the end.
    pub fn on_ended(&self) {
        let mut fire = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != PipelineStatus::Ended && inner.status != PipelineStatus::Errored {
                debug_assert!(!inner.duration.is_nan());
                inner.prev_wall_time = self.clock.monotonic_time();
                inner.prev_media_time = inner.duration;
                inner.status = PipelineStatus::Ended;
                fire = Some(inner.status);
            }
        }
        if let Some(status) = fire {
            (self.on_status_changed)(status);
        }
    }

    /// Enters the terminal error state; at most one notification fires.
    pub fn on_error(&self) {
        let mut fire = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != PipelineStatus::Errored {
                self.sync_point(&mut inner);
                inner.status = PipelineStatus::Errored;
                fire = true;
            }
        }
        if fire {
            (self.on_status_changed)(PipelineStatus::Errored);
        }
    }

    /// Folds elapsed wall time into `prev_media_time` so a following state
    /// change doesn't lose or double-count it.
    fn sync_point(&self, inner: &mut Inner) {
        let wall_time = self.clock.monotonic_time();
        inner.prev_media_time = inner.time_for(wall_time);
        inner.prev_wall_time = wall_time;
    }
}
