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

//! Shared status and range types used across the pipeline.

use serde::{Deserialize, Serialize};

/// The overall playback state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// The pipeline is starting up.
    Initializing,
    /// The pipeline is playing media.
    Playing,
    /// The pipeline is paused by user action.
    Paused,
    /// The pipeline is performing a seek and will play once done.  The seek
    /// itself completes quickly, but we remain in this state until we
    /// transition to Playing, so this is similar to Stalled.
    SeekingPlay,
    /// Similar to SeekingPlay, but will remain paused.
    SeekingPause,
    /// The pipeline is stalled waiting for new content.  This only happens
    /// when playing; a paused video stays Paused even with no content.
    Stalled,
    /// The video has ended and the pipeline is waiting for user action.
    Ended,
    /// There was an error that has stopped the pipeline.
    Errored,
}

/// The W3C-style readiness of the media element, ordered from least to most
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

/// A single `[start, end]` span of buffered presentation time, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }
}

/// The buffered spans of a single buffer, sorted ascending and
/// non-overlapping.
pub type BufferedRanges = Vec<BufferedRange>;

/// Counters reported to the host for `getVideoPlaybackQuality()`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VideoPlaybackQuality {
    pub total_video_frames: u64,
    pub dropped_video_frames: u64,
    pub corrupted_video_frames: u64,
}
