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

//! MSE-style buffering, demuxing and decode pipeline for a single
//! elementary media track.
//!
//! Media segments go in through [`Track::append_data`]; a demuxer worker
//! parses them into encoded frames, a decoder worker turns those into
//! decoded frames just ahead of the playhead, and [`Track::draw_frame`]
//! picks the frame to display.  Container parsing and the actual codec are
//! pluggable through the [`demuxer::Demuxer`] and
//! [`decoder::DecoderBackend`] traits.

pub mod buffer;
pub mod clock;
pub mod decoder;
pub mod demuxer;
pub mod error;
pub mod frame;
pub mod locked_frames;
pub mod monitor;
pub mod pipeline;
pub mod renderer;
pub mod stream;
pub mod task;
pub mod track;
pub mod types;

pub use buffer::FrameBuffer;
pub use error::{MediaError, Result};
pub use frame::{DecodedFrame, EncodedFrame, MediaFrame, PixelFormat, StreamInfo};
pub use stream::Stream;
pub use track::{Track, TrackCallbacks};
pub use types::{
    BufferedRange, BufferedRanges, MediaReadyState, PipelineStatus, VideoPlaybackQuality,
};
