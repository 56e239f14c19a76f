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

//! A thread-safe, time-ordered buffer of media frames.
//!
//! Frames are organized into maximal runs ([`BufferedRange`]s) that are
//! contiguous within a small gap tolerance.  Appending a frame that closes
//! a gap merges the surrounding ranges; removing frames can split a range
//! in two.  Removal follows the MSE "coded frame removal" algorithm:
//! it always operates on presentation timestamps and runs past the end of
//! the requested span until the next key frame, since dependent frames
//! without their reference are unplayable.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::frame::MediaFrame;
use crate::locked_frames::{FrameGuard, LockedFrameList};
use crate::types::{BufferedRange, BufferedRanges};

/// The largest gap, in seconds, between two frames that still counts as
/// contiguous.  Chosen to swallow container rounding error and the odd
/// missing frame without joining genuinely separate segments.
pub const MAX_GAP_SIZE: f64 = 0.15;

struct Range<F> {
    start_pts: f64,
    end_pts: f64,
    frames: VecDeque<Arc<F>>,
}

impl<F: MediaFrame> Range<F> {
    fn single(frame: Arc<F>) -> Self {
        Self {
            start_pts: frame.pts(),
            end_pts: frame.pts() + frame.duration(),
            frames: VecDeque::from([frame]),
        }
    }

    /// Recomputes the pts extents from the contained frames.
    fn update_pts(&mut self) {
        debug_assert!(!self.frames.is_empty());
        self.start_pts = f64::INFINITY;
        self.end_pts = f64::NEG_INFINITY;
        for frame in &self.frames {
            self.start_pts = self.start_pts.min(frame.pts());
            self.end_pts = self.end_pts.max(frame.pts() + frame.duration());
        }
    }
}

/// A buffer of frames ordered either by dts (encoded frames, decode order)
/// or by pts (decoded frames, presentation order).  The ordering key is
/// fixed at construction; buffered-range extents and removal always use
/// pts regardless.
pub struct FrameBuffer<F: MediaFrame> {
    order_by_dts: bool,
    ranges: Mutex<Vec<Range<F>>>,
    used_frames: LockedFrameList<F>,
}

impl<F: MediaFrame> FrameBuffer<F> {
    pub fn new(order_by_dts: bool) -> Self {
        Self {
            order_by_dts,
            ranges: Mutex::new(Vec::new()),
            used_frames: LockedFrameList::new(),
        }
    }

    /// The ordering key of a frame for this buffer.
    fn key(&self, frame: &F) -> f64 {
        if self.order_by_dts {
            frame.dts()
        } else {
            frame.pts()
        }
    }

    /// Whether `a` reaches far enough to be contiguous with (or overlap)
    /// something starting at `b`'s key time.
    fn extends_past(&self, a: &F, b: &F) -> bool {
        self.key(a) + a.duration() + MAX_GAP_SIZE >= self.key(b)
    }

    /// Returns the index of the first frame whose key time is not less
    /// than `time`.  Scans from whichever end of the run is numerically
    /// closer, so sequential appends stay O(1) amortized.
    fn lower_bound(&self, frames: &VecDeque<Arc<F>>, time: f64) -> usize {
        let (Some(front), Some(back)) = (frames.front(), frames.back()) else {
            return 0;
        };

        if time - self.key(front) < self.key(back) - time {
            frames
                .iter()
                .position(|f| self.key(f) >= time)
                .unwrap_or(frames.len())
        } else {
            match frames.iter().rposition(|f| self.key(f) < time) {
                Some(i) => i + 1,
                None => 0,
            }
        }
    }

    /// Inserts a frame in time order, merging ranges that become
    /// contiguous.  A frame with the exact ordering-key timestamp of an
    /// existing frame replaces it; the replaced frame is not freed until
    /// every guard on it has been released.
    pub fn append_frame(&self, frame: Arc<F>) {
        let mut replaced: Option<Arc<F>> = None;
        {
            let mut ranges = self.ranges.lock().unwrap();

            // Find the first buffered range that ends at or after the frame.
            let range_it = ranges
                .iter()
                .position(|r| self.extends_past(r.frames.back().unwrap(), &frame));

            match range_it {
                None => {
                    // The frame is after every existing range.
                    ranges.push(Range::single(frame));
                }
                Some(i) if !self.extends_past(&frame, ranges[i].frames.front().unwrap()) => {
                    // The frame is before this range, so it starts a new
                    // range in front of it.
                    ranges.insert(i, Range::single(frame));
                }
                Some(i) => {
                    let range = &mut ranges[i];
                    let time = self.key(&frame);
                    let pos = self.lower_bound(&range.frames, time);
                    range.start_pts = range.start_pts.min(frame.pts());
                    range.end_pts = range.end_pts.max(frame.pts() + frame.duration());
                    match range.frames.get(pos) {
                        Some(existing) if self.key(existing) == time => {
                            replaced = Some(std::mem::replace(&mut range.frames[pos], frame));
                        }
                        _ => range.frames.insert(pos, frame),
                    }
                }
            }

            // If the frame closed a gap, merge the adjacent ranges.  Both
            // sides are individually sorted and non-overlapping, so moving
            // the later run onto the end of the earlier one stays sorted.
            let mut i = 1;
            while i < ranges.len() {
                let prev_back = ranges[i - 1].frames.back().unwrap();
                if self.extends_past(prev_back, ranges[i].frames.front().unwrap()) {
                    let merged = ranges.remove(i);
                    let prev = &mut ranges[i - 1];
                    prev.frames.extend(merged.frames);
                    prev.start_pts = prev.start_pts.min(merged.start_pts);
                    prev.end_pts = prev.end_pts.max(merged.end_pts);
                } else {
                    i += 1;
                }
            }

            self.assert_ranges_sorted(&ranges);
        }

        // Wait for the replaced frame's guards with the buffer unlocked so
        // guard holders can keep using this buffer in the meantime.
        if let Some(old) = replaced {
            self.used_frames
                .wait_to_delete_frames(&[LockedFrameList::ptr_of(&old)]);
        }
    }

    /// The `[start_pts, end_pts]` of each range.  These are presentation
    /// extents even when the buffer orders by dts, so the first frame of a
    /// range is not necessarily the one defining its start.
    pub fn buffered_ranges(&self) -> BufferedRanges {
        let ranges = self.ranges.lock().unwrap();
        self.assert_ranges_sorted(&ranges);
        ranges
            .iter()
            .map(|r| BufferedRange::new(r.start_pts, r.end_pts))
            .collect()
    }

    /// Counts frames whose ordering-key timestamp lies strictly inside
    /// `(start_time, end_time)`, stitching across range gaps.
    pub fn frames_between(&self, start_time: f64, end_time: f64) -> usize {
        let ranges = self.ranges.lock().unwrap();
        self.assert_ranges_sorted(&ranges);

        let Some(first) = ranges
            .iter()
            .position(|r| self.key(r.frames.back().unwrap()) >= start_time)
        else {
            return 0;
        };

        let mut num_frames = 0usize;
        for range in &ranges[first..] {
            // `start` is the first frame at or after `start_time`.
            let start = self.lower_bound(&range.frames, start_time);
            let end = self.lower_bound(&range.frames, end_time);
            num_frames += end - start;
            if start != end {
                if let Some(f) = range.frames.get(start) {
                    if self.key(f) == start_time {
                        num_frames -= 1;
                    }
                }
            }
            if end != range.frames.len() {
                break;
            }
        }
        num_frames
    }

    /// Returns the frame nearest `time`, pinned by a guard.  The only case
    /// with no result is an empty buffer.
    pub fn get_frame_near(&self, time: f64) -> FrameGuard<F> {
        let ranges = self.ranges.lock().unwrap();
        let found = self.frame_near_locked(&ranges, time, true).cloned();
        self.used_frames.guard_frame(found)
    }

    /// Returns the first frame strictly after `time`, searching across
    /// range boundaries, pinned by a guard.
    pub fn get_frame_after(&self, time: f64) -> FrameGuard<F> {
        let ranges = self.ranges.lock().unwrap();
        let found = self.frame_near_locked(&ranges, time, false).cloned();
        self.used_frames.guard_frame(found)
    }

    /// Walks backward from the first frame at or after `time` until a key
    /// frame is found.  Empty if no key frame exists at or before `time`.
    pub fn get_key_frame_before(&self, time: f64) -> FrameGuard<F> {
        let ranges = self.ranges.lock().unwrap();
        self.assert_ranges_sorted(&ranges);

        let Some(range) = ranges
            .iter()
            .find(|r| self.key(r.frames.back().unwrap()) >= time)
        else {
            return FrameGuard::empty();
        };

        let mut i = self.lower_bound(&range.frames, time);
        debug_assert!(i < range.frames.len());
        if self.key(&range.frames[i]) > time {
            if i == 0 {
                return FrameGuard::empty();
            }
            i -= 1;
        }

        while !range.frames[i].is_key_frame() {
            if i == 0 {
                return FrameGuard::empty();
            }
            i -= 1;
        }
        self.used_frames
            .guard_frame(Some(Arc::clone(&range.frames[i])))
    }

    /// Removes frames with pts in `[start, end)`, continuing past `end`
    /// until (and not including) the next key frame, per the MSE coded
    /// frame removal algorithm.  Always uses pts, even when the buffer is
    /// dts-ordered.
    ///
    /// Blocks until no other thread holds a guard on any removed frame.
    /// Callers must not hold a guard on a frame in this buffer while
    /// calling this, or they will deadlock against themselves.
    pub fn remove(&self, start: f64, end: f64) {
        let mut removed: Vec<Arc<F>> = Vec::new();
        {
            let mut ranges = self.ranges.lock().unwrap();
            let mut is_removing = false;
            let mut i = 0;
            while i < ranges.len() {
                let len = ranges[i].frames.len();
                // The span of frames to delete within this range.
                let mut del_start = if is_removing { 0 } else { len };
                let mut del_end = len;
                for (j, frame) in ranges[i].frames.iter().enumerate() {
                    if !is_removing {
                        // Only start deleting frames whose start time is in
                        // the requested span.
                        if frame.pts() >= start && frame.pts() < end {
                            is_removing = true;
                            del_start = j;
                        }
                    } else if frame.pts() >= end && frame.is_key_frame() {
                        del_end = j;
                        is_removing = false;
                        break;
                    }
                }

                if del_start > 0 && del_start < len && del_end < len {
                    // Deleted an interior run; split the range in two.
                    let mut deleted = ranges[i].frames.split_off(del_start);
                    let kept_tail = deleted.split_off(del_end - del_start);
                    removed.extend(deleted);

                    let mut tail = Range {
                        start_pts: 0.0,
                        end_pts: 0.0,
                        frames: kept_tail,
                    };
                    tail.update_pts();
                    ranges[i].update_pts();
                    ranges.insert(i + 1, tail);
                    i += 2;
                } else {
                    removed.extend(ranges[i].frames.drain(del_start..del_end));
                    if ranges[i].frames.is_empty() {
                        ranges.remove(i);
                    } else {
                        ranges[i].update_pts();
                        i += 1;
                    }
                }
            }

            self.assert_ranges_sorted(&ranges);
        }

        // The frames are already detached from the ranges; now wait (with
        // the buffer unlocked) for other threads to finish with them.
        if !removed.is_empty() {
            let ptrs: Vec<usize> = removed.iter().map(LockedFrameList::ptr_of).collect();
            self.used_frames.wait_to_delete_frames(&ptrs);
            log::trace!("removed {} frames in [{start}, {end})", removed.len());
        }
    }

    /// A rough byte count of everything buffered, for quota estimates.
    pub fn estimate_size(&self) -> usize {
        let ranges = self.ranges.lock().unwrap();
        ranges
            .iter()
            .flat_map(|r| r.frames.iter())
            .map(|f| f.estimate_size())
            .sum()
    }

    fn frame_near_locked<'a>(
        &self,
        ranges: &'a [Range<F>],
        time: f64,
        allow_before: bool,
    ) -> Option<&'a Arc<F>> {
        self.assert_ranges_sorted(ranges);

        let Some(r) = ranges
            .iter()
            .position(|r| self.key(r.frames.back().unwrap()) >= time)
        else {
            // Past every range; the last frame overall is still "near".
            if allow_before {
                return ranges.last().map(|r| r.frames.back().unwrap());
            }
            return None;
        };

        // `i` is the frame at or after `time` within range `r`.
        let frames = &ranges[r].frames;
        let i = self.lower_bound(frames, time);
        debug_assert!(i < frames.len());

        // The frame strictly after `time`.
        let next = if self.key(&frames[i]) > time {
            Some(&frames[i])
        } else if i + 1 < frames.len() {
            Some(&frames[i + 1])
        } else {
            ranges.get(r + 1).map(|nr| nr.frames.front().unwrap())
        };

        if allow_before {
            // The frame at or before `time`; only get_frame_near may
            // return a frame equal to `time`.
            let prev = if self.key(&frames[i]) <= time {
                Some(&frames[i])
            } else if i > 0 {
                Some(&frames[i - 1])
            } else if r > 0 {
                Some(ranges[r - 1].frames.back().unwrap())
            } else {
                None
            };

            if let Some(prev) = prev {
                let prev_dt = time - self.key(prev) - prev.duration();
                match next {
                    Some(next) if self.key(next) - time <= prev_dt => return Some(next),
                    _ => return Some(prev),
                }
            }
        }

        next
    }

    /// Debug check of the range invariants: non-empty, key-frame-initial,
    /// sorted frames, and pairwise non-overlapping sorted ranges.
    #[cfg(debug_assertions)]
    fn assert_ranges_sorted(&self, ranges: &[Range<F>]) {
        for range in ranges {
            assert!(!range.frames.is_empty());
            assert!(range.frames.front().unwrap().is_key_frame());
            assert!(range.start_pts <= range.end_pts);
            let sorted = range
                .frames
                .iter()
                .zip(range.frames.iter().skip(1))
                .all(|(a, b)| self.key(a) <= self.key(b));
            assert!(sorted);
        }
        for pair in ranges.windows(2) {
            assert!(pair[0].end_pts < pair[1].start_pts);
        }
    }

    #[cfg(not(debug_assertions))]
    fn assert_ranges_sorted(&self, _ranges: &[Range<F>]) {}
}
