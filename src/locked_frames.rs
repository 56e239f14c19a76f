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

//! A registry of frames that are currently being used by another thread.
//!
//! Handing a frame across a thread boundary produces a [`FrameGuard`],
//! which keeps the frame alive (it holds an `Arc` clone) and registers the
//! borrow here.  A thread that wants to delete frames calls
//! [`LockedFrameList::wait_to_delete_frames`], which blocks until no guard
//! for any of those frames remains.  Note that holding a guard does *not*
//! guarantee the frame is still inside a buffer; it may already have been
//! removed and be waiting for the guard to go away.

use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

struct Entry {
    ptr: usize,
    locked_thread: ThreadId,
}

struct Shared {
    entries: Mutex<Vec<Entry>>,
    cond: Condvar,
}

/// Tracks which frames are borrowed by other threads and lets a deleter
/// wait for those borrows to end.
pub struct LockedFrameList<F> {
    shared: Arc<Shared>,
    _frame: PhantomData<fn() -> F>,
}

impl<F> Default for LockedFrameList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> LockedFrameList<F> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            }),
            _frame: PhantomData,
        }
    }

    /// The identity key used for a shared frame.
    pub fn ptr_of(frame: &Arc<F>) -> usize {
        Arc::as_ptr(frame) as usize
    }

    /// Registers a borrow of `frame` by the calling thread and returns the
    /// guard that ends it.  `None` produces an empty guard.
    pub fn guard_frame(&self, frame: Option<Arc<F>>) -> FrameGuard<F> {
        let Some(frame) = frame else {
            return FrameGuard::empty();
        };

        let mut entries = self.shared.entries.lock().unwrap();
        entries.push(Entry {
            ptr: Self::ptr_of(&frame),
            locked_thread: thread::current().id(),
        });
        drop(entries);

        FrameGuard {
            shared: Some(Arc::clone(&self.shared)),
            frame: Some(frame),
        }
    }

    /// Blocks until none of the given frame pointers (see [`Self::ptr_of`])
    /// are registered.
    ///
    /// Debug builds panic if the calling thread itself holds a guard on one
    /// of the frames; that is a programming error that would deadlock, not
    /// a runtime condition.
    pub fn wait_to_delete_frames(&self, frames: &[usize]) {
        let mut entries = self.shared.entries.lock().unwrap();

        #[cfg(debug_assertions)]
        {
            let me = thread::current().id();
            for entry in entries.iter() {
                if frames.contains(&entry.ptr) {
                    assert_ne!(
                        entry.locked_thread, me,
                        "cannot delete a frame guarded by the calling thread"
                    );
                }
            }
        }

        while entries.iter().any(|e| frames.contains(&e.ptr)) {
            entries = self.shared.cond.wait(entries).unwrap();
        }
    }
}

/// A move-only handle pinning one frame alive.  Dropping it releases the
/// pin and wakes any thread waiting to delete the frame.
pub struct FrameGuard<F> {
    shared: Option<Arc<Shared>>,
    frame: Option<Arc<F>>,
}

impl<F> FrameGuard<F> {
    /// A guard holding no frame.
    pub fn empty() -> Self {
        Self {
            shared: None,
            frame: None,
        }
    }

    /// The guarded frame, if any.
    pub fn get(&self) -> Option<&F> {
        self.frame.as_deref()
    }

    /// The guarded frame as a shared handle, if any.
    pub fn frame(&self) -> Option<&Arc<F>> {
        self.frame.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_none()
    }
}

impl<F> Drop for FrameGuard<F> {
    fn drop(&mut self) {
        let (Some(shared), Some(frame)) = (self.shared.take(), self.frame.take()) else {
            return;
        };

        let ptr = Arc::as_ptr(&frame) as usize;
        let mut entries = shared.entries.lock().unwrap();
        if let Some(pos) = entries.iter().position(|e| e.ptr == ptr) {
            entries.remove(pos);
            shared.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn can_guard_frames() {
        let list = LockedFrameList::<u32>::new();
        let frame = Arc::new(7u32);

        let guard = list.guard_frame(Some(Arc::clone(&frame)));
        assert_eq!(guard.get(), Some(&7));

        let empty = list.guard_frame(None);
        assert!(empty.is_empty());
    }

    #[test]
    fn delete_returns_immediately_without_guards() {
        let list = LockedFrameList::<u32>::new();
        let frame = Arc::new(1u32);
        list.wait_to_delete_frames(&[LockedFrameList::ptr_of(&frame)]);
    }

    #[test]
    fn moving_a_guard_keeps_the_pin() {
        let list = LockedFrameList::<u32>::new();
        let frame = Arc::new(1u32);
        let ptr = LockedFrameList::ptr_of(&frame);

        let guard = list.guard_frame(Some(Arc::clone(&frame)));
        let moved = guard;
        assert_eq!(list.shared.entries.lock().unwrap().len(), 1);
        drop(moved);
        assert!(list.shared.entries.lock().unwrap().is_empty());
        list.wait_to_delete_frames(&[ptr]);
    }

    /// A deleter must pass through waits on unrelated frames, block on a
    /// guarded frame, and proceed once the guard is released.
    #[test]
    fn will_wait_for_delete() {
        let list = Arc::new(LockedFrameList::<u32>::new());
        let frame1 = Arc::new(1u32);
        let frame2 = Arc::new(2u32);
        let ptr1 = LockedFrameList::ptr_of(&frame1);
        let ptr2 = LockedFrameList::ptr_of(&frame2);

        let (events_tx, events_rx) = mpsc::channel::<&'static str>();
        let (delete_start_tx, delete_start_rx) = mpsc::channel::<()>();
        let (use_frame_tx, use_frame_rx) = mpsc::channel::<()>();

        let user = {
            let list = Arc::clone(&list);
            let frame1 = Arc::clone(&frame1);
            let events = events_tx.clone();
            thread::spawn(move || {
                let guard = list.guard_frame(Some(frame1));
                events.send("guarded").unwrap();
                delete_start_tx.send(()).unwrap();
                use_frame_rx.recv().unwrap();
                // Give the deleter time to actually block on the wait.
                thread::sleep(Duration::from_millis(25));
                events.send("unguard").unwrap();
                drop(guard);
            })
        };

        let deleter = {
            let list = Arc::clone(&list);
            let events = events_tx;
            thread::spawn(move || {
                delete_start_rx.recv().unwrap();
                events.send("delete-start").unwrap();

                // Should not have to wait for unrelated frames.
                list.wait_to_delete_frames(&[ptr2]);
                events.send("unrelated-ok").unwrap();

                // Should have to wait for the locked frame.
                use_frame_tx.send(()).unwrap();
                list.wait_to_delete_frames(&[ptr1]);
                events.send("delete-done").unwrap();
            })
        };

        user.join().unwrap();
        deleter.join().unwrap();

        let order: Vec<&str> = events_rx.try_iter().collect();
        assert_eq!(
            order,
            vec![
                "guarded",
                "delete-start",
                "unrelated-ok",
                "unguard",
                "delete-done"
            ]
        );
    }
}
