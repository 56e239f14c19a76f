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

//! Completion dispatch.
//!
//! Worker threads never invoke host callbacks directly; they post them to a
//! [`TaskRunner`] so callbacks always run on a single, predictable thread
//! and may freely call back into the pipeline without deadlocking a worker.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send>;

/// Where completion callbacks get executed.  Hosts that already own an
/// event loop implement this to marshal tasks onto it; otherwise
/// [`TaskQueue`] provides a dedicated thread.
pub trait TaskRunner: Send + Sync + 'static {
    fn post_task(&self, task: Task);
}

enum QueueMessage {
    Run(Task),
    Shutdown,
}

/// A single-threaded FIFO task runner backed by a dedicated event thread.
/// Tasks run in post order.  Dropping the queue drains nothing: pending
/// tasks posted before the drop still run, then the thread exits.
pub struct TaskQueue {
    sender: mpsc::Sender<QueueMessage>,
    handle: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<QueueMessage>();
        let handle = thread::Builder::new()
            .name("media-events".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        QueueMessage::Run(task) => task(),
                        QueueMessage::Shutdown => break,
                    }
                }
                log::debug!("event thread exiting");
            })
            .expect("failed to spawn event thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for TaskQueue {
    fn post_task(&self, task: Task) {
        if self.sender.send(QueueMessage::Run(task)).is_err() {
            log::warn!("task posted after event thread shutdown; dropping");
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(QueueMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
