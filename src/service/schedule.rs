//! Ordered timer schedule and cancellation handles.
//!
//! The schedule is kept sorted by fire time ascending; tasks with equal
//! times retain FIFO order among themselves. All times are logical millis
//! supplied by the executor, never read from a real clock.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::TaskError;
use super::executor::OperationContext;

pub(crate) type TimerTask = Box<dyn FnMut(&mut OperationContext) -> Result<(), TaskError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskId(u64);

pub(crate) struct TimerEntry {
    pub(crate) id: TaskId,
    /// Logical fire time in millis.
    pub(crate) time: u64,
    /// Reschedule interval in millis; 0 means one-shot.
    pub(crate) interval: u64,
    pub(crate) cancelled: Rc<Cell<bool>>,
    pub(crate) callback: TimerTask,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Binary-search insertion; equal fire times land after existing
    /// entries, preserving FIFO order.
    pub(crate) fn insert(&mut self, entry: TimerEntry) {
        let at = self.entries.partition_point(|e| e.time <= entry.time);
        self.entries.insert(at, entry);
    }

    /// Removes and returns the front entry if its fire time has passed.
    ///
    /// Strict inequality: a task scheduled for exactly `now_ms` does not
    /// fire until a later tick.
    pub(crate) fn pop_due(&mut self, now_ms: u64) -> Option<TimerEntry> {
        if self.entries.first()?.time < now_ms {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    pub(crate) fn remove(&mut self, id: TaskId) {
        if let Some(at) = self.entries.iter().position(|e| e.id == id) {
            self.entries.remove(at);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handle to a scheduled task.
///
/// Cancellation is idempotent and may be called from inside the task's own
/// callback; for a periodic task that suppresses all future firings.
pub struct Scheduled {
    queue: Weak<RefCell<TimerQueue>>,
    cancelled: Rc<Cell<bool>>,
    id: TaskId,
}

impl Scheduled {
    pub(crate) fn new(queue: Weak<RefCell<TimerQueue>>, cancelled: Rc<Cell<bool>>, id: TaskId) -> Self {
        Self {
            queue,
            cancelled,
            id,
        }
    }

    pub fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().remove(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
