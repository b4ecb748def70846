//! Executor driving a user state machine from committed operations.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::core::{Commit, OperationId, OperationType};

use super::schedule::{Scheduled, TimerEntry, TimerQueue};
use super::{ExecutorError, ExecutorResult, TaskError};

pub type OperationHandler =
    Box<dyn FnMut(&mut OperationContext, &Commit) -> Result<Bytes, TaskError>>;

type PostOpTask = Box<dyn FnOnce(&mut OperationContext) -> Result<(), TaskError>>;

#[derive(Clone, Copy)]
struct ActiveOperation {
    kind: OperationType,
    timestamp: u64,
}

/// Execution context handed to handlers, post-op tasks, and scheduled
/// callbacks.
///
/// Exposes the logical clock of the operation being applied and the only
/// sanctioned ways to defer work: `execute` for post-op tasks and
/// `schedule`/`schedule_repeated` for timers. Both reject anything that is
/// not a command.
pub struct OperationContext {
    active: Option<ActiveOperation>,
    tasks: VecDeque<PostOpTask>,
    timers: Rc<RefCell<TimerQueue>>,
}

impl OperationContext {
    pub(crate) fn new() -> Self {
        Self {
            active: None,
            tasks: VecDeque::new(),
            timers: Rc::new(RefCell::new(TimerQueue::default())),
        }
    }

    /// Kind of the operation currently being applied; `None` outside
    /// `apply`/`tick`.
    pub fn operation_type(&self) -> Option<OperationType> {
        self.active.map(|op| op.kind)
    }

    /// Logical timestamp of the operation currently being applied; `None`
    /// outside `apply`/`tick`. Scheduled callbacks observe their task's
    /// scheduled fire time here, not the tick argument.
    pub fn timestamp(&self) -> Option<u64> {
        self.active.map(|op| op.timestamp)
    }

    /// Queues a task to run after the current command's handler returns.
    pub fn execute<F>(&mut self, task: F) -> ExecutorResult<()>
    where
        F: FnOnce(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        self.require_command("tasks can only be queued during command execution")?;
        self.tasks.push_back(Box::new(task));
        Ok(())
    }

    /// Schedules a one-shot callback `delay` after the current logical
    /// time.
    pub fn schedule<F>(&mut self, delay: Duration, task: F) -> ExecutorResult<Scheduled>
    where
        F: FnMut(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        self.schedule_repeated(delay, Duration::ZERO, task)
    }

    /// Schedules a callback `initial_delay` after the current logical
    /// time, refiring every `interval` thereafter. A zero `interval` means
    /// one-shot.
    pub fn schedule_repeated<F>(
        &mut self,
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> ExecutorResult<Scheduled>
    where
        F: FnMut(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        let timestamp =
            self.require_command("callbacks can only be scheduled during command execution")?;
        let time = timestamp + initial_delay.as_millis() as u64;
        let interval = interval.as_millis() as u64;
        tracing::trace!(time, interval, "scheduling callback");

        let cancelled = Rc::new(Cell::new(false));
        let mut timers = self.timers.borrow_mut();
        let id = timers.next_id();
        timers.insert(TimerEntry {
            id,
            time,
            interval,
            cancelled: cancelled.clone(),
            callback: Box::new(task),
        });
        Ok(Scheduled::new(Rc::downgrade(&self.timers), cancelled, id))
    }

    fn require_command(&self, reason: &'static str) -> ExecutorResult<u64> {
        match self.active {
            Some(ActiveOperation {
                kind: OperationType::Command,
                timestamp,
            }) => Ok(timestamp),
            _ => Err(ExecutorError::IllegalContext { reason }),
        }
    }

    fn begin(&mut self, kind: OperationType, timestamp: u64) {
        self.active = Some(ActiveOperation { kind, timestamp });
    }

    fn finish(&mut self) {
        self.active = None;
    }

    /// Drains the post-op queue until empty. Tasks enqueued by tasks run
    /// in the same drain, still FIFO. Task failures are logged and
    /// swallowed; a failing task never aborts its siblings.
    fn drain_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            if let Err(err) = task(self) {
                tracing::warn!("post-operation task failed: {err}");
            }
        }
    }

    fn pop_due(&mut self, now_ms: u64) -> Option<TimerEntry> {
        self.timers.borrow_mut().pop_due(now_ms)
    }

    fn reinsert(&mut self, entry: TimerEntry) {
        self.timers.borrow_mut().insert(entry);
    }
}

/// Deterministic operation executor for one replicated service.
///
/// Holds the registered handlers and the timer schedule. The orchestrator
/// feeds it committed operations via [`apply`](Self::apply) and advances
/// logical time via [`tick`](Self::tick); the executor itself never reads
/// a clock, never uses randomness, and never iterates a collection whose
/// order could differ between replicas.
///
/// Single-threaded by contract: the type is `!Send`, so ownership cannot
/// leave the service thread.
pub struct ServiceExecutor {
    handlers: HashMap<OperationId, OperationHandler>,
    ctx: OperationContext,
    last_input_ms: u64,
}

impl ServiceExecutor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            ctx: OperationContext::new(),
            last_input_ms: 0,
        }
    }

    /// Registers the handler for an operation, replacing any previous one.
    pub fn register<F>(&mut self, operation: OperationId, handler: F)
    where
        F: FnMut(&mut OperationContext, &Commit) -> Result<Bytes, TaskError> + 'static,
    {
        tracing::debug!(operation = %operation, "registered operation handler");
        self.handlers.insert(operation, Box::new(handler));
    }

    /// Applies a committed operation to its registered handler.
    ///
    /// The post-op task queue drains on every exit path: after a handler
    /// failure the queued tasks still run before the error is returned.
    pub fn apply(&mut self, commit: &Commit) -> ExecutorResult<Bytes> {
        debug_assert!(
            commit.wall_clock_ms() >= self.last_input_ms,
            "logical clock moved backward"
        );
        self.last_input_ms = self.last_input_ms.max(commit.wall_clock_ms());
        tracing::trace!(
            operation = %commit.operation(),
            timestamp = commit.wall_clock_ms(),
            "applying commit"
        );

        self.ctx
            .begin(commit.operation().kind(), commit.wall_clock_ms());
        let Some(handler) = self.handlers.get_mut(commit.operation()) else {
            self.ctx.finish();
            return Err(ExecutorError::UnknownOperation(commit.operation().clone()));
        };
        let result = handler(&mut self.ctx, commit);
        self.ctx.drain_tasks();
        self.ctx.finish();

        result.map_err(|source| {
            tracing::warn!(operation = %commit.operation(), "state machine operation failed: {source}");
            ExecutorError::Application {
                operation: commit.operation().clone(),
                source,
            }
        })
    }

    /// Advances logical time, firing every scheduled task whose fire time
    /// is strictly below `now_ms` in ascending time order.
    ///
    /// Each callback runs in a command context stamped with the task's
    /// scheduled time. A periodic task is reinserted at `time + interval`
    /// as soon as it fires, so one tick fires it repeatedly while its
    /// successive times stay below `now_ms`. Callback failures are logged
    /// and swallowed.
    pub fn tick(&mut self, now_ms: u64) {
        debug_assert!(now_ms >= self.last_input_ms, "logical clock moved backward");
        self.last_input_ms = self.last_input_ms.max(now_ms);

        while let Some(mut entry) = self.ctx.pop_due(now_ms) {
            self.ctx.begin(OperationType::Command, entry.time);
            tracing::trace!(time = entry.time, "executing scheduled task");
            if let Err(err) = (entry.callback)(&mut self.ctx) {
                tracing::warn!("scheduled task failed: {err}");
            }
            if entry.interval > 0 && !entry.cancelled.get() {
                entry.time += entry.interval;
                self.ctx.reinsert(entry);
            }
        }
        self.ctx.finish();
    }

    /// See [`OperationContext::execute`].
    pub fn execute<F>(&mut self, task: F) -> ExecutorResult<()>
    where
        F: FnOnce(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        self.ctx.execute(task)
    }

    /// See [`OperationContext::schedule`].
    pub fn schedule<F>(&mut self, delay: Duration, task: F) -> ExecutorResult<Scheduled>
    where
        F: FnMut(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        self.ctx.schedule(delay, task)
    }

    /// See [`OperationContext::schedule_repeated`].
    pub fn schedule_repeated<F>(
        &mut self,
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> ExecutorResult<Scheduled>
    where
        F: FnMut(&mut OperationContext) -> Result<(), TaskError> + 'static,
    {
        self.ctx.schedule_repeated(initial_delay, interval, task)
    }

    #[cfg(test)]
    pub(crate) fn scheduled_len(&self) -> usize {
        self.ctx.timers.borrow().len()
    }
}

impl Default for ServiceExecutor {
    fn default() -> Self {
        Self::new()
    }
}
