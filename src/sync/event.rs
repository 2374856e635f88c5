//! The user-visible completion and notification object.
//!
//! An event composes a completion stamp, a dependency graph, and callback
//! dispatch on top of the engine completion protocol. Its execution status
//! moves monotonically downward, QUEUED → SUBMITTED → RUNNING → COMPLETE,
//! with any negative value as a terminal abort; the transition rule is
//! enforced with an atomic compare-exchange so racing writers (a completion
//! poller against an abort request) cannot regress the status.
//!
//! A user event carries no hardware task at all and is driven purely by
//! explicit status writes from outside.

use crate::config::WaitConfig;
use crate::error::{DriverError, DriverResult};
use crate::memory::storage::StorageKind;
use crate::sync::completion::{
    CompletionStamp, FlushStamp, FlushStampTracker, TASK_COUNT_NOT_READY, TaskCount,
};
use crate::sync::engine::EngineContext;
use crate::sync::tag::backoff_probe;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

pub const EXECUTION_STATUS_QUEUED: i32 = 3;
pub const EXECUTION_STATUS_SUBMITTED: i32 = 2;
pub const EXECUTION_STATUS_RUNNING: i32 = 1;
pub const EXECUTION_STATUS_COMPLETE: i32 = 0;
/// Generic terminal abort requested from outside.
pub const EXECUTION_STATUS_ABORTED: i32 = -1;
/// Distinguished terminal status for a device execution failure.
pub const EXECUTION_STATUS_GPU_HANG: i32 = -777;

#[inline]
#[must_use]
pub const fn is_status_completed(status: i32) -> bool {
    status <= EXECUTION_STATUS_COMPLETE
}

#[inline]
#[must_use]
pub const fn is_status_completed_by_termination(status: i32) -> bool {
    status < EXECUTION_STATUS_COMPLETE
}

/// Result of a wait request that is allowed to return early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
}

/// The status bucket a callback is registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallbackTarget {
    Queued = 0,
    Submitted = 1,
    Running = 2,
    Completed = 3,
}

impl CallbackTarget {
    const COUNT: usize = 4;

    #[must_use]
    pub const fn from_status(status: i32) -> Option<Self> {
        match status {
            EXECUTION_STATUS_QUEUED => Some(Self::Queued),
            EXECUTION_STATUS_SUBMITTED => Some(Self::Submitted),
            EXECUTION_STATUS_RUNNING => Some(Self::Running),
            s if s <= EXECUTION_STATUS_COMPLETE => Some(Self::Completed),
            _ => None,
        }
    }

    /// The status value at which this bucket starts firing.
    #[must_use]
    pub const fn trigger_status(self) -> i32 {
        match self {
            Self::Queued => EXECUTION_STATUS_QUEUED,
            Self::Submitted => EXECUTION_STATUS_SUBMITTED,
            Self::Running => EXECUTION_STATUS_RUNNING,
            Self::Completed => EXECUTION_STATUS_COMPLETE,
        }
    }
}

pub type EventCallback = Box<dyn FnOnce(i32) + Send>;

/// A deferred enqueue: runs against the submission layer when the event
/// leaves the queued state and yields the stamp of the flushed work.
pub type PendingCommand = Box<dyn FnOnce() -> CompletionStamp + Send>;

pub struct Event {
    context: Option<Arc<EngineContext>>,
    wait_config: WaitConfig,

    execution_status: AtomicI32,
    task_level: AtomicU32,
    task_count: AtomicU32,
    flush_stamp: FlushStampTracker,

    /// Unresolved blocking dependencies.
    parent_count: AtomicU32,
    /// Events to release once this one submits or completes.
    children: Mutex<Vec<Arc<Event>>>,
    callbacks: [Mutex<Vec<EventCallback>>; CallbackTarget::COUNT],
    /// Enqueue parked behind the dependencies, submitted at most once.
    command_to_submit: Mutex<Option<PendingCommand>>,
}

impl Event {
    /// Creates an event tied to a submission on `context`. Pass the not-ready
    /// sentinels for an event that is still blocked on its dependencies.
    #[must_use]
    pub fn create(
        context: &Arc<EngineContext>,
        task_level: TaskCount,
        task_count: TaskCount,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: Some(Arc::clone(context)),
            wait_config: *context.wait_config(),
            execution_status: AtomicI32::new(EXECUTION_STATUS_QUEUED),
            task_level: AtomicU32::new(task_level),
            task_count: AtomicU32::new(task_count),
            flush_stamp: FlushStampTracker::new(),
            parent_count: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
            callbacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            command_to_submit: Mutex::new(None),
        })
    }

    /// Creates a user event: no hardware task, status driven from outside.
    #[must_use]
    pub fn create_user() -> Arc<Self> {
        Arc::new(Self {
            context: None,
            wait_config: WaitConfig::default(),
            execution_status: AtomicI32::new(EXECUTION_STATUS_QUEUED),
            task_level: AtomicU32::new(TASK_COUNT_NOT_READY),
            task_count: AtomicU32::new(TASK_COUNT_NOT_READY),
            flush_stamp: FlushStampTracker::new(),
            parent_count: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
            callbacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            command_to_submit: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn is_user_event(&self) -> bool {
        self.context.is_none()
    }

    #[must_use]
    pub fn peek_execution_status(&self) -> i32 {
        self.execution_status.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_task_level(&self) -> TaskCount {
        self.task_level.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_is_blocked(&self) -> bool {
        self.parent_count.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn is_ready_for_submission(&self) -> bool {
        self.parent_count.load(Ordering::Acquire) == 0
    }

    /// Fills in the stamp produced when the associated command was flushed.
    pub fn update_completion_stamp(&self, stamp: &CompletionStamp) {
        self.task_count.store(stamp.task_count, Ordering::Release);
        self.task_level.store(stamp.task_level, Ordering::Release);
        self.flush_stamp.set_stamp(stamp.flush_stamp);
    }

    #[must_use]
    pub fn peek_flush_stamp(&self) -> FlushStamp {
        self.flush_stamp.peek_stamp()
    }

    /// Parks an enqueue behind this event's dependencies. It runs on the
    /// thread that releases the event and its stamp becomes this event's
    /// completion stamp.
    pub fn set_pending_command(&self, command: PendingCommand) {
        *self.command_to_submit.lock().unwrap() = Some(command);
    }

    /// Submits the parked command, at most once. An aborting release drops
    /// the command unexecuted; the hardware never sees it.
    fn submit_pending_command(&self, abort: bool) {
        let command = self.command_to_submit.lock().unwrap().take();
        if let Some(command) = command
            && !abort
        {
            let stamp = command();
            self.update_completion_stamp(&stamp);
        }
    }

    // =====================================================================================
    // Status machine
    // =====================================================================================

    /// Atomic accept-if-not-regressing store. A write lands only when it
    /// moves the status further along (numerically lower) and the current
    /// status is not already terminal: the first negative value wins and no
    /// later write, negative or not, replaces it.
    fn transition_execution_status(&self, new_status: i32) -> bool {
        let mut prev = self.execution_status.load(Ordering::Acquire);
        loop {
            if prev <= new_status || is_status_completed_by_termination(prev) {
                return false;
            }
            match self.execution_status.compare_exchange_weak(
                prev,
                new_status,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Transition plus callback dispatch for every threshold crossed.
    fn transition_to(&self, new_status: i32) -> bool {
        if self.transition_execution_status(new_status) {
            self.execute_callbacks(new_status);
            true
        } else {
            false
        }
    }

    /// Re-reads the completion protocol and advances the status accordingly.
    /// Idempotent; safe to call from any observer thread.
    pub fn update_execution_status(&self) {
        if self.peek_task_level() == TASK_COUNT_NOT_READY {
            return;
        }

        let snapshot = self.peek_execution_status();
        if is_status_completed(snapshot) {
            return;
        }

        if self.peek_is_blocked() {
            self.transition_to(EXECUTION_STATUS_QUEUED);
            return;
        }

        if snapshot == EXECUTION_STATUS_QUEUED {
            self.submit_pending_command(false);
            if self.transition_to(EXECUTION_STATUS_SUBMITTED) {
                self.unblock_children(EXECUTION_STATUS_SUBMITTED);
            }
            // fall through: the submission may already be complete
        }

        if let Some(context) = &self.context
            && context.is_complete(self.peek_task_count())
        {
            if self.transition_to(EXECUTION_STATUS_COMPLETE) {
                self.unblock_children(EXECUTION_STATUS_COMPLETE);
                context.clean_allocation_list(self.peek_task_count(), StorageKind::Temporary);
            }
            return;
        }

        self.transition_to(EXECUTION_STATUS_SUBMITTED);
    }

    #[must_use]
    pub fn update_status_and_check_completion(&self) -> bool {
        self.update_execution_status();
        is_status_completed(self.peek_execution_status())
    }

    /// Explicit status override, the driving operation for user events.
    ///
    /// Rejected when the event already completed, when the status would not
    /// change, or when the event is blocked and the new status is not a
    /// termination. Returns whether the write landed.
    pub fn set_status(&self, status: i32) -> bool {
        let prev = self.peek_execution_status();
        if is_status_completed(prev) {
            return false;
        }
        if status == prev {
            return false;
        }
        if self.peek_is_blocked() && !is_status_completed_by_termination(status) {
            return false;
        }

        if status == EXECUTION_STATUS_SUBMITTED || is_status_completed(status) {
            self.submit_pending_command(is_status_completed_by_termination(status));
        }

        if !self.transition_to(status) {
            return false;
        }
        if is_status_completed(status) || status == EXECUTION_STATUS_SUBMITTED {
            self.unblock_children(status);
        }
        true
    }

    /// Terminal path for a device execution failure: this event and every
    /// event still blocked on it observe the hang status.
    pub fn abort_due_to_gpu_hang(&self) {
        if self.transition_to(EXECUTION_STATUS_GPU_HANG) {
            self.unblock_children(EXECUTION_STATUS_GPU_HANG);
        }
    }

    // =====================================================================================
    // Callbacks
    // =====================================================================================

    /// Registers `callback` to run the first time the status reaches
    /// `target`. Fires immediately, on this thread, when the event is already
    /// at or past it. Callbacks run synchronously on whichever thread causes
    /// the crossing and must not block.
    pub fn add_callback(&self, target: CallbackTarget, callback: impl FnOnce(i32) + Send + 'static) {
        self.callbacks[target as usize]
            .lock()
            .unwrap()
            .push(Box::new(callback));

        self.update_execution_status();
        let status = self.peek_execution_status();
        if status <= target.trigger_status() {
            self.execute_callbacks(status);
        }
    }

    /// Drains and runs every bucket whose threshold `status` has crossed.
    /// Draining under the bucket lock makes each callback fire exactly once
    /// no matter how many threads observe the crossing.
    fn execute_callbacks(&self, status: i32) {
        let terminated = is_status_completed_by_termination(status);
        let target = if terminated {
            CallbackTarget::Completed
        } else {
            match CallbackTarget::from_status(status) {
                Some(target) => target,
                None => return,
            }
        };

        for bucket in 0..=target as usize {
            let drained = mem::take(&mut *self.callbacks[bucket].lock().unwrap());
            for callback in drained {
                callback(status);
            }
        }
    }

    #[must_use]
    pub fn peek_has_callbacks(&self) -> bool {
        self.callbacks
            .iter()
            .any(|bucket| !bucket.lock().unwrap().is_empty())
    }

    // =====================================================================================
    // Dependencies
    // =====================================================================================

    /// Registers `child` as blocked on this event.
    pub fn add_child(&self, child: &Arc<Event>) {
        child.parent_count.fetch_add(1, Ordering::AcqRel);
        self.children.lock().unwrap().push(Arc::clone(child));

        let status = self.peek_execution_status();
        if is_status_completed(status) {
            self.unblock_children(status);
        }
    }

    /// Releases every registered child with `transition_status`, propagating
    /// the task level downward on the success path.
    fn unblock_children(&self, transition_status: i32) {
        let terminated = is_status_completed_by_termination(transition_status);

        let task_level_to_propagate = if terminated {
            TASK_COUNT_NOT_READY
        } else {
            let level = self.task_level.load(Ordering::Acquire);
            if level == TASK_COUNT_NOT_READY {
                // Top of the tree: adopt the engine's current level.
                let resolved = self.resolve_task_level();
                self.task_level.store(resolved, Ordering::Release);
                resolved
            } else {
                level + 1
            }
        };

        let children = mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            child.unblock_by(task_level_to_propagate, transition_status);
        }
    }

    fn resolve_task_level(&self) -> TaskCount {
        match &self.context {
            Some(context) => context.peek_task_level(),
            None => 0,
        }
    }

    /// One blocking dependency resolved. When the dependency terminated, the
    /// negative status propagates here (and transitively further) regardless
    /// of how many other parents remain.
    fn unblock_by(&self, task_level: TaskCount, transition_status: i32) {
        let prev = self.parent_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unblocked an event that had no parents");
        let remaining = prev.saturating_sub(1);

        let terminated = is_status_completed_by_termination(transition_status);
        if remaining > 0 && !terminated {
            return;
        }

        if !terminated {
            let own = self.task_level.load(Ordering::Acquire);
            let base = if own == TASK_COUNT_NOT_READY {
                self.resolve_task_level()
            } else {
                own
            };
            self.task_level
                .store(base.max(task_level), Ordering::Release);
        }

        let status_to_propagate = if terminated {
            transition_status
        } else {
            EXECUTION_STATUS_SUBMITTED
        };
        self.set_status(status_to_propagate);

        // May already be complete; settle the state so it stops blocking others.
        self.update_execution_status();
    }

    // =====================================================================================
    // Waiting
    // =====================================================================================

    /// Waits for completion. Non-blocking calls return `NotReady` instead of
    /// polling. An aborted event returns an error rather than hanging on a
    /// count the hardware will never reach.
    pub fn wait(&self, blocking: bool) -> DriverResult<WaitStatus> {
        let status = self.peek_execution_status();
        if is_status_completed_by_termination(status) {
            return Err(DriverError::Aborted(status));
        }

        let Some(context) = &self.context else {
            return self.wait_user(blocking);
        };

        if context.is_hung() {
            self.abort_due_to_gpu_hang();
            return Err(DriverError::GpuHang(context.context_id()));
        }

        if !blocking {
            if self.peek_task_count() != TASK_COUNT_NOT_READY
                && context.is_complete(self.peek_task_count())
            {
                self.update_execution_status();
                context.clean_allocation_list(self.peek_task_count(), StorageKind::Temporary);
                return Ok(WaitStatus::Ready);
            }
            return Ok(WaitStatus::NotReady);
        }

        self.wait_for_task_count_assignment()?;

        match context.wait_until_complete(self.peek_task_count()) {
            Ok(()) => {}
            Err(DriverError::GpuHang(id)) => {
                self.abort_due_to_gpu_hang();
                return Err(DriverError::GpuHang(id));
            }
            Err(e) => return Err(e),
        }

        self.update_execution_status();
        context.clean_allocation_list(self.peek_task_count(), StorageKind::Temporary);
        Ok(WaitStatus::Ready)
    }

    /// A blocked event has no task count until submission assigns one.
    fn wait_for_task_count_assignment(&self) -> DriverResult<()> {
        let start = Instant::now();
        let mut probes: u32 = 0;

        while self.peek_task_count() == TASK_COUNT_NOT_READY {
            let status = self.peek_execution_status();
            if is_status_completed_by_termination(status) {
                return Err(DriverError::Aborted(status));
            }
            if let Some(timeout) = self.wait_config.timeout
                && start.elapsed() >= timeout
            {
                return Err(DriverError::WaitTimeout);
            }
            backoff_probe(&self.wait_config, probes);
            probes = probes.saturating_add(1);
        }
        Ok(())
    }

    fn wait_user(&self, blocking: bool) -> DriverResult<WaitStatus> {
        let start = Instant::now();
        let mut probes: u32 = 0;

        loop {
            let status = self.peek_execution_status();
            if is_status_completed_by_termination(status) {
                return Err(DriverError::Aborted(status));
            }
            if is_status_completed(status) {
                return Ok(WaitStatus::Ready);
            }
            if !blocking {
                return Ok(WaitStatus::NotReady);
            }
            if let Some(timeout) = self.wait_config.timeout
                && start.elapsed() >= timeout
            {
                return Err(DriverError::WaitTimeout);
            }
            backoff_probe(&self.wait_config, probes);
            probes = probes.saturating_add(1);
        }
    }
}

/// Polls a set of events until all complete. Pending events are swept
/// repeatedly with non-blocking waits; a terminated event fails the whole
/// wait, and a device hang additionally aborts everything still pending.
pub fn wait_for_events(events: &[Arc<Event>]) -> DriverResult<()> {
    let mut pending: Vec<Arc<Event>> = events.to_vec();
    let mut still_pending: Vec<Arc<Event>> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        for event in pending.drain(..) {
            let status = event.peek_execution_status();
            if is_status_completed_by_termination(status) {
                return Err(DriverError::Aborted(status));
            }

            match event.wait(false) {
                Ok(WaitStatus::Ready) => {}
                Ok(WaitStatus::NotReady) => still_pending.push(event),
                Err(DriverError::GpuHang(id)) => {
                    for survivor in &still_pending {
                        survivor.abort_due_to_gpu_hang();
                    }
                    return Err(DriverError::GpuHang(id));
                }
                Err(e) => return Err(e),
            }
        }
        mem::swap(&mut pending, &mut still_pending);
        if !pending.is_empty() {
            thread::yield_now();
        }
    }
    Ok(())
}

/// Initial task level for a new enqueue: the maximum of the queue's current
/// level and every resolved wait-list level, plus one unless the command is
/// already known complete.
#[must_use]
pub fn aggregated_task_level(
    queue_task_level: TaskCount,
    wait_list: &[Arc<Event>],
    command_already_complete: bool,
) -> TaskCount {
    let mut level = queue_task_level;
    for event in wait_list {
        let dependency_level = event.peek_task_level();
        if dependency_level != TASK_COUNT_NOT_READY && dependency_level > level {
            level = dependency_level;
        }
    }
    if command_already_complete { level } else { level + 1 }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("status", &self.peek_execution_status())
            .field("task_level", &self.peek_task_level())
            .field("task_count", &self.peek_task_count())
            .field("parent_count", &self.parent_count.load(Ordering::Acquire))
            .field("user_event", &self.is_user_event())
            .finish()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // A command still parked here can never run; drop it unexecuted.
        self.submit_pending_command(true);

        let status = self.peek_execution_status();
        if !is_status_completed(status) {
            self.transition_execution_status(EXECUTION_STATUS_ABORTED);
        }

        // Every registered callback must run before the object goes away, and
        // no child may stay blocked on a dead event.
        let final_status = self.peek_execution_status();
        self.execute_callbacks(final_status);
        self.unblock_children(final_status);
    }
}
