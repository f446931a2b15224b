//! Tracked tasks and their lifecycle state.
//!
//! A [`Task`] is shared between the thread executing it (which only touches
//! the atomic usage counters) and the cancellation sweep (which only performs
//! compare-and-swap state transitions). No field requires a lock.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{ResourceType, ResourceUsageSnapshot, TaskId, WorkloadGroupId};

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    /// Registered, admission pending or just granted.
    Admitted = 0,
    /// Reported usage at least once.
    Running = 1,
    /// Finished normally.
    Completed = 2,
    /// Selected for cancellation.
    Cancelled = 3,
    /// Refused by admission control.
    Rejected = 4,
}

impl TaskState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Admitted,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Rejected,
        }
    }

    /// Returns true if the task is still executing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Admitted | Self::Running)
    }

    /// Returns true if the state is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A task whose resource consumption is attributed to a workload group.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    group_id: WorkloadGroupId,
    start_time_nanos: i64,
    cpu_nanos: AtomicU64,
    window_cpu_nanos: AtomicU64,
    last_window_cpu_nanos: AtomicU64,
    heap_bytes: AtomicU64,
    state: AtomicU8,
}

impl Task {
    /// Creates a task in the `Admitted` state.
    #[must_use]
    pub fn new(id: TaskId, group_id: WorkloadGroupId, start_time_nanos: i64) -> Self {
        Self {
            id,
            group_id,
            start_time_nanos,
            cpu_nanos: AtomicU64::new(0),
            window_cpu_nanos: AtomicU64::new(0),
            last_window_cpu_nanos: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
            state: AtomicU8::new(TaskState::Admitted as u8),
        }
    }

    /// Creates a task stamped with the current wall-clock time.
    #[must_use]
    pub fn started_now(id: TaskId, group_id: WorkloadGroupId) -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        Self::new(id, group_id, now)
    }

    /// Sets initial usage counters. The CPU time counts against the current
    /// accounting window.
    #[must_use]
    pub fn with_usage(self, cpu_nanos: u64, heap_bytes: u64) -> Self {
        self.cpu_nanos.store(cpu_nanos, Ordering::Relaxed);
        self.window_cpu_nanos.store(cpu_nanos, Ordering::Relaxed);
        self.heap_bytes.store(heap_bytes, Ordering::Relaxed);
        self
    }

    /// Returns the task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the group the task was admitted into.
    #[must_use]
    pub const fn group_id(&self) -> &WorkloadGroupId {
        &self.group_id
    }

    /// Returns the start time in nanoseconds since the Unix epoch.
    #[must_use]
    pub const fn start_time_nanos(&self) -> i64 {
        self.start_time_nanos
    }

    /// Returns accumulated CPU time since the task started.
    #[must_use]
    pub fn cpu_nanos(&self) -> u64 {
        self.cpu_nanos.load(Ordering::Acquire)
    }

    /// Returns the CPU time consumed in the current accounting window.
    #[must_use]
    pub fn current_window_cpu_nanos(&self) -> u64 {
        self.window_cpu_nanos.load(Ordering::Acquire)
    }

    /// Returns the CPU time consumed in the last completed window.
    #[must_use]
    pub fn last_window_cpu_nanos(&self) -> u64 {
        self.last_window_cpu_nanos.load(Ordering::Acquire)
    }

    /// Returns the CPU time charged against node capacity: the larger of the
    /// current and the last completed window.
    #[must_use]
    pub fn windowed_cpu_nanos(&self) -> u64 {
        self.current_window_cpu_nanos().max(self.last_window_cpu_nanos())
    }

    /// Returns the latest heap reading.
    #[must_use]
    pub fn heap_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Acquire)
    }

    /// Returns the raw usage of a resource.
    #[must_use]
    pub fn usage(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Cpu => self.windowed_cpu_nanos(),
            ResourceType::Memory => self.heap_bytes(),
        }
    }

    /// Adds CPU time to the lifetime total and the current window,
    /// returning the new lifetime total.
    pub fn add_cpu(&self, delta_nanos: u64) -> u64 {
        self.window_cpu_nanos.fetch_add(delta_nanos, Ordering::AcqRel);
        self.cpu_nanos
            .fetch_add(delta_nanos, Ordering::AcqRel)
            .saturating_add(delta_nanos)
    }

    /// Closes the current window. Returns the CPU time of the window just
    /// closed and of the window it replaces as the last completed one.
    pub fn roll_cpu_window(&self) -> (u64, u64) {
        let closed = self.window_cpu_nanos.swap(0, Ordering::AcqRel);
        let replaced = self.last_window_cpu_nanos.swap(closed, Ordering::AcqRel);
        (closed, replaced)
    }

    /// Replaces the heap reading, returning the previous one.
    pub fn set_heap(&self, bytes: u64) -> u64 {
        self.heap_bytes.swap(bytes, Ordering::AcqRel)
    }

    /// Copies current usage into an immutable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ResourceUsageSnapshot {
        ResourceUsageSnapshot::new(self.cpu_nanos(), self.heap_bytes())
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically moves from `from` to `to`. Returns false if the task was
    /// not in `from`.
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the first usage report.
    pub fn mark_running(&self) -> bool {
        self.transition(TaskState::Admitted, TaskState::Running)
    }

    /// Marks the task cancelled if it is still active.
    ///
    /// Only one caller ever observes `true` for a given task.
    pub fn try_cancel(&self) -> bool {
        self.finish_as(TaskState::Cancelled)
    }

    /// Marks the task completed if it is still active.
    pub fn mark_completed(&self) -> bool {
        self.finish_as(TaskState::Completed)
    }

    // Retries while the task stays active, so a concurrent `mark_running`
    // never makes an active task look finished.
    fn finish_as(&self, to: TaskState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        while TaskState::from_u8(current).is_active() {
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Marks an admitted task as rejected.
    pub fn mark_rejected(&self) -> bool {
        self.transition(TaskState::Admitted, TaskState::Rejected)
    }

    /// Returns true if the task may still be selected for cancellation.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        self.state().is_active()
    }
}
