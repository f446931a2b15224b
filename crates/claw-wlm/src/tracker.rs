//! Per-task resource accounting with incremental per-group aggregates.
//!
//! The [`ResourceUsageTracker`] owns every live [`Task`]. Usage samples arrive
//! concurrently from the threads executing the tasks; each sample is applied
//! with atomic additions to the task and to the aggregate of the group the
//! task is attributed to. The task map is only locked exclusively when a task
//! is registered or removed.
//!
//! Each task entry carries its own small lock guarding its attribution. A
//! sample holds it shared while adding, removal and re-attribution hold it
//! exclusively, so a sample racing with removal is either fully counted and
//! then subtracted, or dropped.
//!
//! CPU is charged per accounting window. [`ResourceUsageTracker::roll_cpu_window`]
//! closes the window once per period; a task counts against its group with
//! the larger of its current and last completed window, so a task running at
//! a steady rate shows a steady fraction however long it lives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WlmError};
use crate::task::Task;
use crate::types::{ResourceUsageSnapshot, TaskId, WorkloadGroupId};

/// Usage charged to a group, split the way the group aggregate stores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Charge {
    cpu_nanos: i64,
    last_cpu_nanos: i64,
    heap_bytes: i64,
}

impl Charge {
    fn of(task: &Task) -> Self {
        Self {
            cpu_nanos: signed(task.current_window_cpu_nanos()),
            last_cpu_nanos: signed(task.last_window_cpu_nanos()),
            heap_bytes: signed(task.heap_bytes()),
        }
    }

    const fn negated(self) -> Self {
        Self {
            cpu_nanos: -self.cpu_nanos,
            last_cpu_nanos: -self.last_cpu_nanos,
            heap_bytes: -self.heap_bytes,
        }
    }

    fn saturating_add(self, other: Self) -> Self {
        Self {
            cpu_nanos: self.cpu_nanos.saturating_add(other.cpu_nanos),
            last_cpu_nanos: self.last_cpu_nanos.saturating_add(other.last_cpu_nanos),
            heap_bytes: self.heap_bytes.saturating_add(other.heap_bytes),
        }
    }

    const fn abs_diff(self, other: Self) -> u64 {
        self.cpu_nanos
            .abs_diff(other.cpu_nanos)
            .saturating_add(self.last_cpu_nanos.abs_diff(other.last_cpu_nanos))
            .saturating_add(self.heap_bytes.abs_diff(other.heap_bytes))
    }
}

/// Running totals for one workload group. CPU is kept per accounting
/// window: the current one and the last completed one.
#[derive(Debug, Default)]
struct GroupUsage {
    cpu_nanos: AtomicI64,
    last_cpu_nanos: AtomicI64,
    heap_bytes: AtomicI64,
}

impl GroupUsage {
    fn add(&self, cpu_nanos: i64, heap_bytes: i64) {
        self.charge(Charge {
            cpu_nanos,
            last_cpu_nanos: 0,
            heap_bytes,
        });
    }

    fn charge(&self, charge: Charge) {
        if charge.cpu_nanos != 0 {
            self.cpu_nanos.fetch_add(charge.cpu_nanos, Ordering::AcqRel);
        }
        if charge.last_cpu_nanos != 0 {
            self.last_cpu_nanos.fetch_add(charge.last_cpu_nanos, Ordering::AcqRel);
        }
        if charge.heap_bytes != 0 {
            self.heap_bytes.fetch_add(charge.heap_bytes, Ordering::AcqRel);
        }
    }

    fn load(&self) -> Charge {
        Charge {
            cpu_nanos: self.cpu_nanos.load(Ordering::Acquire),
            last_cpu_nanos: self.last_cpu_nanos.load(Ordering::Acquire),
            heap_bytes: self.heap_bytes.load(Ordering::Acquire),
        }
    }

    fn store(&self, charge: Charge) {
        self.cpu_nanos.store(charge.cpu_nanos, Ordering::Release);
        self.last_cpu_nanos.store(charge.last_cpu_nanos, Ordering::Release);
        self.heap_bytes.store(charge.heap_bytes, Ordering::Release);
    }

    fn snapshot(&self) -> ResourceUsageSnapshot {
        let charge = self.load();
        ResourceUsageSnapshot::new(
            unsigned(charge.cpu_nanos.max(charge.last_cpu_nanos)),
            unsigned(charge.heap_bytes),
        )
    }
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Attribution {
    group_id: WorkloadGroupId,
    usage: Arc<GroupUsage>,
}

#[derive(Debug)]
struct TrackedTask {
    task: Arc<Task>,
    attribution: RwLock<Attribution>,
    removed: AtomicBool,
}

/// Tracks CPU and heap consumption of live tasks.
#[derive(Debug, Default)]
pub struct ResourceUsageTracker {
    tasks: RwLock<HashMap<TaskId, Arc<TrackedTask>>>,
    aggregates: RwLock<HashMap<WorkloadGroupId, Arc<GroupUsage>>>,
}

impl ResourceUsageTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new task in the `Admitted` state, stamped with the
    /// current time.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTask` if the id is already tracked.
    pub fn record_start(&self, task_id: TaskId, group_id: WorkloadGroupId) -> Result<Arc<Task>> {
        self.record(Task::started_now(task_id, group_id))
    }

    /// Registers a pre-built task. Any usage it already carries is charged to
    /// its group.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTask` if the id is already tracked.
    pub fn record(&self, task: Task) -> Result<Arc<Task>> {
        let task_id = task.id();
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task_id) {
            warn!(task_id = %task_id, "task registered twice");
            return Err(WlmError::DuplicateTask { task_id });
        }

        let usage = self.aggregate_for(task.group_id());
        usage.charge(Charge::of(&task));

        let task = Arc::new(task);
        let entry = TrackedTask {
            attribution: RwLock::new(Attribution {
                group_id: task.group_id().clone(),
                usage,
            }),
            task: Arc::clone(&task),
            removed: AtomicBool::new(false),
        };
        tasks.insert(task_id, Arc::new(entry));
        drop(tasks);

        debug!(task_id = %task_id, group_id = %task.group_id(), "task tracked");
        Ok(task)
    }

    /// Applies a usage sample: `cpu_delta_nanos` is added to the task's CPU
    /// time, `heap_bytes` replaces its heap reading.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTask` if the task was already removed.
    pub fn update_usage(
        &self,
        task_id: TaskId,
        cpu_delta_nanos: u64,
        heap_bytes: u64,
    ) -> Result<()> {
        let entry = self.entry(task_id)?;

        let attribution = entry.attribution.read();
        if entry.removed.load(Ordering::Acquire) {
            return Err(WlmError::UnknownTask { task_id });
        }
        entry.task.mark_running();
        entry.task.add_cpu(cpu_delta_nanos);
        let previous_heap = entry.task.set_heap(heap_bytes);
        attribution.usage.add(
            signed(cpu_delta_nanos),
            signed(heap_bytes).saturating_sub(signed(previous_heap)),
        );
        Ok(())
    }

    /// Returns the accumulated usage of a task.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTask` if the task is not tracked.
    pub fn snapshot(&self, task_id: TaskId) -> Result<ResourceUsageSnapshot> {
        Ok(self.entry(task_id)?.task.snapshot())
    }

    /// Returns a tracked task.
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&task_id).map(|e| Arc::clone(&e.task))
    }

    /// Returns true if the task is tracked.
    #[must_use]
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.read().contains_key(&task_id)
    }

    /// Removes a task and returns its final usage.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTask` if the task is not tracked, including on a
    /// second call for the same id.
    pub fn remove(&self, task_id: TaskId) -> Result<ResourceUsageSnapshot> {
        let entry = self
            .tasks
            .write()
            .remove(&task_id)
            .ok_or(WlmError::UnknownTask { task_id })?;

        let attribution = entry.attribution.write();
        entry.removed.store(true, Ordering::Release);
        let snapshot = entry.task.snapshot();
        attribution.usage.charge(Charge::of(&entry.task).negated());
        drop(attribution);

        debug!(
            task_id = %task_id,
            cpu_nanos = snapshot.cpu_nanos,
            heap_bytes = snapshot.heap_bytes,
            "task untracked"
        );
        Ok(snapshot)
    }

    /// Returns the live aggregate usage charged to a group.
    #[must_use]
    pub fn group_usage(&self, group_id: &WorkloadGroupId) -> ResourceUsageSnapshot {
        self.aggregates
            .read()
            .get(group_id)
            .map_or_else(ResourceUsageSnapshot::zero, |usage| usage.snapshot())
    }

    /// Returns a point-in-time copy of all live tasks.
    #[must_use]
    pub fn live_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .read()
            .values()
            .map(|e| Arc::clone(&e.task))
            .collect()
    }

    /// Returns a point-in-time copy of the tasks charged to a group.
    #[must_use]
    pub fn tasks_of(&self, group_id: &WorkloadGroupId) -> Vec<Arc<Task>> {
        self.entries()
            .into_iter()
            .filter(|e| e.attribution.read().group_id == *group_id)
            .map(|e| Arc::clone(&e.task))
            .collect()
    }

    /// Returns the number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if no task is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Moves every live task charged to `from` over to `to`, along with its
    /// usage, and drops the `from` aggregate. Returns the number of tasks
    /// moved.
    pub fn reattribute(&self, from: &WorkloadGroupId, to: &WorkloadGroupId) -> usize {
        if from == to {
            return 0;
        }
        let target = self.aggregate_for(to);
        let mut moved = 0;

        for entry in self.entries() {
            let mut attribution = entry.attribution.write();
            if attribution.group_id != *from || entry.removed.load(Ordering::Acquire) {
                continue;
            }
            let charge = Charge::of(&entry.task);
            attribution.usage.charge(charge.negated());
            target.charge(charge);
            *attribution = Attribution {
                group_id: to.clone(),
                usage: Arc::clone(&target),
            };
            moved += 1;
        }

        self.aggregates.write().remove(from);
        if moved > 0 {
            info!(from = %from, to = %to, tasks = moved, "re-attributed task usage");
        }
        moved
    }

    /// Closes the CPU accounting window of every live task, so that CPU
    /// fractions measure recent consumption rather than lifetime totals.
    /// Returns the number of tasks rolled.
    pub fn roll_cpu_window(&self) -> usize {
        let mut rolled = 0;
        for entry in self.entries() {
            let attribution = entry.attribution.write();
            if entry.removed.load(Ordering::Acquire) {
                continue;
            }
            let (closed, replaced) = entry.task.roll_cpu_window();
            attribution.usage.charge(Charge {
                cpu_nanos: -signed(closed),
                last_cpu_nanos: signed(closed).saturating_sub(signed(replaced)),
                heap_bytes: 0,
            });
            rolled += 1;
        }
        trace!(tasks = rolled, "rolled cpu accounting window");
        rolled
    }

    /// Recomputes every aggregate from the live tasks and returns the total
    /// absolute drift that was repaired (CPU nanos plus heap bytes).
    pub fn correct(&self) -> u64 {
        let mut exact: HashMap<WorkloadGroupId, Charge> = HashMap::new();
        for entry in self.entries() {
            let attribution = entry.attribution.read();
            if entry.removed.load(Ordering::Acquire) {
                continue;
            }
            let sums = exact.entry(attribution.group_id.clone()).or_default();
            *sums = sums.saturating_add(Charge::of(&entry.task));
        }

        let mut drift: u64 = 0;
        for (group_id, usage) in self.aggregates.read().iter() {
            let charge = exact.remove(group_id).unwrap_or_default();
            let delta = usage.load().abs_diff(charge);
            if delta > 0 {
                usage.store(charge);
                drift = drift.saturating_add(delta);
            }
        }

        // Live tasks whose aggregate was dropped concurrently.
        for (group_id, charge) in exact {
            self.aggregate_for(&group_id).store(charge);
            drift = drift.saturating_add(charge.abs_diff(Charge::default()));
        }

        if drift > 0 {
            debug!(drift, "corrected aggregate drift");
        }
        drift
    }

    fn entry(&self, task_id: TaskId) -> Result<Arc<TrackedTask>> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(WlmError::UnknownTask { task_id })
    }

    fn entries(&self) -> Vec<Arc<TrackedTask>> {
        self.tasks.read().values().cloned().collect()
    }

    fn aggregate_for(&self, group_id: &WorkloadGroupId) -> Arc<GroupUsage> {
        if let Some(usage) = self.aggregates.read().get(group_id) {
            return Arc::clone(usage);
        }
        let mut aggregates = self.aggregates.write();
        Arc::clone(aggregates.entry(group_id.clone()).or_default())
    }
}
