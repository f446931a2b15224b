//! Periodic cancellation of tasks in over-limit workload groups.
//!
//! The [`TaskCancellationService`] sweeps every group whose effective mode is
//! `ENFORCED`, picks tasks with a [`TaskSelectionStrategy`] and delivers the
//! cancellation through a [`CancellationHandler`] supplied by the execution
//! engine. Cancellation is cooperative: the handler only signals the engine.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::WorkloadGroupRegistry;
use crate::selector::TaskSelectionStrategy;
use crate::settings::SettingsController;
use crate::task::Task;
use crate::tracker::ResourceUsageTracker;
use crate::types::{AdmissionControlMode, NodeCapacity, TaskId, WorkloadGroup, WorkloadGroupId};

/// Delivers cancellation signals to the execution engine.
///
/// Implement this trait to integrate with your task runtime.
pub trait CancellationHandler: Send + Sync {
    /// Asks the engine to cancel a task.
    ///
    /// Returns true if the signal was delivered, false if the task had
    /// already finished.
    fn cancel(&self, task_id: TaskId) -> bool;
}

impl<H: CancellationHandler + ?Sized> CancellationHandler for Arc<H> {
    fn cancel(&self, task_id: TaskId) -> bool {
        (**self).cancel(task_id)
    }
}

/// A handler that records cancellations without signalling anything.
#[derive(Debug, Default)]
pub struct NoOpCancellationHandler {
    cancelled: RwLock<Vec<TaskId>>,
    finished: RwLock<HashSet<TaskId>>,
}

impl NoOpCancellationHandler {
    /// Creates a new no-op handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a task as already finished (for testing).
    pub fn mark_finished(&self, task_id: TaskId) {
        self.finished.write().insert(task_id);
    }

    /// Returns the tasks cancelled so far, in order.
    #[must_use]
    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.read().clone()
    }
}

impl CancellationHandler for NoOpCancellationHandler {
    fn cancel(&self, task_id: TaskId) -> bool {
        if self.finished.read().contains(&task_id) {
            debug!(task_id = %task_id, "NoOp cancel of finished task");
            return false;
        }
        debug!(task_id = %task_id, "NoOp cancel signal sent");
        self.cancelled.write().push(task_id);
        true
    }
}

/// Outcome of one cancellation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancellationReport {
    /// Groups whose mode made them eligible for the sweep.
    pub groups_scanned: usize,
    /// Groups found over at least one limit.
    pub groups_over_limit: usize,
    /// Tasks whose cancellation was delivered.
    pub cancelled: Vec<TaskId>,
    /// Tasks selected but reported finished by the engine.
    pub already_finished: Vec<TaskId>,
    /// Tasks that would have been cancelled in monitor-only groups.
    pub dry_run: Vec<TaskId>,
}

impl CancellationReport {
    /// Returns true if the sweep found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.groups_over_limit == 0
    }
}

/// Sweeps over-limit groups and cancels tasks until they are back under.
pub struct TaskCancellationService<H: CancellationHandler> {
    settings: Arc<SettingsController>,
    registry: Arc<WorkloadGroupRegistry>,
    tracker: Arc<ResourceUsageTracker>,
    selector: Box<dyn TaskSelectionStrategy>,
    handler: H,
    capacity: NodeCapacity,
}

impl<H: CancellationHandler> std::fmt::Debug for TaskCancellationService<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCancellationService")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<H: CancellationHandler> TaskCancellationService<H> {
    /// Creates a new cancellation service.
    #[must_use]
    pub fn new(
        settings: Arc<SettingsController>,
        registry: Arc<WorkloadGroupRegistry>,
        tracker: Arc<ResourceUsageTracker>,
        selector: Box<dyn TaskSelectionStrategy>,
        handler: H,
        capacity: NodeCapacity,
    ) -> Self {
        Self {
            settings,
            registry,
            tracker,
            selector,
            handler,
            capacity,
        }
    }

    /// Returns the cancellation handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs one sweep over all groups.
    pub fn run_once(&self) -> CancellationReport {
        let global = self.settings.mode();
        let dry_run_enabled = self.settings.monitor_only_dry_run();
        let mut report = CancellationReport::default();

        for group in self.registry.groups() {
            let dry_run = match group.effective_mode(global) {
                AdmissionControlMode::Enforced => false,
                AdmissionControlMode::MonitorOnly if dry_run_enabled => true,
                _ => continue,
            };
            report.groups_scanned += 1;
            if self.sweep_group(&group, dry_run, &mut report) {
                report.groups_over_limit += 1;
            }
        }

        if report.is_noop() {
            debug!(groups_scanned = report.groups_scanned, "no group over limit");
        }
        report
    }

    /// Sweeps one group. Returns true if it was over any limit.
    fn sweep_group(
        &self,
        group: &WorkloadGroup,
        dry_run: bool,
        report: &mut CancellationReport,
    ) -> bool {
        let usage = self.tracker.group_usage(&group.id);
        let mut over_limit = false;

        for (resource, limit) in group.limits.iter() {
            let observed = self.capacity.fraction(resource, usage.usage(resource));
            if observed <= limit {
                continue;
            }
            over_limit = true;
            let candidates = self.candidates(&group.id);

            if dry_run {
                let plan = self.selector.plan(&candidates, limit, resource, &self.capacity);
                info!(
                    group_id = %group.id,
                    resource = %resource,
                    limit,
                    observed,
                    selected = plan.len(),
                    "dry-run cancellation"
                );
                report.dry_run.extend(plan.iter().map(|task| task.id()));
                continue;
            }

            let selected =
                self.selector
                    .select_for_cancellation(&candidates, limit, resource, &self.capacity);
            let counters = self.registry.counters(&group.id);
            for task in selected {
                if self.handler.cancel(task.id()) {
                    counters.record_cancellation(resource);
                    info!(
                        task_id = %task.id(),
                        group_id = %group.id,
                        resource = %resource,
                        usage = task.usage(resource),
                        limit,
                        observed,
                        "task cancelled"
                    );
                    report.cancelled.push(task.id());
                } else {
                    debug!(task_id = %task.id(), group_id = %group.id, "task already finished");
                    report.already_finished.push(task.id());
                }
            }
        }
        over_limit
    }

    /// Point-in-time copy of the group's tracked tasks.
    fn candidates(&self, group_id: &WorkloadGroupId) -> Vec<Arc<Task>> {
        self.registry
            .active_tasks_of(group_id)
            .into_iter()
            .filter_map(|task_id| self.tracker.get(task_id))
            .collect()
    }
}
