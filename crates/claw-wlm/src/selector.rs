//! Selection of tasks to cancel in an over-limit workload group.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::task::Task;
use crate::types::{NodeCapacity, ResourceType};

/// Picks the tasks to cancel so a group returns under a limit.
pub trait TaskSelectionStrategy: Send + Sync {
    /// Returns the tasks that would be selected, without changing any state.
    ///
    /// `limit` is a fraction of the node capacity for `resource`.
    fn plan(
        &self,
        tasks: &[Arc<Task>],
        limit: f64,
        resource: ResourceType,
        capacity: &NodeCapacity,
    ) -> Vec<Arc<Task>>;

    /// Selects tasks for cancellation.
    ///
    /// Each planned task is moved to `Cancelled` as it is selected. A task
    /// that finished or was cancelled concurrently is skipped, so no task is
    /// ever selected twice.
    fn select_for_cancellation(
        &self,
        tasks: &[Arc<Task>],
        limit: f64,
        resource: ResourceType,
        capacity: &NodeCapacity,
    ) -> Vec<Arc<Task>> {
        self.plan(tasks, limit, resource, capacity)
            .into_iter()
            .filter(|task| {
                let selected = task.try_cancel();
                if !selected {
                    debug!(
                        task_id = %task.id(),
                        state = %task.state(),
                        "task left before selection"
                    );
                }
                selected
            })
            .collect()
    }
}

/// Greedy selection of the heaviest tasks first.
///
/// Active tasks are ordered by descending usage of the resource, then by
/// earliest start, then by task id. Tasks are taken in that order until the
/// remaining usage is at or under the limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestUsageFirst;

impl HighestUsageFirst {
    /// Creates the strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn selection_order(a: &(u64, Arc<Task>), b: &(u64, Arc<Task>)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| a.1.start_time_nanos().cmp(&b.1.start_time_nanos()))
        .then_with(|| a.1.id().cmp(&b.1.id()))
}

impl TaskSelectionStrategy for HighestUsageFirst {
    #[allow(clippy::cast_precision_loss)]
    fn plan(
        &self,
        tasks: &[Arc<Task>],
        limit: f64,
        resource: ResourceType,
        capacity: &NodeCapacity,
    ) -> Vec<Arc<Task>> {
        // Usage is read once so ordering and accounting agree.
        let mut candidates: Vec<(u64, Arc<Task>)> = tasks
            .iter()
            .filter(|task| task.is_cancellable())
            .map(|task| (task.usage(resource), Arc::clone(task)))
            .collect();
        candidates.sort_by(selection_order);

        let total: u64 = candidates.iter().map(|(usage, _)| *usage).sum();
        let mut excess = total as f64 - limit * capacity.get(resource) as f64;

        let mut selected = Vec::new();
        for (usage, task) in candidates {
            if excess <= 0.0 || usage == 0 {
                break;
            }
            excess -= usage as f64;
            selected.push(task);
        }
        selected
    }
}

/// A strategy that never selects anything, used when workload management is
/// switched off in the static configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSelection;

impl NoOpSelection {
    /// Creates the strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TaskSelectionStrategy for NoOpSelection {
    fn plan(
        &self,
        _tasks: &[Arc<Task>],
        _limit: f64,
        _resource: ResourceType,
        _capacity: &NodeCapacity,
    ) -> Vec<Arc<Task>> {
        Vec::new()
    }
}
