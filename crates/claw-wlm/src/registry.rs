//! Workload group configuration, membership and throttle counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WlmError};
use crate::settings::{SettingChange, SettingKey};
use crate::types::{ResourceType, TaskId, WorkloadGroup, WorkloadGroupId};

/// Monotonic per-group counters.
///
/// Counters are never reset while the process runs, survive settings changes
/// and outlive the deletion of their group.
#[derive(Debug, Default)]
pub struct ThrottleCounters {
    rejections: AtomicU64,
    cancellations: AtomicU64,
    would_rejections: AtomicU64,
    completions: AtomicU64,
    failures: AtomicU64,
    cpu_rejections: AtomicU64,
    memory_rejections: AtomicU64,
    cpu_cancellations: AtomicU64,
    memory_cancellations: AtomicU64,
}

impl ThrottleCounters {
    /// Records an enforced rejection caused by `resource`.
    pub fn record_rejection(&self, resource: ResourceType) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        match resource {
            ResourceType::Cpu => self.cpu_rejections.fetch_add(1, Ordering::Relaxed),
            ResourceType::Memory => self.memory_rejections.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records a delivered cancellation caused by `resource`.
    pub fn record_cancellation(&self, resource: ResourceType) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
        match resource {
            ResourceType::Cpu => self.cpu_cancellations.fetch_add(1, Ordering::Relaxed),
            ResourceType::Memory => self.memory_cancellations.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records an admission that would have been rejected if enforced.
    pub fn record_would_reject(&self) {
        self.would_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a task that finished normally.
    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a task that failed.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Total enforced rejections.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Total delivered cancellations.
    #[must_use]
    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    /// Total monitor-only would-be rejections.
    #[must_use]
    pub fn would_rejections(&self) -> u64 {
        self.would_rejections.load(Ordering::Relaxed)
    }

    /// Total completed tasks.
    #[must_use]
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    /// Total failed tasks.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Rejections attributed to one resource.
    #[must_use]
    pub fn rejections_for(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Cpu => self.cpu_rejections.load(Ordering::Relaxed),
            ResourceType::Memory => self.memory_rejections.load(Ordering::Relaxed),
        }
    }

    /// Cancellations attributed to one resource.
    #[must_use]
    pub fn cancellations_for(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Cpu => self.cpu_cancellations.load(Ordering::Relaxed),
            ResourceType::Memory => self.memory_cancellations.load(Ordering::Relaxed),
        }
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> ThrottleSnapshot {
        ThrottleSnapshot {
            rejections: self.rejections(),
            cancellations: self.cancellations(),
            would_rejections: self.would_rejections(),
            completions: self.completions(),
            failures: self.failures(),
        }
    }
}

/// A copy of [`ThrottleCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThrottleSnapshot {
    /// Enforced rejections.
    pub rejections: u64,
    /// Delivered cancellations.
    pub cancellations: u64,
    /// Monitor-only would-be rejections.
    pub would_rejections: u64,
    /// Completed tasks.
    pub completions: u64,
    /// Failed tasks.
    pub failures: u64,
}

/// Source of truth for workload groups and their active tasks.
///
/// The default group always exists. Lookups of unknown ids degrade to it
/// instead of failing.
#[derive(Debug)]
pub struct WorkloadGroupRegistry {
    groups: RwLock<HashMap<WorkloadGroupId, WorkloadGroup>>,
    members: RwLock<HashMap<WorkloadGroupId, HashSet<TaskId>>>,
    counters: RwLock<HashMap<WorkloadGroupId, Arc<ThrottleCounters>>>,
}

impl Default for WorkloadGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadGroupRegistry {
    /// Creates a registry holding only the default group.
    #[must_use]
    pub fn new() -> Self {
        let default = WorkloadGroup::default_group();
        let mut groups = HashMap::new();
        groups.insert(default.id.clone(), default);
        Self {
            groups: RwLock::new(groups),
            members: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry seeded with `groups`.
    ///
    /// # Errors
    ///
    /// Returns an error if any group is invalid.
    pub fn with_groups(groups: impl IntoIterator<Item = WorkloadGroup>) -> Result<Self> {
        let registry = Self::new();
        for group in groups {
            registry.upsert_group(group)?;
        }
        Ok(registry)
    }

    /// Returns a group's configuration, or the default group if unknown.
    #[must_use]
    pub fn get_group(&self, id: &WorkloadGroupId) -> WorkloadGroup {
        let groups = self.groups.read();
        groups
            .get(id)
            .or_else(|| groups.get(&WorkloadGroupId::default_group()))
            .cloned()
            .unwrap_or_else(WorkloadGroup::default_group)
    }

    /// Returns true if the group is configured.
    #[must_use]
    pub fn contains(&self, id: &WorkloadGroupId) -> bool {
        self.groups.read().contains_key(id)
    }

    /// Returns `id` if configured, otherwise the default group id.
    #[must_use]
    pub fn resolve(&self, id: &WorkloadGroupId) -> WorkloadGroupId {
        if self.contains(id) {
            id.clone()
        } else {
            WorkloadGroupId::default_group()
        }
    }

    /// Returns all configured groups ordered by id.
    #[must_use]
    pub fn groups(&self) -> Vec<WorkloadGroup> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    /// Creates or replaces a group.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkloadGroup` if the definition fails validation.
    pub fn upsert_group(&self, group: WorkloadGroup) -> Result<()> {
        group.validate()?;
        let id = group.id.clone();
        let previous = self.groups.write().insert(id.clone(), group.clone());
        info!(
            group_id = %id,
            cpu_limit = ?group.limits.cpu,
            memory_limit = ?group.limits.memory,
            mode = %group.mode,
            created = previous.is_none(),
            "workload group upserted"
        );
        Ok(())
    }

    /// Deletes a group and moves its active tasks to the default group.
    ///
    /// Tasks are not cancelled. Returns the ids of the moved tasks.
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` for unknown groups and `InvalidWorkloadGroup`
    /// for the default group.
    pub fn delete_group(&self, id: &WorkloadGroupId) -> Result<HashSet<TaskId>> {
        if id.is_default() {
            return Err(WlmError::InvalidWorkloadGroup {
                group_id: id.clone(),
                reason: "the default group cannot be deleted".into(),
            });
        }
        if self.groups.write().remove(id).is_none() {
            return Err(WlmError::GroupNotFound {
                group_id: id.clone(),
            });
        }

        let mut members = self.members.write();
        let moved = members.remove(id).unwrap_or_default();
        if !moved.is_empty() {
            members
                .entry(WorkloadGroupId::default_group())
                .or_default()
                .extend(moved.iter().copied());
        }
        drop(members);

        info!(group_id = %id, moved_tasks = moved.len(), "workload group deleted");
        Ok(moved)
    }

    /// Adds a task to a group's active set. Returns false if it was already
    /// present.
    pub fn add_member(&self, group_id: &WorkloadGroupId, task_id: TaskId) -> bool {
        self.members
            .write()
            .entry(group_id.clone())
            .or_default()
            .insert(task_id)
    }

    /// Removes a task from whichever group currently holds it. Returns the
    /// group it was removed from.
    pub fn remove_member(&self, task_id: TaskId) -> Option<WorkloadGroupId> {
        let mut members = self.members.write();
        let group_id = members
            .iter()
            .find(|(_, tasks)| tasks.contains(&task_id))
            .map(|(id, _)| id.clone())?;
        if let Some(tasks) = members.get_mut(&group_id) {
            tasks.remove(&task_id);
            if tasks.is_empty() {
                members.remove(&group_id);
            }
        }
        Some(group_id)
    }

    /// Returns a copy of a group's active task ids.
    #[must_use]
    pub fn active_tasks_of(&self, group_id: &WorkloadGroupId) -> HashSet<TaskId> {
        self.members
            .read()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of active tasks in a group.
    #[must_use]
    pub fn member_count(&self, group_id: &WorkloadGroupId) -> usize {
        self.members.read().get(group_id).map_or(0, HashSet::len)
    }

    /// Returns the counters of a group, creating them on first use.
    #[must_use]
    pub fn counters(&self, group_id: &WorkloadGroupId) -> Arc<ThrottleCounters> {
        if let Some(counters) = self.counters.read().get(group_id) {
            return Arc::clone(counters);
        }
        Arc::clone(self.counters.write().entry(group_id.clone()).or_default())
    }

    /// Applies a per-group settings change.
    ///
    /// Limit and mode keys for a group that does not exist yet create it.
    /// Other keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting group is invalid.
    pub fn apply_setting(&self, change: &SettingChange) -> Result<()> {
        let mut group = match &change.key {
            SettingKey::GroupLimit { group_id, .. } | SettingKey::GroupMode { group_id } => {
                self.groups
                    .read()
                    .get(group_id)
                    .cloned()
                    .unwrap_or_else(|| WorkloadGroup::new(group_id.clone()))
            }
            _ => return Ok(()),
        };

        match &change.key {
            SettingKey::GroupLimit { resource, .. } => {
                group
                    .limits
                    .set(*resource, change.new.as_ref().and_then(|v| v.as_fraction()));
            }
            SettingKey::GroupMode { .. } => {
                group.mode = change
                    .new
                    .as_ref()
                    .and_then(|v| v.as_mode())
                    .unwrap_or_default();
            }
            _ => {}
        }

        debug!(key = %change.key, "applying group setting");
        self.upsert_group(group)
    }
}
