//! Admission control for new tasks.
//!
//! The [`AdmissionController`] compares a group's live aggregate usage with
//! its configured limits under the effective mode:
//!
//! | Effective mode | Under limit | At or over limit |
//! |----------------|-------------|------------------|
//! | `DISABLED` | admit | admit |
//! | `MONITOR_ONLY` | admit | admit, count a would-be rejection |
//! | `ENFORCED` | admit | reject, count a rejection |

use std::sync::Arc;

use tracing::{debug, warn};

use crate::registry::WorkloadGroupRegistry;
use crate::settings::SettingsController;
use crate::tracker::ResourceUsageTracker;
use crate::types::{
    AdmissionControlMode, AdmissionDecision, AdmissionRejection, NodeCapacity, ResourceType,
    WorkloadGroup, WorkloadGroupId,
};

/// Decides whether a task may start in a workload group.
pub trait Admitter: Send + Sync {
    /// Returns the admission decision for a new task in `group_id`.
    fn admit(&self, group_id: &WorkloadGroupId) -> AdmissionDecision;
}

/// An admitter that admits everything, used when workload management is
/// switched off in the static configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAdmitter;

impl NoOpAdmitter {
    /// Creates a new no-op admitter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Admitter for NoOpAdmitter {
    fn admit(&self, _group_id: &WorkloadGroupId) -> AdmissionDecision {
        AdmissionDecision::Admit
    }
}

/// A limit that a group has reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitBreach {
    /// Resource at or over its limit.
    pub resource: ResourceType,
    /// Configured limit.
    pub limit: f64,
    /// Observed usage fraction.
    pub observed: f64,
}

/// Admission controller backed by the registry, tracker and settings.
#[derive(Debug)]
pub struct AdmissionController {
    settings: Arc<SettingsController>,
    registry: Arc<WorkloadGroupRegistry>,
    tracker: Arc<ResourceUsageTracker>,
    capacity: NodeCapacity,
}

impl AdmissionController {
    /// Creates a new admission controller.
    #[must_use]
    pub fn new(
        settings: Arc<SettingsController>,
        registry: Arc<WorkloadGroupRegistry>,
        tracker: Arc<ResourceUsageTracker>,
        capacity: NodeCapacity,
    ) -> Self {
        Self {
            settings,
            registry,
            tracker,
            capacity,
        }
    }

    /// Returns the mode in effect for a group.
    #[must_use]
    pub fn effective_mode(&self, group: &WorkloadGroup) -> AdmissionControlMode {
        group.effective_mode(self.settings.mode())
    }

    /// Returns the usage fraction of a group for one resource.
    #[must_use]
    pub fn usage_fraction(&self, group_id: &WorkloadGroupId, resource: ResourceType) -> f64 {
        let usage = self.tracker.group_usage(group_id);
        self.capacity.fraction(resource, usage.usage(resource))
    }

    /// Returns the first resource at or over its limit, checking CPU before
    /// memory.
    #[must_use]
    pub fn breach(&self, group: &WorkloadGroup) -> Option<LimitBreach> {
        group.limits.iter().find_map(|(resource, limit)| {
            let observed = self.usage_fraction(&group.id, resource);
            (observed >= limit).then_some(LimitBreach {
                resource,
                limit,
                observed,
            })
        })
    }
}

impl Admitter for AdmissionController {
    fn admit(&self, group_id: &WorkloadGroupId) -> AdmissionDecision {
        let group = self.registry.get_group(group_id);
        let mode = self.effective_mode(&group);
        if !mode.is_tracking() {
            return AdmissionDecision::Admit;
        }

        let Some(breach) = self.breach(&group) else {
            return AdmissionDecision::Admit;
        };

        let counters = self.registry.counters(&group.id);
        if mode.is_enforced() {
            counters.record_rejection(breach.resource);
            warn!(
                group_id = %group.id,
                resource = %breach.resource,
                limit = breach.limit,
                observed = breach.observed,
                "admission rejected"
            );
            AdmissionDecision::Reject(AdmissionRejection {
                group_id: group.id,
                resource: breach.resource,
                limit: breach.limit,
                observed: breach.observed,
            })
        } else {
            counters.record_would_reject();
            debug!(
                group_id = %group.id,
                resource = %breach.resource,
                limit = breach.limit,
                observed = breach.observed,
                "admission would be rejected in enforced mode"
            );
            AdmissionDecision::Admit
        }
    }
}
