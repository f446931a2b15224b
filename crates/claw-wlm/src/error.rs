//! Error types for workload management.

use thiserror::Error;

use crate::types::{ResourceType, TaskId, WorkloadGroupId};

/// Result type for workload management operations.
pub type Result<T> = std::result::Result<T, WlmError>;

/// Errors that can occur in the workload management subsystem.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WlmError {
    /// A task id was registered twice.
    #[error("task {task_id} is already tracked")]
    DuplicateTask {
        /// ID of the task that was already registered.
        task_id: TaskId,
    },

    /// The task is not (or no longer) tracked.
    #[error("task {task_id} is not tracked")]
    UnknownTask {
        /// ID of the task that was not found.
        task_id: TaskId,
    },

    /// Admission was rejected because the group is at or over a limit.
    #[error(
        "workload group {group_id} rejected task: {resource} usage {observed:.4} reached limit {limit:.4}"
    )]
    AdmissionRejected {
        /// Group that rejected the task.
        group_id: WorkloadGroupId,
        /// Resource whose limit was reached.
        resource: ResourceType,
        /// Configured limit as a fraction of node capacity.
        limit: f64,
        /// Observed usage as a fraction of node capacity.
        observed: f64,
    },

    /// A settings update failed validation.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting {
        /// Setting key that was rejected.
        key: String,
        /// Description of why the value is invalid.
        reason: String,
    },

    /// A peer node did not answer a stats request.
    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable {
        /// ID of the node that failed.
        node_id: String,
        /// Description of the failure.
        reason: String,
    },

    /// Workload group not found.
    #[error("workload group not found: {group_id}")]
    GroupNotFound {
        /// ID of the group that was not found.
        group_id: WorkloadGroupId,
    },

    /// Workload group definition is invalid.
    #[error("invalid workload group {group_id}: {reason}")]
    InvalidWorkloadGroup {
        /// ID of the offending group.
        group_id: WorkloadGroupId,
        /// Description of why the group is invalid.
        reason: String,
    },

    /// Static configuration is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of why the configuration is invalid.
        reason: String,
    },
}

impl WlmError {
    /// Returns true for outcomes that are expected under normal operation
    /// rather than integration faults.
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::UnknownTask { .. } | Self::AdmissionRejected { .. })
    }
}
