//! Core types for workload management.
//!
//! This module provides the value types shared by every component:
//! - [`TaskId`] and [`WorkloadGroupId`]: identifiers
//! - [`ResourceType`]: the tracked resources (CPU time, heap)
//! - [`AdmissionControlMode`]: how strictly limits are applied
//! - [`WorkloadGroup`] and [`ResourceLimits`]: group configuration
//! - [`ResourceUsageSnapshot`]: immutable usage readings
//! - [`NodeCapacity`]: the denominator for usage fractions
//! - [`AdmissionDecision`]: the outcome of an admission check

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WlmError};

/// Identifier of the group that absorbs unknown and deleted groups.
pub const DEFAULT_WORKLOAD_GROUP_ID: &str = "DEFAULT_WORKLOAD_GROUP";

/// Unique identifier for a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new task ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a workload group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadGroupId(String);

impl WorkloadGroupId {
    /// Creates a new workload group ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id of the default workload group.
    #[must_use]
    pub fn default_group() -> Self {
        Self(DEFAULT_WORKLOAD_GROUP_ID.to_string())
    }

    /// Returns true if this is the default workload group.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_WORKLOAD_GROUP_ID
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkloadGroupId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A resource whose consumption is tracked and limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// CPU time in nanoseconds.
    Cpu,
    /// Heap bytes currently held.
    Memory,
}

impl ResourceType {
    /// All tracked resources, in evaluation order.
    pub const ALL: [Self; 2] = [Self::Cpu, Self::Memory];

    /// Returns the lowercase name used in settings keys and stats.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown resource {other}")),
        }
    }
}

/// How strictly workload group limits are applied.
///
/// Variants are ordered by restrictiveness so that the effective mode of a
/// group is simply the maximum of the global and group modes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionControlMode {
    /// No tracking-based rejection or cancellation.
    #[default]
    Disabled,
    /// Track and report, never reject or cancel.
    MonitorOnly,
    /// Reject new tasks and cancel running ones.
    Enforced,
}

impl AdmissionControlMode {
    /// Returns the more restrictive of two modes.
    #[must_use]
    pub fn most_restrictive(self, other: Self) -> Self {
        self.max(other)
    }

    /// Returns the setting value for this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::MonitorOnly => "MONITOR_ONLY",
            Self::Enforced => "ENFORCED",
        }
    }

    /// Returns true if limits are evaluated at all.
    #[must_use]
    pub const fn is_tracking(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns true if rejection and cancellation are active.
    #[must_use]
    pub const fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced)
    }
}

impl fmt::Display for AdmissionControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionControlMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DISABLED" => Ok(Self::Disabled),
            "MONITOR_ONLY" => Ok(Self::MonitorOnly),
            "ENFORCED" => Ok(Self::Enforced),
            other => Err(format!(
                "unknown mode {other}, expected one of DISABLED, MONITOR_ONLY, ENFORCED"
            )),
        }
    }
}

/// Per-resource limits of a workload group, as fractions of node capacity.
///
/// `None` means the resource is not limited for the group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    /// CPU limit in (0, 1].
    pub cpu: Option<f64>,
    /// Memory limit in (0, 1].
    pub memory: Option<f64>,
}

impl ResourceLimits {
    /// Creates limits with nothing limited.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cpu: None,
            memory: None,
        }
    }

    /// Sets the CPU limit.
    #[must_use]
    pub const fn with_cpu(mut self, fraction: f64) -> Self {
        self.cpu = Some(fraction);
        self
    }

    /// Sets the memory limit.
    #[must_use]
    pub const fn with_memory(mut self, fraction: f64) -> Self {
        self.memory = Some(fraction);
        self
    }

    /// Returns the limit for a resource.
    #[must_use]
    pub const fn get(&self, resource: ResourceType) -> Option<f64> {
        match resource {
            ResourceType::Cpu => self.cpu,
            ResourceType::Memory => self.memory,
        }
    }

    /// Sets or clears the limit for a resource.
    pub fn set(&mut self, resource: ResourceType, limit: Option<f64>) {
        match resource {
            ResourceType::Cpu => self.cpu = limit,
            ResourceType::Memory => self.memory = limit,
        }
    }

    /// Iterates over configured limits.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, f64)> + '_ {
        ResourceType::ALL
            .into_iter()
            .filter_map(|r| self.get(r).map(|limit| (r, limit)))
    }

    /// Validates that every configured limit lies in (0, 1].
    ///
    /// # Errors
    ///
    /// Returns the offending resource and a reason.
    pub fn validate(&self) -> std::result::Result<(), (ResourceType, String)> {
        for (resource, limit) in self.iter() {
            validate_fraction(limit).map_err(|reason| (resource, reason))?;
        }
        Ok(())
    }
}

/// Checks that a limit fraction lies in (0, 1].
pub(crate) fn validate_fraction(value: f64) -> std::result::Result<(), String> {
    if value.is_nan() {
        return Err("limit cannot be NaN".to_string());
    }
    if value <= 0.0 || value > 1.0 {
        return Err(format!("limit {value} must be in (0, 1]"));
    }
    Ok(())
}

/// A named class of tasks sharing a resource-limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadGroup {
    /// Unique group id.
    pub id: WorkloadGroupId,
    /// Resource limits.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Group-level mode; the global mode wins when more restrictive.
    #[serde(default)]
    pub mode: AdmissionControlMode,
}

impl WorkloadGroup {
    /// Creates a group without limits.
    #[must_use]
    pub fn new(id: impl Into<WorkloadGroupId>) -> Self {
        Self {
            id: id.into(),
            limits: ResourceLimits::new(),
            mode: AdmissionControlMode::Disabled,
        }
    }

    /// Returns the default group.
    #[must_use]
    pub fn default_group() -> Self {
        Self::new(WorkloadGroupId::default_group())
    }

    /// Sets the limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the CPU limit.
    #[must_use]
    pub const fn with_cpu_limit(mut self, fraction: f64) -> Self {
        self.limits.cpu = Some(fraction);
        self
    }

    /// Sets the memory limit.
    #[must_use]
    pub const fn with_memory_limit(mut self, fraction: f64) -> Self {
        self.limits.memory = Some(fraction);
        self
    }

    /// Sets the group mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AdmissionControlMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the mode in effect under the given global mode.
    #[must_use]
    pub fn effective_mode(&self, global: AdmissionControlMode) -> AdmissionControlMode {
        global.most_restrictive(self.mode)
    }

    /// Validates the group definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or a limit is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(WlmError::InvalidWorkloadGroup {
                group_id: self.id.clone(),
                reason: "id cannot be empty".into(),
            });
        }
        self.limits
            .validate()
            .map_err(|(resource, reason)| WlmError::InvalidWorkloadGroup {
                group_id: self.id.clone(),
                reason: format!("{resource} {reason}"),
            })
    }
}

impl From<&str> for WorkloadGroup {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An immutable reading of accumulated usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageSnapshot {
    /// Accumulated CPU time in nanoseconds.
    pub cpu_nanos: u64,
    /// Heap bytes held at the time of the reading.
    pub heap_bytes: u64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
}

impl ResourceUsageSnapshot {
    /// Creates a snapshot stamped with the current time.
    #[must_use]
    pub fn new(cpu_nanos: u64, heap_bytes: u64) -> Self {
        Self {
            cpu_nanos,
            heap_bytes,
            timestamp: Utc::now(),
        }
    }

    /// Creates an empty snapshot.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Returns the raw usage of a resource.
    #[must_use]
    pub const fn usage(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Cpu => self.cpu_nanos,
            ResourceType::Memory => self.heap_bytes,
        }
    }
}

const DEFAULT_CPU_WINDOW: Duration = Duration::from_secs(1);

const fn default_cpu_window() -> Duration {
    DEFAULT_CPU_WINDOW
}

/// The node-wide totals that usage fractions are measured against.
///
/// CPU capacity is a budget per accounting window: `cpu_nanos` of CPU time
/// may be consumed every `cpu_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// CPU nanoseconds per window that correspond to a fraction of 1.0.
    pub cpu_nanos: u64,
    /// Heap bytes that correspond to a fraction of 1.0.
    pub heap_bytes: u64,
    /// Length of the CPU accounting window.
    #[serde(default = "default_cpu_window")]
    pub cpu_window: Duration,
}

impl NodeCapacity {
    /// Creates a capacity from raw totals with a one-second CPU window.
    #[must_use]
    pub const fn new(cpu_nanos: u64, heap_bytes: u64) -> Self {
        Self {
            cpu_nanos,
            heap_bytes,
            cpu_window: DEFAULT_CPU_WINDOW,
        }
    }

    /// Derives CPU capacity from a processor count and an accounting window.
    #[must_use]
    pub fn from_processors(processors: u32, window: Duration, heap_bytes: u64) -> Self {
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        Self {
            cpu_nanos: window_nanos.saturating_mul(u64::from(processors)),
            heap_bytes,
            cpu_window: window,
        }
    }

    /// Sets the CPU accounting window.
    #[must_use]
    pub const fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    /// Returns the capacity for a resource.
    #[must_use]
    pub const fn get(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Cpu => self.cpu_nanos,
            ResourceType::Memory => self.heap_bytes,
        }
    }

    /// Converts a raw usage value into a fraction of capacity.
    #[must_use]
    pub fn fraction(&self, resource: ResourceType, used: u64) -> f64 {
        let capacity = self.get(resource);
        if capacity == 0 {
            return 0.0;
        }
        used as f64 / capacity as f64
    }

    /// Validates that both capacities and the CPU window are non-zero.
    ///
    /// # Errors
    ///
    /// Returns an error if a capacity or the window is zero.
    pub fn validate(&self) -> Result<()> {
        for resource in ResourceType::ALL {
            if self.get(resource) == 0 {
                return Err(WlmError::InvalidConfig {
                    reason: format!("node {resource} capacity cannot be zero"),
                });
            }
        }
        if self.cpu_window.is_zero() {
            return Err(WlmError::InvalidConfig {
                reason: "cpu accounting window cannot be zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for NodeCapacity {
    /// One second of CPU on a single processor and 1 GiB of heap.
    fn default() -> Self {
        Self::new(1_000_000_000, 1024 * 1024 * 1024)
    }
}

/// Details of a rejected admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRejection {
    /// Group that rejected the task.
    pub group_id: WorkloadGroupId,
    /// Resource whose limit was reached.
    pub resource: ResourceType,
    /// Configured limit.
    pub limit: f64,
    /// Observed usage fraction.
    pub observed: f64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    /// The task may start.
    Admit,
    /// The task must not start.
    Reject(AdmissionRejection),
}

impl AdmissionDecision {
    /// Returns true if the task was admitted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Returns true if the task was rejected.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Reject(_))
    }

    /// Converts a rejection into [`WlmError::AdmissionRejected`].
    ///
    /// # Errors
    ///
    /// Returns `AdmissionRejected` for a `Reject` decision.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Admit => Ok(()),
            Self::Reject(rejection) => Err(WlmError::AdmissionRejected {
                group_id: rejection.group_id,
                resource: rejection.resource,
                limit: rejection.limit,
                observed: rejection.observed,
            }),
        }
    }
}
