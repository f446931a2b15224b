//! Static configuration for workload management.
//!
//! [`WlmConfig`] is read once at startup and seeds the
//! [`SettingsController`](crate::settings::SettingsController) and the
//! [`WorkloadGroupRegistry`](crate::registry::WorkloadGroupRegistry). Every
//! later change goes through the settings controller.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WlmError};
use crate::types::{AdmissionControlMode, NodeCapacity, WorkloadGroup};

/// Default interval between cancellation sweeps.
pub const DEFAULT_CANCELLATION_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval between aggregate correction passes.
pub const DEFAULT_CORRECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-node timeout for stats requests.
pub const DEFAULT_STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Workload management configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WlmConfig {
    /// When false, admission and cancellation use no-op implementations.
    pub enabled: bool,
    /// Initial global admission control mode.
    pub mode: AdmissionControlMode,
    /// Id of this node in stats responses.
    pub local_node_id: String,
    /// Capacity that usage fractions are measured against.
    pub node_capacity: NodeCapacity,
    /// Initial interval between cancellation sweeps.
    pub cancellation_interval: Duration,
    /// Initial interval between aggregate correction passes.
    pub correction_interval: Duration,
    /// Initial per-node timeout for stats requests.
    pub stats_timeout: Duration,
    /// Whether monitor-only groups are swept in dry-run mode.
    pub monitor_only_dry_run: bool,
    /// Groups to create at startup.
    pub groups: Vec<WorkloadGroup>,
}

impl Default for WlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AdmissionControlMode::MonitorOnly,
            local_node_id: "local".to_string(),
            node_capacity: NodeCapacity::default(),
            cancellation_interval: DEFAULT_CANCELLATION_INTERVAL,
            correction_interval: DEFAULT_CORRECTION_INTERVAL,
            stats_timeout: DEFAULT_STATS_TIMEOUT,
            monitor_only_dry_run: false,
            groups: Vec::new(),
        }
    }
}

impl WlmConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| WlmError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Enables or disables workload management.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the initial global mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AdmissionControlMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the local node id.
    #[must_use]
    pub fn with_local_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.local_node_id = node_id.into();
        self
    }

    /// Sets the node capacity.
    #[must_use]
    pub const fn with_node_capacity(mut self, capacity: NodeCapacity) -> Self {
        self.node_capacity = capacity;
        self
    }

    /// Sets the cancellation sweep interval.
    #[must_use]
    pub const fn with_cancellation_interval(mut self, interval: Duration) -> Self {
        self.cancellation_interval = interval;
        self
    }

    /// Sets the correction pass interval.
    #[must_use]
    pub const fn with_correction_interval(mut self, interval: Duration) -> Self {
        self.correction_interval = interval;
        self
    }

    /// Sets the per-node stats timeout.
    #[must_use]
    pub const fn with_stats_timeout(mut self, timeout: Duration) -> Self {
        self.stats_timeout = timeout;
        self
    }

    /// Enables dry-run sweeps of monitor-only groups.
    #[must_use]
    pub const fn with_monitor_only_dry_run(mut self, enabled: bool) -> Self {
        self.monitor_only_dry_run = enabled;
        self
    }

    /// Adds a group to create at startup.
    #[must_use]
    pub fn with_group(mut self, group: WorkloadGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero capacities or intervals, an empty
    /// node id or duplicate groups, and `InvalidWorkloadGroup` for invalid
    /// group definitions.
    pub fn validate(&self) -> Result<()> {
        if self.local_node_id.trim().is_empty() {
            return Err(WlmError::InvalidConfig {
                reason: "local_node_id cannot be empty".into(),
            });
        }
        self.node_capacity.validate()?;

        for (name, interval) in [
            ("cancellation_interval", self.cancellation_interval),
            ("correction_interval", self.correction_interval),
            ("stats_timeout", self.stats_timeout),
        ] {
            if interval.is_zero() {
                return Err(WlmError::InvalidConfig {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(&group.id) {
                return Err(WlmError::InvalidConfig {
                    reason: format!("workload group {} defined twice", group.id),
                });
            }
        }
        Ok(())
    }
}
