//! Workload management for Clawbernetes nodes.
//!
//! `claw-wlm` governs how much CPU and heap the tasks of each workload group
//! may use on a node. It tracks per-task usage, gates new tasks with
//! admission control, cancels tasks of groups that grow past their limits and
//! reports per-group statistics across the cluster.
//!
//! # Features
//!
//! - **Usage Tracking**: Lock-free per-task CPU and heap accounting rolled up
//!   into per-group aggregates, with CPU charged per accounting window
//! - **Workload Groups**: Per-group CPU and memory limits as fractions of node
//!   capacity, with a default group for unknown and deleted groups
//! - **Admission Control**: Reject new tasks of over-limit groups, or only
//!   count would-be rejections in monitor-only mode
//! - **Cancellation**: A periodic sweep that cancels the smallest set of
//!   heaviest tasks needed to bring a group back under its limit
//! - **Cluster Stats**: Scatter-gather of per-node stats with per-node
//!   timeouts and partial results
//! - **Dynamic Settings**: Mode, limits and intervals can change at runtime
//!
//! # Admission Control Modes
//!
//! | Mode | Admission | Cancellation |
//! |------|-----------|--------------|
//! | `DISABLED` | always admit | never |
//! | `MONITOR_ONLY` | admit, count would-be rejections | never (optional dry run) |
//! | `ENFORCED` | reject at or over a limit | cancel over a limit |
//!
//! A group's effective mode is the more restrictive of the global mode and
//! the group's own mode.
//!
//! # Example
//!
//! ```rust
//! use claw_wlm::{
//!     AdmissionControlMode, NoOpCancellationHandler, NodeCapacity, TaskId, WlmConfig,
//!     WlmError, WorkloadGroup, WorkloadGroupId, WorkloadManagementService,
//! };
//!
//! let config = WlmConfig::new()
//!     .with_mode(AdmissionControlMode::Enforced)
//!     .with_node_capacity(NodeCapacity::new(1_000_000_000, 1 << 30))
//!     .with_group(WorkloadGroup::new("analytics").with_cpu_limit(0.5));
//!
//! let service = WorkloadManagementService::new(config, NoOpCancellationHandler::new()).unwrap();
//! let group = WorkloadGroupId::new("analytics");
//!
//! // The engine reports task start, usage samples and task end.
//! service.on_task_start(TaskId::new(1), group.clone()).unwrap();
//! service.on_task_usage_sample(TaskId::new(1), 600_000_000, 4096);
//!
//! // The group is now over its CPU limit, so new tasks are rejected.
//! match service.on_task_start(TaskId::new(2), group.clone()) {
//!     Err(WlmError::AdmissionRejected { resource, observed, .. }) => {
//!         println!("rejected on {resource} at {observed:.2}");
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//!
//! let usage = service.on_task_end(TaskId::new(1)).unwrap();
//! assert_eq!(usage.cpu_nanos, 600_000_000);
//! ```
//!
//! # Dynamic Settings
//!
//! ```rust
//! use claw_wlm::{AdmissionControlMode, SettingsController, WlmConfig};
//!
//! let settings = SettingsController::new(&WlmConfig::default());
//! settings.update("wlm.mode", "ENFORCED").unwrap();
//! settings.update("wlm.workload_group.analytics.memory", "0.25").unwrap();
//!
//! // Invalid values are rejected and leave the current value in place.
//! assert!(settings.update("wlm.mode", "bogus").is_err());
//! assert_eq!(settings.mode(), AdmissionControlMode::Enforced);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │            WorkloadManagementService             │
//! │  ┌────────────────┐  ┌─────────────────────────┐ │
//! │  │   Admission    │  │  TaskCancellationService│ │
//! │  │   Controller   │  │  (TaskSelectionStrategy)│ │
//! │  └────────────────┘  └─────────────────────────┘ │
//! │  ┌────────────────┐  ┌─────────────────────────┐ │
//! │  │ WorkloadGroup  │  │  ResourceUsageTracker   │ │
//! │  │   Registry     │  │                         │ │
//! │  └────────────────┘  └─────────────────────────┘ │
//! │  ┌────────────────┐  ┌─────────────────────────┐ │
//! │  │   Settings     │  │    StatsAggregator      │ │
//! │  │  Controller    │  │    (StatsTransport)     │ │
//! │  └────────────────┘  └─────────────────────────┘ │
//! └──────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod admission;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod registry;
pub mod selector;
pub mod service;
pub mod settings;
pub mod stats;
pub mod task;
pub mod tracker;
pub mod types;

// Re-export main types
pub use admission::{AdmissionController, Admitter, LimitBreach, NoOpAdmitter};
pub use cancellation::{
    CancellationHandler, CancellationReport, NoOpCancellationHandler, TaskCancellationService,
};
pub use config::WlmConfig;
pub use error::{Result, WlmError};
pub use registry::{ThrottleCounters, ThrottleSnapshot, WorkloadGroupRegistry};
pub use selector::{HighestUsageFirst, NoOpSelection, TaskSelectionStrategy};
pub use service::{BackgroundHandle, WorkloadManagementService};
pub use settings::{SettingChange, SettingKey, SettingValue, SettingsController};
pub use stats::{
    ClusterStats, GroupStats, LocalOnlyTransport, NodeFailure, NodeStats, ResourceStats,
    StatsAggregator, StatsRequest, StatsTransport,
};
pub use task::{Task, TaskState};
pub use tracker::ResourceUsageTracker;
pub use types::{
    AdmissionControlMode, AdmissionDecision, AdmissionRejection, NodeCapacity, ResourceLimits,
    ResourceType, ResourceUsageSnapshot, TaskId, WorkloadGroup, WorkloadGroupId,
    DEFAULT_WORKLOAD_GROUP_ID,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::admission::{AdmissionController, Admitter};
    pub use crate::cancellation::{CancellationHandler, NoOpCancellationHandler};
    pub use crate::config::WlmConfig;
    pub use crate::error::{Result, WlmError};
    pub use crate::service::WorkloadManagementService;
    pub use crate::settings::SettingsController;
    pub use crate::stats::{ClusterStats, NodeStats, StatsRequest, StatsTransport};
    pub use crate::types::{
        AdmissionControlMode, AdmissionDecision, NodeCapacity, ResourceType, TaskId,
        WorkloadGroup, WorkloadGroupId,
    };
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const SECOND: u64 = 1_000_000_000;

    fn service(config: WlmConfig) -> WorkloadManagementService<Arc<NoOpCancellationHandler>> {
        WorkloadManagementService::new(config, Arc::new(NoOpCancellationHandler::new()))
            .ok()
            .unwrap_or_else(|| panic!("valid config"))
    }

    #[test]
    fn full_workload_management_workflow() {
        let config = WlmConfig::new()
            .with_mode(AdmissionControlMode::Enforced)
            .with_node_capacity(NodeCapacity::new(SECOND, SECOND))
            .with_group(WorkloadGroup::new("g1").with_cpu_limit(0.5));
        let svc = service(config);
        let g1 = WorkloadGroupId::new("g1");

        // Three tasks are admitted while the group is idle.
        for id in 1..=3 {
            assert!(svc.on_task_start(TaskId::new(id), g1.clone()).is_ok());
        }

        // They grow to 0.3, 0.25 and 0.2 of the node's CPU.
        svc.on_task_usage_sample(TaskId::new(1), 300_000_000, 0);
        svc.on_task_usage_sample(TaskId::new(2), 250_000_000, 0);
        svc.on_task_usage_sample(TaskId::new(3), 200_000_000, 0);

        // A fourth task is rejected with a typed error.
        let rejected = svc.on_task_start(TaskId::new(4), g1.clone());
        match rejected {
            Err(WlmError::AdmissionRejected {
                group_id,
                resource,
                limit,
                observed,
            }) => {
                assert_eq!(group_id, g1);
                assert_eq!(resource, ResourceType::Cpu);
                assert!((limit - 0.5).abs() < f64::EPSILON);
                assert!((observed - 0.75).abs() < 1e-12);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // The sweep cancels only the heaviest task.
        let report = svc.run_cancellation_sweep();
        assert_eq!(report.cancelled, vec![TaskId::new(1)]);
        assert_eq!(
            svc.cancellation_handler().cancelled(),
            vec![TaskId::new(1)]
        );

        // The engine stops the cancelled task and the others finish.
        for id in 1..=3 {
            assert!(svc.on_task_end(TaskId::new(id)).is_some());
        }
        assert!(svc.tracker().is_empty());
        let usage = svc.tracker().group_usage(&g1);
        assert_eq!((usage.cpu_nanos, usage.heap_bytes), (0, 0));

        let stats = svc.collect_local_stats(&StatsRequest::local());
        let g1_stats = &stats.groups[&g1];
        assert_eq!(g1_stats.rejection_count, 1);
        assert_eq!(g1_stats.cancellation_count, 1);
        assert_eq!(g1_stats.completions, 2);
        assert_eq!(g1_stats.active_tasks, 0);
    }

    #[test]
    fn monitor_only_observes_without_acting() {
        let config = WlmConfig::new()
            .with_mode(AdmissionControlMode::MonitorOnly)
            .with_node_capacity(NodeCapacity::new(SECOND, SECOND))
            .with_group(WorkloadGroup::new("g1").with_cpu_limit(0.1));
        let svc = service(config);
        let g1 = WorkloadGroupId::new("g1");

        assert!(svc.on_task_start(TaskId::new(1), g1.clone()).is_ok());
        svc.on_task_usage_sample(TaskId::new(1), SECOND, 0);
        assert!(svc.on_task_start(TaskId::new(2), g1.clone()).is_ok());

        let report = svc.run_cancellation_sweep();
        assert!(report.cancelled.is_empty());

        let counters = svc.registry().counters(&g1);
        assert_eq!(counters.would_rejections(), 1);
        assert_eq!(counters.rejections(), 0);
        assert_eq!(counters.cancellations(), 0);
    }

    #[test]
    fn enforcing_a_monitored_group_at_runtime() {
        let config = WlmConfig::new()
            .with_mode(AdmissionControlMode::MonitorOnly)
            .with_node_capacity(NodeCapacity::new(SECOND, SECOND));
        let svc = service(config);
        let batch = WorkloadGroupId::new("batch");

        assert!(svc.update_setting("wlm.workload_group.batch.cpu", "0.4").is_ok());
        assert!(svc.on_task_start(TaskId::new(1), batch.clone()).is_ok());
        svc.on_task_usage_sample(TaskId::new(1), 500_000_000, 0);
        assert!(svc.on_task_start(TaskId::new(2), batch.clone()).is_ok());

        assert!(svc.update_setting("wlm.workload_group.batch.mode", "ENFORCED").is_ok());
        assert!(svc.on_task_start(TaskId::new(3), batch.clone()).is_err());

        let report = svc.run_cancellation_sweep();
        assert_eq!(report.cancelled, vec![TaskId::new(1)]);

        // Removing the limit lets tasks in again.
        assert!(svc.settings().remove("wlm.workload_group.batch.cpu").is_ok());
        assert!(svc.on_task_start(TaskId::new(4), batch).is_ok());
    }

    #[test]
    fn concurrent_tasks_keep_aggregates_exact() {
        let config = WlmConfig::new().with_mode(AdmissionControlMode::Disabled);
        let svc = Arc::new(service(config));
        let group = WorkloadGroupId::new("g1");

        let handles: Vec<_> = (0..8u64)
            .map(|id| {
                let svc = Arc::clone(&svc);
                let group = group.clone();
                std::thread::spawn(move || {
                    let task_id = TaskId::new(id);
                    let _ = svc.on_task_start(task_id, group);
                    for _ in 0..1000 {
                        svc.on_task_usage_sample(task_id, 3, 64);
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        let default = WorkloadGroupId::default_group();
        let usage = svc.tracker().group_usage(&default);
        assert_eq!(usage.cpu_nanos, 8 * 3 * 1000);
        assert_eq!(usage.heap_bytes, 8 * 64);
        assert_eq!(svc.run_correction(), 0);

        for id in 0..8 {
            let _ = svc.on_task_end(TaskId::new(id));
        }
        let usage = svc.tracker().group_usage(&default);
        assert_eq!((usage.cpu_nanos, usage.heap_bytes), (0, 0));
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_sweep() {
        let config = WlmConfig::new()
            .with_mode(AdmissionControlMode::Enforced)
            .with_node_capacity(NodeCapacity::new(SECOND, SECOND))
            .with_cancellation_interval(Duration::from_millis(10))
            .with_group(WorkloadGroup::new("g1").with_memory_limit(0.5));
        let svc = service(config);
        let handler = Arc::clone(svc.cancellation_handler());

        let handle = svc.start();
        assert!(handle.is_running());
        drop(handle);

        assert!(svc.on_task_start(TaskId::new(1), WorkloadGroupId::new("g1")).is_ok());
        svc.on_task_usage_sample(TaskId::new(1), 0, 900_000_000);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handler.cancelled().is_empty());

        // A manual sweep still works.
        let report = svc.run_cancellation_sweep();
        assert_eq!(report.cancelled, vec![TaskId::new(1)]);
        assert_eq!(handler.cancelled(), vec![TaskId::new(1)]);
    }
}
