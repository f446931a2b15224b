//! Workload management service.
//!
//! [`WorkloadManagementService`] wires the components together from a
//! [`WlmConfig`] and exposes the hooks the execution engine calls over a
//! task's lifetime:
//!
//! 1. [`on_task_start`](WorkloadManagementService::on_task_start) registers
//!    the task and runs admission control.
//! 2. [`on_task_usage_sample`](WorkloadManagementService::on_task_usage_sample)
//!    reports CPU and heap usage while it runs.
//! 3. [`on_task_end`](WorkloadManagementService::on_task_end) or
//!    [`on_task_failure`](WorkloadManagementService::on_task_failure) removes
//!    it again.
//!
//! [`start`](WorkloadManagementService::start) spawns the cancellation sweep,
//! the aggregate correction loop and the CPU accounting window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::admission::{AdmissionController, Admitter, NoOpAdmitter};
use crate::cancellation::{CancellationHandler, CancellationReport, TaskCancellationService};
use crate::config::WlmConfig;
use crate::error::Result;
use crate::registry::WorkloadGroupRegistry;
use crate::selector::{HighestUsageFirst, NoOpSelection, TaskSelectionStrategy};
use crate::settings::SettingsController;
use crate::stats::{
    ClusterStats, LocalOnlyTransport, NodeStats, StatsAggregator, StatsRequest, StatsTransport,
};
use crate::task::Task;
use crate::tracker::ResourceUsageTracker;
use crate::types::{ResourceUsageSnapshot, TaskId, WorkloadGroup, WorkloadGroupId};

/// Entry point for the execution engine.
pub struct WorkloadManagementService<H, T = LocalOnlyTransport>
where
    H: CancellationHandler,
    T: StatsTransport,
{
    config: WlmConfig,
    settings: Arc<SettingsController>,
    registry: Arc<WorkloadGroupRegistry>,
    tracker: Arc<ResourceUsageTracker>,
    admitter: Box<dyn Admitter>,
    cancellation: Arc<TaskCancellationService<H>>,
    stats: StatsAggregator<T>,
    // Held shared from group resolution to membership on task start and
    // exclusively by group deletion.
    group_lifecycle: RwLock<()>,
}

impl<H, T> std::fmt::Debug for WorkloadManagementService<H, T>
where
    H: CancellationHandler,
    T: StatsTransport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadManagementService")
            .field("config", &self.config)
            .field("tracked_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl<H: CancellationHandler> WorkloadManagementService<H, LocalOnlyTransport> {
    /// Creates a service that only reports local stats.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WlmConfig, handler: H) -> Result<Self> {
        Self::with_transport(config, handler, LocalOnlyTransport)
    }
}

impl<H: CancellationHandler, T: StatsTransport> WorkloadManagementService<H, T> {
    /// Creates a service that reaches peer nodes through `transport`.
    ///
    /// When the configuration disables workload management, admission and
    /// cancellation use no-op implementations while usage is still tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_transport(config: WlmConfig, handler: H, transport: T) -> Result<Self> {
        config.validate()?;

        let settings = Arc::new(SettingsController::new(&config));
        let registry = Arc::new(WorkloadGroupRegistry::with_groups(
            config.groups.iter().cloned(),
        )?);
        let tracker = Arc::new(ResourceUsageTracker::new());

        let listener_registry = Arc::clone(&registry);
        settings.add_listener(move |change| listener_registry.apply_setting(change));

        let (admitter, selector): (Box<dyn Admitter>, Box<dyn TaskSelectionStrategy>) =
            if config.enabled {
                (
                    Box::new(AdmissionController::new(
                        Arc::clone(&settings),
                        Arc::clone(&registry),
                        Arc::clone(&tracker),
                        config.node_capacity,
                    )),
                    Box::new(HighestUsageFirst::new()),
                )
            } else {
                info!("workload management disabled, admission and cancellation are no-ops");
                (Box::new(NoOpAdmitter::new()), Box::new(NoOpSelection::new()))
            };

        let cancellation = Arc::new(TaskCancellationService::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            selector,
            handler,
            config.node_capacity,
        ));
        let stats = StatsAggregator::new(
            config.local_node_id.clone(),
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            config.node_capacity,
            transport,
        );

        info!(
            node_id = %config.local_node_id,
            enabled = config.enabled,
            mode = %config.mode,
            groups = config.groups.len(),
            "workload management initialized"
        );

        Ok(Self {
            config,
            settings,
            registry,
            tracker,
            admitter,
            cancellation,
            stats,
            group_lifecycle: RwLock::new(()),
        })
    }

    /// Returns the static configuration.
    #[must_use]
    pub const fn config(&self) -> &WlmConfig {
        &self.config
    }

    /// Returns the settings controller.
    #[must_use]
    pub const fn settings(&self) -> &Arc<SettingsController> {
        &self.settings
    }

    /// Returns the group registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<WorkloadGroupRegistry> {
        &self.registry
    }

    /// Returns the usage tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<ResourceUsageTracker> {
        &self.tracker
    }

    /// Returns the cancellation handler.
    #[must_use]
    pub fn cancellation_handler(&self) -> &H {
        self.cancellation.handler()
    }

    // ==================== Execution engine hooks ====================

    /// Registers a new task and runs admission control.
    ///
    /// Unknown groups are resolved to the default group. On rejection the
    /// task is removed again and `AdmissionRejected` is returned.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTask` if the id is already tracked and
    /// `AdmissionRejected` if the group is over an enforced limit.
    pub fn on_task_start(&self, task_id: TaskId, group_id: WorkloadGroupId) -> Result<Arc<Task>> {
        let _lifecycle = self.group_lifecycle.read();
        let group_id = self.registry.resolve(&group_id);
        let task = self.tracker.record_start(task_id, group_id.clone())?;

        if let Err(e) = self.admitter.admit(&group_id).into_result() {
            task.mark_rejected();
            let _ = self.tracker.remove(task_id);
            return Err(e);
        }

        self.registry.add_member(&group_id, task_id);
        debug!(task_id = %task_id, group_id = %group_id, "task admitted");
        Ok(task)
    }

    /// Records a usage sample. Samples for unknown or finished tasks are
    /// ignored.
    pub fn on_task_usage_sample(&self, task_id: TaskId, cpu_delta_nanos: u64, heap_bytes: u64) {
        if let Err(e) = self.tracker.update_usage(task_id, cpu_delta_nanos, heap_bytes) {
            debug!(task_id = %task_id, error = %e, "usage sample ignored");
        }
    }

    /// Removes a finished task and returns its final usage.
    ///
    /// Returns `None` if the task is not tracked.
    pub fn on_task_end(&self, task_id: TaskId) -> Option<ResourceUsageSnapshot> {
        self.finish(task_id, false)
    }

    /// Removes a failed task and returns its final usage.
    ///
    /// Returns `None` if the task is not tracked.
    pub fn on_task_failure(&self, task_id: TaskId) -> Option<ResourceUsageSnapshot> {
        self.finish(task_id, true)
    }

    fn finish(&self, task_id: TaskId, failed: bool) -> Option<ResourceUsageSnapshot> {
        let Some(task) = self.tracker.get(task_id) else {
            debug!(task_id = %task_id, "end of untracked task ignored");
            return None;
        };
        // A cancelled task keeps its state and is not counted as completed.
        let completed = task.mark_completed();
        let snapshot = self.tracker.remove(task_id).ok()?;
        let group_id = self
            .registry
            .remove_member(task_id)
            .unwrap_or_else(|| task.group_id().clone());

        let counters = self.registry.counters(&group_id);
        if failed {
            counters.record_failure();
        } else if completed {
            counters.record_completion();
        }

        debug!(
            task_id = %task_id,
            group_id = %group_id,
            state = %task.state(),
            failed,
            cpu_nanos = snapshot.cpu_nanos,
            heap_bytes = snapshot.heap_bytes,
            "task removed"
        );
        Some(snapshot)
    }

    // ==================== Group management ====================

    /// Creates or replaces a workload group. Its limits and mode become
    /// visible as per-group settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkloadGroup` if the group is invalid.
    pub fn upsert_group(&self, group: WorkloadGroup) -> Result<()> {
        self.settings
            .commit_group(&group, || self.registry.upsert_group(group.clone()))
    }

    /// Deletes a workload group. Its running tasks are charged to the
    /// default group from now on and keep running.
    ///
    /// Returns the number of tasks moved.
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` for unknown groups and `InvalidWorkloadGroup`
    /// for the default group.
    pub fn delete_group(&self, group_id: &WorkloadGroupId) -> Result<usize> {
        let _lifecycle = self.group_lifecycle.write();
        let moved = self
            .settings
            .forget_group(group_id, || self.registry.delete_group(group_id))?;
        let reattributed = self
            .tracker
            .reattribute(group_id, &WorkloadGroupId::default_group());
        debug!(
            group_id = %group_id,
            members = moved.len(),
            reattributed,
            "group usage moved to default group"
        );
        Ok(moved.len())
    }

    /// Applies a dynamic setting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` if the key or value is invalid.
    pub fn update_setting(&self, key: &str, value: &str) -> Result<()> {
        self.settings.update(key, value)
    }

    // ==================== Sweeps and stats ====================

    /// Runs one cancellation sweep immediately.
    pub fn run_cancellation_sweep(&self) -> CancellationReport {
        self.cancellation.run_once()
    }

    /// Recomputes group aggregates. Returns the total drift repaired.
    pub fn run_correction(&self) -> u64 {
        self.tracker.correct()
    }

    /// Closes the current CPU accounting window. Returns the number of tasks
    /// rolled.
    pub fn roll_cpu_window(&self) -> usize {
        self.tracker.roll_cpu_window()
    }

    /// Reads the statistics of this node.
    #[must_use]
    pub fn collect_local_stats(&self, request: &StatsRequest) -> NodeStats {
        self.stats.collect_local(request)
    }

    /// Gathers statistics from the requested nodes.
    pub async fn aggregate_stats(&self, request: &StatsRequest) -> ClusterStats {
        self.stats.aggregate(request).await
    }
}

impl<H: CancellationHandler + 'static, T: StatsTransport> WorkloadManagementService<H, T> {
    /// Spawns the cancellation sweep, correction and CPU window loops on the
    /// current tokio runtime.
    ///
    /// The sweep and correction loops re-read their interval from the
    /// settings before sleeping, so interval changes apply from the next
    /// iteration. The CPU window follows the node capacity.
    #[must_use]
    pub fn start(&self) -> BackgroundHandle {
        let running = Arc::new(AtomicBool::new(true));

        let sweep = {
            let running = Arc::clone(&running);
            let settings = Arc::clone(&self.settings);
            let cancellation = Arc::clone(&self.cancellation);
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    tokio::time::sleep(settings.cancellation_interval()).await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    let report = cancellation.run_once();
                    if !report.cancelled.is_empty() {
                        info!(
                            cancelled = report.cancelled.len(),
                            groups_over_limit = report.groups_over_limit,
                            "cancellation sweep finished"
                        );
                    }
                }
            })
        };

        let correction = {
            let running = Arc::clone(&running);
            let settings = Arc::clone(&self.settings);
            let tracker = Arc::clone(&self.tracker);
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    tokio::time::sleep(settings.correction_interval()).await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tracker.correct();
                }
            })
        };

        let window = {
            let running = Arc::clone(&running);
            let tracker = Arc::clone(&self.tracker);
            let period = self.config.node_capacity.cpu_window;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                while running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tracker.roll_cpu_window();
                }
            })
        };

        info!("workload management loops started");
        BackgroundHandle {
            running,
            tasks: vec![sweep, correction, window],
        }
    }
}

/// Handle for the background loops started by
/// [`WorkloadManagementService::start`].
///
/// Dropping the handle stops the loops.
#[derive(Debug)]
pub struct BackgroundHandle {
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Returns true until [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the loops.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            for task in &self.tasks {
                task.abort();
            }
            info!("workload management loops stopped");
        }
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::NoOpCancellationHandler;
    use crate::error::WlmError;
    use crate::settings::SettingValue;
    use crate::task::TaskState;
    use crate::types::{AdmissionControlMode, NodeCapacity, ResourceType};
    use std::time::Duration;

    const SECOND: u64 = 1_000_000_000;

    fn config() -> WlmConfig {
        WlmConfig::new()
            .with_mode(AdmissionControlMode::Enforced)
            .with_node_capacity(NodeCapacity::new(SECOND, 1000))
            .with_group(WorkloadGroup::new("g1").with_cpu_limit(0.5))
    }

    fn service(config: WlmConfig) -> WorkloadManagementService<NoOpCancellationHandler> {
        WorkloadManagementService::new(config, NoOpCancellationHandler::new())
            .ok()
            .unwrap_or_else(|| panic!("valid config"))
    }

    fn gid(id: &str) -> WorkloadGroupId {
        WorkloadGroupId::new(id)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = WorkloadManagementService::new(
            WlmConfig::new().with_local_node_id(""),
            NoOpCancellationHandler::new(),
        );
        assert!(matches!(result, Err(WlmError::InvalidConfig { .. })));
    }

    #[test]
    fn start_use_end() {
        let svc = service(config());
        let task = svc.on_task_start(TaskId::new(1), gid("g1"));
        assert!(task.is_ok());
        assert_eq!(svc.registry().member_count(&gid("g1")), 1);

        svc.on_task_usage_sample(TaskId::new(1), 100, 10);
        svc.on_task_usage_sample(TaskId::new(1), 50, 20);

        let snapshot = svc.on_task_end(TaskId::new(1));
        assert_eq!(snapshot.map(|s| (s.cpu_nanos, s.heap_bytes)), Some((150, 20)));
        assert_eq!(svc.registry().member_count(&gid("g1")), 0);
        assert!(svc.tracker().is_empty());
        assert_eq!(svc.registry().counters(&gid("g1")).completions(), 1);
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        let second = svc.on_task_start(TaskId::new(1), gid("g1"));
        assert!(matches!(second, Err(WlmError::DuplicateTask { .. })));
        assert_eq!(svc.tracker().len(), 1);
    }

    #[test]
    fn rejected_task_is_not_tracked() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 600_000_000, 0);

        let result = svc.on_task_start(TaskId::new(2), gid("g1"));
        assert!(matches!(
            result,
            Err(WlmError::AdmissionRejected {
                resource: ResourceType::Cpu,
                ..
            })
        ));
        assert!(!svc.tracker().contains(TaskId::new(2)));
        assert_eq!(svc.registry().member_count(&gid("g1")), 1);
        assert_eq!(svc.registry().counters(&gid("g1")).rejections(), 1);
    }

    #[test]
    fn unknown_group_runs_in_default_group() {
        let svc = service(config());
        let task = svc
            .on_task_start(TaskId::new(1), gid("nobody"))
            .ok()
            .unwrap_or_else(|| panic!("admitted"));
        assert!(task.group_id().is_default());
        assert_eq!(svc.registry().member_count(&WorkloadGroupId::default_group()), 1);
    }

    #[test]
    fn late_sample_is_ignored() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        let _ = svc.on_task_end(TaskId::new(1));
        svc.on_task_usage_sample(TaskId::new(1), 100, 100);
        assert_eq!(svc.tracker().group_usage(&gid("g1")).cpu_nanos, 0);
        assert!(svc.on_task_end(TaskId::new(1)).is_none());
    }

    #[test]
    fn failure_is_counted_separately() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        assert!(svc.on_task_failure(TaskId::new(1)).is_some());
        let counters = svc.registry().counters(&gid("g1"));
        assert_eq!(counters.failures(), 1);
        assert_eq!(counters.completions(), 0);
    }

    #[test]
    fn cancelled_task_end_is_not_a_completion() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 900_000_000, 0);

        let report = svc.run_cancellation_sweep();
        assert_eq!(report.cancelled, vec![TaskId::new(1)]);
        assert_eq!(svc.cancellation_handler().cancelled(), vec![TaskId::new(1)]);

        assert!(svc.on_task_end(TaskId::new(1)).is_some());
        let counters = svc.registry().counters(&gid("g1"));
        assert_eq!(counters.cancellations(), 1);
        assert_eq!(counters.completions(), 0);
    }

    #[test]
    fn delete_group_moves_running_tasks_to_default() {
        let svc = service(config());
        let task = svc
            .on_task_start(TaskId::new(1), gid("g1"))
            .ok()
            .unwrap_or_else(|| panic!("admitted"));
        svc.on_task_usage_sample(TaskId::new(1), 400, 40);

        assert_eq!(svc.delete_group(&gid("g1")).ok(), Some(1));
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.group_id(), &gid("g1"));

        let default = WorkloadGroupId::default_group();
        assert_eq!(svc.tracker().group_usage(&default).cpu_nanos, 400);
        assert_eq!(svc.registry().member_count(&default), 1);

        let snapshot = svc.on_task_end(TaskId::new(1));
        assert_eq!(snapshot.map(|s| s.cpu_nanos), Some(400));
        assert_eq!(svc.tracker().group_usage(&default).cpu_nanos, 0);
    }

    #[test]
    fn deleting_default_group_fails() {
        let svc = service(config());
        assert!(svc.delete_group(&WorkloadGroupId::default_group()).is_err());
    }

    #[test]
    fn steady_cpu_rate_is_never_rejected_or_cancelled() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));

        // 100ms of CPU every one-second window is a 10% rate, well under 0.5.
        for _ in 0..30 {
            svc.on_task_usage_sample(TaskId::new(1), 100_000_000, 0);
            assert_eq!(svc.roll_cpu_window(), 1);
        }

        let stats = svc.collect_local_stats(&StatsRequest::local());
        assert!((stats.groups[&gid("g1")].cpu_usage - 0.1).abs() < 1e-12);
        assert!(svc.on_task_start(TaskId::new(2), gid("g1")).is_ok());
        assert!(svc.run_cancellation_sweep().cancelled.is_empty());

        let lifetime = svc.on_task_end(TaskId::new(1)).map(|s| s.cpu_nanos);
        assert_eq!(lifetime, Some(3 * SECOND));
    }

    #[test]
    fn blank_group_setting_leaves_settings_and_registry_agreeing() {
        let svc = service(config());
        let result = svc.update_setting("wlm.workload_group. .cpu", "0.5");
        assert!(matches!(result, Err(WlmError::InvalidSetting { .. })));
        assert_eq!(svc.settings().get("wlm.workload_group. .cpu"), None);
        assert!(!svc.registry().contains(&gid(" ")));
    }

    #[test]
    fn configured_group_limits_are_visible_as_settings() {
        let svc = service(config());
        assert_eq!(
            svc.settings().get("wlm.workload_group.g1.cpu"),
            Some(SettingValue::Fraction(0.5))
        );

        let removed = svc.settings().remove("wlm.workload_group.g1.cpu");
        assert_eq!(removed.ok().flatten(), Some(SettingValue::Fraction(0.5)));
        assert_eq!(svc.registry().get_group(&gid("g1")).limits.cpu, None);
    }

    #[test]
    fn upserted_and_deleted_groups_follow_settings() {
        let svc = service(config());
        let batch = WorkloadGroup::new("batch")
            .with_cpu_limit(0.3)
            .with_mode(AdmissionControlMode::Enforced);
        assert!(svc.upsert_group(batch).is_ok());
        assert_eq!(
            svc.settings().get("wlm.workload_group.batch.cpu"),
            Some(SettingValue::Fraction(0.3))
        );
        assert_eq!(
            svc.settings().get("wlm.workload_group.batch.mode"),
            Some(SettingValue::Mode(AdmissionControlMode::Enforced))
        );

        assert!(svc.upsert_group(WorkloadGroup::new("")).is_err());
        assert_eq!(svc.settings().get("wlm.workload_group.batch.memory"), None);

        assert!(svc.delete_group(&gid("batch")).is_ok());
        assert_eq!(svc.settings().get("wlm.workload_group.batch.cpu"), None);
        assert!(!svc.registry().contains(&gid("batch")));
    }

    #[test]
    fn start_racing_with_delete_never_strands_a_task() {
        let default = WorkloadGroupId::default_group();
        for _ in 0..50 {
            let svc = Arc::new(service(config()));
            let starter = {
                let svc = Arc::clone(&svc);
                std::thread::spawn(move || {
                    for id in 0..20 {
                        let _ = svc.on_task_start(TaskId::new(id), gid("g1"));
                        svc.on_task_usage_sample(TaskId::new(id), 10, 0);
                    }
                })
            };
            assert!(svc.delete_group(&gid("g1")).is_ok());
            let _ = starter.join();

            assert_eq!(svc.registry().member_count(&default), 20);
            assert_eq!(svc.registry().member_count(&gid("g1")), 0);
            assert_eq!(svc.tracker().tasks_of(&default).len(), 20);
            assert!(svc.tracker().tasks_of(&gid("g1")).is_empty());
            assert_eq!(svc.tracker().group_usage(&default).cpu_nanos, 200);
            assert_eq!(svc.run_correction(), 0);
        }
    }

    #[test]
    fn group_limit_setting_reaches_admission() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("batch"));
        assert!(svc.update_setting("wlm.workload_group.batch.memory", "0.2").is_ok());
        assert!(svc.registry().contains(&gid("batch")));

        let _ = svc.on_task_start(TaskId::new(2), gid("batch"));
        svc.on_task_usage_sample(TaskId::new(2), 0, 500);
        let result = svc.on_task_start(TaskId::new(3), gid("batch"));
        assert!(matches!(result, Err(WlmError::AdmissionRejected { .. })));
    }

    #[test]
    fn mode_setting_disables_rejection() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), SECOND, 0);

        assert!(svc.on_task_start(TaskId::new(2), gid("g1")).is_err());
        assert!(svc.update_setting("wlm.mode", "DISABLED").is_ok());
        assert!(svc.on_task_start(TaskId::new(3), gid("g1")).is_ok());
    }

    #[test]
    fn disabled_config_uses_noop_components() {
        let svc = service(config().with_enabled(false));
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), SECOND, 0);

        assert!(svc.on_task_start(TaskId::new(2), gid("g1")).is_ok());
        let report = svc.run_cancellation_sweep();
        assert!(report.cancelled.is_empty());
        // Usage is still tracked for reporting.
        assert_eq!(svc.tracker().group_usage(&gid("g1")).cpu_nanos, SECOND);
    }

    #[test]
    fn local_stats_through_service() {
        let svc = service(config());
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 250_000_000, 0);

        let stats = svc.collect_local_stats(&StatsRequest::local());
        assert_eq!(stats.node_id, "local");
        let g1 = &stats.groups[&gid("g1")];
        assert!((g1.cpu_usage - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn aggregate_without_peers_reports_failures() {
        let svc = service(config());
        let cluster = svc
            .aggregate_stats(&StatsRequest::for_nodes(["local", "n2"]))
            .await;
        assert_eq!(cluster.nodes.len(), 1);
        assert_eq!(cluster.failures.len(), 1);
    }

    #[tokio::test]
    async fn background_sweep_cancels_over_limit_task() {
        let svc = service(config().with_cancellation_interval(Duration::from_millis(10)));
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 800_000_000, 0);

        let handle = svc.start();
        assert!(handle.is_running());

        let mut cancelled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !svc.cancellation_handler().cancelled().is_empty() {
                cancelled = true;
                break;
            }
        }
        handle.stop();
        assert!(cancelled);
        assert!(!handle.is_running());
        assert_eq!(svc.cancellation_handler().cancelled(), vec![TaskId::new(1)]);
    }

    #[tokio::test]
    async fn background_window_lets_idle_usage_expire() {
        let capacity = NodeCapacity::new(SECOND, 1000).with_cpu_window(Duration::from_millis(10));
        let svc = service(config().with_node_capacity(capacity));
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 800_000_000, 0);
        assert!(svc.on_task_start(TaskId::new(2), gid("g1")).is_err());

        let handle = svc.start();
        let mut expired = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if svc.tracker().group_usage(&gid("g1")).cpu_nanos == 0 {
                expired = true;
                break;
            }
        }
        drop(handle);
        assert!(expired);
        assert!(svc.on_task_start(TaskId::new(3), gid("g1")).is_ok());
    }

    #[tokio::test]
    async fn background_correction_runs() {
        let svc = service(config().with_correction_interval(Duration::from_millis(10)));
        let _ = svc.on_task_start(TaskId::new(1), gid("g1"));
        svc.on_task_usage_sample(TaskId::new(1), 100, 0);

        let handle = svc.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);
        assert_eq!(svc.run_correction(), 0);
    }
}
