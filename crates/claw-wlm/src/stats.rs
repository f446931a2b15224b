//! Per-node and cluster-wide workload statistics.
//!
//! [`StatsAggregator::collect_local`] reads the registry and tracker of this
//! node. [`StatsAggregator::aggregate`] fans a [`StatsRequest`] out to peer
//! nodes through a [`StatsTransport`], bounds every node by its own timeout
//! and reports slow or failing nodes as [`NodeFailure`] entries instead of
//! failing the whole request.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WlmError};
use crate::registry::WorkloadGroupRegistry;
use crate::settings::SettingsController;
use crate::tracker::ResourceUsageTracker;
use crate::types::{NodeCapacity, ResourceType, WorkloadGroup, WorkloadGroupId};

/// Usage and throttling of one resource in one group.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Usage as a fraction of node capacity.
    pub current_usage: f64,
    /// Configured limit, if any.
    pub limit: Option<f64>,
    /// Enforced rejections caused by this resource.
    pub rejections: u64,
    /// Cancellations caused by this resource.
    pub cancellations: u64,
}

impl ResourceStats {
    /// Returns true if usage is at or over the limit.
    #[must_use]
    pub fn is_breached(&self) -> bool {
        self.limit.is_some_and(|limit| self.current_usage >= limit)
    }
}

/// Statistics of one workload group on one node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupStats {
    /// CPU usage as a fraction of node capacity.
    pub cpu_usage: f64,
    /// Heap usage as a fraction of node capacity.
    pub memory_usage: f64,
    /// Enforced rejections.
    pub rejection_count: u64,
    /// Delivered cancellations.
    pub cancellation_count: u64,
    /// Monitor-only would-be rejections.
    pub would_rejections: u64,
    /// Completed tasks.
    pub completions: u64,
    /// Failed tasks.
    pub failures: u64,
    /// Tasks currently in the group.
    pub active_tasks: usize,
    /// Per-resource breakdown.
    pub resources: BTreeMap<ResourceType, ResourceStats>,
}

impl GroupStats {
    /// Returns true if any resource is at or over its limit.
    #[must_use]
    pub fn is_breached(&self) -> bool {
        self.resources.values().any(ResourceStats::is_breached)
    }
}

/// Statistics of one node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Node id.
    pub node_id: String,
    /// Per-group statistics.
    pub groups: BTreeMap<WorkloadGroupId, GroupStats>,
}

impl NodeStats {
    /// Creates empty stats for a node.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Adds a group's statistics.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<WorkloadGroupId>, stats: GroupStats) -> Self {
        self.groups.insert(group_id.into(), stats);
        self
    }

    /// Drops every group that is under all of its limits.
    pub fn retain_breached(&mut self) {
        self.groups.retain(|_, stats| stats.is_breached());
    }
}

/// A stats request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsRequest {
    /// Nodes to query. Empty means the local node only.
    pub node_ids: Vec<String>,
    /// Only report groups at or over a limit.
    pub breach_only: bool,
}

impl StatsRequest {
    /// Creates a request for the local node.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// Creates a request for the given nodes.
    #[must_use]
    pub fn for_nodes<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_ids: node_ids.into_iter().map(Into::into).collect(),
            breach_only: false,
        }
    }

    /// Restricts the response to breached groups.
    #[must_use]
    pub const fn with_breach_only(mut self, breach_only: bool) -> Self {
        self.breach_only = breach_only;
        self
    }
}

/// A node that did not answer a stats request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// Node id.
    pub node_id: String,
    /// Why the node did not answer.
    pub reason: String,
}

/// Combined statistics of the requested nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterStats {
    /// Nodes that answered, in request order.
    pub nodes: Vec<NodeStats>,
    /// Nodes that failed or timed out.
    pub failures: Vec<NodeFailure>,
}

impl ClusterStats {
    /// Returns the stats of a node, if it answered.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeStats> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Returns true if every requested node answered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Sums a group's rejections across all answering nodes.
    #[must_use]
    pub fn total_rejections(&self, group_id: &WorkloadGroupId) -> u64 {
        self.nodes
            .iter()
            .filter_map(|n| n.groups.get(group_id))
            .map(|g| g.rejection_count)
            .sum()
    }

    /// Sums a group's cancellations across all answering nodes.
    #[must_use]
    pub fn total_cancellations(&self, group_id: &WorkloadGroupId) -> u64 {
        self.nodes
            .iter()
            .filter_map(|n| n.groups.get(group_id))
            .map(|g| g.cancellation_count)
            .sum()
    }
}

/// Fetches stats from a peer node.
///
/// Implement this trait to plug in the cluster's node-to-node transport.
pub trait StatsTransport: Send + Sync {
    /// Requests the stats of `node_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be reached or answers with an
    /// error.
    fn fetch(
        &self,
        node_id: &str,
        request: &StatsRequest,
    ) -> impl Future<Output = Result<NodeStats>> + Send;
}

/// A transport with no peers: every remote node is unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyTransport;

impl StatsTransport for LocalOnlyTransport {
    async fn fetch(&self, node_id: &str, _request: &StatsRequest) -> Result<NodeStats> {
        Err(WlmError::NodeUnreachable {
            node_id: node_id.to_string(),
            reason: "no stats transport configured".into(),
        })
    }
}

/// Builds node and cluster statistics.
#[derive(Debug)]
pub struct StatsAggregator<T: StatsTransport> {
    local_node_id: String,
    settings: Arc<SettingsController>,
    registry: Arc<WorkloadGroupRegistry>,
    tracker: Arc<ResourceUsageTracker>,
    capacity: NodeCapacity,
    transport: T,
}

impl<T: StatsTransport> StatsAggregator<T> {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new(
        local_node_id: impl Into<String>,
        settings: Arc<SettingsController>,
        registry: Arc<WorkloadGroupRegistry>,
        tracker: Arc<ResourceUsageTracker>,
        capacity: NodeCapacity,
        transport: T,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            settings,
            registry,
            tracker,
            capacity,
            transport,
        }
    }

    /// Returns the id of the local node.
    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Reads the current statistics of this node.
    #[must_use]
    pub fn collect_local(&self, request: &StatsRequest) -> NodeStats {
        let mut stats = NodeStats::new(self.local_node_id.clone());
        for group in self.registry.groups() {
            let group_stats = self.group_stats(&group);
            if request.breach_only && !group_stats.is_breached() {
                continue;
            }
            stats.groups.insert(group.id, group_stats);
        }
        stats
    }

    fn group_stats(&self, group: &WorkloadGroup) -> GroupStats {
        let usage = self.tracker.group_usage(&group.id);
        let counters = self.registry.counters(&group.id);
        let snapshot = counters.snapshot();

        let resources: BTreeMap<_, _> = ResourceType::ALL
            .into_iter()
            .map(|resource| {
                let stats = ResourceStats {
                    current_usage: self.capacity.fraction(resource, usage.usage(resource)),
                    limit: group.limits.get(resource),
                    rejections: counters.rejections_for(resource),
                    cancellations: counters.cancellations_for(resource),
                };
                (resource, stats)
            })
            .collect();

        GroupStats {
            cpu_usage: resources
                .get(&ResourceType::Cpu)
                .map_or(0.0, |r| r.current_usage),
            memory_usage: resources
                .get(&ResourceType::Memory)
                .map_or(0.0, |r| r.current_usage),
            rejection_count: snapshot.rejections,
            cancellation_count: snapshot.cancellations,
            would_rejections: snapshot.would_rejections,
            completions: snapshot.completions,
            failures: snapshot.failures,
            active_tasks: self.registry.member_count(&group.id),
            resources,
        }
    }

    /// Gathers statistics from every requested node.
    ///
    /// The local node is answered in-process. Each remote node gets its own
    /// timeout, read from the settings at call time; nodes that fail or time
    /// out are listed in [`ClusterStats::failures`].
    pub async fn aggregate(&self, request: &StatsRequest) -> ClusterStats {
        let timeout = self.settings.stats_timeout();

        let mut seen = HashSet::new();
        let targets: Vec<&str> = if request.node_ids.is_empty() {
            vec![self.local_node_id.as_str()]
        } else {
            request
                .node_ids
                .iter()
                .map(String::as_str)
                .filter(|id| seen.insert(*id))
                .collect()
        };

        let fetches: Vec<_> = targets
            .iter()
            .map(|node_id| self.fetch_node(node_id, request, timeout))
            .collect();
        let results = join_all(fetches).await;

        let mut cluster = ClusterStats::default();
        for (node_id, result) in targets.iter().zip(results) {
            match result {
                Ok(mut stats) => {
                    if request.breach_only {
                        stats.retain_breached();
                    }
                    cluster.nodes.push(stats);
                }
                Err(reason) => {
                    warn!(node_id = %node_id, reason = %reason, "node stats unavailable");
                    cluster.failures.push(NodeFailure {
                        node_id: (*node_id).to_string(),
                        reason,
                    });
                }
            }
        }

        debug!(
            nodes = cluster.nodes.len(),
            failures = cluster.failures.len(),
            "stats aggregated"
        );
        cluster
    }

    async fn fetch_node(
        &self,
        node_id: &str,
        request: &StatsRequest,
        timeout: Duration,
    ) -> std::result::Result<NodeStats, String> {
        if node_id == self.local_node_id {
            return Ok(self.collect_local(request));
        }
        match tokio::time::timeout(timeout, self.transport.fetch(node_id, request)).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
        }
    }
}
