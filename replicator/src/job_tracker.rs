use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use model::{DataCenterId, JobId, NodeDirectory, NodeId};

use crate::job::{Job, JobError, JobErrorCode, JobState, JobType};
use crate::messages::JobStatusReport;
use crate::{Cluster, InterDcLimits, ReplicatorConfig};

type Edge = (Option<DataCenterId>, Option<DataCenterId>);

/// What the master tells a node after reconciling its job report.
#[derive(Debug, Default, Clone)]
pub struct JobReconciliation {
    pub to_abort: Vec<JobId>,
    pub to_remove: Vec<JobId>,
    /// Jobs that left the registry; their chunks need a refresh.
    pub finished: Vec<Job>,
}

/// Registry of running jobs plus per data center edge traffic accounting.
#[derive(Debug)]
pub struct JobTracker {
    jobs: BTreeMap<JobId, Job>,
    job_timeout: chrono::Duration,
    limits: InterDcLimits,
    consumption: BTreeMap<Edge, i64>,
    /// Edges each job charged at registration; released as is.
    charged_edges: BTreeMap<JobId, Vec<Edge>>,
    saturated: BTreeSet<Edge>,
}

impl JobTracker {
    pub fn new(config: &ReplicatorConfig) -> Self {
        Self {
            jobs: BTreeMap::new(),
            job_timeout: config.job_timeout(),
            limits: config.inter_dc_limits.clone(),
            consumption: BTreeMap::new(),
            charged_edges: BTreeMap::new(),
            saturated: BTreeSet::new(),
        }
    }

    pub fn set_config(&mut self, config: &ReplicatorConfig, nodes: &NodeDirectory) {
        self.job_timeout = config.job_timeout();
        self.limits = config.inter_dc_limits.clone();
        let edges: Vec<Edge> = self.consumption.keys().copied().collect();
        self.saturated.clear();
        for edge in edges {
            self.update_saturation(edge, nodes);
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_of(&self, node: NodeId) -> Vec<&Job> {
        self.jobs.values().filter(|job| job.node == node).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn capacity(&self, edge: Edge, nodes: &NodeDirectory) -> i64 {
        if edge.0 == edge.1 {
            return i64::MAX;
        }
        let name = |dc: Option<DataCenterId>| dc.and_then(|dc| nodes.data_center(dc)).map(|dc| dc.name.clone());
        let (src, dst) = (name(edge.0), name(edge.1));
        self.limits
            .capacities
            .iter()
            .find(|capacity| capacity.src == src && capacity.dst == dst)
            .map(|capacity| capacity.capacity)
            .unwrap_or(self.limits.default_capacity)
    }

    fn update_saturation(&mut self, edge: Edge, nodes: &NodeDirectory) {
        let used = self.consumption.get(&edge).copied().unwrap_or(0);
        if used >= self.capacity(edge, nodes) {
            self.saturated.insert(edge);
        } else {
            self.saturated.remove(&edge);
        }
    }

    pub fn is_edge_unsaturated(&self, src: Option<DataCenterId>, dst: Option<DataCenterId>) -> bool {
        src == dst || !self.saturated.contains(&(src, dst))
    }

    /// Whether any destination, including the source's own data center, can
    /// still take traffic from `src`.
    pub fn has_unsaturated_edge_from(&self, src: Option<DataCenterId>, nodes: &NodeDirectory) -> bool {
        std::iter::once(None)
            .chain(nodes.data_centers().iter().map(|dc| Some(dc.id)))
            .any(|dst| self.is_edge_unsaturated(src, dst))
    }

    /// Nodes whose data center cannot currently receive traffic from `src`.
    pub fn saturated_destinations(&self, src: Option<DataCenterId>, nodes: &NodeDirectory) -> Vec<NodeId> {
        if self.saturated.is_empty() {
            return Vec::new();
        }
        nodes
            .nodes()
            .filter(|node| !self.is_edge_unsaturated(src, nodes.data_center_of(node.id)))
            .map(|node| node.id)
            .collect()
    }

    fn job_edges(job: &Job, nodes: &NodeDirectory) -> Vec<Edge> {
        if !job.job_type.moves_data() {
            return Vec::new();
        }
        let src = nodes.data_center_of(job.node);
        job.targets
            .iter()
            .map(|target| (src, nodes.data_center_of(target.node)))
            .filter(|(src, dst)| src != dst)
            .collect()
    }

    pub fn register_job(&mut self, job: Job, cluster: &mut Cluster) {
        if let Some(node) = cluster.nodes.node_mut(job.node) {
            node.jobs.insert(job.id);
            node.resource_usage += job.resource_usage;
        }
        if let Some(chunk) = cluster.store.chunk_mut(job.chunk.chunk) {
            chunk.job = Some(job.id);
        }
        let edges = Self::job_edges(&job, &cluster.nodes);
        for edge in &edges {
            *self.consumption.entry(*edge).or_insert(0) += 1;
            self.update_saturation(*edge, &cluster.nodes);
        }
        if !edges.is_empty() {
            self.charged_edges.insert(job.id, edges);
        }
        tracing::debug!(
            "Job registered: {} ({:?}) on node {} for chunk {}",
            job.id,
            job.job_type,
            job.node,
            job.chunk.chunk
        );
        self.jobs.insert(job.id, job);
    }

    pub fn unregister_job(&mut self, id: JobId, cluster: &mut Cluster) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        if let Some(node) = cluster.nodes.node_mut(job.node) {
            node.jobs.remove(&id);
            node.resource_usage -= job.resource_usage;
        }
        if let Some(chunk) = cluster.store.chunk_mut(job.chunk.chunk) {
            if chunk.job == Some(id) {
                chunk.job = None;
            }
        }
        for edge in self.charged_edges.remove(&id).unwrap_or_default() {
            if let Some(used) = self.consumption.get_mut(&edge) {
                *used -= 1;
                if *used <= 0 {
                    self.consumption.remove(&edge);
                }
            }
            self.update_saturation(edge, &cluster.nodes);
        }
        Some(job)
    }

    /// Reconciles the node's report with the registry: unknown jobs are
    /// aborted or removed, finished ones unregistered, overdue ones aborted.
    pub fn process_jobs(
        &mut self,
        node: NodeId,
        reports: &[JobStatusReport],
        now: DateTime<Utc>,
        cluster: &mut Cluster,
    ) -> JobReconciliation {
        let mut result = JobReconciliation::default();
        let mut seen = BTreeSet::new();

        for report in reports {
            seen.insert(report.job_id);
            let known = self.jobs.get(&report.job_id).map(|job| job.node == node).unwrap_or(false);
            if !known {
                if report.state.is_terminal() {
                    result.to_remove.push(report.job_id);
                } else {
                    tracing::warn!("Unknown job {} reported by node {}, aborting", report.job_id, node);
                    result.to_abort.push(report.job_id);
                }
                continue;
            }

            if report.state.is_terminal() {
                result.to_remove.push(report.job_id);
                if let Some(mut job) = self.unregister_job(report.job_id, cluster) {
                    job.state = report.state;
                    job.error = report.error.clone();
                    match job.state {
                        JobState::Completed => tracing::debug!("Job completed: {} on node {}", job.id, node),
                        _ => tracing::warn!(
                            "Job {} ({:?}) on node {} finished in state {:?}: {:?}",
                            job.id,
                            job.job_type,
                            node,
                            job.state,
                            job.error
                        ),
                    }
                    self.retry_failed_removal(&job, cluster);
                    result.finished.push(job);
                }
                continue;
            }

            if let Some(job) = self.jobs.get_mut(&report.job_id) {
                job.state = report.state;
                if now - job.start_time > self.job_timeout {
                    tracing::warn!("Job {} on node {} timed out", job.id, node);
                    result.to_abort.push(job.id);
                }
            }
        }

        let missing: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.node == node && !seen.contains(&job.id) && now - job.start_time > self.job_timeout)
            .map(|job| job.id)
            .collect();
        for id in missing {
            if let Some(mut job) = self.unregister_job(id, cluster) {
                tracing::warn!("Job {} vanished from node {} reports, dropping", id, node);
                job.state = JobState::Aborted;
                job.error = Some(JobError::new(JobErrorCode::Timeout, "job not reported in time"));
                self.retry_failed_removal(&job, cluster);
                result.finished.push(job);
            }
        }

        result
    }

    fn retry_failed_removal(&self, job: &Job, cluster: &mut Cluster) {
        if job.job_type != JobType::Remove || job.state == JobState::Completed {
            return;
        }
        if job.error.as_ref().map(|error| error.code == JobErrorCode::NoSuchChunk).unwrap_or(false) {
            return;
        }
        if let Some(node) = cluster.nodes.node_mut(job.node) {
            if node.reported_heartbeat {
                node.add_to_removal_queue(job.chunk.part(), job.chunk.medium);
            }
        }
    }

    /// Drops every job of the node, e.g. when it goes offline.
    pub fn abort_node_jobs(&mut self, node: NodeId, cluster: &mut Cluster) -> Vec<Job> {
        let ids: Vec<JobId> = self.jobs.values().filter(|job| job.node == node).map(|job| job.id).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister_job(id, cluster))
            .map(|mut job| {
                job.state = JobState::Aborted;
                job
            })
            .collect()
    }

    pub fn clear(&mut self, cluster: &mut Cluster) {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for id in ids {
            self.unregister_job(id, cluster);
        }
        self.consumption.clear();
        self.charged_edges.clear();
        self.saturated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterDcEdgeCapacity;
    use model::{ChunkPartLocation, ChunkReplica, ChunkStore, CellTag, MediumIndex, ReplicaIndex};
    use placement::PlacementConfig;

    fn cluster() -> (Cluster, NodeId, NodeId) {
        let mut cluster = Cluster::new(ChunkStore::new(CellTag(1)), PlacementConfig::default());
        let a = cluster.nodes.register_node("a:1");
        let b = cluster.nodes.register_node("b:1");
        let east = cluster.nodes.get_or_create_rack("r1", Some("east"));
        let west = cluster.nodes.get_or_create_rack("r2", Some("west"));
        cluster.nodes.set_node_rack(a, Some(east)).unwrap();
        cluster.nodes.set_node_rack(b, Some(west)).unwrap();
        cluster.nodes.node_mut(a).unwrap().reported_heartbeat = true;
        (cluster, a, b)
    }

    fn location() -> ChunkPartLocation {
        ChunkPartLocation {
            chunk: model::ChunkId::new(),
            replica_index: ReplicaIndex::GENERIC,
            medium: MediumIndex(0),
        }
    }

    fn report(job: JobId, state: JobState, error: Option<JobError>) -> JobStatusReport {
        JobStatusReport {
            job_id: job,
            state,
            error,
        }
    }

    #[test]
    fn test_register_and_complete_job() {
        let (mut cluster, a, b) = cluster();
        let mut tracker = JobTracker::new(&ReplicatorConfig::default());
        let now = Utc::now();
        let job = Job::replicate(a, location(), vec![ChunkReplica::generic(b, MediumIndex(0))], 10, now);
        let id = job.id;
        tracker.register_job(job, &mut cluster);
        assert_eq!(cluster.nodes.node(a).unwrap().resource_usage.replication_slots, 1);

        let result = tracker.process_jobs(a, &[report(id, JobState::Completed, None)], now, &mut cluster);
        assert_eq!(result.to_remove, vec![id]);
        assert_eq!(result.finished.len(), 1);
        assert!(tracker.is_empty());
        assert_eq!(cluster.nodes.node(a).unwrap().resource_usage, model::NodeResources::default());
    }

    #[test]
    fn test_unknown_jobs_are_aborted_or_removed() {
        let (mut cluster, a, _) = cluster();
        let mut tracker = JobTracker::new(&ReplicatorConfig::default());
        let (running, done) = (JobId::new(), JobId::new());
        let result = tracker.process_jobs(
            a,
            &[report(running, JobState::Running, None), report(done, JobState::Failed, None)],
            Utc::now(),
            &mut cluster,
        );
        assert_eq!(result.to_abort, vec![running]);
        assert_eq!(result.to_remove, vec![done]);
    }

    #[test]
    fn test_overdue_job_is_aborted() {
        let (mut cluster, a, _) = cluster();
        let config = ReplicatorConfig::default();
        let mut tracker = JobTracker::new(&config);
        let start = Utc::now();
        let job = Job::remove(a, location(), start);
        let id = job.id;
        tracker.register_job(job, &mut cluster);

        let later = start + config.job_timeout() + chrono::Duration::seconds(1);
        let result = tracker.process_jobs(a, &[report(id, JobState::Running, None)], later, &mut cluster);
        assert_eq!(result.to_abort, vec![id]);

        // Not reported at all: dropped from the registry.
        let result = tracker.process_jobs(a, &[], later, &mut cluster);
        assert_eq!(result.finished.len(), 1);
        assert!(tracker.job(id).is_none());
    }

    #[test]
    fn test_vanished_removal_is_requeued() {
        let (mut cluster, a, _) = cluster();
        let config = ReplicatorConfig::default();
        let mut tracker = JobTracker::new(&config);
        let start = Utc::now();
        let loc = location();
        let job = Job::remove(a, loc, start);
        let id = job.id;
        tracker.register_job(job, &mut cluster);

        let later = start + config.job_timeout() + chrono::Duration::seconds(1);
        let result = tracker.process_jobs(a, &[], later, &mut cluster);
        assert_eq!(result.finished.len(), 1);
        assert_eq!(result.finished[0].state, JobState::Aborted);
        assert!(tracker.job(id).is_none());
        assert!(cluster.nodes.node(a).unwrap().removal_queue.contains_key(&loc.part()));
    }

    #[test]
    fn test_failed_removal_is_requeued() {
        let (mut cluster, a, _) = cluster();
        let mut tracker = JobTracker::new(&ReplicatorConfig::default());
        let now = Utc::now();
        let (first, second) = (location(), location());

        for (loc, code) in [(first, JobErrorCode::Other), (second, JobErrorCode::NoSuchChunk)] {
            let job = Job::remove(a, loc, now);
            let id = job.id;
            tracker.register_job(job, &mut cluster);
            let error = Some(JobError::new(code, "boom"));
            tracker.process_jobs(a, &[report(id, JobState::Failed, error)], now, &mut cluster);
        }

        let node = cluster.nodes.node(a).unwrap();
        assert!(node.removal_queue.contains_key(&first.part()));
        assert!(!node.removal_queue.contains_key(&second.part()));
    }

    #[test]
    fn test_inter_dc_edge_saturation() {
        let (mut cluster, a, b) = cluster();
        let mut config = ReplicatorConfig::default();
        config.inter_dc_limits.capacities.push(InterDcEdgeCapacity {
            src: Some("east".to_string()),
            dst: Some("west".to_string()),
            capacity: 1,
        });
        let mut tracker = JobTracker::new(&config);
        let east = cluster.nodes.data_center_of(a);
        let west = cluster.nodes.data_center_of(b);
        assert!(tracker.is_edge_unsaturated(east, west));

        let job = Job::replicate(a, location(), vec![ChunkReplica::generic(b, MediumIndex(0))], 10, Utc::now());
        let id = job.id;
        tracker.register_job(job, &mut cluster);
        assert!(!tracker.is_edge_unsaturated(east, west));
        assert!(tracker.is_edge_unsaturated(east, east));
        assert!(tracker.has_unsaturated_edge_from(east, &cluster.nodes));
        assert_eq!(tracker.saturated_destinations(east, &cluster.nodes), vec![b]);

        tracker.unregister_job(id, &mut cluster);
        assert!(tracker.is_edge_unsaturated(east, west));
    }

    fn east_west_tracker() -> JobTracker {
        let mut config = ReplicatorConfig::default();
        config.inter_dc_limits.capacities.push(InterDcEdgeCapacity {
            src: Some("east".to_string()),
            dst: Some("west".to_string()),
            capacity: 1,
        });
        JobTracker::new(&config)
    }

    #[test]
    fn test_edge_released_after_target_removed() {
        let (mut cluster, a, b) = cluster();
        let mut tracker = east_west_tracker();
        let east = cluster.nodes.data_center_of(a);
        let west = cluster.nodes.data_center_of(b);

        let job = Job::replicate(a, location(), vec![ChunkReplica::generic(b, MediumIndex(0))], 10, Utc::now());
        let id = job.id;
        tracker.register_job(job, &mut cluster);
        assert!(!tracker.is_edge_unsaturated(east, west));

        cluster.nodes.remove_node(b);
        tracker.unregister_job(id, &mut cluster);
        assert!(tracker.is_edge_unsaturated(east, west));
    }

    #[test]
    fn test_edge_released_after_target_moves_data_center() {
        let (mut cluster, a, b) = cluster();
        let mut tracker = east_west_tracker();
        let east = cluster.nodes.data_center_of(a);
        let west = cluster.nodes.data_center_of(b);

        let job = Job::replicate(a, location(), vec![ChunkReplica::generic(b, MediumIndex(0))], 10, Utc::now());
        let id = job.id;
        tracker.register_job(job, &mut cluster);

        let north = cluster.nodes.get_or_create_rack("r3", Some("north"));
        cluster.nodes.set_node_rack(b, Some(north)).unwrap();
        tracker.unregister_job(id, &mut cluster);
        assert!(tracker.is_edge_unsaturated(east, west));
        assert!(tracker.saturated_destinations(east, &cluster.nodes).is_empty());
    }
}
