use chrono::{DateTime, Utc};
use model::{ChunkPartLocation, ChunkReplica, JobId, NodeId, NodeResources, ReplicaIndex};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Replicate,
    Remove,
    Repair,
    Seal,
    Balance,
}

impl JobType {
    /// Jobs that ship data to other nodes and consume inter data center
    /// bandwidth.
    pub fn moves_data(self) -> bool {
        matches!(self, JobType::Replicate | JobType::Repair | JobType::Balance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    /// The node no longer has the chunk the job refers to.
    NoSuchChunk,
    Timeout,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A unit of remedial work executed by a storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub node: NodeId,
    /// The part the job reads, removes or seals; for repair, the medium
    /// being repaired.
    pub chunk: ChunkPartLocation,
    /// Where new replicas are written.
    pub targets: Vec<ChunkReplica>,
    /// Parts a repair job rebuilds.
    pub erased_parts: Vec<ReplicaIndex>,
    pub row_count: Option<i64>,
    /// Repair of parts that still exist on decommissioned nodes.
    pub decommission: bool,
    pub data_size: i64,
    pub resource_usage: NodeResources,
    pub state: JobState,
    pub start_time: DateTime<Utc>,
    pub error: Option<JobError>,
}

impl Job {
    fn new(job_type: JobType, node: NodeId, chunk: ChunkPartLocation, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            node,
            chunk,
            targets: Vec::new(),
            erased_parts: Vec::new(),
            row_count: None,
            decommission: false,
            data_size: 0,
            resource_usage: NodeResources::default(),
            state: JobState::Waiting,
            start_time: now,
            error: None,
        }
    }

    pub fn replicate(
        node: NodeId,
        source: ChunkPartLocation,
        targets: Vec<ChunkReplica>,
        data_size: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::new(JobType::Replicate, node, source, now);
        job.targets = targets;
        job.data_size = data_size;
        job.resource_usage.replication_slots = 1;
        job.resource_usage.replication_data_size = data_size;
        job
    }

    pub fn balance(node: NodeId, source: ChunkPartLocation, target: ChunkReplica, data_size: i64, now: DateTime<Utc>) -> Self {
        let mut job = Self::replicate(node, source, vec![target], data_size, now);
        job.job_type = JobType::Balance;
        job
    }

    pub fn remove(node: NodeId, location: ChunkPartLocation, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(JobType::Remove, node, location, now);
        job.resource_usage.removal_slots = 1;
        job
    }

    pub fn repair(
        node: NodeId,
        location: ChunkPartLocation,
        targets: Vec<ChunkReplica>,
        data_size: i64,
        decommission: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::new(JobType::Repair, node, location, now);
        job.erased_parts = targets.iter().map(|target| target.replica_index).collect();
        job.targets = targets;
        job.data_size = data_size;
        job.decommission = decommission;
        job.resource_usage.repair_slots = 1;
        job.resource_usage.repair_data_size = data_size;
        job
    }

    pub fn seal(node: NodeId, location: ChunkPartLocation, row_count: i64, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(JobType::Seal, node, location, now);
        job.row_count = Some(row_count);
        job.resource_usage.seal_slots = 1;
        job
    }

    /// Weight charged to the repair balancer for this job.
    pub fn repair_cost(&self) -> f64 {
        self.data_size.max(1) as f64 * self.targets.len().max(1) as f64
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{ChunkId, MediumIndex};

    fn location() -> ChunkPartLocation {
        ChunkPartLocation {
            chunk: ChunkId::new(),
            replica_index: ReplicaIndex::GENERIC,
            medium: MediumIndex(0),
        }
    }

    #[test]
    fn test_job_resource_usage() {
        let now = Utc::now();
        let target = ChunkReplica::generic(NodeId(2), MediumIndex(0));

        let replicate = Job::replicate(NodeId(1), location(), vec![target], 4096, now);
        assert_eq!(replicate.resource_usage.replication_slots, 1);
        assert_eq!(replicate.resource_usage.replication_data_size, 4096);
        assert!(replicate.job_type.moves_data());

        let remove = Job::remove(NodeId(1), location(), now);
        assert_eq!(remove.resource_usage.removal_slots, 1);
        assert!(!remove.job_type.moves_data());

        let repair = Job::repair(NodeId(1), location(), vec![target, target], 100, false, now);
        assert_eq!(repair.resource_usage.repair_slots, 1);
        assert_eq!(repair.repair_cost(), 200.0);
        assert_eq!(repair.state, JobState::Waiting);
    }
}
