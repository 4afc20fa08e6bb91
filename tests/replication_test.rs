mod common;

use common::{SimCluster, DEFAULT};
use model::{AccountId, ChunkListKind, ChunkOwner, ChunkTreeRef, ErasureCodec, ReplicaIndex, Replication};
use replicator::{BatchRequest, BatchSubrequest, HealthSet, JobType, NodeAdminRequest};

#[test]
fn test_underreplicated_chunk_reaches_its_factor() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..4).map(|_| cluster.add_node()).collect();
    let chunk = cluster.create_regular_chunk(3, &nodes[..1]);

    cluster.automaton.refresh();
    assert!(cluster.health_sets(chunk).contains(&HealthSet::Underreplicated));

    cluster.converge(30);

    assert_eq!(cluster.holders(chunk).len(), 3);
    assert!(cluster.health_sets(chunk).is_empty());
    assert!(cluster
        .started_jobs
        .iter()
        .all(|job| job.job_type == JobType::Replicate && job.chunk_id == chunk));
}

#[test]
fn test_lost_node_replicas_are_restored_elsewhere() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..4).map(|_| cluster.add_node()).collect();
    let chunks: Vec<_> = (0..5)
        .map(|_| cluster.create_regular_chunk(2, &nodes[..2]))
        .collect();
    cluster.converge(30);

    cluster.kill_node(nodes[0]);
    cluster.converge(60);

    for chunk in chunks {
        let holders = cluster.holders(chunk);
        assert_eq!(holders.len(), 2, "chunk {} held by {:?}", chunk, holders);
        assert!(!holders.contains(&nodes[0]));
        assert!(cluster.health_sets(chunk).is_empty());
    }
}

#[test]
fn test_overreplicated_chunk_sheds_replicas() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..4).map(|_| cluster.add_node()).collect();
    let chunk = cluster.create_regular_chunk(2, &nodes);

    cluster.automaton.refresh();
    assert!(cluster.health_sets(chunk).contains(&HealthSet::Overreplicated));

    cluster.converge(30);

    assert_eq!(cluster.holders(chunk).len(), 2);
    assert!(cluster.started_jobs.iter().all(|job| job.job_type == JobType::Remove));
}

#[test]
fn test_erased_part_is_repaired() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..8).map(|_| cluster.add_node()).collect();
    let codec = ErasureCodec::ReedSolomon3_3;
    let holders: Vec<_> = (0..codec.total_part_count())
        .map(|index| (nodes[index], ReplicaIndex(index as u8)))
        .collect();
    let chunk = cluster.create_chunk(codec, 1, &holders);
    cluster.converge(30);
    assert!(cluster.health_sets(chunk).is_empty());

    cluster.kill_node(nodes[1]);
    cluster.automaton.refresh();
    assert!(cluster.health_sets(chunk).contains(&HealthSet::DataMissing));

    cluster.converge(60);

    assert!(cluster.health_sets(chunk).is_empty());
    assert!(cluster.started_jobs.iter().any(|job| job.job_type == JobType::Repair));
    for index in 0..codec.total_part_count() {
        let part = ReplicaIndex(index as u8);
        let copies = cluster
            .nodes
            .values()
            .filter(|node| node.alive && node.replicas.contains(&(chunk, part, DEFAULT)))
            .count();
        assert_eq!(copies, 1, "part {} has {} copies", index, copies);
    }
}

#[test]
fn test_decommissioned_node_is_drained() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..4).map(|_| cluster.add_node()).collect();
    let chunks: Vec<_> = (0..3)
        .map(|_| cluster.create_regular_chunk(2, &nodes[..2]))
        .collect();
    cluster.converge(30);

    cluster
        .automaton
        .node_admin(nodes[0], NodeAdminRequest::SetDecommissioned { decommissioned: true })
        .unwrap();
    cluster.converge(60);

    assert!(cluster.nodes[&nodes[0]].replicas.is_empty());
    for chunk in chunks {
        assert_eq!(cluster.holders(chunk).len(), 2);
        assert!(cluster.health_sets(chunk).is_empty());
    }
    assert_eq!(cluster.automaton.node_view(nodes[0]).unwrap().replica_count, 0);
}

#[test]
fn test_owner_replication_change_drives_replication() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..4).map(|_| cluster.add_node()).collect();
    let chunk = cluster.create_regular_chunk(2, &nodes[..2]);

    let lists = cluster
        .automaton
        .execute_batch(BatchRequest {
            subrequests: vec![BatchSubrequest::CreateChunkLists {
                kind: ChunkListKind::Static,
                count: 1,
            }],
        })
        .unwrap();
    let list = lists.subresponses[0].chunk_list_ids[0];

    let response = cluster
        .automaton
        .execute_batch(BatchRequest {
            subrequests: vec![
                BatchSubrequest::AttachChunkTrees {
                    parent: list,
                    children: vec![ChunkTreeRef::Chunk(chunk)],
                },
                BatchSubrequest::SetOwner {
                    chunk_list: list,
                    owner: ChunkOwner {
                        name: "//home/table".to_string(),
                        account: AccountId::new("sim"),
                        replication: Replication::new(true).with_policy(DEFAULT, 3),
                    },
                },
            ],
        })
        .unwrap();
    assert!(response.subresponses.iter().all(|r| r.ok), "{:?}", response);

    cluster.converge(60);

    assert_eq!(cluster.holders(chunk).len(), 3);
    let status = cluster.automaton.chunk_status(chunk).unwrap();
    assert!(status.health_sets.is_empty());
}

fn owner(name: &str, replication: Replication) -> ChunkOwner {
    ChunkOwner {
        name: name.to_string(),
        account: AccountId::new("sim"),
        replication,
    }
}

#[test]
fn test_ancestor_owners_move_replica_to_another_medium() {
    let (mut cluster, extra) = SimCluster::with_media(&["ssd"]);
    let ssd = extra[0];
    let nodes: Vec<_> = (0..6).map(|_| cluster.add_node()).collect();
    let chunk = cluster.create_regular_chunk(3, &nodes[..3]);

    let lists = cluster
        .automaton
        .execute_batch(BatchRequest {
            subrequests: vec![BatchSubrequest::CreateChunkLists {
                kind: ChunkListKind::Static,
                count: 2,
            }],
        })
        .unwrap();
    let (parent, grandparent) = (lists.subresponses[0].chunk_list_ids[0], lists.subresponses[0].chunk_list_ids[1]);
    let response = cluster
        .automaton
        .execute_batch(BatchRequest {
            subrequests: vec![
                BatchSubrequest::AttachChunkTrees {
                    parent,
                    children: vec![ChunkTreeRef::Chunk(chunk)],
                },
                BatchSubrequest::AttachChunkTrees {
                    parent: grandparent,
                    children: vec![ChunkTreeRef::ChunkList(parent)],
                },
                BatchSubrequest::SetOwner {
                    chunk_list: grandparent,
                    owner: owner("//home/table", Replication::new(true).with_policy(DEFAULT, 3)),
                },
            ],
        })
        .unwrap();
    assert!(response.subresponses.iter().all(|r| r.ok), "{:?}", response);
    cluster.converge(60);
    assert_eq!(cluster.holders_on(chunk, DEFAULT).len(), 3);
    assert!(cluster.holders_on(chunk, ssd).is_empty());

    let response = cluster
        .automaton
        .execute_batch(BatchRequest {
            subrequests: vec![
                BatchSubrequest::SetOwner {
                    chunk_list: parent,
                    owner: owner("//home/table/part", Replication::new(true).with_policy(DEFAULT, 2)),
                },
                BatchSubrequest::SetOwner {
                    chunk_list: grandparent,
                    owner: owner("//home/table", Replication::new(true).with_policy(ssd, 1)),
                },
            ],
        })
        .unwrap();
    assert!(response.subresponses.iter().all(|r| r.ok), "{:?}", response);
    cluster.converge(60);

    assert_eq!(cluster.holders_on(chunk, DEFAULT).len(), 2);
    assert_eq!(cluster.holders_on(chunk, ssd).len(), 1);
    assert!(cluster.health_sets(chunk).is_empty());
    assert!(cluster.started_jobs.iter().any(|job| job.job_type == JobType::Remove));
}

#[test]
fn test_snapshot_preserves_chunks() {
    let mut cluster = SimCluster::new();
    let nodes: Vec<_> = (0..3).map(|_| cluster.add_node()).collect();
    let chunk = cluster.create_regular_chunk(2, &nodes[..2]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cell.snapshot");
    let bytes = cluster.automaton.snapshot().unwrap();
    std::fs::write(&path, &bytes).unwrap();

    let restored = model::decode_snapshot(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(restored.chunk_count(), cluster.automaton.store().chunk_count());
    let restored_chunk = restored.chunk(chunk).unwrap();
    assert!(restored_chunk.confirmed);
}
