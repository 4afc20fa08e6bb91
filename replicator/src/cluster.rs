use model::{ChunkStore, NodeDirectory};
use placement::{ChunkPlacement, ConsistentReplicaPlacement, PlacementConfig};

/// Everything the replicator reads and mutates, passed explicitly into each
/// step instead of being reached through globals.
#[derive(Debug)]
pub struct Cluster {
    pub store: ChunkStore,
    pub nodes: NodeDirectory,
    pub placement: ChunkPlacement,
    pub consistent_placement: ConsistentReplicaPlacement,
}

impl Cluster {
    pub fn new(store: ChunkStore, config: PlacementConfig) -> Self {
        let consistent_placement = ConsistentReplicaPlacement::new(config.consistent_placement_token_count);
        Self {
            store,
            nodes: NodeDirectory::new(),
            placement: ChunkPlacement::new(config),
            consistent_placement,
        }
    }

    /// Re-keys the node in the placement indexes after any change to its
    /// state, statistics or flags.
    pub fn update_node_placement(&mut self, node: model::NodeId) {
        if let Some(node) = self.nodes.node(node) {
            self.placement.on_node_updated(node, self.store.media());
        }
    }
}
