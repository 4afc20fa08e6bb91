use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::chunk_tree::{add_edge, remove_edge};
use crate::{
    AccountId, CellTag, Chunk, ChunkId, ChunkInfo, ChunkKind, ChunkList, ChunkListId,
    ChunkListKind, ChunkOwner, ChunkTreeRef, ChunkTreeStatistics, ChunkView, ChunkViewId,
    DynamicStore, DynamicStoreId, ErasureCodec, Medium, MediumConfig, MediumIndex, ModelError,
    Replication, Requisition, RequisitionIndex, RequisitionRegistry, Result, TransactionId,
    MAX_MEDIUM_COUNT, MAX_REPLICATION_FACTOR,
};

pub const DEFAULT_MEDIUM_NAME: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChunkSpec {
    pub id: ChunkId,
    pub kind: ChunkKind,
    #[serde(default)]
    pub erasure_codec: ErasureCodec,
    pub account: AccountId,
    pub replication: Replication,
    #[serde(default)]
    pub transaction: Option<TransactionId>,
    #[serde(default)]
    pub read_quorum: u8,
    #[serde(default)]
    pub write_quorum: u8,
    #[serde(default)]
    pub consistent_placement_hash: Option<u64>,
    #[serde(default)]
    pub endorsement_required: bool,
}

/// Arena of every persisted chunk tree entity, the media table and the
/// requisition registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStore {
    cell_tag: CellTag,
    chunks: BTreeMap<ChunkId, Chunk>,
    chunk_lists: BTreeMap<ChunkListId, ChunkList>,
    chunk_views: BTreeMap<ChunkViewId, ChunkView>,
    dynamic_stores: BTreeMap<DynamicStoreId, DynamicStore>,
    media: Vec<Medium>,
    requisitions: RequisitionRegistry,
    pending_requisition_traversals: BTreeSet<ChunkListId>,
}

impl ChunkStore {
    pub fn new(cell_tag: CellTag) -> Self {
        let default_medium = Medium {
            index: MediumIndex(0),
            name: DEFAULT_MEDIUM_NAME.to_string(),
            cache: false,
            transient: false,
            priority: 0,
            max_replication_factor: MAX_REPLICATION_FACTOR,
            disk_families: Vec::new(),
        };

        Self {
            cell_tag,
            chunks: BTreeMap::new(),
            chunk_lists: BTreeMap::new(),
            chunk_views: BTreeMap::new(),
            dynamic_stores: BTreeMap::new(),
            media: vec![default_medium],
            requisitions: RequisitionRegistry::new(),
            pending_requisition_traversals: BTreeSet::new(),
        }
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub(crate) fn rebuild_after_load(&mut self) {
        self.requisitions.rebuild_index();
    }

    // Media

    pub fn create_medium(&mut self, name: &str, config: MediumConfig) -> Result<MediumIndex> {
        if self.media.iter().any(|medium| medium.name == name) {
            return Err(ModelError::AlreadyExists(format!("medium {}", name)));
        }
        if self.media.len() >= MAX_MEDIUM_COUNT {
            return Err(ModelError::TooManyMedia(MAX_MEDIUM_COUNT));
        }
        let index = MediumIndex(self.media.len() as u8);
        let medium = Medium::new(index, name, config)?;
        tracing::info!("Medium created: {} (Index: {})", name, index);
        self.media.push(medium);
        Ok(index)
    }

    pub fn medium(&self, index: MediumIndex) -> Option<&Medium> {
        self.media.get(index.as_usize())
    }

    pub fn medium_by_name(&self, name: &str) -> Result<&Medium> {
        self.media
            .iter()
            .find(|medium| medium.name == name)
            .ok_or_else(|| ModelError::NoSuchMedium(name.to_string()))
    }

    pub fn media(&self) -> &[Medium] {
        &self.media
    }

    // Chunks

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(&id)
    }

    pub fn get_chunk(&self, id: ChunkId) -> Result<&Chunk> {
        self.chunks.get(&id).ok_or(ModelError::NoSuchChunk(id))
    }

    pub fn get_chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        self.chunks.get_mut(&id).ok_or(ModelError::NoSuchChunk(id))
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_list(&self, id: ChunkListId) -> Option<&ChunkList> {
        self.chunk_lists.get(&id)
    }

    pub fn chunk_view(&self, id: ChunkViewId) -> Option<&ChunkView> {
        self.chunk_views.get(&id)
    }

    pub fn dynamic_store(&self, id: DynamicStoreId) -> Option<&DynamicStore> {
        self.dynamic_stores.get(&id)
    }

    pub fn requisitions(&self) -> &RequisitionRegistry {
        &self.requisitions
    }

    pub fn requisitions_mut(&mut self) -> &mut RequisitionRegistry {
        &mut self.requisitions
    }

    pub fn create_chunk(&mut self, spec: CreateChunkSpec) -> Result<ChunkId> {
        if self.chunks.contains_key(&spec.id) {
            return Err(ModelError::AlreadyExists(format!("chunk {}", spec.id)));
        }
        self.validate_replication(&spec.replication)?;
        if spec.kind == ChunkKind::Journal && !spec.erasure_codec.is_erasure() {
            let replication_factor = spec
                .replication
                .iter()
                .map(|(_, policy)| policy.replication_factor)
                .max()
                .unwrap_or(0);
            validate_journal_quorums(spec.read_quorum, spec.write_quorum, replication_factor)?;
        }

        let mut chunk = Chunk::new(spec.id, spec.kind, spec.erasure_codec, self.cell_tag);
        chunk.read_quorum = spec.read_quorum;
        chunk.write_quorum = spec.write_quorum;
        chunk.consistent_placement_hash = spec.consistent_placement_hash;
        chunk.endorsement_required = spec.endorsement_required;
        chunk.staging_transaction = spec.transaction;
        chunk.staging_account = Some(spec.account.clone());

        let requisition = Requisition::from_replication(&spec.account, &spec.replication, false);
        let index = self.requisitions.get_or_create(&requisition);
        self.requisitions.ref_index(index);
        chunk.local_requisition = index;

        tracing::debug!("Chunk created: {} ({:?}, {:?})", spec.id, spec.kind, spec.erasure_codec);
        self.chunks.insert(spec.id, chunk);
        Ok(spec.id)
    }

    fn validate_replication(&self, replication: &Replication) -> Result<()> {
        if replication.is_empty() {
            return Err(ModelError::InvalidReplicationFactor(
                "at least one medium must be requested".to_string(),
            ));
        }
        for (medium, policy) in replication.iter() {
            if self.medium(medium).is_none() {
                return Err(ModelError::NoSuchMedium(medium.to_string()));
            }
            if policy.replication_factor > MAX_REPLICATION_FACTOR {
                return Err(ModelError::InvalidReplicationFactor(format!(
                    "replication factor {} on medium {} exceeds {}",
                    policy.replication_factor, medium, MAX_REPLICATION_FACTOR
                )));
            }
        }
        Ok(())
    }

    /// Returns false if the chunk was already confirmed.
    pub fn confirm_chunk(&mut self, id: ChunkId, info: ChunkInfo) -> Result<bool> {
        let chunk = self.get_chunk_mut(id)?;
        if chunk.confirmed {
            return Ok(false);
        }
        let old = chunk.statistics();
        chunk.confirmed = true;
        chunk.info = info;
        if chunk.is_blob() {
            chunk.disk_size_final = true;
        }
        let new = chunk.statistics();
        self.propagate_chunk_statistics(id, old, new);
        Ok(true)
    }

    /// Returns false if the chunk was already sealed.
    pub fn seal_chunk(&mut self, id: ChunkId, row_count: i64) -> Result<bool> {
        let chunk = self.get_chunk_mut(id)?;
        if !chunk.is_journal() {
            return Err(ModelError::NotJournalChunk(id));
        }
        if !chunk.confirmed {
            return Err(ModelError::ChunkNotConfirmed(id));
        }
        if chunk.sealed {
            return Ok(false);
        }
        let old = chunk.statistics();
        chunk.sealed = true;
        chunk.sealable = false;
        chunk.disk_size_final = true;
        chunk.info.row_count = row_count;
        let new = chunk.statistics();
        self.propagate_chunk_statistics(id, old, new);
        tracing::debug!("Chunk sealed: {} (RowCount: {})", id, row_count);
        Ok(true)
    }

    pub fn create_chunk_list(&mut self, id: ChunkListId, kind: ChunkListKind) -> Result<()> {
        if self.chunk_lists.contains_key(&id) {
            return Err(ModelError::AlreadyExists(format!("chunk list {}", id)));
        }
        self.chunk_lists.insert(id, ChunkList::new(id, kind));
        Ok(())
    }

    pub fn create_chunk_view(
        &mut self,
        id: ChunkViewId,
        chunk: ChunkId,
        lower_row: Option<i64>,
        upper_row: Option<i64>,
    ) -> Result<()> {
        if self.chunk_views.contains_key(&id) {
            return Err(ModelError::AlreadyExists(format!("chunk view {}", id)));
        }
        self.get_chunk_mut(chunk)?.add_parent(ChunkTreeRef::ChunkView(id));
        self.chunk_views.insert(
            id,
            ChunkView {
                id,
                chunk,
                lower_row,
                upper_row,
                parents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn create_dynamic_store(&mut self, id: DynamicStoreId) -> Result<()> {
        if self.dynamic_stores.contains_key(&id) {
            return Err(ModelError::AlreadyExists(format!("dynamic store {}", id)));
        }
        self.dynamic_stores.insert(
            id,
            DynamicStore {
                id,
                parents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn tree_statistics(&self, node: ChunkTreeRef) -> ChunkTreeStatistics {
        match node {
            ChunkTreeRef::Chunk(id) => self.chunks.get(&id).map(Chunk::statistics).unwrap_or_default(),
            ChunkTreeRef::ChunkList(id) => self
                .chunk_lists
                .get(&id)
                .map(|list| list.statistics)
                .unwrap_or_default(),
            ChunkTreeRef::ChunkView(id) => match self.chunk_views.get(&id) {
                Some(view) => {
                    let chunk = self.chunks.get(&view.chunk).map(Chunk::statistics).unwrap_or_default();
                    view.statistics(&chunk)
                }
                None => ChunkTreeStatistics::default(),
            },
            ChunkTreeRef::DynamicStore(_) => ChunkTreeStatistics::default(),
        }
    }

    fn exists(&self, node: ChunkTreeRef) -> Result<()> {
        let found = match node {
            ChunkTreeRef::Chunk(id) => self.chunks.contains_key(&id),
            ChunkTreeRef::ChunkList(id) => self.chunk_lists.contains_key(&id),
            ChunkTreeRef::ChunkView(id) => self.chunk_views.contains_key(&id),
            ChunkTreeRef::DynamicStore(id) => self.dynamic_stores.contains_key(&id),
        };
        if found {
            return Ok(());
        }
        Err(match node {
            ChunkTreeRef::Chunk(id) => ModelError::NoSuchChunk(id),
            ChunkTreeRef::ChunkList(id) => ModelError::NoSuchChunkList(id),
            ChunkTreeRef::ChunkView(id) => ModelError::NoSuchChunkView(id),
            ChunkTreeRef::DynamicStore(id) => ModelError::NoSuchDynamicStore(id),
        })
    }

    /// Distinct parents of a chunk tree node.
    pub fn parents_of(&self, node: ChunkTreeRef) -> Vec<ChunkTreeRef> {
        let lists = |parents: &BTreeMap<ChunkListId, u32>| {
            parents.keys().map(|id| ChunkTreeRef::ChunkList(*id)).collect()
        };
        match node {
            ChunkTreeRef::Chunk(id) => self
                .chunks
                .get(&id)
                .map(|chunk| chunk.parents.keys().copied().collect())
                .unwrap_or_default(),
            ChunkTreeRef::ChunkList(id) => self.chunk_lists.get(&id).map(|l| lists(&l.parents)).unwrap_or_default(),
            ChunkTreeRef::ChunkView(id) => self.chunk_views.get(&id).map(|v| lists(&v.parents)).unwrap_or_default(),
            ChunkTreeRef::DynamicStore(id) => self
                .dynamic_stores
                .get(&id)
                .map(|s| lists(&s.parents))
                .unwrap_or_default(),
        }
    }

    fn is_ancestor(&self, ancestor: ChunkListId, of: ChunkListId) -> bool {
        let mut queue = VecDeque::from([of]);
        let mut visited = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            if current == ancestor {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(list) = self.chunk_lists.get(&current) {
                queue.extend(list.parents.keys().copied());
            }
        }
        false
    }

    pub fn attach_to_chunk_list(&mut self, parent: ChunkListId, children: &[ChunkTreeRef]) -> Result<()> {
        if !self.chunk_lists.contains_key(&parent) {
            return Err(ModelError::NoSuchChunkList(parent));
        }
        for child in children {
            self.exists(*child)?;
            if let ChunkTreeRef::ChunkList(child_list) = child {
                if self.is_ancestor(*child_list, parent) {
                    return Err(ModelError::InvalidChunkTree(format!(
                        "attaching chunk list {} to {} would create a cycle",
                        child_list, parent
                    )));
                }
            }
        }

        let mut delta = ChunkTreeStatistics::default();
        for child in children {
            self.mark_previous_journal_chunk_sealable(parent, *child);
            match child {
                ChunkTreeRef::Chunk(id) => {
                    if let Some(chunk) = self.chunks.get_mut(id) {
                        chunk.add_parent(ChunkTreeRef::ChunkList(parent));
                    }
                }
                ChunkTreeRef::ChunkList(id) => {
                    if let Some(list) = self.chunk_lists.get_mut(id) {
                        add_edge(&mut list.parents, parent);
                    }
                }
                ChunkTreeRef::ChunkView(id) => {
                    if let Some(view) = self.chunk_views.get_mut(id) {
                        add_edge(&mut view.parents, parent);
                    }
                }
                ChunkTreeRef::DynamicStore(id) => {
                    if let Some(store) = self.dynamic_stores.get_mut(id) {
                        add_edge(&mut store.parents, parent);
                    }
                }
            }
            delta += self.tree_statistics(*child);
            if let Some(list) = self.chunk_lists.get_mut(&parent) {
                list.children.push(Some(*child));
            }
        }
        self.propagate_statistics(parent, delta);
        Ok(())
    }

    /// In a journal root, appending a chunk closes the previous one for writing.
    fn mark_previous_journal_chunk_sealable(&mut self, parent: ChunkListId, appended: ChunkTreeRef) {
        let Some(list) = self.chunk_lists.get(&parent) else {
            return;
        };
        if list.kind != ChunkListKind::JournalRoot || !matches!(appended, ChunkTreeRef::Chunk(_)) {
            return;
        }
        let Some(ChunkTreeRef::Chunk(previous)) = list.children.iter().rev().find_map(|child| *child) else {
            return;
        };
        if let Some(chunk) = self.chunks.get_mut(&previous) {
            if chunk.is_journal() && chunk.confirmed && !chunk.sealed {
                chunk.sealable = true;
            }
        }
    }

    pub fn detach_from_chunk_list(&mut self, parent: ChunkListId, child: ChunkTreeRef) -> Result<()> {
        let list = self
            .chunk_lists
            .get_mut(&parent)
            .ok_or(ModelError::NoSuchChunkList(parent))?;
        let position = list
            .children
            .iter()
            .rposition(|slot| *slot == Some(child))
            .ok_or_else(|| ModelError::InvalidChunkTree(format!("{:?} is not a child of {}", child, parent)))?;
        list.children.remove(position);
        self.drop_edge(parent, child);
        let stats = self.tree_statistics(child);
        self.propagate_statistics(parent, stats * -1);
        Ok(())
    }

    /// Replaces the first `count` live children with holes.
    pub fn trim_chunk_list(&mut self, parent: ChunkListId, count: usize) -> Result<Vec<ChunkTreeRef>> {
        let list = self
            .chunk_lists
            .get_mut(&parent)
            .ok_or(ModelError::NoSuchChunkList(parent))?;
        let mut trimmed = Vec::new();
        for slot in list.children.iter_mut() {
            if trimmed.len() == count {
                break;
            }
            if let Some(child) = slot.take() {
                trimmed.push(child);
            }
        }
        let mut delta = ChunkTreeStatistics::default();
        for child in &trimmed {
            self.drop_edge(parent, *child);
            delta -= self.tree_statistics(*child);
        }
        self.propagate_statistics(parent, delta);
        Ok(trimmed)
    }

    fn drop_edge(&mut self, parent: ChunkListId, child: ChunkTreeRef) {
        let removed = match child {
            ChunkTreeRef::Chunk(id) => self
                .chunks
                .get_mut(&id)
                .map(|chunk| chunk.remove_parent(ChunkTreeRef::ChunkList(parent))),
            ChunkTreeRef::ChunkList(id) => self.chunk_lists.get_mut(&id).map(|l| remove_edge(&mut l.parents, parent)),
            ChunkTreeRef::ChunkView(id) => self.chunk_views.get_mut(&id).map(|v| remove_edge(&mut v.parents, parent)),
            ChunkTreeRef::DynamicStore(id) => self
                .dynamic_stores
                .get_mut(&id)
                .map(|s| remove_edge(&mut s.parents, parent)),
        };
        if removed != Some(true) {
            tracing::error!("Invariant violation: missing parent edge {} -> {:?}", parent, child);
        }
    }

    fn propagate_chunk_statistics(&mut self, id: ChunkId, old: ChunkTreeStatistics, new: ChunkTreeStatistics) {
        let mut delta = new;
        delta -= old;
        if delta.is_zero() {
            return;
        }
        let parents: Vec<(ChunkTreeRef, u32)> = match self.chunks.get(&id) {
            Some(chunk) => chunk.parents.iter().map(|(p, c)| (*p, *c)).collect(),
            None => return,
        };
        for (parent, count) in parents {
            match parent {
                ChunkTreeRef::ChunkList(list) => self.propagate_statistics(list, delta * count as i64),
                ChunkTreeRef::ChunkView(view_id) => {
                    let Some(view) = self.chunk_views.get(&view_id) else {
                        continue;
                    };
                    let mut view_delta = view.statistics(&new);
                    view_delta -= view.statistics(&old);
                    let lists: Vec<(ChunkListId, u32)> = view.parents.iter().map(|(p, c)| (*p, *c)).collect();
                    for (list, list_count) in lists {
                        self.propagate_statistics(list, view_delta * (count as i64 * list_count as i64));
                    }
                }
                other => tracing::error!("Invariant violation: chunk {} has unexpected parent {:?}", id, other),
            }
        }
    }

    /// Adds `delta` to the list and every ancestor, honoring edge multiplicity.
    fn propagate_statistics(&mut self, start: ChunkListId, delta: ChunkTreeStatistics) {
        if delta.is_zero() {
            return;
        }
        let mut queue = VecDeque::from([(start, delta)]);
        while let Some((id, delta)) = queue.pop_front() {
            let Some(list) = self.chunk_lists.get_mut(&id) else {
                tracing::error!("Invariant violation: dangling chunk list parent {}", id);
                continue;
            };
            list.statistics += delta;
            for (parent, count) in &list.parents {
                queue.push_back((*parent, delta * *count as i64));
            }
        }
    }

    /// Recomputes a list's statistics from its children and compares.
    pub fn verify_statistics(&self, id: ChunkListId) -> Result<()> {
        let list = self.chunk_lists.get(&id).ok_or(ModelError::NoSuchChunkList(id))?;
        let mut expected = ChunkTreeStatistics {
            chunk_list_count: 1,
            ..ChunkTreeStatistics::default()
        };
        for child in list.child_refs() {
            expected += self.tree_statistics(child);
        }
        if expected != list.statistics {
            return Err(ModelError::StatisticsMismatch {
                list: id,
                expected,
                actual: list.statistics,
            });
        }
        Ok(())
    }

    /// Clears staging on a chunk (or a whole subtree) and commits its
    /// requisition. Returns the chunks that were unstaged.
    pub fn unstage_chunk_tree(&mut self, root: ChunkTreeRef, recursive: bool) -> Result<Vec<ChunkId>> {
        self.exists(root)?;
        let mut chunks = Vec::new();
        let mut stack = vec![root];
        let mut visited = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            match node {
                ChunkTreeRef::Chunk(id) => chunks.push(id),
                ChunkTreeRef::ChunkView(id) => {
                    if let Some(view) = self.chunk_views.get(&id) {
                        stack.push(ChunkTreeRef::Chunk(view.chunk));
                    }
                }
                ChunkTreeRef::ChunkList(id) if recursive || node == root => {
                    if let Some(list) = self.chunk_lists.get(&id) {
                        stack.extend(list.child_refs());
                    }
                }
                ChunkTreeRef::ChunkList(_) | ChunkTreeRef::DynamicStore(_) => {}
            }
        }

        let mut unstaged = Vec::new();
        for id in chunks {
            let Some(chunk) = self.chunks.get_mut(&id) else {
                continue;
            };
            if !chunk.is_staged() && chunk.staging_account.is_none() {
                continue;
            }
            chunk.staging_transaction = None;
            chunk.staging_account = None;
            let old = chunk.local_requisition;
            let committed = self.requisitions.get(old).commit();
            let new = self.requisitions.get_or_create(&committed);
            self.requisitions.ref_index(new);
            self.requisitions.unref_index(old);
            if let Some(chunk) = self.chunks.get_mut(&id) {
                chunk.local_requisition = new;
            }
            unstaged.push(id);
        }
        Ok(unstaged)
    }

    /// Sets or replaces the owner with the same name and schedules a
    /// requisition traversal of the list.
    pub fn set_owner(&mut self, id: ChunkListId, owner: ChunkOwner) -> Result<()> {
        self.validate_replication(&owner.replication)?;
        let list = self.chunk_lists.get_mut(&id).ok_or(ModelError::NoSuchChunkList(id))?;
        match list.owners.iter_mut().find(|existing| existing.name == owner.name) {
            Some(existing) => *existing = owner,
            None => list.owners.push(owner),
        }
        self.pending_requisition_traversals.insert(id);
        Ok(())
    }

    pub fn remove_owner(&mut self, id: ChunkListId, name: &str) -> Result<bool> {
        let list = self.chunk_lists.get_mut(&id).ok_or(ModelError::NoSuchChunkList(id))?;
        let before = list.owners.len();
        list.owners.retain(|owner| owner.name != name);
        let removed = list.owners.len() != before;
        if removed {
            self.pending_requisition_traversals.insert(id);
        }
        Ok(removed)
    }

    pub fn add_pending_requisition_traversal(&mut self, id: ChunkListId) {
        self.pending_requisition_traversals.insert(id);
    }

    pub fn pending_requisition_traversals(&self) -> &BTreeSet<ChunkListId> {
        &self.pending_requisition_traversals
    }

    pub fn finish_requisition_traversals(&mut self, lists: &[ChunkListId]) {
        for id in lists {
            self.pending_requisition_traversals.remove(id);
        }
    }

    /// Removes an unreferenced chunk and releases its requisitions. The
    /// caller unwinds node-side replica and queue bookkeeping.
    pub fn destroy_chunk(&mut self, id: ChunkId) -> Result<Chunk> {
        let chunk = self.get_chunk(id)?;
        if !chunk.parents.is_empty() {
            return Err(ModelError::ChunkTreeInUse(ChunkTreeRef::Chunk(id)));
        }
        let Some(chunk) = self.chunks.remove(&id) else {
            return Err(ModelError::NoSuchChunk(id));
        };
        for index in chunk.requisition_indexes() {
            self.requisitions.unref_index(index);
        }
        tracing::debug!("Chunk destroyed: {}", id);
        Ok(chunk)
    }

    /// Points the chunk's requisition slot for `cell` at `index`; the new
    /// index is referenced before the old one is released.
    pub fn set_chunk_requisition(&mut self, id: ChunkId, cell: CellTag, index: RequisitionIndex) -> Result<bool> {
        let local = cell == self.cell_tag;
        let chunk = self.chunks.get(&id).ok_or(ModelError::NoSuchChunk(id))?;
        let old = if local {
            Some(chunk.local_requisition)
        } else {
            chunk.external_requisitions.get(&cell).copied()
        };
        if old == Some(index) {
            return Ok(false);
        }
        self.requisitions.ref_index(index);
        if let Some(old) = old {
            self.requisitions.unref_index(old);
        }
        let chunk = self.get_chunk_mut(id)?;
        if local {
            chunk.local_requisition = index;
        } else {
            chunk.external_requisitions.insert(cell, index);
        }
        Ok(true)
    }

    /// Union of the chunk's local and imported requisitions.
    pub fn chunk_requisition(&self, chunk: &Chunk) -> Requisition {
        let mut requisition = self.requisitions.get(chunk.local_requisition).clone();
        for index in chunk.external_requisitions.values() {
            requisition |= self.requisitions.get(*index);
        }
        requisition
    }
}

fn validate_journal_quorums(read_quorum: u8, write_quorum: u8, replication_factor: u8) -> Result<()> {
    if read_quorum == 0 || write_quorum == 0 {
        return Err(ModelError::InvalidQuorum("journal quorums must be positive".to_string()));
    }
    if read_quorum > replication_factor || write_quorum > replication_factor {
        return Err(ModelError::InvalidQuorum(format!(
            "quorums ({}, {}) exceed replication factor {}",
            read_quorum, write_quorum, replication_factor
        )));
    }
    if read_quorum as u16 + write_quorum as u16 <= replication_factor as u16 {
        return Err(ModelError::InvalidQuorum(format!(
            "read quorum {} plus write quorum {} must exceed replication factor {}",
            read_quorum, write_quorum, replication_factor
        )));
    }
    Ok(())
}
