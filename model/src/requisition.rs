use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::BitOrAssign;

use crate::{AccountId, MediumIndex};

/// Replication factor on one medium; a factor of zero means "not requested".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicationPolicy {
    pub replication_factor: u8,
    pub data_parts_only: bool,
}

impl ReplicationPolicy {
    pub fn new(replication_factor: u8, data_parts_only: bool) -> Self {
        Self {
            replication_factor,
            data_parts_only,
        }
    }

    pub fn is_set(&self) -> bool {
        self.replication_factor != 0
    }
}

impl BitOrAssign for ReplicationPolicy {
    fn bitor_assign(&mut self, rhs: Self) {
        if !rhs.is_set() {
            return;
        }
        if !self.is_set() {
            *self = rhs;
            return;
        }
        self.replication_factor = self.replication_factor.max(rhs.replication_factor);
        self.data_parts_only = self.data_parts_only && rhs.data_parts_only;
    }
}

/// Per-medium replication policies plus vitality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replication {
    policies: BTreeMap<MediumIndex, ReplicationPolicy>,
    vital: bool,
}

impl Replication {
    pub const fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
            vital: false,
        }
    }

    pub fn new(vital: bool) -> Self {
        Self {
            policies: BTreeMap::new(),
            vital,
        }
    }

    pub fn with_policy(mut self, medium: MediumIndex, replication_factor: u8) -> Self {
        self.set(medium, ReplicationPolicy::new(replication_factor, false));
        self
    }

    pub fn set(&mut self, medium: MediumIndex, policy: ReplicationPolicy) {
        if policy.is_set() {
            self.policies.insert(medium, policy);
        } else {
            self.policies.remove(&medium);
        }
    }

    /// Sets an explicit zero factor so the medium is considered even though
    /// nothing is requested on it.
    pub fn set_zero(&mut self, medium: MediumIndex) {
        self.policies.entry(medium).or_default();
    }

    pub fn get(&self, medium: MediumIndex) -> ReplicationPolicy {
        self.policies.get(&medium).copied().unwrap_or_default()
    }

    pub fn contains(&self, medium: MediumIndex) -> bool {
        self.policies.contains_key(&medium)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediumIndex, ReplicationPolicy)> + '_ {
        self.policies.iter().map(|(medium, policy)| (*medium, *policy))
    }

    pub fn is_vital(&self) -> bool {
        self.vital
    }

    pub fn set_vital(&mut self, vital: bool) {
        self.vital = vital;
    }

    pub fn is_empty(&self) -> bool {
        self.policies.values().all(|policy| !policy.is_set())
    }
}

impl BitOrAssign<&Replication> for Replication {
    fn bitor_assign(&mut self, rhs: &Replication) {
        for (medium, policy) in rhs.iter() {
            *self.policies.entry(medium).or_default() |= policy;
        }
        self.vital |= rhs.vital;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequisitionEntry {
    pub account: AccountId,
    pub medium: MediumIndex,
    pub policy: ReplicationPolicy,
    pub committed: bool,
}

impl RequisitionEntry {
    fn key(&self) -> (&AccountId, MediumIndex, bool) {
        (&self.account, self.medium, self.committed)
    }
}

/// The resolved replication demand on a chunk, one entry per
/// (account, medium, committed) triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Requisition {
    entries: Vec<RequisitionEntry>,
    vital: bool,
}

impl Requisition {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            vital: false,
        }
    }

    pub fn from_replication(account: &AccountId, replication: &Replication, committed: bool) -> Self {
        let mut requisition = Self::new();
        requisition.aggregate_with(replication, account, committed);
        requisition
    }

    pub fn aggregate_with(&mut self, replication: &Replication, account: &AccountId, committed: bool) {
        for (medium, policy) in replication.iter() {
            if policy.is_set() {
                self.entries.push(RequisitionEntry {
                    account: account.clone(),
                    medium,
                    policy,
                    committed,
                });
            }
        }
        self.vital |= replication.is_vital();
        self.normalize();
    }

    pub fn entries(&self) -> &[RequisitionEntry] {
        &self.entries
    }

    pub fn is_vital(&self) -> bool {
        self.vital
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks every entry as committed.
    pub fn commit(&self) -> Requisition {
        let mut result = self.clone();
        for entry in &mut result.entries {
            entry.committed = true;
        }
        result.normalize();
        result
    }

    /// Collapses accounts into one policy per medium. Committed entries win
    /// over uncommitted ones when both are present.
    pub fn to_replication(&self) -> Replication {
        let has_committed = self.entries.iter().any(|entry| entry.committed);
        let mut replication = Replication::new(self.vital);
        for entry in &self.entries {
            if entry.committed || !has_committed {
                let mut policy = replication.get(entry.medium);
                policy |= entry.policy;
                replication.set(entry.medium, policy);
            }
        }
        replication
    }

    fn normalize(&mut self) {
        self.entries.sort_by(|a, b| a.key().cmp(&b.key()));
        let mut merged: Vec<RequisitionEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match merged.last_mut() {
                Some(last) if last.key() == entry.key() => last.policy |= entry.policy,
                _ => merged.push(entry),
            }
        }
        self.entries = merged;
    }
}

impl BitOrAssign<&Requisition> for Requisition {
    fn bitor_assign(&mut self, rhs: &Requisition) {
        self.entries.extend(rhs.entries.iter().cloned());
        self.vital |= rhs.vital;
        self.normalize();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequisitionIndex(pub u32);

impl RequisitionIndex {
    pub const EMPTY: RequisitionIndex = RequisitionIndex(0);
}

static EMPTY_REQUISITION: Requisition = Requisition::new();
static EMPTY_REPLICATION: Replication = Replication::empty();

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryItem {
    requisition: Requisition,
    replication: Replication,
    ref_count: i64,
}

/// Deduplicated, ref-counted table of requisitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequisitionRegistry {
    items: BTreeMap<RequisitionIndex, RegistryItem>,
    next_index: u32,
    #[serde(skip)]
    index_by_value: HashMap<Requisition, RequisitionIndex>,
}

impl Default for RequisitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequisitionRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            items: BTreeMap::new(),
            next_index: 1,
            index_by_value: HashMap::new(),
        };
        // The empty requisition is permanent.
        registry.items.insert(
            RequisitionIndex::EMPTY,
            RegistryItem {
                requisition: Requisition::new(),
                replication: Replication::new(false),
                ref_count: 1,
            },
        );
        registry
            .index_by_value
            .insert(Requisition::new(), RequisitionIndex::EMPTY);
        registry
    }

    /// Returns the index of an equal requisition, inserting one with a zero
    /// ref count if none exists. Callers must `ref_index` what they keep.
    pub fn get_or_create(&mut self, requisition: &Requisition) -> RequisitionIndex {
        if let Some(index) = self.index_by_value.get(requisition) {
            return *index;
        }
        let index = RequisitionIndex(self.next_index);
        self.next_index += 1;
        self.items.insert(
            index,
            RegistryItem {
                requisition: requisition.clone(),
                replication: requisition.to_replication(),
                ref_count: 0,
            },
        );
        self.index_by_value.insert(requisition.clone(), index);
        tracing::trace!("Requisition registered (Index: {}, Entries: {})", index.0, requisition.entries().len());
        index
    }

    pub fn find(&self, requisition: &Requisition) -> Option<RequisitionIndex> {
        self.index_by_value.get(requisition).copied()
    }

    pub fn contains(&self, index: RequisitionIndex) -> bool {
        self.items.contains_key(&index)
    }

    pub fn get(&self, index: RequisitionIndex) -> &Requisition {
        match self.items.get(&index) {
            Some(item) => &item.requisition,
            None => {
                tracing::error!("Invariant violation: unknown requisition index {}", index.0);
                &EMPTY_REQUISITION
            }
        }
    }

    pub fn replication(&self, index: RequisitionIndex) -> &Replication {
        match self.items.get(&index) {
            Some(item) => &item.replication,
            None => {
                tracing::error!("Invariant violation: unknown requisition index {}", index.0);
                &EMPTY_REPLICATION
            }
        }
    }

    pub fn ref_count(&self, index: RequisitionIndex) -> i64 {
        self.items.get(&index).map(|item| item.ref_count).unwrap_or(0)
    }

    pub fn ref_index(&mut self, index: RequisitionIndex) {
        match self.items.get_mut(&index) {
            Some(item) => item.ref_count += 1,
            None => tracing::error!("Invariant violation: ref of unknown requisition index {}", index.0),
        }
    }

    pub fn unref_index(&mut self, index: RequisitionIndex) {
        let Some(item) = self.items.get_mut(&index) else {
            tracing::error!("Invariant violation: unref of unknown requisition index {}", index.0);
            return;
        };
        item.ref_count -= 1;
        if item.ref_count <= 0 && index != RequisitionIndex::EMPTY {
            if let Some(item) = self.items.remove(&index) {
                self.index_by_value.remove(&item.requisition);
            }
        }
    }

    /// Registers the union of two requisitions.
    pub fn aggregate(&mut self, a: RequisitionIndex, b: RequisitionIndex) -> RequisitionIndex {
        let mut merged = self.get(a).clone();
        merged |= self.get(b);
        self.get_or_create(&merged)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.index_by_value = self
            .items
            .iter()
            .map(|(index, item)| (item.requisition.clone(), *index))
            .collect();
    }
}

/// Short-lived registry used to build the inline dictionary of a
/// cross-cell requisition update.
#[derive(Debug, Clone, Default)]
pub struct EphemeralRequisitionRegistry {
    items: Vec<Requisition>,
    index_by_value: HashMap<Requisition, u32>,
}

impl EphemeralRequisitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, requisition: &Requisition) -> u32 {
        if let Some(index) = self.index_by_value.get(requisition) {
            return *index;
        }
        let index = self.items.len() as u32;
        self.items.push(requisition.clone());
        self.index_by_value.insert(requisition.clone(), index);
        index
    }

    pub fn get(&self, index: u32) -> Option<&Requisition> {
        self.items.get(index as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_dictionary(self) -> Vec<(u32, Requisition)> {
        self.items
            .into_iter()
            .enumerate()
            .map(|(index, requisition)| (index as u32, requisition))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str) -> AccountId {
        AccountId::new(name)
    }

    fn requisition(name: &str, medium: u8, factor: u8, vital: bool) -> Requisition {
        let mut replication = Replication::new(vital);
        replication.set(MediumIndex(medium), ReplicationPolicy::new(factor, false));
        Requisition::from_replication(&account(name), &replication, true)
    }

    #[test]
    fn test_policy_merge_takes_max_factor() {
        let mut policy = ReplicationPolicy::new(2, true);
        policy |= ReplicationPolicy::new(3, false);
        assert_eq!(policy, ReplicationPolicy::new(3, false));

        let mut unset = ReplicationPolicy::default();
        unset |= ReplicationPolicy::new(1, true);
        assert_eq!(unset, ReplicationPolicy::new(1, true));
    }

    #[test]
    fn test_registry_dedupes_by_value() {
        let mut registry = RequisitionRegistry::new();
        let a = registry.get_or_create(&requisition("tmp", 0, 3, true));
        let b = registry.get_or_create(&requisition("tmp", 0, 3, true));
        let c = registry.get_or_create(&requisition("tmp", 0, 2, true));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.replication(a).get(MediumIndex(0)).replication_factor, 3);
    }

    #[test]
    fn test_unref_to_zero_erases_entry() {
        let mut registry = RequisitionRegistry::new();
        let value = requisition("tmp", 0, 3, false);
        let index = registry.get_or_create(&value);
        registry.ref_index(index);
        registry.ref_index(index);
        registry.unref_index(index);
        assert!(registry.contains(index));
        registry.unref_index(index);
        assert!(!registry.contains(index));
        assert_eq!(registry.find(&value), None);
    }

    #[test]
    fn test_empty_requisition_is_permanent() {
        let mut registry = RequisitionRegistry::new();
        registry.unref_index(RequisitionIndex::EMPTY);
        registry.unref_index(RequisitionIndex::EMPTY);
        assert!(registry.contains(RequisitionIndex::EMPTY));
    }

    #[test]
    fn test_aggregate_is_commutative_and_associative() {
        let a = requisition("a", 0, 3, false);
        let b = requisition("b", 1, 1, true);
        let c = requisition("a", 0, 5, false);

        let mut ab = a.clone();
        ab |= &b;
        let mut ba = b.clone();
        ba |= &a;
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c |= &c;
        let mut bc = b.clone();
        bc |= &c;
        let mut a_bc = a.clone();
        a_bc |= &bc;
        assert_eq!(ab_c, a_bc);

        let replication = ab_c.to_replication();
        assert_eq!(replication.get(MediumIndex(0)).replication_factor, 5);
        assert_eq!(replication.get(MediumIndex(1)).replication_factor, 1);
        assert!(replication.is_vital());
    }

    #[test]
    fn test_committed_entries_take_precedence() {
        let mut replication = Replication::new(false);
        replication.set(MediumIndex(0), ReplicationPolicy::new(5, false));
        let mut value = Requisition::from_replication(&account("a"), &replication, false);
        let mut committed = Replication::new(false);
        committed.set(MediumIndex(0), ReplicationPolicy::new(2, false));
        value.aggregate_with(&committed, &account("a"), true);
        assert_eq!(value.to_replication().get(MediumIndex(0)).replication_factor, 2);
    }

    #[test]
    fn test_ephemeral_registry_builds_dictionary() {
        let mut registry = EphemeralRequisitionRegistry::new();
        let first = registry.get_or_create(&requisition("a", 0, 3, false));
        let again = registry.get_or_create(&requisition("a", 0, 3, false));
        let second = registry.get_or_create(&requisition("b", 0, 1, false));
        assert_eq!(first, again);
        assert_ne!(first, second);
        assert_eq!(registry.into_dictionary().len(), 2);
    }
}
