use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use model::ChunkId;
use serde::{Deserialize, Serialize};

/// Named health index exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSet {
    Lost,
    LostVital,
    Overreplicated,
    Underreplicated,
    DataMissing,
    ParityMissing,
    QuorumMissing,
    Precarious,
    PrecariousVital,
    UnsafelyPlaced,
    InconsistentlyPlaced,
    OldestPartMissing,
}

impl HealthSet {
    pub const ALL: [HealthSet; 12] = [
        HealthSet::Lost,
        HealthSet::LostVital,
        HealthSet::Overreplicated,
        HealthSet::Underreplicated,
        HealthSet::DataMissing,
        HealthSet::ParityMissing,
        HealthSet::QuorumMissing,
        HealthSet::Precarious,
        HealthSet::PrecariousVital,
        HealthSet::UnsafelyPlaced,
        HealthSet::InconsistentlyPlaced,
        HealthSet::OldestPartMissing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HealthSet::Lost => "lost",
            HealthSet::LostVital => "lost_vital",
            HealthSet::Overreplicated => "overreplicated",
            HealthSet::Underreplicated => "underreplicated",
            HealthSet::DataMissing => "data_missing",
            HealthSet::ParityMissing => "parity_missing",
            HealthSet::QuorumMissing => "quorum_missing",
            HealthSet::Precarious => "precarious",
            HealthSet::PrecariousVital => "precarious_vital",
            HealthSet::UnsafelyPlaced => "unsafely_placed",
            HealthSet::InconsistentlyPlaced => "inconsistently_placed",
            HealthSet::OldestPartMissing => "oldest_part_missing",
        }
    }
}

impl fmt::Display for HealthSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HealthSet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        HealthSet::ALL
            .iter()
            .copied()
            .find(|set| set.name() == s)
            .ok_or_else(|| format!("unknown health set: {}", s))
    }
}

/// Erasure chunks with missing parts, oldest loss first, capped in size.
#[derive(Debug, Clone, Default)]
pub struct OldestPartMissingChunks {
    max_size: usize,
    entries: BTreeSet<(DateTime<Utc>, ChunkId)>,
    loss_times: HashMap<ChunkId, DateTime<Utc>>,
}

impl OldestPartMissingChunks {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.entries.len() > self.max_size {
            if let Some(entry) = self.entries.pop_last() {
                self.loss_times.remove(&entry.1);
            }
        }
    }

    /// Admits the chunk while there is room, or in place of the most
    /// recent entry if the chunk lost its part earlier.
    pub fn remember(&mut self, chunk: ChunkId, loss_time: DateTime<Utc>) {
        if self.loss_times.contains_key(&chunk) || self.max_size == 0 {
            return;
        }
        if self.entries.len() >= self.max_size {
            match self.entries.last() {
                Some(last) if loss_time < last.0 => {
                    let last = *last;
                    self.entries.remove(&last);
                    self.loss_times.remove(&last.1);
                }
                _ => return,
            }
        }
        self.entries.insert((loss_time, chunk));
        self.loss_times.insert(chunk, loss_time);
    }

    pub fn forget(&mut self, chunk: ChunkId) {
        if let Some(loss_time) = self.loss_times.remove(&chunk) {
            self.entries.remove(&(loss_time, chunk));
        }
    }

    pub fn contains(&self, chunk: ChunkId) -> bool {
        self.loss_times.contains_key(&chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, ChunkId)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.loss_times.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub lost: usize,
    pub lost_vital: usize,
    pub overreplicated: usize,
    pub underreplicated: usize,
    pub data_missing: usize,
    pub parity_missing: usize,
    pub quorum_missing: usize,
    pub precarious: usize,
    pub precarious_vital: usize,
    pub unsafely_placed: usize,
    pub inconsistently_placed: usize,
    pub oldest_part_missing: usize,
}

/// Health indexes rebuilt per chunk on every refresh.
#[derive(Debug, Clone, Default)]
pub struct ChunkHealthSets {
    lost: BTreeSet<ChunkId>,
    lost_vital: BTreeSet<ChunkId>,
    overreplicated: BTreeSet<ChunkId>,
    underreplicated: BTreeSet<ChunkId>,
    data_missing: BTreeSet<ChunkId>,
    parity_missing: BTreeSet<ChunkId>,
    quorum_missing: BTreeSet<ChunkId>,
    precarious: BTreeSet<ChunkId>,
    precarious_vital: BTreeSet<ChunkId>,
    unsafely_placed: BTreeSet<ChunkId>,
    inconsistently_placed: BTreeSet<ChunkId>,
    oldest_part_missing: OldestPartMissingChunks,
}

impl ChunkHealthSets {
    pub fn new(max_oldest_part_missing: usize) -> Self {
        Self {
            oldest_part_missing: OldestPartMissingChunks::new(max_oldest_part_missing),
            ..Self::default()
        }
    }

    fn set(&self, set: HealthSet) -> Option<&BTreeSet<ChunkId>> {
        match set {
            HealthSet::Lost => Some(&self.lost),
            HealthSet::LostVital => Some(&self.lost_vital),
            HealthSet::Overreplicated => Some(&self.overreplicated),
            HealthSet::Underreplicated => Some(&self.underreplicated),
            HealthSet::DataMissing => Some(&self.data_missing),
            HealthSet::ParityMissing => Some(&self.parity_missing),
            HealthSet::QuorumMissing => Some(&self.quorum_missing),
            HealthSet::Precarious => Some(&self.precarious),
            HealthSet::PrecariousVital => Some(&self.precarious_vital),
            HealthSet::UnsafelyPlaced => Some(&self.unsafely_placed),
            HealthSet::InconsistentlyPlaced => Some(&self.inconsistently_placed),
            HealthSet::OldestPartMissing => None,
        }
    }

    fn set_mut(&mut self, set: HealthSet) -> Option<&mut BTreeSet<ChunkId>> {
        match set {
            HealthSet::Lost => Some(&mut self.lost),
            HealthSet::LostVital => Some(&mut self.lost_vital),
            HealthSet::Overreplicated => Some(&mut self.overreplicated),
            HealthSet::Underreplicated => Some(&mut self.underreplicated),
            HealthSet::DataMissing => Some(&mut self.data_missing),
            HealthSet::ParityMissing => Some(&mut self.parity_missing),
            HealthSet::QuorumMissing => Some(&mut self.quorum_missing),
            HealthSet::Precarious => Some(&mut self.precarious),
            HealthSet::PrecariousVital => Some(&mut self.precarious_vital),
            HealthSet::UnsafelyPlaced => Some(&mut self.unsafely_placed),
            HealthSet::InconsistentlyPlaced => Some(&mut self.inconsistently_placed),
            HealthSet::OldestPartMissing => None,
        }
    }

    pub fn insert(&mut self, set: HealthSet, chunk: ChunkId) {
        if let Some(members) = self.set_mut(set) {
            members.insert(chunk);
        }
    }

    pub fn contains(&self, set: HealthSet, chunk: ChunkId) -> bool {
        match self.set(set) {
            Some(members) => members.contains(&chunk),
            None => self.oldest_part_missing.contains(chunk),
        }
    }

    /// Members of a set; the oldest-part-missing set is ordered by loss time.
    pub fn members(&self, set: HealthSet) -> Vec<ChunkId> {
        match self.set(set) {
            Some(members) => members.iter().copied().collect(),
            None => self.oldest_part_missing.iter().map(|(_, chunk)| chunk).collect(),
        }
    }

    pub fn len(&self, set: HealthSet) -> usize {
        match self.set(set) {
            Some(members) => members.len(),
            None => self.oldest_part_missing.len(),
        }
    }

    pub fn remember_part_missing(&mut self, chunk: ChunkId, loss_time: DateTime<Utc>) {
        self.oldest_part_missing.remember(chunk, loss_time);
    }

    pub fn set_max_oldest_part_missing(&mut self, max_size: usize) {
        self.oldest_part_missing.set_max_size(max_size);
    }

    /// Drops the chunk from every set ahead of recomputation.
    pub fn reset(&mut self, chunk: ChunkId) {
        for set in HealthSet::ALL {
            if let Some(members) = self.set_mut(set) {
                members.remove(&chunk);
            }
        }
        self.oldest_part_missing.forget(chunk);
    }

    pub fn clear(&mut self) {
        for set in HealthSet::ALL {
            if let Some(members) = self.set_mut(set) {
                members.clear();
            }
        }
        self.oldest_part_missing.clear();
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            lost: self.lost.len(),
            lost_vital: self.lost_vital.len(),
            overreplicated: self.overreplicated.len(),
            underreplicated: self.underreplicated.len(),
            data_missing: self.data_missing.len(),
            parity_missing: self.parity_missing.len(),
            quorum_missing: self.quorum_missing.len(),
            precarious: self.precarious.len(),
            precarious_vital: self.precarious_vital.len(),
            unsafely_placed: self.unsafely_placed.len(),
            inconsistently_placed: self.inconsistently_placed.len(),
            oldest_part_missing: self.oldest_part_missing.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reset_removes_chunk_everywhere() {
        let mut sets = ChunkHealthSets::new(10);
        let chunk = ChunkId::new();
        sets.insert(HealthSet::Lost, chunk);
        sets.insert(HealthSet::LostVital, chunk);
        sets.remember_part_missing(chunk, Utc::now());
        assert_eq!(sets.summary().lost_vital, 1);

        sets.reset(chunk);
        assert_eq!(sets.summary(), HealthSummary::default());
    }

    #[test]
    fn test_oldest_part_missing_keeps_oldest_entries() {
        let mut oldest = OldestPartMissingChunks::new(2);
        let base = Utc::now();
        let chunks: Vec<ChunkId> = (0..3).map(|_| ChunkId::new()).collect();

        oldest.remember(chunks[0], base + Duration::seconds(10));
        oldest.remember(chunks[1], base + Duration::seconds(20));
        oldest.remember(chunks[2], base + Duration::seconds(5));

        let order: Vec<ChunkId> = oldest.iter().map(|(_, chunk)| chunk).collect();
        assert_eq!(order, vec![chunks[2], chunks[0]]);

        // Newer than everything kept: rejected.
        let late = ChunkId::new();
        oldest.remember(late, base + Duration::seconds(30));
        assert!(!oldest.contains(late));
    }

    #[test]
    fn test_health_set_names_roundtrip() {
        for set in HealthSet::ALL {
            assert_eq!(set.name().parse::<HealthSet>().unwrap(), set);
        }
        assert!("bogus".parse::<HealthSet>().is_err());
    }
}
