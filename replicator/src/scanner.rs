use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use model::{Chunk, ChunkId, ScanKind};

/// FIFO of chunks awaiting one kind of scan, for one chunk kind.
///
/// A chunk is queued at most once per epoch: the chunk itself carries an
/// epoch-stamped flag, so bumping the epoch invalidates every flag at once.
/// The global queue holds ids scheduled wholesale at leading start; those are
/// served before anything else.
#[derive(Debug)]
pub struct ChunkScanner {
    kind: ScanKind,
    journal: bool,
    queue: VecDeque<(ChunkId, DateTime<Utc>)>,
    global: VecDeque<ChunkId>,
}

impl ChunkScanner {
    pub fn new(kind: ScanKind, journal: bool) -> Self {
        Self {
            kind,
            journal,
            queue: VecDeque::new(),
            global: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn is_journal(&self) -> bool {
        self.journal
    }

    /// Queues the chunk to be scanned no earlier than `due`. Returns false
    /// if it is already queued in this epoch.
    pub fn enqueue(&mut self, chunk: &mut Chunk, epoch: u64, due: DateTime<Utc>) -> bool {
        if chunk.scan_flag(self.kind, epoch) {
            return false;
        }
        chunk.set_scan_flag(self.kind, epoch);
        self.queue.push_back((chunk.id, due));
        true
    }

    /// Adds the chunk to the global queue and stamps its flag, so explicit
    /// enqueues in the same epoch do not scan it a second time.
    pub fn schedule_global_scan(&mut self, chunk: &mut Chunk, epoch: u64) {
        if chunk.scan_flag(self.kind, epoch) {
            return;
        }
        chunk.set_scan_flag(self.kind, epoch);
        self.global.push_back(chunk.id);
    }

    /// Pops the next chunk that is due. The caller clears the chunk's scan
    /// flag and skips ids of chunks destroyed meanwhile.
    pub fn dequeue(&mut self, now: DateTime<Utc>) -> Option<ChunkId> {
        if let Some(chunk) = self.global.pop_front() {
            return Some(chunk);
        }
        match self.queue.front() {
            Some((_, due)) if *due <= now => self.queue.pop_front().map(|(chunk, _)| chunk),
            _ => None,
        }
    }

    pub fn has_unscanned(&self, now: DateTime<Utc>) -> bool {
        !self.global.is_empty() || self.queue.front().map(|(_, due)| *due <= now).unwrap_or(false)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len() + self.global.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.global.clear();
    }
}
