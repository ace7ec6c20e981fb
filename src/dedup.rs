// ===============================
// src/dedup.rs
// ===============================
use ahash::AHashSet;
use sha2::{Digest, Sha256};

/// Hex digest of a normalized order document.
pub fn content_hash(doc: &str) -> String {
    hex::encode(Sha256::digest(doc.as_bytes()))
}

/// Order-channel duplicate suppression: identical re-deliveries share a
/// content hash and are dropped for the life of the process.
#[derive(Default)]
pub struct OrderSeen {
    hashes: AHashSet<String>,
}

impl OrderSeen {
    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub fn insert(&mut self, hash: String) {
        self.hashes.insert(hash);
    }
}

/// Execution-id suppression with start-time priming: ids stamped before
/// `start_epoch_sec`, plus the historical part of an instrument's first
/// batch, are recorded without being acted on.
pub struct ExecSeen {
    start_epoch_sec: i64,
    ids: AHashSet<String>,
    primed: AHashSet<String>,
}

impl ExecSeen {
    pub fn new(start_epoch_sec: i64) -> Self {
        Self { start_epoch_sec, ids: AHashSet::new(), primed: AHashSet::new() }
    }

    /// True exactly once per instrument, on its first execution batch.
    pub fn needs_priming(&mut self, instrument: &str) -> bool {
        self.primed.insert(instrument.to_string())
    }

    pub fn predates_start(&self, time_sec: Option<i64>) -> bool {
        matches!(time_sec, Some(t) if t < self.start_epoch_sec)
    }

    /// Records the id; false when it was already known.
    pub fn record(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }
}
