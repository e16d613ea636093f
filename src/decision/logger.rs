// =============================================================================
// Decision Logger — per-trader ring buffer + durable per-cycle JSON files
// =============================================================================
//
// Two surfaces:
//   1. In-memory ring of the most recent records, for API-style queries.
//   2. One JSON file per cycle under decision_logs/<trader_id>/.
//
// Durable writes are best-effort: a disk failure is logged and the cycle
// carries on. Records are never modified after append.
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::DecisionRecord;

/// Default number of records retained in memory.
const DEFAULT_RING_CAPACITY: usize = 50;

/// Append-only, time-ordered log of one trader's cycles.
pub struct DecisionLogger {
    trader_id: String,
    dir: PathBuf,
    ring: RwLock<VecDeque<DecisionRecord>>,
    capacity: usize,
}

impl DecisionLogger {
    /// Create a logger writing under `<base_dir>/<trader_id>/`.
    pub fn new(base_dir: impl AsRef<Path>, trader_id: impl Into<String>) -> Self {
        Self::with_capacity(base_dir, trader_id, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(
        base_dir: impl AsRef<Path>,
        trader_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let trader_id = trader_id.into();
        Self {
            dir: base_dir.as_ref().join(&trader_id),
            trader_id,
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Append a record: always lands in the ring, best-effort on disk.
    pub fn append(&self, record: DecisionRecord) {
        if let Err(e) = self.write_to_disk(&record) {
            warn!(
                trader_id = %self.trader_id,
                cycle = record.cycle_number,
                error = %e,
                "decision record not persisted to disk"
            );
        }

        let mut ring = self.ring.write();
        ring.push_back(record);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Atomic write (tmp + rename) of one cycle file.
    fn write_to_disk(&self, record: &DecisionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let filename = format!(
            "{}_{:06}.json",
            record.timestamp.format("%Y%m%dT%H%M%S%3f"),
            record.cycle_number
        );
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{filename}.tmp"));

        let content = serde_json::to_string_pretty(record)
            .context("failed to serialise decision record")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(
            trader_id = %self.trader_id,
            cycle = record.cycle_number,
            path = %path.display(),
            "decision record persisted"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The most recent `n` records, oldest first.
    pub fn latest(&self, n: usize) -> Vec<DecisionRecord> {
        let ring = self.ring.read();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Every retained record, oldest first.
    pub fn all(&self) -> Vec<DecisionRecord> {
        self.ring.read().iter().cloned().collect()
    }

    /// Number of records currently retained in memory.
    pub fn count(&self) -> usize {
        self.ring.read().len()
    }

    /// Highest cycle number seen, or 0 before the first record.
    pub fn last_cycle_number(&self) -> u64 {
        self.ring.read().back().map(|r| r.cycle_number).unwrap_or(0)
    }
}

impl std::fmt::Debug for DecisionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionLogger")
            .field("trader_id", &self.trader_id)
            .field("dir", &self.dir)
            .field("count", &self.count())
            .finish()
    }
}
