//! Ledger of mappings that move bytes through host memory instead of
//! sharing them.
//!
//! Zero-copy mappers never touch a ledger.  Upload and download mappers
//! report every copy through [`host_copy!`](crate::host_copy), which compiles
//! away unless the calling crate enables `audit-zero-copy`; without it the
//! ledgers of that crate stay empty.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::types::MemoryType;

/// One copying mapper, identified by name and by the memory types it joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CopyPath {
    pub mapper: &'static str,
    pub input: MemoryType,
    pub output: MemoryType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyTotals {
    pub copies: u64,
    pub bytes: u64,
}

/// Per-path copy counters, owned by whatever device the copies run on.
#[derive(Debug, Default)]
pub struct CopyLedger {
    paths: Mutex<BTreeMap<CopyPath, CopyTotals>>,
}

impl CopyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one copy of `bytes` along `path`.  The first copy on each path
    /// is logged as a warning.
    pub fn record(&self, path: CopyPath, bytes: usize) {
        let mut paths = self.paths.lock();
        let totals = paths.entry(path).or_default();
        if totals.copies == 0 {
            warn!(
                mapper = path.mapper,
                input = %path.input,
                output = %path.output,
                bytes,
                "Mapping copies through host memory"
            );
        }
        totals.copies += 1;
        totals.bytes += bytes as u64;
    }

    pub fn totals(&self, path: &CopyPath) -> CopyTotals {
        self.paths.lock().get(path).copied().unwrap_or_default()
    }

    /// Every path copied so far, ordered by mapper name.
    pub fn snapshot(&self) -> Vec<(CopyPath, CopyTotals)> {
        self.paths.lock().iter().map(|(path, totals)| (*path, *totals)).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.paths.lock().values().map(|totals| totals.bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }

    /// Log one line per copied path.
    pub fn report(&self, device: &str) {
        for (path, totals) in self.snapshot() {
            info!(
                device,
                mapper = path.mapper,
                input = %path.input,
                output = %path.output,
                copies = totals.copies,
                copied_kb = totals.bytes / 1024,
                "Host copy path"
            );
        }
    }
}
