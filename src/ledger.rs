use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::{fs, io, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("ledger at {path} is not valid json: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key-value storage for cooldown deadlines (unix seconds).
pub trait CooldownStore: Send {
    fn get(&self, sku: &str) -> Option<i64>;
    /// Sets the same deadline for every SKU in one write.
    fn set_many(&mut self, skus: &[&str], until: i64) -> Result<(), LedgerError>;
    /// Keeps only entries for which `keep` returns true; returns how many were removed.
    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, LedgerError>;
    fn len(&self) -> usize;
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, i64>,
}

#[cfg(test)]
impl CooldownStore for MemoryStore {
    fn get(&self, sku: &str) -> Option<i64> {
        self.entries.get(sku).copied()
    }

    fn set_many(&mut self, skus: &[&str], until: i64) -> Result<(), LedgerError> {
        for sku in skus {
            self.entries.insert(sku.to_string(), until);
        }
        Ok(())
    }

    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, LedgerError> {
        let before = self.entries.len();
        self.entries.retain(|sku, _| keep(sku));
        Ok(before - self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// JSON object on disk, rewritten once per mutation. The in-memory map only
/// changes after the write succeeds. Also reads the older line format
/// (`sku,timestamp` or a bare `sku`, which counts as expired).
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, i64>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => parse_ledger(&text).map_err(|source| LedgerError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };
        debug!(
            target: "cleanup.ledger",
            path = %path.display(),
            entries = entries.len(),
            "ledger loaded"
        );
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, i64>) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, json).map_err(|source| LedgerError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// JSON when the text starts with `{`, otherwise the legacy line format.
fn parse_ledger(text: &str) -> Result<BTreeMap<String, i64>, serde_json::Error> {
    if text.trim_start().starts_with('{') {
        return serde_json::from_str(text);
    }
    let mut entries = BTreeMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (sku, until) = match line.split_once(',') {
            Some((sku, ts)) => (sku.trim(), ts.trim().parse().unwrap_or(0)),
            None => (line, 0),
        };
        entries.insert(sku.to_string(), until);
    }
    if !entries.is_empty() {
        warn!(
            target: "cleanup.ledger",
            entries = entries.len(),
            "read ledger in legacy line format; it will be rewritten as json"
        );
    }
    Ok(entries)
}

impl CooldownStore for JsonFileStore {
    fn get(&self, sku: &str) -> Option<i64> {
        self.entries.get(sku).copied()
    }

    fn set_many(&mut self, skus: &[&str], until: i64) -> Result<(), LedgerError> {
        if skus.is_empty() {
            return Ok(());
        }
        let mut next = self.entries.clone();
        for sku in skus {
            next.insert(sku.to_string(), until);
        }
        self.persist(&next)?;
        self.entries = next;
        Ok(())
    }

    fn retain(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<usize, LedgerError> {
        let mut next = self.entries.clone();
        next.retain(|sku, _| keep(sku));
        let removed = self.entries.len() - next.len();
        if removed > 0 {
            self.persist(&next)?;
            self.entries = next;
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Tracks verified deletions so the same SKU is not retried until its
/// cooldown window has passed.
pub struct CooldownLedger {
    store: Box<dyn CooldownStore>,
    window: Duration,
}

impl CooldownLedger {
    pub fn new(store: Box<dyn CooldownStore>, window: Duration) -> Self {
        Self { store, window }
    }

    #[cfg(test)]
    pub fn in_memory(window: Duration) -> Self {
        Self::new(Box::<MemoryStore>::default(), window)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[cfg(test)]
    pub fn cooldown_until(&self, sku: &str) -> Option<i64> {
        self.store.get(sku)
    }

    pub fn is_in_cooldown(&self, sku: &str, now: DateTime<Utc>) -> bool {
        self.store
            .get(sku)
            .is_some_and(|until| until > now.timestamp())
    }

    /// Has an entry whose deadline has passed: processed before and due for
    /// re-evaluation.
    pub fn is_expired_entry(&self, sku: &str, now: DateTime<Utc>) -> bool {
        self.store
            .get(sku)
            .is_some_and(|until| until <= now.timestamp())
    }

    /// Records SKUs whose removal was confirmed by a catalog re-fetch.
    pub fn record_verified<S: AsRef<str>>(
        &mut self,
        skus: &[S],
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let until = now.timestamp() + self.window.as_secs() as i64;
        let skus: Vec<&str> = skus.iter().map(|sku| sku.as_ref()).collect();
        self.store.set_many(&skus, until)?;
        if !skus.is_empty() {
            info!(
                target: "cleanup.ledger",
                recorded = skus.len(),
                until = until,
                "verified deletions recorded"
            );
        }
        Ok(())
    }

    /// Drops entries for SKUs no longer in the live catalog.
    pub fn prune_absent(&mut self, live: &HashSet<String>) -> Result<usize, LedgerError> {
        let removed = self.store.retain(&|sku| live.contains(sku))?;
        if removed > 0 {
            info!(
                target: "cleanup.ledger",
                removed = removed,
                remaining = self.store.len(),
                "pruned ledger entries absent from catalog"
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn cooldown_expires_after_window() {
        let mut ledger = CooldownLedger::in_memory(Duration::from_secs(3600));
        ledger.record_verified(&["SKU-1"], now()).expect("record");

        assert_eq!(ledger.cooldown_until("SKU-1"), Some(now().timestamp() + 3600));
        assert!(ledger.is_in_cooldown("SKU-1", now()));
        assert!(ledger.is_in_cooldown("SKU-1", now() + TimeDelta::seconds(3599)));
        assert!(!ledger.is_in_cooldown("SKU-1", now() + TimeDelta::seconds(3601)));
        assert!(ledger.is_expired_entry("SKU-1", now() + TimeDelta::seconds(3601)));
        assert!(!ledger.is_in_cooldown("OTHER", now()));
        assert!(!ledger.is_expired_entry("OTHER", now()));
    }

    #[test]
    fn prune_keeps_only_live_skus() {
        let mut ledger = CooldownLedger::in_memory(Duration::from_secs(60));
        ledger
            .record_verified(&["A", "B", "C"], now())
            .expect("record");
        let live: HashSet<String> = ["B".to_string()].into_iter().collect();
        assert_eq!(ledger.prune_absent(&live).expect("prune"), 2);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_in_cooldown("B", now()));
    }

    #[test]
    fn file_store_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("processed_skus.json");

        let store = JsonFileStore::open(&path).expect("open");
        let mut ledger = CooldownLedger::new(Box::new(store), Duration::from_secs(3600));
        ledger.record_verified(&["X-1", "X-2"], now()).expect("record");

        let reopened = JsonFileStore::open(&path).expect("reopen");
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("X-2"), Some(now().timestamp() + 3600));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn file_store_reads_legacy_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_skus.txt");
        fs::write(&path, "OLD-1\nOLD-2,1700003600\n\nOLD-3,garbage\n").expect("write");

        let mut store = JsonFileStore::open(&path).expect("open");
        assert_eq!(store.get("OLD-1"), Some(0));
        assert_eq!(store.get("OLD-2"), Some(1_700_003_600));
        assert_eq!(store.get("OLD-3"), Some(0));

        let removed = store.retain(&|sku| sku != "OLD-3").expect("retain");
        assert_eq!(removed, 1);
        let text = fs::read_to_string(&path).expect("read back");
        let json: BTreeMap<String, i64> = serde_json::from_str(&text).expect("json");
        assert_eq!(json.len(), 2);
    }

    #[test]
    fn failed_write_leaves_entries_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("state");
        fs::create_dir(&state).expect("mkdir");
        let path = state.join("processed_skus.json");
        let mut store = JsonFileStore::open(&path).expect("open");
        store.set_many(&["KEPT"], 10).expect("first write");

        // Replace the directory with a plain file so the next write fails.
        fs::remove_dir_all(&state).expect("rm");
        fs::write(&state, "not a directory").expect("block");

        let err = store.set_many(&["A", "B"], 20).expect_err("write should fail");
        assert!(matches!(err, LedgerError::Io { .. }));
        assert_eq!(store.get("A"), None);
        assert_eq!(store.len(), 1);

        let err = store.retain(&|_| false).expect_err("prune should fail");
        assert!(matches!(err, LedgerError::Io { .. }));
        assert_eq!(store.get("KEPT"), Some(10));
    }

    #[test]
    fn corrupt_json_ledger_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_skus.json");
        fs::write(&path, "{\"SKU-1\": 1700000000, \"SKU-2\":").expect("write");

        let err = JsonFileStore::open(&path).expect_err("corrupt ledger");
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }
}
