//! Memory Store Implementation
//!
//! In-process ordered store. Keys are kept in a `BTreeMap` so range reads visit
//! siblings in key order; each transaction runs under the write guard, which
//! makes the read-modify-write atomic without any retry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ReportingResult;

use super::{ChildCollector, KeyRange, MetricStore, Scan, Snapshot, StorePath, UpdateFn};

/// Internal store statistics
#[derive(Debug, Clone, Copy, Default)]
struct InternalStoreStats {
    transactions: u64,
    reads: u64,
    range_reads: u64,
    keys_scanned: u64,
}

/// Memory store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Number of committed transactions
    pub transactions: u64,
    /// Number of single value reads
    pub reads: u64,
    /// Number of range reads
    pub range_reads: u64,
    /// Number of keys visited by range reads
    pub keys_scanned: u64,
    /// Number of stored cells
    pub cells: u64,
}

/// In-process ordered store
#[derive(Debug, Default)]
pub struct MemoryStore {
    cells: Arc<parking_lot::RwLock<BTreeMap<String, f64>>>,
    stats: Arc<parking_lot::Mutex<InternalStoreStats>>,
}

impl MemoryStore {
    /// Create an empty memory store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get store statistics
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        let stats = *self.stats.lock();
        MemoryStoreStats {
            transactions: stats.transactions,
            reads: stats.reads,
            range_reads: stats.range_reads,
            keys_scanned: stats.keys_scanned,
            cells: self.cells.read().len() as u64,
        }
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn transaction(&self, path: &StorePath, update: UpdateFn) -> ReportingResult<f64> {
        let key = path.encode();
        let next = {
            let mut cells = self.cells.write();
            let next = update(cells.get(&key).copied());
            cells.insert(key, next);
            next
        };

        self.stats.lock().transactions += 1;
        tracing::trace!("Memory store committed {} = {}", path, next);
        Ok(next)
    }

    async fn get(&self, path: &StorePath) -> ReportingResult<Option<f64>> {
        let value = self.cells.read().get(&path.encode()).copied();
        self.stats.lock().reads += 1;
        Ok(value)
    }

    async fn range(&self, parent: &StorePath, range: &KeyRange) -> ReportingResult<Vec<Snapshot>> {
        let mut collector = ChildCollector::new(parent, range);
        let mut scanned = 0_u64;
        {
            let cells = self.cells.read();
            let mut cursor = collector.scan_start();
            loop {
                let mut seek = None;
                for (key, value) in cells.range(cursor..) {
                    scanned += 1;
                    match collector.push(key, *value) {
                        Scan::Next => {}
                        Scan::Seek(next) => {
                            seek = Some(next);
                            break;
                        }
                        Scan::Stop => break,
                    }
                }
                match seek {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.range_reads += 1;
            stats.keys_scanned += scanned;
        }
        Ok(collector.finish())
    }

    async fn health_check(&self) -> ReportingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(raw: f64) -> UpdateFn {
        Arc::new(move |current: Option<f64>| current.unwrap_or(0.0) + raw)
    }

    #[tokio::test]
    async fn test_transaction_and_get() -> ReportingResult<()> {
        let store = MemoryStore::new();
        let path = StorePath::root().child("default").child("default").child("value~sum");

        assert_eq!(store.get(&path).await?, None);
        assert_eq!(store.transaction(&path, sum(50.0)).await?, 50.0);
        assert_eq!(store.transaction(&path, sum(7.0)).await?, 57.0);
        assert_eq!(store.get(&path).await?, Some(57.0));

        let stats = store.stats();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.cells, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_transactions_are_atomic() -> ReportingResult<()> {
        let store = Arc::new(MemoryStore::new());
        let path = StorePath::root().child("counter");

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store.transaction(&path, sum(1.0)).await
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| crate::error::ReportingError::internal(e.to_string()))??;
        }

        assert_eq!(store.get(&path).await?, Some(64.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_range_is_ordered_and_inclusive() -> ReportingResult<()> {
        let store = MemoryStore::new();
        let parent = StorePath::root().child("f").child("k").child("retainers").child("minute");
        for (bucket, raw) in [
            ("2026-10-16T09:58", 1.0),
            ("2026-10-16T09:59", 2.0),
            ("2026-10-16T10:00", 3.0),
            ("2026-10-16T10:01", 4.0),
        ] {
            store
                .transaction(&parent.child(bucket).child("value~sum"), sum(raw))
                .await?;
        }
        // sibling retainer must not leak into the read
        store
            .transaction(
                &StorePath::root().child("f").child("k").child("retainers").child("second").child("x"),
                sum(9.0),
            )
            .await?;

        let snapshots = store
            .range(&parent, &KeyRange::between("2026-10-16T09:59", "2026-10-16T10:00"))
            .await?;
        let keys: Vec<&str> = snapshots.iter().map(Snapshot::key).collect();
        assert_eq!(keys, vec!["2026-10-16T09:59", "2026-10-16T10:00"]);

        let leaf = StorePath::root().child("value~sum");
        assert_eq!(snapshots[1].child(&leaf), Some(3.0));

        let all = store.range(&parent, &KeyRange::all()).await?;
        assert_eq!(all.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_leaf_projection_ignores_retained_history() -> ReportingResult<()> {
        let root = StorePath::root().child("custom");
        let leaf = StorePath::root().child("default").child("value~sum");
        let range = KeyRange::all().only_leaf(leaf.clone());

        let mut scanned_per_read = Vec::new();
        for buckets in [10_u32, 2_000] {
            let store = MemoryStore::new();
            for instance in ["k1", "k2"] {
                let node = root.child(instance);
                store.transaction(&node.child("default").child("value~sum"), sum(5.0)).await?;
                for second in 0..buckets {
                    let bucket = format!("2026-10-16T{:02}:{:02}:{:02}", second / 3600, second / 60 % 60, second % 60);
                    store
                        .transaction(
                            &node.child("retainers").child("second").child(bucket).child("value~sum"),
                            sum(1.0),
                        )
                        .await?;
                }
            }

            let snapshots = store.range(&root, &range).await?;
            assert_eq!(snapshots.len(), 2);
            assert!(snapshots.iter().all(|snapshot| snapshot.len() == 1));
            assert!(snapshots.iter().all(|snapshot| snapshot.child(&leaf) == Some(5.0)));
            scanned_per_read.push(store.stats().keys_scanned);
        }

        assert_eq!(scanned_per_read[0], scanned_per_read[1]);
        Ok(())
    }
}
