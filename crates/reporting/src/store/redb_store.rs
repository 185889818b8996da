//! Redb Store Implementation
//!
//! Embedded store backed by redb. Every cell update runs in its own write
//! transaction on the blocking pool; redb serializes write transactions, so the
//! read-modify-write is atomic per cell. Transient failures are retried with
//! exponential backoff up to the configured budget.

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    config::{RetryConfig, StoreConfig},
    error::{ReportingError, ReportingResult},
};

use super::{ChildCollector, KeyRange, MetricStore, Scan, Snapshot, StorePath, UpdateFn};

/// Table definitions for redb
const CELLS_TABLE: TableDefinition<&str, f64> = TableDefinition::new("cells");

/// Map a redb failure; only I/O failures are worth retrying
fn redb_error(operation: &str, err: impl Into<redb::Error>) -> ReportingError {
    let err: redb::Error = err.into();
    if matches!(err, redb::Error::Io(_)) {
        ReportingError::store_transient(operation, err.to_string())
    } else {
        ReportingError::store(operation, err.to_string())
    }
}

/// Redb-backed store
#[derive(Debug)]
pub struct RedbStore {
    /// redb database instance
    database: Arc<Database>,

    /// Retry policy for write transactions
    retry: RetryConfig,

    /// Transactions slower than this are logged
    slow_transaction: Duration,
}

impl RedbStore {
    /// Open a redb store
    ///
    /// Uses the in-memory backend when no database path is configured.
    ///
    /// # Errors
    ///
    /// Returns error if database initialization fails
    pub async fn open(config: &StoreConfig) -> ReportingResult<Self> {
        let cache_size = usize::try_from(config.cache_size_bytes).unwrap_or(64 * 1024 * 1024);

        let database = if let Some(ref path) = config.database_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ReportingError::store(
                        "create_directory",
                        format!("Failed to create directory {}: {}", parent.display(), e),
                    )
                })?;
            }

            let database = Database::builder()
                .set_cache_size(cache_size)
                .create(path)
                .map_err(|e| {
                    ReportingError::store(
                        "database_open",
                        format!("Failed to open database {}: {}", path.display(), e),
                    )
                })?;
            tracing::info!("Opened redb store at {}", path.display());
            database
        } else {
            let database = Database::builder()
                .set_cache_size(cache_size)
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .map_err(|e| {
                    ReportingError::store(
                        "database_open",
                        format!("Failed to create in-memory database: {e}"),
                    )
                })?;
            tracing::info!("Opened in-memory redb store");
            database
        };

        // Initialize tables
        let write_txn = database
            .begin_write()
            .map_err(|e| redb_error("begin_write", e))?;
        {
            let _cells_table = write_txn
                .open_table(CELLS_TABLE)
                .map_err(|e| redb_error("open_cells_table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| redb_error("commit_init", e))?;

        Ok(Self {
            database: Arc::new(database),
            retry: config.retry.clone(),
            slow_transaction: Duration::from_millis(config.slow_transaction_warn_ms),
        })
    }

    /// Run one read-modify-write in a dedicated write transaction
    fn apply_once(database: &Database, key: &str, update: &UpdateFn) -> ReportingResult<f64> {
        let write_txn = database
            .begin_write()
            .map_err(|e| redb_error("begin_write", e))?;

        let next = {
            let mut table = write_txn
                .open_table(CELLS_TABLE)
                .map_err(|e| redb_error("open_table", e))?;

            let current = table
                .get(key)
                .map_err(|e| redb_error("get", e))?
                .map(|guard| guard.value());
            let next = update(current);

            table
                .insert(key, next)
                .map_err(|e| redb_error("insert", e))?;
            next
        };

        write_txn
            .commit()
            .map_err(|e| redb_error("commit", e))?;
        Ok(next)
    }

    /// Run a closure against the database on the blocking pool
    async fn blocking<T, F>(&self, operation: &'static str, task: F) -> ReportingResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> ReportingResult<T> + Send + 'static,
    {
        let database = Arc::clone(&self.database);
        tokio::task::spawn_blocking(move || task(&database))
            .await
            .map_err(|e| ReportingError::internal(format!("{operation} task failed: {e}")))?
    }

    /// Delay before the given retry attempt (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)] // Millisecond delays are small
        let delay_ms = self.retry.initial_delay_ms as f64 * self.retry.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped below
        let delay_ms = delay_ms.min(self.retry.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
impl MetricStore for RedbStore {
    async fn transaction(&self, path: &StorePath, update: UpdateFn) -> ReportingResult<f64> {
        let key = path.encode();
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let start = Instant::now();

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let task_key = key.clone();
            let task_update = Arc::clone(&update);
            let result = self
                .blocking("transaction", move |database| {
                    Self::apply_once(database, &task_key, &task_update)
                })
                .await;

            match result {
                Ok(next) => {
                    let duration = start.elapsed();
                    if duration >= self.slow_transaction {
                        tracing::warn!("Redb transaction on {} took {:?}", path, duration);
                    }
                    tracing::trace!("Redb store committed {} = {}", path, next);
                    return Ok(next);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!("Redb transaction on {} exhausted retries: {}", path, err);
                    return Err(ReportingError::transaction_aborted(
                        path.to_string(),
                        attempt,
                        err,
                    ));
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "Redb transaction on {} failed (attempt {}/{}), retrying in {:?}: {}",
                        path,
                        attempt,
                        max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn get(&self, path: &StorePath) -> ReportingResult<Option<f64>> {
        let key = path.encode();
        self.blocking("get", move |database| {
            let read_txn = database
                .begin_read()
                .map_err(|e| redb_error("begin_read", e))?;
            let table = read_txn
                .open_table(CELLS_TABLE)
                .map_err(|e| redb_error("open_table", e))?;
            let value = table
                .get(key.as_str())
                .map_err(|e| redb_error("get", e))?
                .map(|guard| guard.value());
            Ok(value)
        })
        .await
    }

    async fn range(&self, parent: &StorePath, range: &KeyRange) -> ReportingResult<Vec<Snapshot>> {
        let parent = parent.clone();
        let range = range.clone();
        self.blocking("range", move |database| {
            let read_txn = database
                .begin_read()
                .map_err(|e| redb_error("begin_read", e))?;
            let table = read_txn
                .open_table(CELLS_TABLE)
                .map_err(|e| redb_error("open_table", e))?;

            let mut collector = ChildCollector::new(&parent, &range);
            let mut cursor = collector.scan_start();
            loop {
                let mut seek = None;
                let entries = table
                    .range(cursor.as_str()..)
                    .map_err(|e| redb_error("range", e))?;
                for entry in entries {
                    let (key, value) = entry.map_err(|e| redb_error("range", e))?;
                    match collector.push(key.value(), value.value()) {
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
            Ok(collector.finish())
        })
        .await
    }

    async fn health_check(&self) -> ReportingResult<()> {
        self.blocking("health_check", |database| {
            let read_txn = database
                .begin_read()
                .map_err(|e| redb_error("health_check_read", e))?;
            let _table = read_txn
                .open_table(CELLS_TABLE)
                .map_err(|e| redb_error("health_check_table", e))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use tempfile::TempDir;

    fn in_memory_config() -> StoreConfig {
        StoreConfig {
            backend: StoreBackend::Redb,
            database_path: None,
            ..Default::default()
        }
    }

    fn sum(raw: f64) -> UpdateFn {
        Arc::new(move |current: Option<f64>| current.unwrap_or(0.0) + raw)
    }

    #[tokio::test]
    async fn test_transaction_and_get() -> ReportingResult<()> {
        let store = RedbStore::open(&in_memory_config()).await?;
        let path = StorePath::root().child("default").child("default").child("value~sum");

        assert_eq!(store.get(&path).await?, None);
        store.transaction(&path, sum(50.0)).await?;
        store.transaction(&path, sum(2.0)).await?;
        assert_eq!(store.get(&path).await?, Some(52.0));
        store.health_check().await
    }

    #[tokio::test]
    async fn test_range_read() -> ReportingResult<()> {
        let store = RedbStore::open(&in_memory_config()).await?;
        let parent = StorePath::root().child("default").child("default").child("retainers").child("second");
        for bucket in ["2026-10-16T09:59:58", "2026-10-16T09:59:59", "2026-10-16T10:00:00"] {
            store
                .transaction(&parent.child(bucket).child("value~sum"), sum(1.0))
                .await?;
        }

        let snapshots = store
            .range(&parent, &KeyRange::between("2026-10-16T09:59:59", "2026-10-16T10:00:00"))
            .await?;
        let keys: Vec<&str> = snapshots.iter().map(Snapshot::key).collect();
        assert_eq!(keys, vec!["2026-10-16T09:59:59", "2026-10-16T10:00:00"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() -> ReportingResult<()> {
        let temp_dir = TempDir::new()?;
        let config = StoreConfig {
            backend: StoreBackend::Redb,
            database_path: Some(temp_dir.path().join("reporting").join("cells.redb")),
            ..Default::default()
        };
        let path = StorePath::root().child("custom").child("abc").child("default").child("value~diff");

        {
            let store = RedbStore::open(&config).await?;
            store.transaction(&path, Arc::new(|_: Option<f64>| 23.0)).await?;
        }

        let reopened = RedbStore::open(&config).await?;
        assert_eq!(reopened.get(&path).await?, Some(23.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_deterministic_failure_is_not_retried() -> ReportingResult<()> {
        let database = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| redb_error("create", e))?;
        let mismatched: TableDefinition<&str, u64> = TableDefinition::new("cells");
        let write_txn = database
            .begin_write()
            .map_err(|e| redb_error("begin_write", e))?;
        {
            let _table = write_txn
                .open_table(mismatched)
                .map_err(|e| redb_error("open_table", e))?;
        }
        write_txn.commit().map_err(|e| redb_error("commit", e))?;

        // a retry would sleep for a minute
        let store = RedbStore {
            database: Arc::new(database),
            retry: RetryConfig {
                max_retries: 5,
                initial_delay_ms: 60_000,
                max_delay_ms: 60_000,
                backoff_multiplier: 1.0,
            },
            slow_transaction: Duration::from_millis(10),
        };
        let result = store
            .transaction(&StorePath::root().child("value~sum"), sum(1.0))
            .await;
        assert!(matches!(
            result,
            Err(ReportingError::Store {
                transient: false,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_backoff_is_capped() {
        let store_retry = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        };
        let database = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new());
        let Ok(database) = database else {
            return;
        };
        let store = RedbStore {
            database: Arc::new(database),
            retry: store_retry,
            slow_transaction: Duration::from_millis(10),
        };
        assert_eq!(store.backoff(1), Duration::from_millis(10));
        assert_eq!(store.backoff(2), Duration::from_millis(20));
        assert_eq!(store.backoff(4), Duration::from_millis(50));
    }
}
