//! Store contract and adapters
//!
//! The ordered key-value store is the only shared mutable resource. It must
//! provide hierarchical addressing, an atomic read-modify-write on a single
//! value, and ordered range reads over sibling keys.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::{
    config::{StoreBackend, StoreConfig},
    error::ReportingResult,
};

pub mod memory_store;
#[cfg(feature = "hot-storage")]
pub mod redb_store;

pub use memory_store::{MemoryStore, MemoryStoreStats};
#[cfg(feature = "hot-storage")]
pub use redb_store::RedbStore;

/// Separator used in encoded keys; sorts below every character allowed in a segment
pub(crate) const KEY_SEPARATOR: char = '\u{1f}';

/// First character after `KEY_SEPARATOR`; `{child}{SUBTREE_END}` sorts after the whole subtree of `child`
const SUBTREE_END: char = '\u{20}';

/// Update applied atomically to one cell
pub type UpdateFn = Arc<dyn Fn(Option<f64>) -> f64 + Send + Sync>;

/// Hierarchical address of a node in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The root node
    #[must_use]
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Address a child of this node
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Path segments from the root
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Check whether this is the root node
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Encoded key stored by ordered backends
    #[must_use]
    pub fn encode(&self) -> String {
        let separator = KEY_SEPARATOR.to_string();
        self.segments.join(&separator)
    }

    /// Prefix shared by the encoded keys of every descendant
    #[must_use]
    pub(crate) fn child_prefix(&self) -> String {
        let mut prefix = self.encode();
        if !self.is_root() {
            prefix.push(KEY_SEPARATOR);
        }
        prefix
    }

    /// Rebuild a path from an encoded key
    #[must_use]
    pub fn decode(key: &str) -> Self {
        if key.is_empty() {
            return Self::root();
        }
        Self {
            segments: key.split(KEY_SEPARATOR).map(str::to_string).collect(),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for StorePath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Inclusive bounds on child keys of a range read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Smallest child key returned
    pub start: Option<String>,
    /// Largest child key returned
    pub end: Option<String>,
    /// When set, only the value at this path below each child is read
    pub leaf: Option<StorePath>,
}

impl KeyRange {
    /// Every child
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
            leaf: None,
        }
    }

    /// Children with `start <= key <= end`
    #[must_use]
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            leaf: None,
        }
    }

    /// Read only the value at `leaf` below each child
    ///
    /// Children without a value at `leaf` are left out of the result.
    #[must_use]
    pub fn only_leaf(mut self, leaf: StorePath) -> Self {
        self.leaf = Some(leaf);
        self
    }

    /// Check whether a child key lies within the bounds
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key <= end)
    }

    /// Check whether a child key sorts after the upper bound
    #[must_use]
    pub fn is_past_end(&self, key: &str) -> bool {
        self.end.as_deref().is_some_and(|end| key > end)
    }
}

/// One child returned by a range read, with the values of its subtree
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    key: String,
    leaves: BTreeMap<StorePath, f64>,
}

impl Snapshot {
    /// Child key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value stored at `relative` below this child
    #[must_use]
    pub fn child(&self, relative: &StorePath) -> Option<f64> {
        self.leaves.get(relative).copied()
    }

    /// Number of values in the subtree
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Check whether the subtree holds no values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Next step of an ordered key scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Visit the following key
    Next,
    /// Resume at the first key not below this encoded key
    Seek(String),
    /// No later key can match
    Stop,
}

/// Groups an ordered scan of encoded keys into child snapshots
#[derive(Debug)]
pub(crate) struct ChildCollector<'a> {
    prefix: String,
    range: &'a KeyRange,
    leaf: Option<String>,
    snapshots: Vec<Snapshot>,
}

impl<'a> ChildCollector<'a> {
    pub(crate) fn new(parent: &StorePath, range: &'a KeyRange) -> Self {
        Self {
            prefix: parent.child_prefix(),
            range,
            leaf: range.leaf.as_ref().map(StorePath::encode),
            snapshots: Vec::new(),
        }
    }

    /// First encoded key the scan has to visit
    pub(crate) fn scan_start(&self) -> String {
        let mut start = self.prefix.clone();
        if let Some(ref bound) = self.range.start {
            start.push_str(bound);
        }
        start
    }

    /// Feed the next key of the ordered scan
    pub(crate) fn push(&mut self, encoded: &str, value: f64) -> Scan {
        let Some(rest) = encoded.strip_prefix(self.prefix.as_str()) else {
            return Scan::Stop;
        };
        if rest.is_empty() {
            // value stored on the parent itself
            return Scan::Next;
        }

        let (child, remainder) = rest.split_once(KEY_SEPARATOR).unwrap_or((rest, ""));
        if self.range.is_past_end(child) {
            return Scan::Stop;
        }
        if !self.range.contains(child) {
            return Scan::Next;
        }

        let Some(leaf) = self.leaf.as_deref() else {
            self.insert(child, remainder, value);
            return Scan::Next;
        };
        match remainder.cmp(leaf) {
            Ordering::Less => Scan::Seek(format!("{}{child}{KEY_SEPARATOR}{leaf}", self.prefix)),
            Ordering::Equal => {
                let next = self.after_child(child);
                self.insert(child, remainder, value);
                Scan::Seek(next)
            }
            Ordering::Greater => Scan::Seek(self.after_child(child)),
        }
    }

    /// First encoded key past the subtree of `child`
    fn after_child(&self, child: &str) -> String {
        format!("{}{child}{SUBTREE_END}", self.prefix)
    }

    fn insert(&mut self, child: &str, remainder: &str, value: f64) {
        let relative = StorePath::decode(remainder);
        match self.snapshots.last_mut() {
            Some(snapshot) if snapshot.key == child => {
                snapshot.leaves.insert(relative, value);
            }
            _ => {
                let mut leaves = BTreeMap::new();
                leaves.insert(relative, value);
                self.snapshots.push(Snapshot {
                    key: child.to_string(),
                    leaves,
                });
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<Snapshot> {
        self.snapshots
    }
}

/// Store contract consumed by the writer and the query resolver
#[async_trait]
pub trait MetricStore: Send + Sync + fmt::Debug {
    /// Atomically replace the value at `path` with `update(current)`
    ///
    /// Conflicting writers are retried by the store until the update commits
    /// or its retry budget is exhausted.
    async fn transaction(&self, path: &StorePath, update: UpdateFn) -> ReportingResult<f64>;

    /// One-shot read of the value at `path`
    async fn get(&self, path: &StorePath) -> ReportingResult<Option<f64>>;

    /// Ordered read of the children of `parent` whose keys fall within `range`
    ///
    /// With a leaf projection each snapshot holds at most that one value.
    async fn range(&self, parent: &StorePath, range: &KeyRange) -> ReportingResult<Vec<Snapshot>>;

    /// Health check
    async fn health_check(&self) -> ReportingResult<()>;
}

/// Open the store selected by the configuration
///
/// # Errors
///
/// Returns error if the backend is unavailable or fails to open
pub async fn open(config: &StoreConfig) -> ReportingResult<Arc<dyn MetricStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-process memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "hot-storage")]
        StoreBackend::Redb => Ok(Arc::new(RedbStore::open(config).await?)),
        #[cfg(not(feature = "hot-storage"))]
        StoreBackend::Redb => Err(crate::error::ReportingError::configuration(
            "The redb backend requires the 'hot-storage' feature",
        )),
    }
}
