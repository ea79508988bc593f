use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        key: String,
        data: Value,
    },
    Delete {
        collection: String,
        key: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. } | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch of {size} operations exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed collection file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Keyed document collections with the handful of query shapes the sync jobs need.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn max_batch_ops(&self) -> usize;

    async fn query_by_equality(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Documents whose string `field` sorts at or after `from`.
    async fn query_field_from(
        &self,
        collection: &str,
        field: &str,
        from: &str,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    async fn get_by_key(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Validates the whole batch before writing anything. Each collection is replaced
    /// atomically; callers split work into chunks of `max_batch_ops`.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    async fn query_by_date(
        &self,
        collection: &str,
        date: NaiveDate,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let value = Value::String(date.format("%Y-%m-%d").to_string());
        self.query_by_equality(collection, "date", &value).await
    }

    async fn query_date_from(
        &self,
        collection: &str,
        from: NaiveDate,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let from = from.format("%Y-%m-%d").to_string();
        self.query_field_from(collection, "date", &from).await
    }
}

type Collection = BTreeMap<String, Value>;

fn check_batch(ops: &[WriteOp], limit: usize) -> Result<(), StoreError> {
    if ops.len() > limit {
        return Err(StoreError::BatchTooLarge {
            size: ops.len(),
            limit,
        });
    }
    Ok(())
}

fn apply_op(collection: &mut Collection, op: WriteOp) {
    match op {
        WriteOp::Set { key, data, .. } => {
            collection.insert(key, data);
        }
        WriteOp::Delete { key, .. } => {
            collection.remove(&key);
        }
    }
}

fn equality_matches(collection: &Collection, field: &str, value: &Value) -> Vec<StoredDocument> {
    collection
        .iter()
        .filter(|(_, doc)| doc.get(field) == Some(value))
        .map(|(key, doc)| StoredDocument {
            key: key.clone(),
            data: doc.clone(),
        })
        .collect()
}

fn range_matches(collection: &Collection, field: &str, from: &str) -> Vec<StoredDocument> {
    collection
        .iter()
        .filter(|(_, doc)| doc.get(field).and_then(Value::as_str).is_some_and(|v| v >= from))
        .map(|(key, doc)| StoredDocument {
            key: key.clone(),
            data: doc.clone(),
        })
        .collect()
}

#[derive(Debug)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, Collection>>,
    max_batch_ops: usize,
    committed_ops: AtomicUsize,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_OPS)
    }
}

impl MemoryDocumentStore {
    pub fn new(max_batch_ops: usize) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            max_batch_ops: max_batch_ops.max(1),
            committed_ops: AtomicUsize::new(0),
        }
    }

    /// Total number of write operations applied so far.
    pub fn committed_ops(&self) -> usize {
        self.committed_ops.load(Ordering::SeqCst)
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }

    async fn query_by_equality(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|c| equality_matches(c, field, value))
            .unwrap_or_default())
    }

    async fn query_field_from(
        &self,
        collection: &str,
        field: &str,
        from: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|c| range_matches(c, field, from))
            .unwrap_or_default())
    }

    async fn get_by_key(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        check_batch(&ops, self.max_batch_ops)?;
        let count = ops.len();
        let mut guard = self.collections.write().await;
        for op in ops {
            let collection = guard.entry(op.collection().to_string()).or_default();
            apply_op(collection, op);
        }
        self.committed_ops.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }
}

/// One pretty-printed JSON object per collection under `root`, replaced atomically on write.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    max_batch_ops: usize,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn load(&self, collection: &str) -> Result<Collection, StoreError> {
        let path = self.collection_path(collection);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Malformed { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Collection::new()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Writes `docs` to a hidden temp file beside the collection, removing it on failure.
    async fn stage(&self, collection: &str, docs: &Collection) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(docs)?;
        let tmp_path = self
            .root
            .join(format!(".{collection}.{}.tmp", Uuid::new_v4()));
        if let Err(err) = write_new(&tmp_path, &bytes).await {
            discard(std::slice::from_ref(&tmp_path)).await;
            return Err(err);
        }
        Ok(tmp_path)
    }
}

async fn write_new(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

async fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "temp file not removed");
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }

    async fn query_by_equality(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(equality_matches(&self.load(collection).await?, field, value))
    }

    async fn query_field_from(
        &self,
        collection: &str,
        field: &str,
        from: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(range_matches(&self.load(collection).await?, field, from))
    }

    async fn get_by_key(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.load(collection).await?.remove(key))
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        check_batch(&ops, self.max_batch_ops)?;
        let _guard = self.write_lock.lock().await;

        let mut touched: BTreeMap<String, Collection> = BTreeMap::new();
        for op in ops {
            let name = op.collection().to_string();
            if !touched.contains_key(&name) {
                let loaded = self.load(&name).await?;
                touched.insert(name.clone(), loaded);
            }
            if let Some(collection) = touched.get_mut(&name) {
                apply_op(collection, op);
            }
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;

        // Stage every collection before renaming any of them.
        let mut staged = Vec::with_capacity(touched.len());
        for (name, docs) in &touched {
            match self.stage(name, docs).await {
                Ok(tmp_path) => staged.push(tmp_path),
                Err(err) => {
                    discard(&staged).await;
                    return Err(err);
                }
            }
        }

        for (i, (tmp_path, (name, docs))) in staged.iter().zip(&touched).enumerate() {
            let final_path = self.collection_path(name);
            if let Err(source) = tokio::fs::rename(tmp_path, &final_path).await {
                discard(&staged[i..]).await;
                return Err(StoreError::Io {
                    path: final_path,
                    source,
                });
            }
            debug!(
                collection = %name,
                docs = docs.len(),
                path = %final_path.display(),
                "collection persisted"
            );
        }
        Ok(())
    }
}
