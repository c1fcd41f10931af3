use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::{PartitionKey, Result, StoreError};
use crate::query::QueryFilter;
use crate::storage::batch::{BatchOp, TransactionalBatch};
use crate::storage::document::{Document, PatchOp};

/// Hard ceiling on operations per transactional batch, imposed by the
/// atomic-batch mechanism. Callers writing more must chunk.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// One committed mutation, as observed by the change feed.
#[derive(Debug, Clone)]
pub(crate) struct ChangeEntry {
    pub seq: u64,
    pub partition_key: PartitionKey,
    pub document: Document,
}

#[derive(Debug, Default)]
struct Partition {
    items: BTreeMap<String, Document>,
}

#[derive(Debug, Default)]
pub(crate) struct ContainerState {
    partitions: HashMap<String, Partition>,
    pub(crate) change_log: Vec<ChangeEntry>,
    next_seq: u64,
}

impl ContainerState {
    /// Stamp store-owned metadata and append the write to the change log.
    fn commit(&mut self, mut doc: Document) -> Document {
        self.next_seq += 1;
        doc.seq = self.next_seq;
        doc.etag = self.next_seq;
        doc.ts = Utc::now().timestamp();

        self.change_log.push(ChangeEntry {
            seq: doc.seq,
            partition_key: doc.partition_key.clone(),
            document: doc.clone(),
        });
        self.partitions
            .entry(doc.partition_key.as_str().to_string())
            .or_default()
            .items
            .insert(doc.id.clone(), doc.clone());
        doc
    }
}

/// Point-in-time counters for a container.
#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub item_count: usize,
    pub batch_commits: u64,
}

/// A partitioned document container.
///
/// Writes within one partition are linearizable: every mutation takes the
/// container write lock, and a transactional batch validates fully before it
/// applies, so readers observe either the pre-write or the fully-post-write
/// state.
#[derive(Clone)]
pub struct Container {
    name: String,
    partition_key_path: String,
    pub(crate) state: Arc<RwLock<ContainerState>>,
    batch_commits: Arc<AtomicU64>,
}

impl Container {
    pub(crate) fn new(name: impl Into<String>, partition_key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key_path: partition_key_path.into(),
            state: Arc::new(RwLock::new(ContainerState::default())),
            batch_commits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_key_path(&self) -> &str {
        &self.partition_key_path
    }

    /// Check a body against the partition it is being written to.
    fn validate_partition(&self, doc: &Document, partition_key: &PartitionKey) -> Result<()> {
        match doc.path_value(&self.partition_key_path) {
            Some(value) if value == partition_key.as_str() => Ok(()),
            Some(value) => Err(StoreError::InvalidArgument(format!(
                "document '{}' carries partition key '{}' but was addressed to partition '{}'",
                doc.id, value, partition_key
            ))),
            None => Err(StoreError::InvalidArgument(format!(
                "document '{}' is missing partition key field '{}'",
                doc.id, self.partition_key_path
            ))),
        }
    }

    /// Create a new item. Fails with Conflict if the id already exists in the
    /// partition (soft-deleted items still occupy their id).
    pub async fn create_item(&self, partition_key: PartitionKey, body: Value) -> Result<Document> {
        let doc = Document::new(partition_key.clone(), body)?;
        self.validate_partition(&doc, &partition_key)?;

        let mut state = self.state.write().await;
        if let Some(partition) = state.partitions.get(partition_key.as_str())
            && partition.items.contains_key(&doc.id)
        {
            return Err(StoreError::Conflict(
                doc.id.clone(),
                partition_key.as_str().to_string(),
            ));
        }
        Ok(state.commit(doc))
    }

    /// Create or overwrite an item. Idempotent by id.
    pub async fn upsert_item(&self, partition_key: PartitionKey, body: Value) -> Result<Document> {
        let doc = Document::new(partition_key.clone(), body)?;
        self.validate_partition(&doc, &partition_key)?;

        let mut state = self.state.write().await;
        Ok(state.commit(doc))
    }

    /// Replace an item only if the caller's etag still matches the stored
    /// one. The optimistic-concurrency primitive the lease machinery is built
    /// on.
    pub async fn replace_item_if(
        &self,
        partition_key: PartitionKey,
        id: &str,
        body: Value,
        etag: u64,
    ) -> Result<Document> {
        let doc = Document::new(partition_key.clone(), body)?;
        self.validate_partition(&doc, &partition_key)?;
        if doc.id != id {
            return Err(StoreError::InvalidArgument(format!(
                "replacement body id '{}' does not match target id '{id}'",
                doc.id
            )));
        }

        let mut state = self.state.write().await;
        let current = state
            .partitions
            .get(partition_key.as_str())
            .and_then(|p| p.items.get(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string(), partition_key.to_string()))?;
        if current.etag != etag {
            return Err(StoreError::PreconditionFailed(id.to_string()));
        }
        Ok(state.commit(doc))
    }

    /// Point read by id. Returns soft-deleted items too; visibility filtering
    /// belongs to queries, not point reads.
    pub async fn read_item(&self, partition_key: &PartitionKey, id: &str) -> Result<Document> {
        let state = self.state.read().await;
        state
            .partitions
            .get(partition_key.as_str())
            .and_then(|p| p.items.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string(), partition_key.to_string()))
    }

    /// Partial update of stored fields. The read-modify-write happens under
    /// the container write lock, so concurrent patches of different fields
    /// cannot lose each other's writes.
    pub async fn patch_item(
        &self,
        partition_key: &PartitionKey,
        id: &str,
        ops: &[PatchOp],
    ) -> Result<Document> {
        let mut state = self.state.write().await;
        let mut doc = state
            .partitions
            .get(partition_key.as_str())
            .and_then(|p| p.items.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string(), partition_key.to_string()))?;

        for op in ops {
            op.apply(&mut doc.body)?;
        }
        Ok(state.commit(doc))
    }

    /// Filtered scan. Pinned to one partition when the filter names one,
    /// otherwise a cross-partition scan.
    pub async fn query(&self, filter: &QueryFilter) -> Result<Vec<Document>> {
        let state = self.state.read().await;
        let mut results: Vec<Document> = match filter.partition_key() {
            Some(key) => state
                .partitions
                .get(key.as_str())
                .map(|p| p.items.values().filter(|d| filter.matches(d)).cloned().collect())
                .unwrap_or_default(),
            None => state
                .partitions
                .values()
                .flat_map(|p| p.items.values())
                .filter(|d| filter.matches(d))
                .cloned()
                .collect(),
        };
        filter.sort(&mut results);
        Ok(results)
    }

    /// Start a transactional batch against one partition.
    pub fn batch(&self, partition_key: PartitionKey) -> TransactionalBatch {
        TransactionalBatch::new(self.clone(), partition_key)
    }

    /// All-or-nothing commit of a validated batch. Called by
    /// [`TransactionalBatch::execute`].
    pub(crate) async fn commit_batch(
        &self,
        partition_key: PartitionKey,
        ops: Vec<BatchOp>,
    ) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if ops.len() > MAX_BATCH_OPERATIONS {
            return Err(StoreError::InvalidArgument(format!(
                "batch of {} operations exceeds the {MAX_BATCH_OPERATIONS}-operation limit",
                ops.len()
            )));
        }

        // Validate every operation before touching state.
        let mut docs = Vec::with_capacity(ops.len());
        for op in &ops {
            let doc = Document::new(partition_key.clone(), op.body().clone())?;
            self.validate_partition(&doc, &partition_key)?;
            docs.push(doc);
        }

        let mut state = self.state.write().await;

        // Conflict checks against current state; nothing has mutated yet, so
        // a failure here aborts the whole batch with no partial writes.
        for (op, doc) in ops.iter().zip(&docs) {
            if matches!(op, BatchOp::Create(_))
                && let Some(partition) = state.partitions.get(partition_key.as_str())
                && partition.items.contains_key(&doc.id)
            {
                return Err(StoreError::Conflict(
                    doc.id.clone(),
                    partition_key.as_str().to_string(),
                ));
            }
        }

        for doc in docs {
            state.commit(doc);
        }
        self.batch_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stats(&self) -> ContainerStats {
        let state = self.state.read().await;
        ContainerStats {
            item_count: state.partitions.values().map(|p| p.items.len()).sum(),
            batch_commits: self.batch_commits.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sessions_container() -> Container {
        Container::new("sessions", "/sessionId")
    }

    #[tokio::test]
    async fn test_create_read_and_conflict() {
        let container = sessions_container();
        let pk = PartitionKey::from("s-1");

        let created = container
            .create_item(pk.clone(), json!({"id": "s-1", "sessionId": "s-1"}))
            .await
            .unwrap();
        assert!(created.seq > 0);

        let read = container.read_item(&pk, "s-1").await.unwrap();
        assert_eq!(read.body, created.body);

        let dup = container
            .create_item(pk.clone(), json!({"id": "s-1", "sessionId": "s-1"}))
            .await;
        assert!(matches!(dup, Err(StoreError::Conflict(_, _))));
    }

    #[tokio::test]
    async fn test_write_rejects_mismatched_partition() {
        let container = sessions_container();
        let result = container
            .upsert_item(
                PartitionKey::from("s-1"),
                json!({"id": "m-1", "sessionId": "s-2"}),
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_replace_item_if_enforces_etag() {
        let container = Container::new("leases", "/id");
        let pk = PartitionKey::from("l-1");
        let doc = container
            .upsert_item(pk.clone(), json!({"id": "l-1", "owner": "a"}))
            .await
            .unwrap();

        // Stale etag loses.
        let stale = container
            .replace_item_if(
                pk.clone(),
                "l-1",
                json!({"id": "l-1", "owner": "b"}),
                doc.etag + 1,
            )
            .await;
        assert!(matches!(stale, Err(StoreError::PreconditionFailed(_))));

        // Current etag wins.
        let replaced = container
            .replace_item_if(pk.clone(), "l-1", json!({"id": "l-1", "owner": "b"}), doc.etag)
            .await
            .unwrap();
        assert_eq!(replaced.body["owner"], "b");
    }

    #[tokio::test]
    async fn test_batch_commit_counts() {
        let container = sessions_container();
        let pk = PartitionKey::from("s-1");

        container
            .batch(pk.clone())
            .upsert_item(json!({"id": "a", "sessionId": "s-1"}))
            .upsert_item(json!({"id": "b", "sessionId": "s-1"}))
            .execute()
            .await
            .unwrap();

        let stats = container.stats().await;
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.batch_commits, 1);
    }
}
