use serde_json::Value;

use crate::core::{PartitionKey, Result};
use crate::storage::container::Container;

/// One operation queued in a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Fails the whole batch with Conflict if the id already exists.
    Create(Value),
    /// Creates or overwrites.
    Upsert(Value),
}

impl BatchOp {
    pub(crate) fn body(&self) -> &Value {
        match self {
            BatchOp::Create(body) | BatchOp::Upsert(body) => body,
        }
    }
}

/// Builder for an atomic multi-item write against one partition.
///
/// Operations are queued locally; nothing reaches the container until
/// [`execute`](Self::execute), which validates the whole batch (operation
/// count, partition-key agreement, create conflicts) and then applies it as
/// one indivisible unit. Either every queued operation becomes visible or
/// none does.
pub struct TransactionalBatch {
    container: Container,
    partition_key: PartitionKey,
    ops: Vec<BatchOp>,
}

impl TransactionalBatch {
    pub(crate) fn new(container: Container, partition_key: PartitionKey) -> Self {
        Self {
            container,
            partition_key,
            ops: Vec::new(),
        }
    }

    pub fn create_item(mut self, body: Value) -> Self {
        self.ops.push(BatchOp::Create(body));
        self
    }

    pub fn upsert_item(mut self, body: Value) -> Self {
        self.ops.push(BatchOp::Upsert(body));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit the batch. An empty batch is a no-op.
    pub async fn execute(self) -> Result<()> {
        self.container
            .commit_batch(self.partition_key, self.ops)
            .await
    }
}
