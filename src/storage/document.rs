use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::{PartitionKey, Result, StoreError};

/// A stored record: caller JSON body plus store-owned metadata.
///
/// `ts` and `seq` are assigned by the container on every committed write;
/// `seq` is the container-wide change sequence used for recency ordering and
/// the change feed, `ts` is the wall-clock counterpart exposed to callers.
/// `etag` changes on every write and backs conditional replace.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub partition_key: PartitionKey,
    pub etag: u64,
    pub ts: i64,
    pub seq: u64,
    pub body: Value,
}

impl Document {
    /// Build an unstamped document from a record body. The body must carry a
    /// string `id` matching the partition layout of the target container;
    /// metadata fields are zeroed until the container commits the write.
    pub fn new(partition_key: PartitionKey, body: Value) -> Result<Self> {
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                StoreError::InvalidArgument("document body must carry a non-empty 'id'".into())
            })?
            .to_string();

        Ok(Self {
            id,
            partition_key,
            etag: 0,
            ts: 0,
            seq: 0,
            body,
        })
    }

    /// Decode the body into a typed record.
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// The soft-delete flag: absent means false.
    pub fn is_deleted(&self) -> bool {
        self.body
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Value of the field a container's partition key path points at, if the
    /// body carries it.
    pub fn path_value(&self, partition_key_path: &str) -> Option<&str> {
        let field = partition_key_path.strip_prefix('/').unwrap_or(partition_key_path);
        self.body.get(field).and_then(Value::as_str)
    }
}

/// A partial update touching one field, applied server-side so concurrent
/// patches of different fields never overwrite each other.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Set { path: String, value: Value },
}

impl PatchOp {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self::Set {
            path: path.into(),
            value,
        }
    }

    /// Apply to a document body. Paths name top-level fields (`/name`,
    /// `/rating`); nested paths are not part of this store's contract.
    pub fn apply(&self, body: &mut Value) -> Result<()> {
        match self {
            PatchOp::Set { path, value } => {
                let field = path.strip_prefix('/').ok_or_else(|| {
                    StoreError::InvalidArgument(format!("patch path '{path}' must start with '/'"))
                })?;
                if field.is_empty() || field.contains('/') {
                    return Err(StoreError::InvalidArgument(format!(
                        "patch path '{path}' must name a single top-level field"
                    )));
                }
                let object = body.as_object_mut().ok_or_else(|| {
                    StoreError::InvalidArgument("patch target is not a JSON object".into())
                })?;
                object.insert(field.to_string(), value.clone());
                Ok(())
            }
        }
    }
}
