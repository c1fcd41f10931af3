//! Typed query filters and the soft-delete convention.
//!
//! Every read-path query in the crate goes through [`QueryFilter`], so the
//! soft-delete predicate lives in exactly one place instead of being repeated
//! at each call site.

use serde_json::Value;

use crate::core::{PartitionKey, RecordKind};
use crate::storage::Document;

/// The soft-delete convention: a record is visible when it has no delete flag
/// set, or the flag is explicitly false.
pub fn soft_delete_visible(body: &Value) -> bool {
    !body
        .get("deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Sort direction over the store-assigned write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Descending by store-assigned timestamp: "list my sessions".
    NewestFirst,
    /// Ascending, i.e. the order written: replaying a conversation.
    OldestFirst,
}

/// Filter applied to a container scan.
///
/// Deleted records are excluded unless [`QueryFilter::include_deleted`] is
/// called explicitly (the deletion sweep needs it to find its own frontier;
/// nothing on the read path does).
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    partition_key: Option<PartitionKey>,
    kind: Option<RecordKind>,
    upn: Option<String>,
    session_id: Option<String>,
    include_deleted: bool,
    order: Option<SortOrder>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the scan to a single partition.
    pub fn partition(mut self, key: PartitionKey) -> Self {
        self.partition_key = Some(key);
        self
    }

    /// Match only records with this `type` discriminator.
    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Match only records owned by this user.
    pub fn upn(mut self, upn: impl Into<String>) -> Self {
        self.upn = Some(upn.into());
        self
    }

    /// Match only records of this session.
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Escape hatch for the tombstone sweep. Read paths never call this.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn order_by(mut self, order: SortOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if !self.include_deleted && !soft_delete_visible(&doc.body) {
            return false;
        }
        if let Some(kind) = self.kind
            && doc.body.get("type").and_then(Value::as_str) != Some(kind.as_str())
        {
            return false;
        }
        if let Some(upn) = &self.upn
            && doc.body.get("upn").and_then(Value::as_str) != Some(upn.as_str())
        {
            return false;
        }
        if let Some(session_id) = &self.session_id
            && doc.body.get("sessionId").and_then(Value::as_str) != Some(session_id.as_str())
        {
            return false;
        }
        true
    }

    /// Order results by the store-assigned write sequence (the tiebreak for
    /// equal wall-clock timestamps).
    pub fn sort(&self, docs: &mut [Document]) {
        match self.order {
            Some(SortOrder::NewestFirst) => docs.sort_by(|a, b| {
                b.ts.cmp(&a.ts).then(b.seq.cmp(&a.seq))
            }),
            Some(SortOrder::OldestFirst) => docs.sort_by(|a, b| {
                a.ts.cmp(&b.ts).then(a.seq.cmp(&b.seq))
            }),
            None => {}
        }
    }
}
