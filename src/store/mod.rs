//! The session store: conversation CRUD over the primary container and the
//! per-user projection.
//!
//! Callers see either a valid result or a specific failure condition; a
//! multi-record write is never partially visible. The projection container is
//! read here ("list my sessions") but written only by the change-feed
//! replicator.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StoreSettings;
use crate::core::{PartitionKey, RecordKind, Result, SessionKind, StoreError};
use crate::model::{CompletionPrompt, Message, Session, SessionRecord, require_upn};
use crate::query::{QueryFilter, SortOrder};
use crate::resilience::RetryPolicy;
use crate::storage::{Container, DocumentStore, MAX_BATCH_OPERATIONS, PatchOp};

/// Create the three containers this subsystem needs, if missing. Start-up
/// helper for hosts that own provisioning; safe to call from racing replicas.
pub async fn provision(store: &DocumentStore, settings: &StoreSettings) -> Result<()> {
    settings.validate()?;
    store
        .create_container_if_not_exists(&settings.sessions_container, "/sessionId")
        .await?;
    store
        .create_container_if_not_exists(&settings.user_sessions_container, "/upn")
        .await?;
    store
        .create_container_if_not_exists(&settings.leases_container, "/id")
        .await?;
    Ok(())
}

/// Service handle for conversation persistence.
///
/// Explicitly constructed with validated settings and resolved containers;
/// construction fails fast if a required setting is empty or a container is
/// missing.
pub struct SessionStore {
    sessions: Container,
    user_sessions: Container,
    retry: RetryPolicy,
}

impl SessionStore {
    pub async fn new(store: &DocumentStore, settings: StoreSettings) -> Result<Self> {
        settings.validate()?;
        let sessions = store.container(&settings.sessions_container).await?;
        let user_sessions = store.container(&settings.user_sessions_container).await?;
        info!(
            database = %settings.database,
            sessions = %settings.sessions_container,
            user_sessions = %settings.user_sessions_container,
            "session store initialized"
        );
        Ok(Self {
            sessions,
            user_sessions,
            retry: RetryPolicy::transient_only(),
        })
    }

    /// All non-deleted sessions of the given kind for the given user, newest
    /// first. Served from the projection container to avoid a cross-partition
    /// scan of the primary container.
    pub async fn get_sessions(
        &self,
        kind: SessionKind,
        upn: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Session>> {
        require_upn(upn)?;
        let filter = QueryFilter::new()
            .partition(PartitionKey::new(upn))
            .kind(kind.record_kind())
            .upn(upn)
            .order_by(SortOrder::NewestFirst);
        let docs = self
            .retry
            .execute(cancel, || self.user_sessions.query(&filter))
            .await?;
        docs.iter().map(|d| d.to_record()).collect()
    }

    /// Point read of one session from the primary container.
    pub async fn get_session(&self, id: &str, cancel: &CancellationToken) -> Result<Session> {
        let pk = PartitionKey::new(id);
        let doc = self
            .retry
            .execute(cancel, || self.sessions.read_item(&pk, id))
            .await?;
        doc.to_record()
    }

    /// Non-deleted messages of one session owned by `upn`, in the order they
    /// were written.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        upn: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        require_upn(upn)?;
        let filter = QueryFilter::new()
            .partition(PartitionKey::new(session_id))
            .kind(RecordKind::Message)
            .session(session_id)
            .upn(upn)
            .order_by(SortOrder::OldestFirst);
        let docs = self
            .retry
            .execute(cancel, || self.sessions.query(&filter))
            .await?;
        docs.iter().map(|d| d.to_record()).collect()
    }

    /// Create a new session, opening its partition.
    pub async fn insert_session(
        &self,
        session: Session,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let pk = session.partition_key();
        let body = serde_json::to_value(&session)?;
        let doc = self
            .retry
            .execute(cancel, || self.sessions.create_item(pk.clone(), body.clone()))
            .await?;
        doc.to_record()
    }

    /// Create a single message in its session's partition.
    pub async fn insert_message(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let pk = message.partition_key();
        let body = serde_json::to_value(&message)?;
        let doc = self
            .retry
            .execute(cancel, || self.sessions.create_item(pk.clone(), body.clone()))
            .await?;
        doc.to_record()
    }

    /// Full replace of a session record. Fails with NotFound if the session
    /// does not exist.
    pub async fn update_session(
        &self,
        session: Session,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let pk = session.partition_key();
        self.retry
            .execute(cancel, || self.sessions.read_item(&pk, &session.id))
            .await?;
        let body = serde_json::to_value(&session)?;
        let doc = self
            .retry
            .execute(cancel, || self.sessions.upsert_item(pk.clone(), body.clone()))
            .await?;
        doc.to_record()
    }

    /// Rename a session. A field-level patch, not a read-modify-write, so a
    /// concurrent token-count update cannot be lost.
    pub async fn update_session_name(
        &self,
        id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let pk = PartitionKey::new(id);
        let ops = [PatchOp::set("/name", Value::String(name.to_string()))];
        let doc = self
            .retry
            .execute(cancel, || self.sessions.patch_item(&pk, id, &ops))
            .await?;
        doc.to_record()
    }

    /// Rate one message. Field-level patch of `/rating` only.
    pub async fn update_message_rating(
        &self,
        id: &str,
        session_id: &str,
        rating: Option<bool>,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let pk = PartitionKey::new(session_id);
        let value = match rating {
            Some(rating) => Value::Bool(rating),
            None => Value::Null,
        };
        let ops = [PatchOp::set("/rating", value)];
        let doc = self
            .retry
            .execute(cancel, || self.sessions.patch_item(&pk, id, &ops))
            .await?;
        doc.to_record()
    }

    /// Atomically write one completion round: the user's prompt message, the
    /// assistant's completion message, the completion-prompt audit record,
    /// and the updated session. All four share the session's partition key;
    /// violated inputs fail before any write is attempted.
    pub async fn upsert_session_batch(
        &self,
        prompt_message: Message,
        completion_message: Message,
        completion_prompt: CompletionPrompt,
        session: Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let records: [SessionRecord; 4] = [
            prompt_message.into(),
            completion_message.into(),
            completion_prompt.into(),
            session.into(),
        ];
        let partition_key = records[0].partition_key();
        if records.iter().any(|r| r.partition_key() != partition_key) {
            return Err(StoreError::InvalidArgument(
                "all items in a session batch must share the same partition key".into(),
            ));
        }

        let mut bodies = Vec::with_capacity(records.len());
        for record in &records {
            bodies.push(record.to_body()?);
        }
        self.retry
            .execute(cancel, || {
                let mut batch = self.sessions.batch(partition_key.clone());
                for body in &bodies {
                    batch = batch.upsert_item(body.clone());
                }
                batch.execute()
            })
            .await
    }

    /// Soft-delete a session and everything in its partition.
    ///
    /// Flips the delete flag on every non-deleted item, committing in capped
    /// batches and re-querying until the partition is exhausted, so partition
    /// size is never assumed bounded. Cancellation is honored between
    /// batches; the batch itself is atomic, so aborting cannot strand a
    /// half-applied batch.
    pub async fn delete_session_and_messages(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pk = PartitionKey::new(session_id);
        let filter = QueryFilter::new().partition(pk.clone());

        debug!(session_id, "deleting session and related messages");
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let pending = self
                .retry
                .execute(cancel, || self.sessions.query(&filter))
                .await?;
            if pending.is_empty() {
                return Ok(());
            }

            for chunk in pending.chunks(MAX_BATCH_OPERATIONS) {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                let mut tombstones = Vec::with_capacity(chunk.len());
                for doc in chunk {
                    let mut body = doc.body.clone();
                    PatchOp::set("/deleted", Value::Bool(true)).apply(&mut body)?;
                    tombstones.push(body);
                }
                self.retry
                    .execute(cancel, || {
                        let mut batch = self.sessions.batch(pk.clone());
                        for body in &tombstones {
                            batch = batch.upsert_item(body.clone());
                        }
                        batch.execute()
                    })
                    .await?;
            }
        }
    }

    /// Point read of a completion-prompt audit record.
    pub async fn get_completion_prompt(
        &self,
        session_id: &str,
        completion_prompt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletionPrompt> {
        let pk = PartitionKey::new(session_id);
        let doc = self
            .retry
            .execute(cancel, || self.sessions.read_item(&pk, completion_prompt_id))
            .await?;
        doc.to_record()
    }

    /// Idempotent overwrite of a session's projection record, keyed by the
    /// owning user. Called by the change-feed replicator; request-handling
    /// code must never write the projection directly.
    pub async fn upsert_user_session(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require_upn(&session.upn)?;
        let pk = PartitionKey::new(&session.upn);
        let body = serde_json::to_value(session)?;
        self.retry
            .execute(cancel, || {
                self.user_sessions.upsert_item(pk.clone(), body.clone())
            })
            .await?;
        Ok(())
    }
}
