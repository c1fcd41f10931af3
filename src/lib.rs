//! # convostore
//!
//! Conversation persistence with change propagation:
//!
//! - [`storage`]: an embedded partitioned document store — per-partition
//!   atomic transactional batches, point reads, filtered queries, field
//!   patches, and an ordered change feed consumed through leases.
//! - [`store`]: the session store — chat sessions, messages, and
//!   completion-prompt audit records, with a uniform soft-delete discipline.
//! - [`replicator`]: lease-coordinated change-feed processors maintaining the
//!   denormalized per-user projection that answers "list my sessions" without
//!   cross-partition fan-out.
//! - [`resilience`]: bounded exponential-backoff retry with jitter.
//!
//! # Examples
//!
//! One completion round, end to end:
//!
//! ```
//! use convostore::{
//!     CompletionPrompt, DocumentStore, Message, Sender, Session, SessionStore, StoreSettings,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> convostore::Result<()> {
//! let documents = DocumentStore::new();
//! let settings = StoreSettings::new("chat");
//! convostore::provision(&documents, &settings).await?;
//!
//! let store = SessionStore::new(&documents, settings).await?;
//! let cancel = CancellationToken::new();
//!
//! let session = store
//!     .insert_session(Session::new("alice@example.com"), &cancel)
//!     .await?;
//!
//! let prompt = Message::new(&session.id, &session.upn, Sender::User, 9, "hello?");
//! let audit = CompletionPrompt::new(&session.id, "hello?");
//! let completion = Message::new(&session.id, &session.upn, Sender::Assistant, 12, "hi!")
//!     .with_completion_prompt_id(&audit.id);
//!
//! let mut updated = session.clone();
//! updated.add_tokens_used(prompt.tokens + completion.tokens);
//! store
//!     .upsert_session_batch(prompt, completion, audit, updated, &cancel)
//!     .await?;
//!
//! let messages = store
//!     .get_session_messages(&session.id, &session.upn, &cancel)
//!     .await?;
//! assert_eq!(messages.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod model;
pub mod query;
pub mod replicator;
pub mod resilience;
pub mod storage;
pub mod store;

// Re-export main types for convenience
pub use config::StoreSettings;
pub use core::{PartitionKey, RecordKind, Result, SessionKind, StoreError};
pub use model::{Citation, CompletionPrompt, Message, Sender, Session, SessionRecord};
pub use query::{QueryFilter, SortOrder, soft_delete_visible};
pub use replicator::{
    ChangeFeedReplicator, FeedHandler, ProjectionSink, ReplicatorState, UserSessionProjector,
};
pub use resilience::{RetryClassification, RetryPolicy};
pub use storage::{
    Container, ContainerStats, Document, DocumentStore, MAX_BATCH_OPERATIONS, PatchOp,
    TransactionalBatch,
};
pub use store::{SessionStore, provision};
