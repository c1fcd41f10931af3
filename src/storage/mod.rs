pub mod batch;
pub mod container;
pub mod database;
pub mod document;
pub mod feed;

pub use batch::{BatchOp, TransactionalBatch};
pub use container::{Container, ContainerStats, MAX_BATCH_OPERATIONS};
pub use database::DocumentStore;
pub use document::{Document, PatchOp};
pub use feed::{ChangeFeedPage, FeedRange, Lease, LeaseManager};
