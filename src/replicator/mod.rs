//! Change-feed replication: keeps the per-user projection of session
//! metadata eventually consistent with the primary container.
//!
//! Any number of replicator instances may run concurrently; lease documents
//! divide feed ranges between them, and every projection write is an
//! idempotent upsert, so redelivery and instance churn are harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::StoreSettings;
use crate::core::{Result, StoreError};
use crate::model::{Session, record_kind_of};
use crate::resilience::RetryPolicy;
use crate::storage::{Container, Document, DocumentStore, LeaseManager};
use crate::store::SessionStore;

/// Items requested per feed page; aligned with the batch-write ceiling.
const FEED_PAGE_SIZE: usize = 100;

/// Destination of projection writes. The seam between the replicator and the
/// store, so tests can observe or fail projections deliberately.
#[async_trait]
pub trait ProjectionSink: Send + Sync {
    async fn project(&self, session: &Session, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl ProjectionSink for SessionStore {
    async fn project(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        self.upsert_user_session(session, cancel).await
    }
}

/// Per-batch handler for one named feed subscription.
///
/// Handlers are infallible by contract: one bad record must never block or
/// fail the batch for the others, so failures are logged and dropped inside.
#[async_trait]
pub trait FeedHandler: Send + Sync {
    async fn handle_changes(&self, changes: &[Document], cancel: &CancellationToken);
}

/// Projects changed Session records into the per-user projection container.
pub struct UserSessionProjector {
    sink: Arc<dyn ProjectionSink>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl UserSessionProjector {
    pub fn new(sink: Arc<dyn ProjectionSink>, concurrency: usize) -> Self {
        Self {
            sink,
            retry: RetryPolicy::new(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl FeedHandler for UserSessionProjector {
    async fn handle_changes(&self, changes: &[Document], cancel: &CancellationToken) {
        // Only session records project; messages and completion prompts
        // share the feed and are ignored here.
        let sessions: Vec<Session> = changes
            .iter()
            .filter(|doc| record_kind_of(&doc.body).is_some_and(|kind| kind.is_session()))
            .filter_map(|doc| match doc.to_record::<Session>() {
                Ok(session) => Some(session),
                Err(err) => {
                    error!(id = %doc.id, error = %err, "undecodable session record in feed");
                    None
                }
            })
            .collect();
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "projecting changed sessions");
        futures::stream::iter(sessions)
            .for_each_concurrent(self.concurrency, |session| async move {
                let outcome = self
                    .retry
                    .execute(cancel, || self.sink.project(&session, cancel))
                    .await;
                if let Err(err) = outcome {
                    // Best effort: the same change reappears on the next
                    // delivery of this session, and projection upserts are
                    // idempotent.
                    error!(
                        session_id = %session.session_id,
                        error = %err,
                        "projection failed after retries, dropping record"
                    );
                }
            })
            .await;
    }
}

/// Replicator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct FeedSubscription {
    name: String,
    handler: Arc<dyn FeedHandler>,
}

/// Consumes the sessions container change feed and dispatches batches to the
/// registered handlers.
///
/// `start` is idempotent once running; `stop` is graceful and safe to call
/// even if `start` never completed. Each instance registers leases under a
/// process-unique name so horizontally scaled replicas never collide.
pub struct ChangeFeedReplicator {
    settings: StoreSettings,
    sessions: Container,
    leases: Container,
    instance_name: String,
    subscriptions: std::sync::Mutex<Vec<FeedSubscription>>,
    state: std::sync::Mutex<ReplicatorState>,
    is_initialized: AtomicBool,
    shutdown: std::sync::Mutex<Option<CancellationToken>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeFeedReplicator {
    pub async fn new(store: &DocumentStore, settings: StoreSettings) -> Result<Self> {
        settings.validate()?;
        let sessions = store.container(&settings.sessions_container).await?;
        let leases = store.container(&settings.leases_container).await?;
        Ok(Self {
            settings,
            sessions,
            leases,
            instance_name: format!("{}_replicator", Uuid::new_v4()),
            subscriptions: std::sync::Mutex::new(Vec::new()),
            state: std::sync::Mutex::new(ReplicatorState::Stopped),
            is_initialized: AtomicBool::new(false),
            shutdown: std::sync::Mutex::new(None),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Replicator pre-wired with the standard user-session projection.
    pub async fn with_user_session_projection(
        store: &DocumentStore,
        settings: StoreSettings,
        sink: Arc<dyn ProjectionSink>,
    ) -> Result<Self> {
        let projector = UserSessionProjector::new(sink, settings.projection_concurrency);
        let replicator = Self::new(store, settings).await?;
        replicator.subscribe("project-user-sessions", Arc::new(projector));
        Ok(replicator)
    }

    /// Register a named subscription. Must happen before `start`.
    pub fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn FeedHandler>) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .push(FeedSubscription {
                name: name.into(),
                handler,
            });
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ReplicatorState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Start all registered subscriptions. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(ReplicatorState::Starting);
        info!(instance = %self.instance_name, "starting change feed processors");

        let token = CancellationToken::new();
        let subscriptions: Vec<(String, Arc<dyn FeedHandler>)> = {
            let subs = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.iter()
                .map(|s| (s.name.clone(), s.handler.clone()))
                .collect()
        };
        if subscriptions.is_empty() {
            self.is_initialized.store(false, Ordering::SeqCst);
            self.set_state(ReplicatorState::Stopped);
            return Err(StoreError::InvalidOperation(
                "no change-feed subscriptions registered".into(),
            ));
        }

        // Provision every subscription's leases before spawning anything, so
        // a failure here leaves the replicator cleanly stopped.
        let mut pumps = Vec::with_capacity(subscriptions.len());
        for (name, handler) in subscriptions {
            let manager = LeaseManager::new(
                self.leases.clone(),
                &name,
                format!("{}_{name}", self.instance_name),
                self.settings.feed_range_count,
                self.settings.lease_ttl,
            );
            if let Err(err) = manager.ensure_leases().await {
                self.is_initialized.store(false, Ordering::SeqCst);
                self.set_state(ReplicatorState::Stopped);
                return Err(err);
            }
            pumps.push((name, manager, handler));
        }

        let mut tasks = self.tasks.lock().await;
        for (name, manager, handler) in pumps {
            tasks.push(tokio::spawn(pump(
                name,
                self.sessions.clone(),
                manager,
                handler,
                self.settings.feed_poll_interval,
                token.clone(),
            )));
        }
        drop(tasks);

        *self.shutdown.lock().expect("shutdown lock poisoned") = Some(token);
        self.set_state(ReplicatorState::Running);
        info!("change feed processors started");
        Ok(())
    }

    /// Stop all subscriptions and wait for their pumps to drain.
    pub async fn stop(&self) -> Result<()> {
        self.set_state(ReplicatorState::Stopping);
        info!("stopping change feed processors");

        let token = self.shutdown.lock().expect("shutdown lock poisoned").take();
        if let Some(token) = token {
            token.cancel();
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "feed pump task ended abnormally");
            }
        }
        drop(tasks);

        self.is_initialized.store(false, Ordering::SeqCst);
        self.set_state(ReplicatorState::Stopped);
        info!("change feed processors stopped");
        Ok(())
    }
}

/// One subscription's pump: acquire leases, drain pages, checkpoint.
async fn pump(
    name: String,
    sessions: Container,
    manager: LeaseManager,
    handler: Arc<dyn FeedHandler>,
    poll_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    info!(subscription = %name, "feed pump started");
    let mut held = Vec::new();
    loop {
        match manager.acquire().await {
            Ok(leases) => held = leases,
            Err(err) => {
                warn!(subscription = %name, error = %err, "lease acquisition failed");
                held.clear();
            }
        }

        for lease in &mut held {
            if cancel.is_cancelled() {
                break;
            }
            let page = match sessions
                .read_changes(lease.range, lease.continuation(), FEED_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(subscription = %name, error = %err, "feed read failed");
                    continue;
                }
            };
            if page.documents.is_empty() {
                continue;
            }

            handler.handle_changes(&page.documents, &cancel).await;

            // Checkpoint after handling: at-least-once delivery.
            if let Err(err) = manager.checkpoint(lease, page.continuation).await {
                warn!(
                    subscription = %name,
                    lease = %lease.id(),
                    error = %err,
                    "checkpoint failed, lease ownership lost"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    if let Err(err) = manager.release(std::mem::take(&mut held)).await {
        warn!(subscription = %name, error = %err, "lease release failed");
    }
    info!(subscription = %name, "feed pump stopped");
}
