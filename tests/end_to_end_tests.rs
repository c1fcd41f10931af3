/// End-to-end scenario
///
/// Insert a session, write one completion round atomically, read the
/// conversation back in order, and observe the change feed populate the
/// per-user projection.
/// Run with: cargo test --test end_to_end_tests
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use convostore::{
    ChangeFeedReplicator, CompletionPrompt, DocumentStore, Message, Sender, Session, SessionKind,
    SessionStore, StoreSettings,
};
use tokio_util::sync::CancellationToken;

/// Poll until the projection lists `expected` sessions for `upn`.
async fn wait_for_count(
    store: &SessionStore,
    upn: &str,
    expected: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    for _ in 0..200 {
        let listed = store.get_sessions(SessionKind::Session, upn, cancel).await?;
        if listed.len() == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("projection did not reach {expected} sessions for {upn}")
}

#[tokio::test]
async fn test_conversation_lifecycle() -> Result<()> {
    let documents = DocumentStore::new();
    let settings = StoreSettings::new("chat")
        .feed_poll_interval(Duration::from_millis(20))
        .feed_range_count(2);
    convostore::provision(&documents, &settings).await?;

    let store = Arc::new(SessionStore::new(&documents, settings.clone()).await?);
    let replicator = ChangeFeedReplicator::with_user_session_projection(
        &documents,
        settings,
        store.clone(),
    )
    .await?;
    replicator.start().await?;

    let cancel = CancellationToken::new();
    let upn = "u1@example.com";

    // First user interaction creates the session.
    let session = store
        .insert_session(Session::new(upn).with_name("S1"), &cancel)
        .await?;

    // One completion round: paired messages, the prompt audit record, and
    // the updated session, in a single atomic batch.
    let prompt = Message::new(&session.id, upn, Sender::User, 11, "plan a trip to Kyoto");
    let audit = CompletionPrompt::new(&session.id, "system: travel agent\nplan a trip to Kyoto");
    let completion = Message::new(&session.id, upn, Sender::Assistant, 87, "Day 1: Fushimi Inari…")
        .with_completion_prompt_id(&audit.id);
    let audit_id = audit.id.clone();

    let mut updated = session.clone();
    updated.add_tokens_used(prompt.tokens + completion.tokens);
    store
        .upsert_session_batch(prompt.clone(), completion.clone(), audit, updated, &cancel)
        .await?;

    // The conversation reads back in the order written.
    let messages = store.get_session_messages(&session.id, upn, &cancel).await?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[1].sender, Sender::Assistant);
    assert_eq!(messages[1].completion_prompt_id.as_deref(), Some(audit_id.as_str()));

    // The audit record is a point read away.
    let stored_audit = store
        .get_completion_prompt(&session.id, &audit_id, &cancel)
        .await?;
    assert!(stored_audit.prompt.contains("Kyoto"));

    // After the feed processes the changes, the projection lists the session
    // with its accumulated token usage.
    let mut listed = Vec::new();
    for _ in 0..200 {
        listed = store.get_sessions(SessionKind::Session, upn, &cancel).await?;
        if listed.len() == 1 && listed[0].tokens_used == 98 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session.id);
    assert_eq!(listed[0].name, "S1");
    assert_eq!(listed[0].tokens_used, 98);

    replicator.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_projection_lists_newest_first() -> Result<()> {
    let documents = DocumentStore::new();
    let settings = StoreSettings::new("chat").feed_poll_interval(Duration::from_millis(20));
    convostore::provision(&documents, &settings).await?;

    let store = Arc::new(SessionStore::new(&documents, settings.clone()).await?);
    let replicator = ChangeFeedReplicator::with_user_session_projection(
        &documents,
        settings,
        store.clone(),
    )
    .await?;
    replicator.start().await?;

    let cancel = CancellationToken::new();
    let upn = "u1@example.com";

    // Stagger the inserts so each projection lands before the next session
    // exists; recency in the listing follows projection write order.
    let first = store
        .insert_session(Session::new(upn).with_name("first"), &cancel)
        .await?;
    wait_for_count(&store, upn, 1, &cancel).await?;
    let second = store
        .insert_session(Session::new(upn).with_name("second"), &cancel)
        .await?;
    wait_for_count(&store, upn, 2, &cancel).await?;

    let listed = store.get_sessions(SessionKind::Session, upn, &cancel).await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);

    // Kiosk sessions list separately from plain ones.
    let kiosks = store.get_sessions(SessionKind::Kiosk, upn, &cancel).await?;
    assert!(kiosks.is_empty());

    replicator.stop().await?;
    Ok(())
}
