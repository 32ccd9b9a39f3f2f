// tests/integration/transaction_test.rs

//! Integration tests for transaction sessions and connection affinity

use super::test_helpers::{TestContext, wait_until};
use pgcluster::core::cursor::ServerError;
use pgcluster::core::transport::SessionEvent;
use pgcluster::core::transport::mock::default_reply;
use pgcluster::core::{Isolation, PoolError, QueryOptions};

#[tokio::test]
async fn test_session_statements_share_one_connection() {
    let ctx = TestContext::new(2).await;

    let session = ctx.cluster.tx_begin(Isolation::default()).await.unwrap();
    let tx_serial = ctx.server.session_of("BEGIN ISOLATION LEVEL READ COMMITTED").unwrap();

    for i in 0..3 {
        let cursor = ctx
            .cluster
            .query(format!("UPDATE pinned_{i}"), QueryOptions::empty(), Some(session))
            .await
            .unwrap();
        assert!(cursor.is_ok());
        // Unpinned work never lands on the session's connection.
        ctx.cluster
            .query(format!("SELECT free_{i}"), QueryOptions::empty(), None)
            .await
            .unwrap();
    }
    ctx.cluster.tx_commit(session).await.unwrap();

    for sent in ctx.server.log() {
        if sent.command.starts_with("UPDATE") || sent.command == "COMMIT" {
            assert_eq!(sent.session, tx_serial, "{} left the session", sent.command);
        }
        if sent.command.starts_with("SELECT free") {
            assert_ne!(sent.session, tx_serial, "{} ran inside the session", sent.command);
        }
    }
}

#[tokio::test]
async fn test_commit_releases_the_connection() {
    let ctx = TestContext::new(1).await;

    let session = ctx.cluster.tx_begin(Isolation::Serializable).await.unwrap();
    assert!(ctx.cluster.connections()[session.connection].in_session);
    assert_eq!(
        ctx.server.count_sent("BEGIN ISOLATION LEVEL SERIALIZABLE"),
        1
    );

    ctx.cluster.tx_commit(session).await.unwrap();
    assert!(!ctx.cluster.connections()[session.connection].in_session);

    // With the session closed, unpinned work runs on the only connection again.
    let cursor = ctx
        .cluster
        .query("SELECT after", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert!(cursor.is_ok());
}

#[tokio::test]
async fn test_rollback_ends_the_session() {
    let ctx = TestContext::new(1).await;

    let session = ctx.cluster.tx_begin(Isolation::RepeatableRead).await.unwrap();
    ctx.cluster.tx_rollback(session).await.unwrap();

    assert_eq!(ctx.server.count_sent("ROLLBACK"), 1);
    assert!(!ctx.cluster.connections()[0].in_session);
}

#[tokio::test]
async fn test_transaction_always_wraps_unpinned_command() {
    let ctx = TestContext::new(1).await;

    let cursor = ctx
        .cluster
        .query("UPDATE wrapped", QueryOptions::TRANSACTION_ALWAYS, None)
        .await
        .unwrap();

    assert_eq!(ctx.server.sent(), vec!["BEGIN;UPDATE wrapped;COMMIT".to_string()]);
    assert_eq!(cursor.len(), 1);
    assert_eq!(cursor.first().unwrap().tag, "UPDATE");
    assert!(!ctx.cluster.connections()[0].in_session);
}

#[tokio::test]
async fn test_transaction_always_inside_session_is_not_wrapped() {
    let ctx = TestContext::new(1).await;

    let session = ctx.cluster.tx_begin(Isolation::default()).await.unwrap();
    ctx.cluster
        .query("UPDATE inside", QueryOptions::TRANSACTION_ALWAYS, Some(session))
        .await
        .unwrap();

    assert_eq!(ctx.server.count_sent("UPDATE inside"), 1);
    assert_eq!(ctx.server.count_sent("BEGIN;UPDATE inside"), 0);
    ctx.cluster.tx_commit(session).await.unwrap();
}

#[tokio::test]
async fn test_commit_on_lost_session_fails_without_retry() {
    let ctx = TestContext::new(2).await;

    let session = ctx.cluster.tx_begin(Isolation::default()).await.unwrap();
    let serial = ctx.server.session_of("BEGIN").unwrap();
    assert!(ctx.server.drop_session(serial));

    wait_until(|| ctx.cluster.connections()[session.connection].generation != session.generation)
        .await;

    let result = ctx.cluster.tx_commit(session).await;
    assert_eq!(result, Err(PoolError::AffinityViolation(session)));
    assert_eq!(ctx.server.count_sent("COMMIT"), 0);

    // A pinned query is refused just the same.
    let result = ctx
        .cluster
        .query("SELECT 1", QueryOptions::empty(), Some(session))
        .await;
    assert_eq!(result, Err(PoolError::AffinityViolation(session)));
}

#[tokio::test]
async fn test_loss_fails_in_flight_and_queued_session_work() {
    let ctx = TestContext::new(1).await;

    let session = ctx.cluster.tx_begin(Isolation::default()).await.unwrap();
    let in_flight = ctx
        .cluster
        .query("HANG inside", QueryOptions::empty(), Some(session));
    wait_until(|| ctx.server.count_sent("HANG inside") == 1).await;
    let queued = ctx
        .cluster
        .query("SELECT later", QueryOptions::empty(), Some(session));

    ctx.server.drop_session(0);

    assert_eq!(in_flight.await, Err(PoolError::TransportLost));
    assert_eq!(queued.await, Err(PoolError::AffinityViolation(session)));
    assert_eq!(ctx.server.count_sent("SELECT later"), 0);
}

#[tokio::test]
async fn test_failed_begin_surfaces_server_error() {
    let ctx = TestContext::new(1).await;
    ctx.server.set_responder(|command| {
        if command.starts_with("BEGIN") {
            vec![SessionEvent::Error(ServerError {
                severity: "ERROR".into(),
                code: "25001".into(),
                message: "no more transactions today".into(),
                ..Default::default()
            })]
        } else {
            default_reply(command)
        }
    });

    let result = ctx.cluster.tx_begin(Isolation::default()).await;
    assert!(matches!(result, Err(PoolError::Server(ref e)) if e.code == "25001"));
    assert!(!ctx.cluster.connections()[0].in_session);
}

#[tokio::test]
async fn test_inconsistent_transaction_flags_are_rejected() {
    let ctx = TestContext::new(1).await;

    let result = ctx
        .cluster
        .query("COMMIT", QueryOptions::TRANSACTION_END, None)
        .await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
    assert!(ctx.server.sent().is_empty());
}

#[tokio::test]
async fn test_failed_wrapped_command_is_rolled_back() {
    let ctx = TestContext::new(1).await;

    let cursor = ctx
        .cluster
        .query("FAIL midway", QueryOptions::TRANSACTION_ALWAYS, None)
        .await
        .unwrap();
    assert!(cursor.error().is_some());

    // The server skipped the COMMIT; the pool ends the transaction before reusing
    // the connection.
    let next = ctx
        .cluster
        .query("SELECT next", QueryOptions::empty(), None)
        .await
        .unwrap();
    assert!(next.is_ok(), "{:?}", next.error());
    assert_eq!(
        ctx.server.sent(),
        vec![
            "BEGIN;FAIL midway;COMMIT".to_string(),
            "ROLLBACK".to_string(),
            "SELECT next".to_string(),
        ]
    );
    assert!(!ctx.cluster.connections()[0].in_session);
}

#[tokio::test]
async fn test_unsendable_command_keeps_the_session() {
    let ctx = TestContext::new(1).await;
    let session = ctx.cluster.tx_begin(Isolation::default()).await.unwrap();
    ctx.server.refuse_to_send("unencodable");

    let result = ctx
        .cluster
        .query("SELECT unencodable", QueryOptions::empty(), Some(session))
        .await;
    assert!(matches!(result, Err(PoolError::InvalidRequest(_))));

    // The connection was not treated as lost: same identity, same transaction.
    assert_eq!(ctx.cluster.connections()[0].generation, session.generation);
    let cursor = ctx
        .cluster
        .query("UPDATE still_inside", QueryOptions::empty(), Some(session))
        .await
        .unwrap();
    assert!(cursor.is_ok());
    ctx.cluster.tx_commit(session).await.unwrap();
    assert_eq!(ctx.server.connects(), 1);
}
