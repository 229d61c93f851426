//! Cluster redirect handling against two mock nodes.

mod common;

use braid::mux::Multiplexer;
use braid::{CommandId, MessageFlags, RedisKey, RedisValue, ResultProcessor};
use bytes::Bytes;
use common::{MockConfig, MockServer};

#[tokio::test]
async fn moved_redirect_updates_slot_table() {
    // Node 2 owns the data; node 1 redirects every keyed command there.
    let node2 = MockServer::start(MockConfig::default()).await;
    let node1 = MockServer::start(MockConfig {
        moved_to: Some(node2.addr().to_string()),
        ..MockConfig::default()
    })
    .await;

    let mux = Multiplexer::connect(braid::Options::single(node1.addr()))
        .await
        .expect("connect");
    let db = mux.default_database();

    // First write lands on node 1, is redirected, and succeeds on node 2.
    db.set("{x}a", Bytes::from_static(b"1")).await.unwrap();
    assert_eq!(node2.value(b"{x}a").as_deref(), Some(b"1".as_slice()));
    assert_eq!(node1.count("SET {x}a"), 1);
    assert_eq!(node2.count("SET {x}a"), 1);

    // The slot table learned the move: the second write with the same hash
    // tag goes straight to node 2, no redirect.
    db.set("{x}b", Bytes::from_static(b"2")).await.unwrap();
    assert_eq!(node2.value(b"{x}b").as_deref(), Some(b"2".as_slice()));
    assert_eq!(node1.count("SET {x}b"), 0, "node 1 saw no second SET");
    assert_eq!(node2.count("SET {x}b"), 1);

    mux.close(false).await;
}

#[tokio::test]
async fn cross_slot_transaction_fails_before_io() {
    let node2 = MockServer::start(MockConfig::default()).await;
    let node1 = MockServer::start(MockConfig {
        moved_to: Some(node2.addr().to_string()),
        ..MockConfig::default()
    })
    .await;

    let mux = Multiplexer::connect(braid::Options::single(node1.addr()))
        .await
        .expect("connect");
    let db = mux.default_database();

    // Enter cluster mode by taking one redirect.
    db.set("{x}a", Bytes::from_static(b"1")).await.unwrap();
    let watch_count = node1.count("WATCH") + node2.count("WATCH");

    let mut tx = braid::Transaction::new();
    tx.add_condition(braid::Condition::KeyExists(RedisKey::from("foo")));
    tx.add_op(
        CommandId::Set,
        Some(RedisKey::from("bar")),
        vec![RedisValue::Literal("v")],
        ResultProcessor::OkStatus,
    );
    let err = db.run_transaction(tx).await.unwrap_err();
    assert!(matches!(err, braid::BraidError::CrossSlot { .. }));

    // Rejected locally: no WATCH ever reached a server.
    assert_eq!(node1.count("WATCH") + node2.count("WATCH"), watch_count);

    mux.close(false).await;
}

#[tokio::test]
async fn no_redirect_flag_surfaces_moved_to_caller() {
    let node2 = MockServer::start(MockConfig::default()).await;
    let node1 = MockServer::start(MockConfig {
        moved_to: Some(node2.addr().to_string()),
        ..MockConfig::default()
    })
    .await;

    let mux = Multiplexer::connect(braid::Options::single(node1.addr()))
        .await
        .expect("connect");

    let err = mux
        .execute(
            CommandId::Set,
            Some(RedisKey::from("{x}a")),
            vec![RedisValue::Literal("1")],
            ResultProcessor::OkStatus,
            MessageFlags::NO_REDIRECT,
        )
        .await
        .unwrap_err();
    let server_error = err.as_server_error().expect("server error");
    assert!(server_error.message.starts_with("MOVED"));
    assert_eq!(node2.count("SET {x}a"), 0);

    mux.close(false).await;
}

#[tokio::test]
async fn redirect_retries_are_bounded() {
    // Two nodes bouncing every keyed command at each other: the client must
    // give up after connectRetry attempts instead of looping.
    let placeholder = MockServer::start(MockConfig::default()).await;
    let bouncer = MockServer::start(MockConfig {
        moved_to: Some(placeholder.addr().to_string()),
        ..MockConfig::default()
    })
    .await;
    // Point the placeholder back at the bouncer.
    let loop_server = MockServer::start(MockConfig {
        moved_to: Some(bouncer.addr().to_string()),
        ..MockConfig::default()
    })
    .await;
    drop(placeholder);

    let mut options = braid::Options::single(bouncer.addr());
    options.connect_retry = 2;
    options.sync_timeout = 500;
    options.async_timeout = 1_500;
    // The bouncer names a dead endpoint once the placeholder is gone, so
    // every retry re-resolves; the loop must still terminate in an error.
    options.endpoints = vec![bouncer.addr().to_string(), loop_server.addr().to_string()];
    let mux = Multiplexer::connect(options).await.expect("connect");

    let result = mux
        .execute(
            CommandId::Set,
            Some(RedisKey::from("{x}a")),
            vec![RedisValue::Literal("1")],
            ResultProcessor::OkStatus,
            MessageFlags::empty(),
        )
        .await;
    assert!(result.is_err(), "bounced command must fail, not loop");

    mux.close(false).await;
}
