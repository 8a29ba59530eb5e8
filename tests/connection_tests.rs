//! Integration tests for the connection lifecycle manager.
//!
//! Dials go through the scripted `MockConnector` from `tests/common`. Every
//! test runs on a paused clock so reconnect timers fire as soon as the
//! runtime is otherwise idle.

mod common;

use std::time::Duration;

use questlink_session::connection::{Backoff, ConnectionState};
use questlink_session::protocol::AuthHeader;
use questlink_session::{
    ChannelEvent, ConnectionConfig, ConnectionManager, ReconnectPolicy, SessionError,
};
use tokio::sync::mpsc;

use common::{
    init_tracing, next_event, settle, wait_for_dials, wait_for_state, Dial, MockConnector,
};

const URL: &str = "ws://realtime.test/ws";

fn start(
    connector: &MockConnector,
    policy: ReconnectPolicy,
) -> (ConnectionManager, mpsc::Receiver<ChannelEvent>) {
    init_tracing();
    let config = ConnectionConfig::new(URL).with_reconnect_policy(policy);
    ConnectionManager::start(connector.clone(), config)
}

async fn expect_connected(events: &mut mpsc::Receiver<ChannelEvent>) -> uuid::Uuid {
    match next_event(events).await {
        ChannelEvent::Connected { channel_id } => channel_id,
        other => panic!("expected Connected, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Connecting
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn first_connect_presents_token_and_identifies() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(manager.status().channel_id.is_none());

    manager.ensure_connected("tok-1", "u1");
    let channel_id = expect_connected(&mut events).await;

    assert!(manager.is_connected());
    assert_eq!(manager.status().channel_id, Some(channel_id));

    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, URL);
    assert_eq!(requests[0].auth_header, AuthHeader::bearer("tok-1"));
    assert_eq!(requests[0].user_id, "u1");

    let sent = connector.server(0).sent();
    let identify: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(
        identify,
        serde_json::json!({ "type": "identify", "userId": "u1" })
    );

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_ensure_connected_dials_once() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    expect_connected(&mut events).await;

    manager.ensure_connected("tok", "u1");
    manager.on_auth_state_change(true, Some("u1"), Some("tok"));
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(connector.dials(), 1);
    assert!(manager.is_connected());
    assert!(events.try_recv().is_err());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ensure_connected_while_connecting_is_a_no_op() {
    let connector = MockConnector::scripted(vec![Dial::Hang], Dial::Accept);
    let policy = ReconnectPolicy::default().with_connect_timeout(Duration::from_secs(600));
    let (mut manager, _events) = start(&connector, policy);
    let mut status = manager.subscribe_status();

    manager.ensure_connected("tok", "u1");
    wait_for_state(&mut status, ConnectionState::Connecting).await;
    wait_for_dials(&connector, 1).await;
    manager.ensure_connected("tok", "u1");
    settle().await;

    assert_eq!(connector.dials(), 1);
    assert_eq!(manager.status().state, ConnectionState::Connecting);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn incoming_messages_become_events() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    expect_connected(&mut events).await;

    connector.server(0).push("hello");
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Message("hello".into())
    );

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn send_requires_a_live_channel() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    let err = manager.send("too early").unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));

    manager.ensure_connected("tok", "u1");
    expect_connected(&mut events).await;

    manager.send("ping").unwrap();
    settle().await;
    let sent = connector.server(0).sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], "ping");

    manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Disconnecting
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn disconnect_when_idle_is_silent() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.disconnect();
    manager.on_auth_state_change(false, None, None);
    settle().await;

    assert!(events.try_recv().is_err());
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert_eq!(connector.dials(), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_retains_the_channel_object() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    let first = expect_connected(&mut events).await;

    manager.on_auth_state_change(false, None, None);
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected {
            reason: Some("client disconnect".into())
        }
    );
    assert!(connector.server(0).is_closed());

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.channel_id, Some(first));

    manager.ensure_connected("tok", "u1");
    let second = expect_connected(&mut events).await;
    assert_eq!(first, second);
    assert_eq!(connector.dials(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnecting_cancels_the_timer() {
    let connector = MockConnector::scripted(vec![Dial::Fail], Dial::Accept);
    let policy = ReconnectPolicy::default().with_delay(Duration::from_secs(5));
    let (mut manager, mut events) = start(&connector, policy);
    let mut status = manager.subscribe_status();

    manager.ensure_connected("tok", "u1");
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::ConnectError { .. }
    ));
    wait_for_state(&mut status, ConnectionState::Reconnecting).await;

    manager.disconnect();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected {
            reason: Some("client disconnect".into())
        }
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.dials(), 1);
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn logout_wins_over_an_in_flight_connect() {
    let connector = MockConnector::scripted(vec![Dial::Hang], Dial::Accept);
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());
    let mut status = manager.subscribe_status();

    manager.on_auth_state_change(true, Some("u1"), Some("tok"));
    wait_for_state(&mut status, ConnectionState::Connecting).await;
    wait_for_dials(&connector, 1).await;
    manager.on_auth_state_change(false, None, None);

    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected {
            reason: Some("client disconnect".into())
        }
    );

    // Well past the connect timeout: the abandoned dial must not resurface.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert_eq!(connector.dials(), 1);
    assert!(events.try_recv().is_err());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unread_events_never_stall_logout() {
    init_tracing();
    let connector = MockConnector::accepting();
    let config = ConnectionConfig::new(URL).with_event_channel_capacity(4);
    let (mut manager, mut events) = ConnectionManager::start(connector.clone(), config);
    let mut status = manager.subscribe_status();

    // Nobody reads `events` until the end: `Connected` plus three messages
    // fill it and everything after that is dropped.
    manager.ensure_connected("tok", "u1");
    wait_for_state(&mut status, ConnectionState::Connected).await;
    let server = connector.server(0);
    for i in 0..8 {
        server.push(&format!("update {i}"));
    }
    server.hang_up();
    wait_for_state(&mut status, ConnectionState::Reconnecting).await;

    manager.disconnect();
    wait_for_state(&mut status, ConnectionState::Disconnected).await;
    assert!(server.is_closed());

    manager.ensure_connected("tok", "u1");
    wait_for_state(&mut status, ConnectionState::Connected).await;
    manager.disconnect();
    wait_for_state(&mut status, ConnectionState::Disconnected).await;
    assert!(connector.server(1).is_closed());
    assert!(!manager.is_connected());

    let buffered: Vec<ChannelEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(buffered.len(), 4);
    assert!(matches!(buffered[0], ChannelEvent::Connected { .. }));
    assert_eq!(buffered[1], ChannelEvent::Message("update 0".into()));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_live_connection() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    expect_connected(&mut events).await;

    manager.shutdown().await;

    assert!(connector.server(0).is_closed());
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Disconnected {
            reason: Some("client shut down".into())
        })
    );
    assert_eq!(events.recv().await, None);

    // Commands after shutdown are ignored.
    manager.ensure_connected("tok", "u1");
    assert_eq!(connector.dials(), 1);
}

// ════════════════════════════════════════════════════════════════════
// Credential changes
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn new_token_tears_down_before_reconnecting() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok-1", "u1");
    let first = expect_connected(&mut events).await;

    manager.ensure_connected("tok-2", "u1");
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected {
            reason: Some("credentials changed".into())
        }
    );
    let second = expect_connected(&mut events).await;

    assert_eq!(first, second);
    assert!(connector.server(0).is_closed());
    assert!(!connector.server(1).is_closed());

    let requests = connector.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].auth_header, AuthHeader::bearer("tok-2"));

    manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Retry policy
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_retriggered() {
    let connector = MockConnector::scripted(Vec::new(), Dial::Fail);
    let policy = ReconnectPolicy::default().with_max_attempts(3);
    let (mut manager, mut events) = start(&connector, policy);
    let mut status = manager.subscribe_status();

    manager.on_auth_state_change(true, Some("u1"), Some("tok"));

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        let done = matches!(event, ChannelEvent::Failed { .. });
        seen.push(event);
        if done {
            break;
        }
    }

    assert!(matches!(seen[0], ChannelEvent::ConnectError { .. }));
    assert_eq!(seen[1], ChannelEvent::Reconnecting { attempt: 1 });
    assert!(matches!(seen[2], ChannelEvent::ConnectError { .. }));
    assert_eq!(seen[3], ChannelEvent::Reconnecting { attempt: 2 });
    assert!(matches!(seen[4], ChannelEvent::ConnectError { .. }));
    assert!(matches!(seen[5], ChannelEvent::Failed { .. }));
    assert_eq!(seen.len(), 6);

    let failed = wait_for_state(&mut status, ConnectionState::Failed).await;
    assert_eq!(failed.attempt, 3);

    // No automatic attempt while failed.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.dials(), 3);

    connector.set_fallback(Dial::Accept);
    manager.on_auth_state_change(true, Some("u1"), Some("tok"));
    expect_connected(&mut events).await;
    assert_eq!(connector.dials(), 4);
    assert_eq!(manager.status().attempt, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_stop_retrying_immediately() {
    let connector = MockConnector::scripted(vec![Dial::Reject], Dial::Accept);
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("stale", "u1");
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::ConnectError { .. }
    ));
    match next_event(&mut events).await {
        ChannelEvent::Failed { reason } => assert!(reason.contains("rejected"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.dials(), 1);
    assert_eq!(manager.status().state, ConnectionState::Failed);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_connect_error_fails_without_retrying() {
    let connector = MockConnector::scripted(vec![Dial::Misconfigured], Dial::Accept);
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::ConnectError { .. }
    ));
    match next_event(&mut events).await {
        ChannelEvent::Failed { reason } => {
            assert!(reason.starts_with("unrecoverable connect error"), "{reason}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.dials(), 1);
    assert_eq!(manager.status().state, ConnectionState::Failed);

    // A new auth-state change starts over.
    manager.on_auth_state_change(true, Some("u1"), Some("tok"));
    expect_connected(&mut events).await;

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn huge_retry_delays_wait_instead_of_overflowing() {
    let policies = [
        ReconnectPolicy::default().with_delay(Duration::MAX),
        ReconnectPolicy::default()
            .with_delay(Duration::from_secs(u64::MAX / 2))
            .with_backoff(Backoff::Exponential {
                max_delay: Duration::MAX,
            }),
    ];
    for policy in policies {
        let connector = MockConnector::scripted(vec![Dial::Fail], Dial::Accept);
        let (mut manager, mut events) = start(&connector, policy);
        let mut status = manager.subscribe_status();

        manager.ensure_connected("tok", "u1");
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::ConnectError { .. }
        ));
        wait_for_state(&mut status, ConnectionState::Reconnecting).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.dials(), 1);
        assert_eq!(manager.status().state, ConnectionState::Reconnecting);

        manager.disconnect();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected {
                reason: Some("client disconnect".into())
            }
        );
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        manager.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_counts_as_a_failure() {
    let connector = MockConnector::scripted(vec![Dial::Hang], Dial::Accept);
    let policy = ReconnectPolicy::default()
        .with_connect_timeout(Duration::from_secs(5))
        .with_delay(Duration::from_secs(1));
    let (mut manager, mut events) = start(&connector, policy);

    let started = tokio::time::Instant::now();
    manager.ensure_connected("tok", "u1");

    match next_event(&mut events).await {
        ChannelEvent::ConnectError { message } => {
            assert_eq!(message, SessionError::ConnectTimeout.to_string());
        }
        other => panic!("expected ConnectError, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(5));

    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Reconnecting { attempt: 1 }
    );
    expect_connected(&mut events).await;
    assert_eq!(connector.dials(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_spaces_out_attempts() {
    let connector = MockConnector::scripted(Vec::new(), Dial::Fail);
    let policy = ReconnectPolicy::default()
        .with_max_attempts(4)
        .with_delay(Duration::from_secs(1))
        .with_backoff(Backoff::Exponential {
            max_delay: Duration::from_secs(3),
        });
    let (mut manager, mut events) = start(&connector, policy);

    manager.ensure_connected("tok", "u1");

    let mut last_error = None;
    let mut gaps = Vec::new();
    loop {
        match next_event(&mut events).await {
            ChannelEvent::ConnectError { .. } => last_error = Some(tokio::time::Instant::now()),
            ChannelEvent::Reconnecting { .. } => {
                gaps.push(last_error.unwrap().elapsed());
            }
            ChannelEvent::Failed { .. } => break,
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(gaps.len(), 3);
    assert!(gaps[0] >= Duration::from_secs(1) && gaps[0] < Duration::from_secs(2));
    assert!(gaps[1] >= Duration::from_secs(2) && gaps[1] < Duration::from_secs(3));
    assert!(gaps[2] >= Duration::from_secs(3) && gaps[2] < Duration::from_secs(4));

    manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Connection loss
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn server_hang_up_triggers_reconnect_on_same_channel() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());
    let mut status = manager.subscribe_status();

    manager.ensure_connected("tok", "u1");
    let first = expect_connected(&mut events).await;

    connector.server(0).hang_up();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected {
            reason: Some("closed by server".into())
        }
    );
    let reconnecting = wait_for_state(&mut status, ConnectionState::Reconnecting).await;
    assert_eq!(reconnecting.channel_id, Some(first));

    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Reconnecting { attempt: 1 }
    );
    let second = expect_connected(&mut events).await;
    assert_eq!(first, second);
    assert_eq!(connector.dials(), 2);
    assert_eq!(connector.accepted(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn receive_error_is_treated_as_connection_loss() {
    let connector = MockConnector::accepting();
    let (mut manager, mut events) = start(&connector, ReconnectPolicy::default());

    manager.ensure_connected("tok", "u1");
    expect_connected(&mut events).await;

    connector
        .server(0)
        .fail(SessionError::TransportReceive("reset by peer".into()));
    match next_event(&mut events).await {
        ChannelEvent::Disconnected { reason } => {
            assert!(reason.unwrap().contains("reset by peer"));
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert!(connector.server(0).is_closed());

    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Reconnecting { attempt: 1 }
    );
    expect_connected(&mut events).await;

    manager.shutdown().await;
}
