//! Session lifecycle integration tests without a broker
//!
//! Everything here exercises the state machine and error surface against
//! an unreachable endpoint, which is the strongest coverage available
//! without a live broker.

use bytes::Bytes;
use mqtt_session::config::BrokerSection;
use mqtt_session::credentials::CredentialBuilder;
use mqtt_session::session::{ConnectionManager, ConnectionState, LifecycleEvent, ReconnectConfig};
use mqtt_session::SessionError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CA_PEM: &[u8] = include_bytes!("fixtures/ca.pem");
const CLIENT_PEM: &[u8] = include_bytes!("fixtures/client.pem");
const CLIENT_KEY: &[u8] = include_bytes!("fixtures/client.key");

fn unreachable_manager() -> ConnectionManager {
    let security = CredentialBuilder::build(CA_PEM, CLIENT_PEM, CLIENT_KEY)
        .expect("fixtures are valid");
    let broker = BrokerSection {
        host: "127.0.0.1".to_string(),
        // Reserved port, nothing listens here
        port: 1,
        client_id: "lifecycle-test".to_string(),
        keep_alive_secs: 60,
        connect_timeout_secs: 2,
        disconnect_grace_ms: 10,
    };
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts: Some(2),
    };
    ConnectionManager::new(broker, security, reconnect)
}

#[tokio::test]
async fn test_fresh_session_starts_disconnected() {
    let manager = unreachable_manager();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_failure_reaches_failed_state() {
    let manager = unreachable_manager();

    let result = manager.connect().await;
    assert!(result.is_err());
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_operations_outside_connected_state_fail() {
    let manager = unreachable_manager();

    let publish = manager
        .publish("topic_1", Bytes::from_static(b"payload"), 1, false)
        .await;
    assert!(matches!(publish, Err(SessionError::NotConnected { .. })));

    let subscribe = manager.subscribe("topic_1", 1, Arc::new(|_| {})).await;
    assert!(matches!(subscribe, Err(SessionError::NotConnected { .. })));
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let manager = unreachable_manager();
    let mut state_rx = manager.watch_state();

    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            let state = state_rx.borrow_and_update().clone();
            let terminal = matches!(
                state,
                ConnectionState::Failed(_) | ConnectionState::ClosedByUser
            );
            seen.push(state);
            if terminal || state_rx.changed().await.is_err() {
                break;
            }
        }
        seen
    });

    let _ = manager.connect().await;
    let seen = observer.await.expect("observer task");

    // The watch channel coalesces rapid transitions; the terminal state
    // is always observable
    assert!(seen
        .iter()
        .any(|s| matches!(s, ConnectionState::Failed(_))));
}

#[tokio::test]
async fn test_disconnect_always_closes_the_session() {
    let manager = unreachable_manager();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        manager.on_lifecycle_event(Arc::new(move |event| {
            events.lock().unwrap().push(event.clone());
        }));
    }

    // Never connected, disconnect must still close cleanly
    manager.disconnect().await.expect("disconnect");
    assert_eq!(manager.state(), ConnectionState::ClosedByUser);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[LifecycleEvent::Disconnected]
    );
}

#[tokio::test]
async fn test_failed_session_may_retry_connect() {
    let manager = unreachable_manager();

    assert!(manager.connect().await.is_err());
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));

    // A second attempt is allowed from Failed; the endpoint is still down
    assert!(manager.connect().await.is_err());
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent_without_a_connection() {
    let manager = unreachable_manager();

    assert!(!manager.unsubscribe("topic_1").await.expect("unsubscribe"));
    assert!(!manager.unsubscribe("topic_1").await.expect("unsubscribe"));
}

#[tokio::test]
async fn test_disconnect_is_repeatable() {
    let manager = unreachable_manager();
    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        manager.on_lifecycle_event(Arc::new(move |event| {
            if matches!(event, LifecycleEvent::Disconnected) {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    manager.disconnect().await.expect("first disconnect");
    manager.disconnect().await.expect("second disconnect");
    assert_eq!(manager.state(), ConnectionState::ClosedByUser);
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}
