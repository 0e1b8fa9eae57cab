//! Per-message delivery tracking
//!
//! Publish and subscribe requests are acknowledged asynchronously by the
//! broker. A [`DeliveryToken`] is handed out at request time and resolved
//! from the event loop when the matching acknowledgement arrives.
//!
//! Correlation works in two steps because the client assigns packet ids
//! internally: requests are queued in issue order, the outgoing event
//! reveals the packet id for the oldest queued request, and the broker's
//! acknowledgement then resolves it by packet id. The manager serializes
//! requests, so issue order is well defined.

use crate::error::{SessionError, SessionResult};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type AckSender = oneshot::Sender<SessionResult<()>>;

/// Handle for awaiting the acknowledgement of one publish or subscribe
#[derive(Debug)]
pub struct DeliveryToken {
    receiver: oneshot::Receiver<SessionResult<()>>,
}

impl DeliveryToken {
    /// Wait for the acknowledgement, bounded by `timeout`
    ///
    /// Returns `DeliveryTimeout` when the bound elapses and
    /// `TransportLost` when the connection drops while the request is in
    /// flight.
    pub async fn await_ack(self, timeout: Duration) -> SessionResult<()> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::TransportLost(
                "session closed before acknowledgement".to_string(),
            )),
            Err(_) => Err(SessionError::DeliveryTimeout { timeout }),
        }
    }
}

/// Await a batch of tokens in issue order, returning the first failure
///
/// The timeout is one shared deadline for the whole batch, not a
/// per-token allowance.
pub async fn await_all(
    tokens: impl IntoIterator<Item = DeliveryToken>,
    timeout: Duration,
) -> SessionResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    for token in tokens {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        token.await_ack(remaining).await?;
    }
    Ok(())
}

/// Expectation attached to a queued publish
#[derive(Debug, Clone, Copy, PartialEq)]
enum AckExpectation {
    /// QoS 0: resolved as soon as the packet leaves the client
    None,
    /// QoS 1 or 2: resolved by PUBACK or PUBCOMP
    Broker,
}

/// Registry correlating issued requests with broker acknowledgements
///
/// Owned by the manager; fed from the event loop.
#[derive(Default)]
pub struct AckRegistry {
    queued_publishes: VecDeque<(AckExpectation, AckSender)>,
    queued_subscribes: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

impl AckRegistry {
    /// Register a publish about to be handed to the client
    pub fn register_publish(&mut self, qos: u8) -> DeliveryToken {
        let (sender, receiver) = oneshot::channel();
        let expectation = if qos == 0 {
            AckExpectation::None
        } else {
            AckExpectation::Broker
        };
        self.queued_publishes.push_back((expectation, sender));
        DeliveryToken { receiver }
    }

    /// Register a subscribe about to be handed to the client
    pub fn register_subscribe(&mut self) -> DeliveryToken {
        let (sender, receiver) = oneshot::channel();
        self.queued_subscribes.push_back(sender);
        DeliveryToken { receiver }
    }

    /// A publish left the client; bind the oldest queued publish to `pkid`
    pub fn publish_issued(&mut self, pkid: u16) {
        match self.queued_publishes.pop_front() {
            Some((AckExpectation::None, sender)) => {
                // Fire-and-forget delivery is complete once the packet is out
                let _ = sender.send(Ok(()));
            }
            Some((AckExpectation::Broker, sender)) => {
                if self.in_flight.insert(pkid, sender).is_some() {
                    warn!(pkid, "Packet id reused while still in flight");
                }
            }
            None => debug!(pkid, "Outgoing publish with no queued request"),
        }
    }

    /// A subscribe left the client; bind the oldest queued subscribe to `pkid`
    pub fn subscribe_issued(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(sender) => {
                if self.in_flight.insert(pkid, sender).is_some() {
                    warn!(pkid, "Packet id reused while still in flight");
                }
            }
            None => debug!(pkid, "Outgoing subscribe with no queued request"),
        }
    }

    /// The broker acknowledged the request bound to `pkid`
    pub fn acknowledged(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            Some(sender) => {
                let _ = sender.send(Ok(()));
            }
            None => debug!(pkid, "Acknowledgement for unknown packet id"),
        }
    }

    /// Drop the newest queued publish after a rejected client request
    pub fn abandon_newest_publish(&mut self) {
        self.queued_publishes.pop_back();
    }

    /// Drop the newest queued subscribe after a rejected client request
    pub fn abandon_newest_subscribe(&mut self) {
        self.queued_subscribes.pop_back();
    }

    /// Fail every outstanding token; called when the transport drops
    pub fn fail_all(&mut self, reason: &str) {
        let outstanding =
            self.queued_publishes.len() + self.queued_subscribes.len() + self.in_flight.len();
        if outstanding > 0 {
            warn!(outstanding, reason, "Failing in-flight deliveries");
        }
        for (_, sender) in self.queued_publishes.drain(..) {
            let _ = sender.send(Err(SessionError::TransportLost(reason.to_string())));
        }
        for sender in self.queued_subscribes.drain(..) {
            let _ = sender.send(Err(SessionError::TransportLost(reason.to_string())));
        }
        for (_, sender) in self.in_flight.drain() {
            let _ = sender.send(Err(SessionError::TransportLost(reason.to_string())));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.queued_publishes.len() + self.queued_subscribes.len() + self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_resolves_at_issue() {
        let mut registry = AckRegistry::default();
        let token = registry.register_publish(0);

        registry.publish_issued(0);
        assert_eq!(registry.outstanding(), 0);

        token.await_ack(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_qos1_resolves_on_acknowledgement() {
        let mut registry = AckRegistry::default();
        let token = registry.register_publish(1);

        registry.publish_issued(42);
        assert_eq!(registry.outstanding(), 1);

        registry.acknowledged(42);
        token.await_ack(Duration::from_secs(1)).await.unwrap();
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_issue_order_binds_packet_ids() {
        let mut registry = AckRegistry::default();
        let first = registry.register_publish(1);
        let second = registry.register_publish(1);

        registry.publish_issued(10);
        registry.publish_issued(11);

        // Acknowledge the second request only
        registry.acknowledged(11);
        second.await_ack(Duration::from_secs(1)).await.unwrap();

        registry.fail_all("connection reset");
        let result = first.await_ack(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::TransportLost(_))));
    }

    #[tokio::test]
    async fn test_subscribe_resolves_on_suback() {
        let mut registry = AckRegistry::default();
        let token = registry.register_subscribe();

        registry.subscribe_issued(3);
        registry.acknowledged(3);

        token.await_ack(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_all_fails_queued_and_in_flight() {
        let mut registry = AckRegistry::default();
        let queued = registry.register_publish(1);
        let in_flight = registry.register_publish(1);
        registry.publish_issued(5);

        registry.fail_all("broker went away");
        assert_eq!(registry.outstanding(), 0);

        for token in [queued, in_flight] {
            let result = token.await_ack(Duration::from_secs(1)).await;
            match result {
                Err(SessionError::TransportLost(reason)) => {
                    assert!(reason.contains("broker went away"));
                }
                other => panic!("expected TransportLost, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ack_times_out() {
        let mut registry = AckRegistry::default();
        let token = registry.register_publish(1);
        registry.publish_issued(1);

        let result = token.await_ack(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SessionError::DeliveryTimeout { .. })));
    }

    #[tokio::test]
    async fn test_dropped_registry_fails_token() {
        let token = {
            let mut registry = AckRegistry::default();
            registry.register_publish(1)
        };

        let result = token.await_ack(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::TransportLost(_))));
    }

    #[tokio::test]
    async fn test_await_all_stops_at_first_failure() {
        let mut registry = AckRegistry::default();
        let first = registry.register_publish(1);
        let second = registry.register_publish(1);

        registry.publish_issued(1);
        registry.acknowledged(1);
        registry.publish_issued(2);
        registry.fail_all("reset");

        let result = await_all([first, second], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::TransportLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_all_shares_one_deadline() {
        let mut registry = AckRegistry::default();
        let acked = registry.register_publish(1);
        let pending_a = registry.register_publish(1);
        let pending_b = registry.register_publish(1);

        registry.publish_issued(1);
        registry.acknowledged(1);
        registry.publish_issued(2);
        registry.publish_issued(3);

        // Two unacknowledged tokens share the budget; the batch fails
        // after one timeout, not one per token
        let start = tokio::time::Instant::now();
        let result = await_all([acked, pending_a, pending_b], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SessionError::DeliveryTimeout { .. })));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_unknown_acknowledgement_is_ignored() {
        let mut registry = AckRegistry::default();
        registry.acknowledged(99);
        assert_eq!(registry.outstanding(), 0);
    }
}
