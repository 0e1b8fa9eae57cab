//! Subscription runs
//!
//! Subscribes to a topic filter and delivers inbound messages to a
//! handler for a bounded listen window. Handlers run on the session's
//! event-dispatch path and must not block; the channel variant hands
//! messages off to a bounded queue for slow consumers.

use crate::config::SubscribeSection;
use crate::error::{SessionError, SessionResult};
use crate::session::{ConnectionManager, DeliveryToken, ReceivedMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Bound on waiting for the broker to confirm a subscription
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the channel variant's hand-off queue
const STREAM_BUFFER: usize = 64;

/// Subscriber bound to one session
pub struct Subscriber {
    manager: Arc<ConnectionManager>,
    config: SubscribeSection,
}

impl Subscriber {
    pub fn new(manager: Arc<ConnectionManager>, config: SubscribeSection) -> Self {
        Self { manager, config }
    }

    /// Subscribe and listen for the configured window
    ///
    /// Invokes `handler` once per matching inbound message, in arrival
    /// order. The run completes when the window elapses (0 = listen until
    /// cancelled) or cancellation is signalled; either way the filter is
    /// unsubscribed before returning. Returns the number of messages
    /// delivered to the handler.
    pub async fn run(
        &self,
        handler: Arc<dyn Fn(ReceivedMessage) + Send + Sync>,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionResult<u64> {
        let received = Arc::new(AtomicU64::new(0));
        let counting_handler: Arc<dyn Fn(ReceivedMessage) + Send + Sync> = {
            let received = received.clone();
            Arc::new(move |message| {
                received.fetch_add(1, Ordering::SeqCst);
                handler(message);
            })
        };

        info!(
            filter = %self.config.topic,
            qos = self.config.qos,
            duration_secs = self.config.duration_secs,
            "Starting subscription run"
        );

        let token = self
            .manager
            .subscribe(&self.config.topic, self.config.qos, counting_handler)
            .await?;

        tokio::select! {
            result = token.await_ack(SUBSCRIBE_ACK_TIMEOUT) => result?,
            _ = cancelled(&mut cancel) => return Err(SessionError::Cancelled),
        }
        info!(filter = %self.config.topic, "Subscription confirmed");

        // Listen window: fixed duration, or until cancelled when zero
        if self.config.duration_secs == 0 {
            cancelled(&mut cancel).await;
        } else {
            let window = Duration::from_secs(self.config.duration_secs);
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = cancelled(&mut cancel) => {}
            }
        }

        if let Err(e) = self.manager.unsubscribe(&self.config.topic).await {
            warn!(filter = %self.config.topic, error = %e, "Unsubscribe failed");
        }

        let count = received.load(Ordering::SeqCst);
        info!(received = count, "Subscription run complete");
        Ok(count)
    }

    /// Subscribe and stream inbound messages over a bounded channel
    ///
    /// The internal handler never blocks the event-dispatch path: when
    /// the consumer falls behind the buffer, messages are dropped with a
    /// warning. The returned token resolves on the broker's confirmation.
    pub async fn stream(
        &self,
    ) -> SessionResult<(DeliveryToken, mpsc::Receiver<ReceivedMessage>)> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let handler: Arc<dyn Fn(ReceivedMessage) + Send + Sync> = Arc::new(move |message| {
            if let Err(e) = tx.try_send(message) {
                warn!(error = %e, "Subscriber stream full, message dropped");
            }
        });

        let token = self
            .manager
            .subscribe(&self.config.topic, self.config.qos, handler)
            .await?;
        Ok((token, rx))
    }
}

/// Resolve once the cancellation flag is raised (or the sender is gone)
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSection;
    use crate::credentials::CredentialBuilder;
    use crate::session::ReconnectConfig;

    const CA_PEM: &[u8] = include_bytes!("../tests/fixtures/ca.pem");
    const CLIENT_PEM: &[u8] = include_bytes!("../tests/fixtures/client.pem");
    const CLIENT_KEY: &[u8] = include_bytes!("../tests/fixtures/client.key");

    fn disconnected_manager() -> Arc<ConnectionManager> {
        let security = CredentialBuilder::build(CA_PEM, CLIENT_PEM, CLIENT_KEY).unwrap();
        let broker = BrokerSection {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "subscriber-test".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 1,
            disconnect_grace_ms: 10,
        };
        Arc::new(ConnectionManager::new(
            broker,
            security,
            ReconnectConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_not_connected() {
        let subscriber = Subscriber::new(disconnected_manager(), SubscribeSection::default());
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = subscriber.run(Arc::new(|_| {}), cancel_rx).await;
        assert!(matches!(result, Err(SessionError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_filter() {
        let mut config = SubscribeSection::default();
        config.topic = "a/#/b".to_string();
        let subscriber = Subscriber::new(disconnected_manager(), config);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = subscriber.run(Arc::new(|_| {}), cancel_rx).await;
        assert!(matches!(result, Err(SessionError::InvalidTopic(_))));
    }

    #[tokio::test]
    async fn test_stream_fails_fast_when_not_connected() {
        let subscriber = Subscriber::new(disconnected_manager(), SubscribeSection::default());
        let result = subscriber.stream().await;
        assert!(matches!(result, Err(SessionError::NotConnected { .. })));
    }
}
