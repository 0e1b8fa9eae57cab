//! Rate-limited publish loop
//!
//! Sends a sequence of timestamped messages to one topic at a fixed
//! interval, waiting for each acknowledgement before the next send.
//! Fail-fast: an acknowledgement timeout or transport failure ends the
//! whole loop, it is never masked as success.

use crate::config::PublishSection;
use crate::error::{SessionError, SessionResult};
use crate::session::ConnectionManager;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Build the message payload for one send (pure function of the clock)
pub fn timestamp_payload(now: DateTime<Utc>) -> String {
    serde_json::json!({
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "frequency": "50.0",
    })
    .to_string()
}

/// Paced publisher bound to one session
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    config: PublishSection,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>, config: PublishSection) -> Self {
        Self { manager, config }
    }

    /// Run the paced send loop to completion
    ///
    /// Sends `count` messages (0 = unbounded), one per interval, awaiting
    /// each acknowledgement within the configured bound. Returns the
    /// number of acknowledged messages. Cancellation ends the loop with
    /// `Cancelled`; a request already issued is not revoked, only the
    /// wait is abandoned.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> SessionResult<u32> {
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            topic = %self.config.topic,
            qos = self.config.qos,
            count = self.config.count,
            interval_ms = self.config.interval_ms,
            "Starting publish loop"
        );

        let mut acknowledged: u32 = 0;
        loop {
            if self.config.count != 0 && acknowledged == self.config.count {
                break;
            }
            if !tick_or_cancel(&mut ticker, &mut cancel).await {
                return Err(SessionError::Cancelled);
            }

            let payload = timestamp_payload(Utc::now());
            let token = self
                .manager
                .publish(
                    &self.config.topic,
                    payload,
                    self.config.qos,
                    self.config.retain,
                )
                .await?;

            tokio::select! {
                result = token.await_ack(ack_timeout) => result?,
                _ = cancelled(&mut cancel) => return Err(SessionError::Cancelled),
            }

            acknowledged += 1;
            debug!(sequence = acknowledged, "Message acknowledged");
        }

        info!(acknowledged, "Publish loop complete");
        Ok(acknowledged)
    }
}

/// Wait for the next tick; returns false when cancellation wins
async fn tick_or_cancel(ticker: &mut Interval, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    loop {
        tokio::select! {
            _ = ticker.tick() => return true,
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return false,
                Ok(()) => {}
                Err(_) => return false,
            },
        }
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
            client_id: "publisher-test".to_string(),
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

    #[test]
    fn test_timestamp_payload_is_well_formed_json() {
        let payload = timestamp_payload(Utc::now());
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["frequency"], "50.0");
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_timestamp_payload_reflects_the_clock() {
        let instant = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = timestamp_payload(instant);
        assert!(payload.contains("2024-05-01T12:00:00"));
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_not_connected() {
        let publisher = Publisher::new(disconnected_manager(), PublishSection::default());
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = publisher.run(cancel_rx).await;
        assert!(matches!(result, Err(SessionError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_run_observes_prior_cancellation() {
        let publisher = Publisher::new(disconnected_manager(), PublishSection::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let result = publisher.run(cancel_rx).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_zero_count_loop_is_cancellable() {
        let mut config = PublishSection::default();
        config.count = 0;
        config.interval_ms = 5;
        let publisher = Publisher::new(disconnected_manager(), config);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let result = publisher.run(cancel_rx).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }
}
