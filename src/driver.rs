//! Top-level session orchestration
//!
//! One run: build credentials, connect, do the work (publish, subscribe,
//! or both), disconnect. The driver owns the completion decision and
//! guarantees the disconnect happens even when the work fails or is
//! cancelled, so the broker always sees a clean session close.

use crate::config::SessionConfig;
use crate::credentials::CredentialBuilder;
use crate::error::SessionResult;
use crate::publisher::Publisher;
use crate::session::{ConnectionManager, LifecycleEvent, MessageHandler};
use crate::subscriber::Subscriber;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// What a run does once the session is up
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// Send the configured message sequence, then disconnect
    Publish,
    /// Listen for the configured window, then disconnect
    Subscribe,
    /// Publish and subscribe concurrently over one session
    Both,
}

/// Outcome of a completed run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub published: u32,
    pub received: u64,
}

/// Orchestrates one session run
pub struct SessionDriver {
    config: SessionConfig,
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl SessionDriver {
    /// Create a driver from configuration and PEM credential buffers
    pub fn new(config: SessionConfig, ca_pem: Vec<u8>, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self {
            config,
            ca_pem,
            cert_pem,
            key_pem,
        }
    }

    /// Run to completion with the default (logging) message handler
    pub async fn run(&self, mode: RunMode, cancel: watch::Receiver<bool>) -> SessionResult<RunSummary> {
        let handler: MessageHandler = Arc::new(|message| {
            info!(
                topic = %message.topic,
                qos = message.qos,
                payload = %String::from_utf8_lossy(&message.payload),
                "Message received"
            );
        });
        self.run_with_handler(mode, handler, cancel).await
    }

    /// Run to completion, delivering inbound messages to `on_message`
    ///
    /// Credential errors are fatal and reported before any connection
    /// attempt. Cancellation ends the work early; the session is
    /// disconnected in every outcome.
    pub async fn run_with_handler(
        &self,
        mode: RunMode,
        on_message: MessageHandler,
        cancel: watch::Receiver<bool>,
    ) -> SessionResult<RunSummary> {
        let security = CredentialBuilder::build(&self.ca_pem, &self.cert_pem, &self.key_pem)?;

        let manager = Arc::new(ConnectionManager::new(
            self.config.broker.clone(),
            security,
            (&self.config.reconnect).into(),
        ));
        manager.on_lifecycle_event(Arc::new(|event| match event {
            LifecycleEvent::Connected => info!("Session established"),
            LifecycleEvent::Reconnected => info!("Session re-established"),
            LifecycleEvent::ConnectionLost { reason } => {
                warn!(reason = %reason, "Session interrupted")
            }
            LifecycleEvent::Disconnected => info!("Session closed"),
        }));

        manager.connect().await?;

        let work = self.do_work(&manager, mode, on_message, cancel).await;

        // Disconnect in every outcome, including cancellation
        let closed = manager.disconnect().await;

        let summary = work?;
        closed?;
        Ok(summary)
    }

    async fn do_work(
        &self,
        manager: &Arc<ConnectionManager>,
        mode: RunMode,
        on_message: MessageHandler,
        cancel: watch::Receiver<bool>,
    ) -> SessionResult<RunSummary> {
        match mode {
            RunMode::Publish => {
                let publisher = Publisher::new(manager.clone(), self.config.publish.clone());
                let published = publisher.run(cancel).await?;
                Ok(RunSummary {
                    published,
                    received: 0,
                })
            }
            RunMode::Subscribe => {
                let subscriber = Subscriber::new(manager.clone(), self.config.subscribe.clone());
                let received = subscriber.run(on_message, cancel).await?;
                Ok(RunSummary {
                    published: 0,
                    received,
                })
            }
            RunMode::Both => {
                let publisher = Publisher::new(manager.clone(), self.config.publish.clone());
                let subscriber = Subscriber::new(manager.clone(), self.config.subscribe.clone());

                let (published, received) = tokio::join!(
                    publisher.run(cancel.clone()),
                    subscriber.run(on_message, cancel),
                );
                Ok(RunSummary {
                    published: published?,
                    received: received?,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialError;
    use crate::error::SessionError;

    const CA_PEM: &[u8] = include_bytes!("../tests/fixtures/ca.pem");
    const CLIENT_PEM: &[u8] = include_bytes!("../tests/fixtures/client.pem");
    const CLIENT_KEY: &[u8] = include_bytes!("../tests/fixtures/client.key");
    const OTHER_KEY: &[u8] = include_bytes!("../tests/fixtures/other.key");

    fn test_config() -> SessionConfig {
        let toml_content = r#"
[broker]
host = "127.0.0.1"
port = 1
client_id = "driver-test"
connect_timeout_secs = 1

[tls]
ca_file = "ca.pem"
cert_file = "client.pem"
key_file = "client.key"

[reconnect]
initial_delay_ms = 10
max_delay_ms = 20
max_attempts = 1
"#;
        toml::from_str(toml_content).unwrap()
    }

    #[tokio::test]
    async fn test_mismatched_credentials_fail_before_connecting() {
        let driver = SessionDriver::new(
            test_config(),
            CA_PEM.to_vec(),
            CLIENT_PEM.to_vec(),
            OTHER_KEY.to_vec(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = driver.run(RunMode::Publish, cancel_rx).await;
        match result {
            Err(SessionError::Credential(CredentialError::KeyMismatch)) => {}
            other => panic!("expected KeyMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_the_run() {
        let driver = SessionDriver::new(
            test_config(),
            CA_PEM.to_vec(),
            CLIENT_PEM.to_vec(),
            CLIENT_KEY.to_vec(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = driver.run(RunMode::Subscribe, cancel_rx).await;
        assert!(result.is_err());
    }
}
