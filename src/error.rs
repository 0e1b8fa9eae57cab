//! Error taxonomy for MQTT session operations
//!
//! Credential and configuration errors are fatal and reported once at
//! startup. Transport instability is recovered internally up to the retry
//! budget and surfaced to handlers as `ConnectionLost` events; only budget
//! exhaustion escalates to the caller.

use crate::credentials::CredentialError;
use crate::session::connection::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Connection not established within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Acknowledgement not received within {timeout:?}")]
    DeliveryTimeout { timeout: Duration },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Publish request rejected")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Subscribe request rejected")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_nonempty() {
        let errors: Vec<SessionError> = vec![
            SessionError::ConnectTimeout {
                timeout: Duration::from_secs(30),
            },
            SessionError::NotConnected {
                state: ConnectionState::Disconnected,
            },
            SessionError::DeliveryTimeout {
                timeout: Duration::from_secs(5),
            },
            SessionError::TransportLost("connection reset".to_string()),
            SessionError::Cancelled,
            SessionError::InvalidTopic("a/#/b".to_string()),
            SessionError::PublishFailed("rejected".to_string().into()),
            SessionError::SubscribeFailed("rejected".to_string().into()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_not_connected_mentions_state() {
        let error = SessionError::NotConnected {
            state: ConnectionState::Connecting,
        };
        assert!(error.to_string().contains("Connecting"));
    }
}
