//! Pure connection state management
//!
//! Connection state machine, reconnect backoff policy, and MQTT option
//! construction. Everything here is a pure function of its inputs so it
//! can be tested without a broker.

use crate::config::{BrokerSection, ReconnectSection};
use crate::credentials::SecurityConfig;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use std::time::Duration;

/// Connection state for one session
///
/// Mutated only by the connection manager; observed by publishers and
/// subscribers to gate operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection attempt has been made
    Disconnected,
    /// connect() in progress, waiting for the broker's acknowledgement
    Connecting,
    /// Session established and ready for operations
    Connected,
    /// Transport lost, automatic reconnection in progress (attempt count)
    Reconnecting(u32),
    /// Closed by an explicit disconnect() call
    ClosedByUser,
    /// Connect failed or retry budget exhausted
    Failed(String),
}

/// Reconnect backoff policy: exponential, bounded by a maximum interval
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay
    pub max_delay: Duration,
    /// Retry budget (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_attempts: section.max_attempts,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a given attempt (1-based): initial * 2^(n-1), capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

/// Decision for one reconnection attempt
#[derive(Debug, PartialEq)]
pub enum ReconnectDecision {
    /// Proceed with the next attempt after the given delay
    Proceed { attempt: u32, delay: Duration },
    /// Stop: shutdown was requested
    AbortShutdownRequested,
    /// Stop: retry budget exhausted
    AbortBudgetExhausted,
}

/// Decide whether another reconnection attempt should be made
pub fn should_attempt_reconnect(
    completed_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectDecision {
    if shutdown_requested {
        return ReconnectDecision::AbortShutdownRequested;
    }
    if let Some(max) = config.max_attempts {
        if completed_attempts >= max {
            return ReconnectDecision::AbortBudgetExhausted;
        }
    }
    let attempt = completed_attempts + 1;
    ReconnectDecision::Proceed {
        attempt,
        delay: config.delay_for_attempt(attempt),
    }
}

/// Check whether the state allows publish/subscribe operations
pub fn can_operate(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

/// Convert a configured QoS level (0/1/2) to the transport type
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Build MQTT options for one connection attempt
///
/// The security configuration is applied as the transport; the client
/// identifier comes straight from configuration, never inferred.
pub fn configure_mqtt_options(broker: &BrokerSection, security: &SecurityConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
    options.set_transport(security.transport());
    options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    options
}
