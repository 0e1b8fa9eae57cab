//! Long-lived MQTT sessions over mutual TLS
//!
//! Builds validated TLS credentials, opens a broker session that survives
//! transport loss through supervised reconnection, and runs paced publish
//! and bounded subscribe workloads over it.
//!
//! The crate separates pure decision logic (connection state, backoff,
//! event routing, topic matching) from the impure connection manager that
//! owns the client and its event loop, so session behavior is testable
//! without a broker.

pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod observability;
pub mod publisher;
pub mod session;
pub mod subscriber;
pub mod topic;

pub use config::SessionConfig;
pub use credentials::{CredentialBuilder, CredentialError, SecurityConfig};
pub use driver::{RunMode, RunSummary, SessionDriver};
pub use error::{SessionError, SessionResult};
pub use publisher::Publisher;
pub use session::{
    ConnectionManager, ConnectionState, DeliveryToken, LifecycleEvent, ReceivedMessage,
};
pub use subscriber::Subscriber;
