//! MQTT session core
//!
//! Split between pure decision logic (`connection`, `events`) and the
//! impure connection manager that owns the client, the event loop task,
//! and the reconnection supervisor.

pub mod connection;
pub mod events;
pub mod manager;
pub mod token;

pub use connection::{ConnectionState, ReconnectConfig};
pub use events::{LifecycleEvent, LifecycleHandler, MessageHandler, ReceivedMessage};
pub use manager::ConnectionManager;
pub use token::{await_all, DeliveryToken};
