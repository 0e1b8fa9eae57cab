//! Observability infrastructure
//!
//! Structured logging for session lifecycle, delivery, and reconnection
//! activity.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
