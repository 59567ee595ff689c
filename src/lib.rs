//! Conformance core of a vertiport reservation DSS: a versioned entity store
//! for operational intent references, constraint references, and
//! subscriptions, with synchronous notification fan-out and derived
//! availability queries. Callers own the transport and deliver notifications.

pub mod engine;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError};
pub use notify::NotifyHub;
