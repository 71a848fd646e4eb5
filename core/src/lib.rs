//! # Entity Bridge Core
//!
//! Core traits and wire types for exchanging entity commands between services
//! over a partitioned, append-only log while keeping a request/response feel.
//!
//! This crate provides:
//!
//! - [`envelope`]: the single wire structure and its JSON codec
//! - [`topic`]: deterministic topic naming and creation settings
//! - [`transport`]: publish / poll / commit / topic-admin abstractions
//! - [`entity`]: entity contract and the local storage collaborator
//! - [`config`]: environment-driven configuration
//! - [`environment`]: injected dependencies such as the clock
//!
//! ## Architecture
//!
//! ```text
//!  caller service                              owning service
//! ┌──────────────┐   {caller}-{owner}-{entity}   ┌──────────────────┐
//! │ EntityClient │ ────────── CREATE ──────────► │ CommandProcessor │
//! │              │                               │        │         │
//! │  Response    │   {owner}-{caller}-{entity}   │   UnitOfWork     │
//! │  Correlator  │ ◄──── CREATED_RESPONSE ────── │        │         │
//! └──────────────┘                               └────────┼─────────┘
//!                                                         ▼
//!                                                  {entity}-dlq
//! ```
//!
//! The runtime pieces live in `entity-bridge-runtime`; the Kafka-protocol
//! transport in `entity-bridge-redpanda`; in-memory doubles in
//! `entity-bridge-testing`.

pub mod config;
pub mod entity;
pub mod envelope;
pub mod topic;
pub mod transport;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

// Re-export commonly used types
pub use config::{BridgeConfig, ConfigError};
pub use entity::{Entity, EntityStore, StoreError, UnitOfWork};
pub use envelope::{CodecError, Envelope, EventType};
pub use environment::{Clock, SystemClock};
pub use topic::{TopicRoute, TopicSettings};
pub use transport::{
    BoxFuture, LogConsumer, LogRecord, LogTransport, StartOffset, Subscription, TopicAdmin,
    TransportError,
};
