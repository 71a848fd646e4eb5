//! # Entity Bridge Testing
//!
//! Testing utilities for the entity bridge.
//!
//! This crate provides:
//! - [`InMemoryLog`]: partitioned log with consumer groups and fault injection
//! - [`InMemoryEntityStore`]: staged, transactional entity storage
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use entity_bridge_testing::{InMemoryEntityStore, InMemoryLog, test_clock};
//!
//! #[tokio::test]
//! async fn create_round_trip() {
//!     let log = Arc::new(InMemoryLog::new());
//!     let bridge = Bridge::builder(config, log.clone(), log.clone())
//!         .clock(Arc::new(test_clock()))
//!         .build();
//!
//!     bridge.serve::<Order>(Arc::new(InMemoryEntityStore::new()));
//!     let created = bridge.client::<Order>("payment").create(order).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use entity_bridge_core::environment::Clock;

pub mod log;
pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making envelope timestamps reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use entity_bridge_testing::mocks::FixedClock;
    /// use entity_bridge_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use log::InMemoryLog;
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryEntityStore;
