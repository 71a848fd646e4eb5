//! # Entity Bridge Runtime
//!
//! Request/response over a partitioned log.
//!
//! This crate provides the moving parts that sit on top of the transport
//! traits in `entity-bridge-core`:
//!
//! ## Core Components
//!
//! - **Bridge**: process-level wiring of everything below
//! - **`EntityClient`**: create/update/delete/get-all/get-by-id against a remote owner
//! - **`ResponseCorrelator`**: matches replies to waiting callers, with timeouts
//! - **`CommandProcessor`**: applies commands at most once per in-flight
//!   correlation id and replies
//! - **`DeadLetterRouter`**: quarantines messages that cannot be processed
//! - **`TopicProvisioner`**: creates topics lazily before first use
//!
//! ## Example
//!
//! ```ignore
//! use entity_bridge_runtime::Bridge;
//!
//! let bridge = Bridge::builder(config, transport.clone(), transport).build();
//! bridge.serve::<Order>(order_store);
//!
//! let users = bridge.client::<User>("utility");
//! let user = users.get_by_id(user_id).await?;
//! ```

/// Process-level wiring
pub mod bridge;

/// Request-style entity client
pub mod client;

/// Reply correlation and timeouts
pub mod correlator;

/// Dead-letter routing
pub mod dead_letter;

/// Caller-visible errors
pub mod error;

/// Read loop states and handles
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Idempotent command processing
pub mod processor;

/// Topic provisioning and publishing
pub mod publisher;

/// Retry logic with exponential backoff
pub mod retry;

mod read_loop;

pub use bridge::{Bridge, BridgeBuilder};
pub use client::{Command, EntityClient, Reply, RequestOptions};
pub use correlator::{PendingReply, RawReply, ResponseCorrelator};
pub use dead_letter::{DeadLetter, DeadLetterRouter};
pub use error::{RemoteFailure, RequestError};
pub use lifecycle::{LoopHandle, LoopState};
pub use processor::{
    Claim, CommandProcessor, ProcessedIds, ProcessorBinding, RecordOutcome, SkipReason,
};
pub use publisher::{Publisher, TopicProvisioner};
pub use read_loop::IDLE_DELAY;
pub use retry::RetryPolicy;
