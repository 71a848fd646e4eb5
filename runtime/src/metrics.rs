//! Prometheus metrics for the bridge.
//!
//! Counters are recorded through the `metrics` facade and are no-ops until a
//! recorder is installed. [`MetricsServer`] installs the Prometheus exporter.
//!
//! - requests: sent, timed out, remote errors, discarded late replies
//! - commands: processed per event type, skipped per reason
//! - dead letters: published, failed
//! - retries: attempts, successes, exhausted
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_bridge_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the exporter and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the exporter cannot be installed.
    /// An already-installed recorder is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new().with_http_listener(self.addr);
        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("bridge_requests_sent_total", "Commands published by requesters");
    describe_counter!(
        "bridge_requests_timeout_total",
        "Requests that received no reply in time"
    );
    describe_counter!(
        "bridge_requests_remote_error_total",
        "Requests answered with ERROR_RESPONSE"
    );
    describe_counter!(
        "bridge_responses_discarded_total",
        "Replies with no registered waiter (late, duplicate or foreign)"
    );
    describe_counter!(
        "bridge_commands_processed_total",
        "Commands applied by command processors, by event type"
    );
    describe_counter!(
        "bridge_commands_skipped_total",
        "Command records skipped without applying, by reason"
    );
    describe_counter!("bridge_dlq_published_total", "Messages routed to a dead-letter topic");
    describe_counter!("bridge_dlq_failed_total", "Dead-letter publishes that failed");
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Requester and correlator metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record a published command.
    pub fn record_sent(model_type: &'static str) {
        counter!("bridge_requests_sent_total", "model_type" => model_type).increment(1);
    }

    /// Record a request timeout.
    pub fn record_timeout() {
        counter!("bridge_requests_timeout_total").increment(1);
    }

    /// Record an `ERROR_RESPONSE` reply.
    pub fn record_remote_error() {
        counter!("bridge_requests_remote_error_total").increment(1);
    }

    /// Record a reply nobody was waiting for.
    pub fn record_discarded() {
        counter!("bridge_responses_discarded_total").increment(1);
    }
}

/// Command processor metrics recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record a dispatched command.
    pub fn record_processed(event_type: &'static str) {
        counter!("bridge_commands_processed_total", "event_type" => event_type).increment(1);
    }

    /// Record a skipped record.
    pub fn record_skipped(reason: &'static str) {
        counter!("bridge_commands_skipped_total", "reason" => reason).increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a successful dead-letter publish.
    pub fn record_published() {
        counter!("bridge_dlq_published_total").increment(1);
    }

    /// Record a failed dead-letter publish.
    pub fn record_failed() {
        counter!("bridge_dlq_failed_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
