//! Lifecycle of background read loops.
//!
//! Every read loop runs as its own tokio task and publishes its [`LoopState`]
//! through a `watch` channel, so a supervisor can observe it without calling
//! into the loop:
//!
//! ```text
//! Starting ──► Subscribed ──► Idle ⇄ Processing
//!    │                          │         │
//!    │                          ▼         ▼
//!    │                        Stopping ──► Stopped
//!    └──────────────► Faulted (unrecoverable transport failure)
//! ```
//!
//! Stop requests are only honoured between records, so a record being
//! processed when [`LoopHandle::stop`] is called is finished first.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observable state of a read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// Task spawned, consumer not yet open.
    Starting,
    /// Consumer open; about to poll.
    Subscribed,
    /// Waiting for the next record.
    Idle,
    /// Handling a record.
    Processing,
    /// Stop requested; finishing up.
    Stopping,
    /// Exited after a stop request. Terminal.
    Stopped,
    /// Exited on an unrecoverable transport failure. Terminal.
    Faulted(String),
}

impl LoopState {
    /// Whether the loop has exited.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted(_))
    }
}

/// Owner-side handle of a running read loop.
///
/// Dropping the handle requests a stop without waiting for it.
pub struct LoopHandle {
    name: String,
    state: watch::Receiver<LoopState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Spawn `body` as a named loop.
    pub(crate) fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(LoopControl) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(LoopState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let control = LoopControl {
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(body(control));

        Self {
            name: name.into(),
            state: state_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    /// Loop name (usually the topic it reads).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    /// A receiver for watching state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate` and return it.
    ///
    /// Returns the last observed state if the loop task is gone.
    pub async fn wait_for<P>(&self, predicate: P) -> LoopState
    where
        P: FnMut(&LoopState) -> bool,
    {
        let mut state = self.state.clone();
        if let Ok(observed) = state.wait_for(predicate).await {
            return observed.clone();
        }
        state.borrow().clone()
    }

    /// Request a stop, wait for the loop to drain and exit, and return its
    /// final state.
    pub async fn stop(mut self) -> LoopState {
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(name = %self.name, error = %e, "Read loop task failed");
                return LoopState::Faulted(e.to_string());
            }
        }

        self.state()
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Loop-side half: publishes state and observes stop requests.
pub(crate) struct LoopControl {
    state: watch::Sender<LoopState>,
    shutdown: watch::Receiver<bool>,
}

impl LoopControl {
    pub(crate) fn set(&self, state: LoopState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`, waking early on a stop request. Returns `true` if a
    /// stop was requested.
    pub(crate) async fn sleep(&mut self, delay: Duration) -> bool {
        if self.stop_requested() {
            return true;
        }
        let woken = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            _ = self.shutdown.wait_for(|stop| *stop) => true,
        };
        woken || self.stop_requested()
    }

    /// Mark the loop as stopped after a stop request.
    pub(crate) fn finish(&self) {
        self.set(LoopState::Stopping);
        self.set(LoopState::Stopped);
    }

    /// Mark the loop as faulted.
    pub(crate) fn fault(&self, reason: impl Into<String>) {
        self.set(LoopState::Faulted(reason.into()));
    }
}
