//! Fetch operations: one submitted unit of backend query work.
//!
//! [`channel`] creates the two ends of an operation:
//!
//! - [`FetchReporter`] is handed to the query engine. It raises zero or more
//!   partial outcomes followed by exactly one terminal outcome, and can
//!   observe cancellation.
//! - [`FetchHandle`] is returned to the connection. It splits into a
//!   [`FetchEvents`] stream (partials, then the terminal) and a
//!   [`CancelHandle`].
//!
//! Cancellation is fire-and-forget: it flips a flag the engine may watch.
//!
//! # Example
//!
//! ```
//! use metrilyx_dataserver::fetch::{channel, FetchEvent};
//! use serde_json::Map;
//!
//! # tokio_test_block(async {
//! let (handle, reporter) = channel();
//! let (mut events, _cancel) = handle.into_parts();
//!
//! reporter.partial(0, Map::new());
//! reporter.complete(Some(Map::new()));
//!
//! assert!(matches!(events.next().await, Some(FetchEvent::Partial(Ok(_)))));
//! assert!(matches!(events.next().await, Some(FetchEvent::Terminal(Ok(Some(_))))));
//! assert!(events.next().await.is_none());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::Timestamp;

/// Registry key of a fetch operation.
///
/// The submission timestamp keeps a resubmitted request from colliding with
/// its predecessor and drives expiry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    request_id: String,
    submitted_at: Timestamp,
}

impl FetchKey {
    pub fn new(request_id: impl Into<String>, submitted_at: Timestamp) -> Self {
        Self {
            request_id: request_id.into(),
            submitted_at,
        }
    }

    #[inline]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[inline]
    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.request_id, self.submitted_at)
    }
}

/// Why a fetch operation (or one of its sub-queries) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Cancelled by the connection (close, expiry, or replacement).
    #[error("request cancelled")]
    Cancelled,

    /// The backend reported a failure.
    #[error("{0}")]
    Backend(String),

    /// The engine dropped the operation without a terminal outcome.
    #[error("operation dropped without completing")]
    Dropped,
}

impl FetchError {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A satisfied sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    /// Position of the sub-query in the request's `series`.
    pub sub_query: usize,
    pub payload: Map<String, Value>,
}

/// A failed sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialFailure {
    /// Position of the sub-query in the request's `series`.
    pub sub_query: usize,
    /// The failing sub-query specification.
    pub query: Value,
    pub error: FetchError,
}

pub type PartialOutcome = std::result::Result<PartialResult, PartialFailure>;

/// `Ok(None)` completes without anything to send.
pub type TerminalOutcome = std::result::Result<Option<Map<String, Value>>, FetchError>;

/// One event from a fetch operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Partial(PartialOutcome),
    Terminal(TerminalOutcome),
}

/// Create a connected handle/reporter pair.
pub fn channel() -> (FetchHandle, FetchReporter) {
    let (partial_tx, partial_rx) = mpsc::unbounded_channel();
    let (terminal_tx, terminal_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let handle = FetchHandle {
        events: FetchEvents {
            partials: partial_rx,
            terminal: terminal_rx,
            partials_open: true,
            terminal_outcome: None,
            done: false,
        },
        cancel: CancelHandle { tx: cancel_tx },
    };
    let reporter = FetchReporter {
        partials: PartialSink { tx: partial_tx },
        terminal: terminal_tx,
        cancelled: cancel_rx,
    };
    (handle, reporter)
}

/// Connection-side end of a fetch operation.
pub struct FetchHandle {
    events: FetchEvents,
    cancel: CancelHandle,
}

impl FetchHandle {
    pub fn into_parts(self) -> (FetchEvents, CancelHandle) {
        (self.events, self.cancel)
    }
}

/// Requests cancellation of a fetch operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire-and-forget; the engine may or may not stop promptly.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Partial outcomes followed by exactly one terminal outcome.
pub struct FetchEvents {
    partials: mpsc::UnboundedReceiver<PartialOutcome>,
    terminal: oneshot::Receiver<TerminalOutcome>,
    partials_open: bool,
    terminal_outcome: Option<TerminalOutcome>,
    done: bool,
}

impl FetchEvents {
    /// Next event, or `None` once the terminal event has been returned.
    ///
    /// Partials already queued when the terminal outcome arrives are
    /// returned before it.
    pub async fn next(&mut self) -> Option<FetchEvent> {
        loop {
            if let Some(terminal) = self.terminal_outcome.take() {
                if let Ok(partial) = self.partials.try_recv() {
                    self.terminal_outcome = Some(terminal);
                    return Some(FetchEvent::Partial(partial));
                }
                self.done = true;
                return Some(FetchEvent::Terminal(terminal));
            }
            if self.done {
                return None;
            }

            tokio::select! {
                biased;
                partial = self.partials.recv(), if self.partials_open => match partial {
                    Some(partial) => return Some(FetchEvent::Partial(partial)),
                    None => self.partials_open = false,
                },
                terminal = &mut self.terminal => {
                    self.terminal_outcome = Some(terminal.unwrap_or(Err(FetchError::Dropped)));
                }
            }
        }
    }
}

/// Clonable sender for partial outcomes.
///
/// Engines that run sub-queries concurrently hand one to each task.
#[derive(Debug, Clone)]
pub struct PartialSink {
    tx: mpsc::UnboundedSender<PartialOutcome>,
}

impl PartialSink {
    /// Report a satisfied sub-query. Dropped silently if nobody listens.
    pub fn partial(&self, sub_query: usize, payload: Map<String, Value>) {
        let _ = self.tx.send(Ok(PartialResult { sub_query, payload }));
    }

    /// Report a failed sub-query. Dropped silently if nobody listens.
    pub fn partial_error(&self, sub_query: usize, query: Value, error: FetchError) {
        let _ = self.tx.send(Err(PartialFailure {
            sub_query,
            query,
            error,
        }));
    }
}

/// Engine-side end of a fetch operation.
pub struct FetchReporter {
    partials: PartialSink,
    terminal: oneshot::Sender<TerminalOutcome>,
    cancelled: watch::Receiver<bool>,
}

impl FetchReporter {
    /// A clonable sender for partial outcomes.
    pub fn partials(&self) -> PartialSink {
        self.partials.clone()
    }

    pub fn partial(&self, sub_query: usize, payload: Map<String, Value>) {
        self.partials.partial(sub_query, payload);
    }

    pub fn partial_error(&self, sub_query: usize, query: Value, error: FetchError) {
        self.partials.partial_error(sub_query, query, error);
    }

    /// Finish successfully. `None` means there is no aggregate to send.
    pub fn complete(self, payload: Option<Map<String, Value>>) {
        let _ = self.terminal.send(Ok(payload));
    }

    /// Finish with an error.
    pub fn fail(self, error: FetchError) {
        let _ = self.terminal.send(Err(error));
    }

    /// Whether cancellation was requested, or the connection side is gone.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.cancelled.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the connection side is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.cancelled.wait_for(|cancelled| *cancelled).await;
    }
}
