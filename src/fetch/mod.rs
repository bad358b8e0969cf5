//! Fetch module - in-flight backend operations and their bookkeeping.
//!
//! Provides:
//! - [`channel`] / [`FetchHandle`] / [`FetchReporter`] - one operation's event channels
//! - [`FetchRegistry`] - per-connection map of in-flight operations
//! - [`ExpirationSweeper`] - per-connection expiry timer

mod operation;
mod registry;
mod sweeper;

pub use operation::{
    channel, CancelHandle, FetchError, FetchEvent, FetchEvents, FetchHandle, FetchKey,
    FetchReporter, PartialFailure, PartialOutcome, PartialResult, PartialSink, TerminalOutcome,
};
pub use registry::{FetchEntry, FetchRegistry};
pub use sweeper::{ExpirationSweeper, DEFAULT_FETCH_TTL};
