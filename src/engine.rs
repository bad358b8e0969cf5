//! Query engine collaborator.
//!
//! The engine executes requests and reports their outcomes through the
//! [`FetchReporter`](crate::fetch::FetchReporter) half of a
//! [`fetch::channel`](crate::fetch::channel). It also translates sub-query
//! failures into client-facing envelopes.
//!
//! # Example
//!
//! ```
//! use metrilyx_dataserver::engine::{QueryEngine, SubmitRequest};
//! use metrilyx_dataserver::fetch::{channel, FetchHandle};
//! use metrilyx_dataserver::Result;
//! use serde_json::Map;
//!
//! struct Empty;
//!
//! impl QueryEngine for Empty {
//!     fn submit(&self, _request: SubmitRequest) -> Result<FetchHandle> {
//!         let (handle, reporter) = channel();
//!         reporter.complete(Some(Map::new()));
//!         Ok(handle)
//!     }
//! }
//! ```

use crate::error::Result;
use crate::fetch::{FetchHandle, PartialFailure};
use crate::protocol::{GraphRequest, RequestEnvelope, RequestMeta, ResponseEnvelope};

/// A request handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitRequest {
    /// A validated graph request.
    Graph(GraphRequest),
    /// An annotation request, passed through unvalidated.
    Annotations(RequestEnvelope),
}

impl SubmitRequest {
    /// Identifier used for the registry key.
    pub fn id(&self) -> &str {
        match self {
            Self::Graph(request) => &request.id,
            Self::Annotations(envelope) => envelope.id().unwrap_or_default(),
        }
    }

    /// Identifying fields mirrored onto responses.
    pub fn meta(&self) -> RequestMeta {
        match self {
            Self::Graph(request) => request.meta(),
            Self::Annotations(envelope) => envelope.meta(),
        }
    }
}

/// Backend that executes requests asynchronously.
pub trait QueryEngine: Send + Sync + 'static {
    /// Start executing `request` and return its handle without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be submitted at all; no
    /// operation exists in that case.
    fn submit(&self, request: SubmitRequest) -> Result<FetchHandle>;

    /// Build the envelope sent to the client for a failed sub-query.
    fn error_envelope(&self, meta: &RequestMeta, failure: &PartialFailure) -> ResponseEnvelope {
        ResponseEnvelope::error(
            meta.clone(),
            format!(
                "{} (sub-query {}: {})",
                failure.error, failure.sub_query, failure.query
            ),
        )
    }
}
