//! Protocol module - frames and envelopes.
//!
//! This module defines what travels over a client connection:
//! - [`InboundFrame`] - a transport message as seen by the connection
//! - [`RequestEnvelope`] / [`GraphRequest`] - decoded and validated requests
//! - [`ResponseEnvelope`] / [`ErrorReply`] - outbound messages

mod envelope;
mod frame;

pub use envelope::{
    format_start, ErrorReply, GraphRequest, RequestEnvelope, RequestMeta, ResponseBody,
    ResponseEnvelope, ANNOTATIONS_ID, ID_ALIAS, ID_FIELD,
};
pub use frame::{CloseInfo, InboundFrame};
