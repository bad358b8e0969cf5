//! Codec module - JSON encoding/decoding for envelopes.
//!
//! - [`JsonCodec::decode`] is permissive: any failure becomes a
//!   [`DataserverError::Decode`](crate::DataserverError::Decode) carrying a
//!   message fit to send back to the client.
//! - [`JsonCodec::encode`] is strict: callers only pass values that are
//!   representable as JSON, so a failure there is a bug and is propagated.
//!
//! # Example
//!
//! ```
//! use metrilyx_dataserver::codec::JsonCodec;
//! use metrilyx_dataserver::protocol::ErrorReply;
//!
//! let text = JsonCodec::encode(&ErrorReply::new("boom")).unwrap();
//! assert_eq!(text, r#"{"error":"boom"}"#);
//!
//! assert!(JsonCodec::decode("not json").is_err());
//! ```

mod json;

pub use json::JsonCodec;
