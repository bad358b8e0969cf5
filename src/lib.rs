//! # metrilyx-dataserver
//!
//! Websocket push server for metric graphs.
//!
//! Dashboard clients keep one websocket open and send graph requests as JSON
//! envelopes. Each request is handed to a [`QueryEngine`]; as the engine
//! resolves sub-queries the server streams partial results back, followed by
//! the aggregate result.
//!
//! ## Architecture
//!
//! - **Codec / protocol**: JSON envelopes in, JSON envelopes out. Binary
//!   frames are rejected.
//! - **Connection**: one task per socket owns a fetch registry and an expiry
//!   sweeper; closing the socket cancels everything it has in flight.
//! - **Engine**: an external collaborator reporting partial and terminal
//!   outcomes through [`fetch::channel`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use metrilyx_dataserver::Server;
//!
//! #[tokio::main]
//! async fn main() -> metrilyx_dataserver::Result<()> {
//!     let engine = Arc::new(MyEngine::new());
//!     Server::builder().build(engine).serve().await
//! }
//! ```

pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod protocol;
pub mod writer;

mod connection;
mod server;

pub use broadcast::{BroadcastSet, ClientSet, ConnectionId};
pub use connection::{Connection, ConnectionState, OperationEvent};
pub use engine::{QueryEngine, SubmitRequest};
pub use error::{DataserverError, Result};
pub use server::{Server, ServerBuilder};
