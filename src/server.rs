//! Server builder and websocket hosting.
//!
//! The [`ServerBuilder`] provides a fluent API for configuring the server.
//! The [`Server`] accepts websocket upgrades on one route and runs one
//! [`Connection`] per socket:
//! 1. Upgrade the HTTP request and log the peer
//! 2. Spawn a writer task over the socket's sink
//! 3. Map socket messages to [`InboundFrame`]s
//! 4. Run the connection until the socket closes
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use metrilyx_dataserver::Server;
//!
//! #[tokio::main]
//! async fn main() -> metrilyx_dataserver::Result<()> {
//!     Server::builder()
//!         .bind("127.0.0.1:9000".parse().unwrap())
//!         .fetch_ttl(Duration::from_secs(600))
//!         .build(Arc::new(MyEngine::connect()?))
//!         .serve()
//!         .await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::net::TcpListener;

use crate::broadcast::ClientSet;
use crate::config::{ConnectionConfig, ServerConfig};
use crate::connection::Connection;
use crate::engine::QueryEngine;
use crate::error::Result;
use crate::protocol::{CloseInfo, InboundFrame};
use crate::writer::spawn_writer_task;

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    clients: Option<Arc<ClientSet>>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            clients: None,
        }
    }

    /// Set the listen address.
    ///
    /// Default: 0.0.0.0:9000
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the route that accepts websocket upgrades.
    ///
    /// Default: /api/data
    pub fn path(mut self, path: &str) -> Self {
        self.config.path = path.to_string();
        self
    }

    /// Set how long a fetch may stay in flight before it is swept.
    ///
    /// Default: 900 seconds
    pub fn fetch_ttl(mut self, ttl: Duration) -> Self {
        self.config.connection.fetch_ttl = ttl;
        self
    }

    /// Set the maximum pending outbound messages per connection.
    ///
    /// Default: 1024
    pub fn max_pending_messages(mut self, limit: usize) -> Self {
        self.config.connection.writer.max_pending_messages = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.connection.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.writer.backpressure_timeout = timeout;
        self
    }

    /// Share an existing client set instead of creating one.
    pub fn clients(mut self, clients: Arc<ClientSet>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Build the server around `engine`.
    pub fn build(self, engine: Arc<dyn QueryEngine>) -> Server {
        Server {
            config: self.config,
            engine,
            clients: self.clients.unwrap_or_default(),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct ServerState {
    engine: Arc<dyn QueryEngine>,
    clients: Arc<ClientSet>,
    connection: Arc<ConnectionConfig>,
}

/// A configured websocket server.
pub struct Server {
    config: ServerConfig,
    engine: Arc<dyn QueryEngine>,
    clients: Arc<ClientSet>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Every open connection, for broadcasting.
    pub fn clients(&self) -> &Arc<ClientSet> {
        &self.clients
    }

    /// The axum router serving websocket upgrades.
    pub fn router(&self) -> Router {
        let state = ServerState {
            engine: self.engine.clone(),
            clients: self.clients.clone(),
            connection: Arc::new(self.config.connection.clone()),
        };
        Router::new()
            .route(&self.config.path, get(upgrade))
            .with_state(state)
    }

    /// Bind the configured address and serve until the process stops.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Listening on {} at {}",
            listener.local_addr()?,
            self.config.path
        );
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: ServerState) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let (writer, writer_task) = spawn_writer_task(sink, state.connection.writer.clone());

    let connection = Connection::new(
        peer.to_string(),
        state.engine.clone(),
        state.clients.clone(),
        writer,
        &state.connection,
    );
    let inbound = stream.filter_map(|message| future::ready(inbound_frame(message)));
    connection.run(Box::pin(inbound)).await;

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Writer for {} ended: {}", peer, e),
        Err(e) => tracing::warn!("Writer task for {} failed: {}", peer, e),
    }
}

/// Map a socket message to a connection frame. Ping/pong is handled by axum.
fn inbound_frame(message: std::result::Result<Message, axum::Error>) -> Option<InboundFrame> {
    match message {
        Ok(Message::Text(text)) => Some(InboundFrame::Text(text)),
        Ok(Message::Binary(data)) => Some(InboundFrame::Binary(Bytes::from(data))),
        Ok(Message::Close(frame)) => Some(InboundFrame::Close(close_info(frame))),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(InboundFrame::Close(CloseInfo::abnormal(e.to_string()))),
    }
}

fn close_info(frame: Option<CloseFrame<'static>>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo::clean(frame.code, frame.reason.into_owned()),
        None => CloseInfo {
            was_clean: true,
            code: None,
            reason: String::new(),
        },
    }
}
