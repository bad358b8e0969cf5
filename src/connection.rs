//! Per-connection request lifecycle.
//!
//! A [`Connection`] moves through `Connecting → Open → Closing → Closed`.
//! While open it:
//! 1. Decodes each text frame and validates graph requests
//! 2. Submits requests to the [`QueryEngine`] and registers the operations
//! 3. Streams partial and complete results back as they arrive
//! 4. Sweeps operations that outlive the fetch TTL
//!
//! On close every in-flight operation is cancelled, the sweeper stops and
//! the connection leaves the [`BroadcastSet`].
//!
//! All of this runs on one task ([`Connection::run`]). Engine events reach
//! it through a channel, one relay task per operation, tagged with the
//! operation's key and generation. Events for operations that are no longer
//! registered are dropped.
//!
//! # Example
//!
//! ```ignore
//! let (writer, _task) = spawn_writer_task(sink, config.writer.clone());
//! let connection = Connection::new(peer, engine, clients, writer, &config);
//! connection.run(inbound_frames).await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastSet, ConnectionId};
use crate::clock::{Clock, SystemClock};
use crate::codec::JsonCodec;
use crate::config::ConnectionConfig;
use crate::engine::{QueryEngine, SubmitRequest};
use crate::error::{DataserverError, Result};
use crate::fetch::{
    ExpirationSweeper, FetchEntry, FetchEvent, FetchEvents, FetchKey, FetchRegistry,
};
use crate::protocol::{
    format_start, CloseInfo, ErrorReply, GraphRequest, InboundFrame, RequestEnvelope,
    ResponseBody, ResponseEnvelope,
};
use crate::writer::WriterHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An event from one fetch operation, tagged for registry lookup.
#[derive(Debug)]
pub struct OperationEvent {
    pub key: FetchKey,
    pub generation: u64,
    pub event: FetchEvent,
}

enum Step {
    Frame(Option<InboundFrame>),
    Event(OperationEvent),
    Sweep,
}

/// One client connection and everything it has in flight.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    state: ConnectionState,
    registry: FetchRegistry,
    sweeper: ExpirationSweeper,
    fetch_ttl: Duration,
    engine: Arc<dyn QueryEngine>,
    clients: Arc<dyn BroadcastSet>,
    writer: WriterHandle,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::UnboundedSender<OperationEvent>,
    events_rx: mpsc::UnboundedReceiver<OperationEvent>,
}

impl Connection {
    /// Accept a connection from `peer`. Nothing is registered until [`open`](Self::open).
    pub fn new(
        peer: impl Into<String>,
        engine: Arc<dyn QueryEngine>,
        clients: Arc<dyn BroadcastSet>,
        writer: WriterHandle,
        config: &ConnectionConfig,
    ) -> Self {
        let peer = peer.into();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connection request by {} (id={})", peer, id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            peer,
            state: ConnectionState::Connecting,
            registry: FetchRegistry::new(),
            sweeper: ExpirationSweeper::new(config.fetch_ttl),
            fetch_ttl: config.fetch_ttl,
            engine,
            clients,
            writer,
            clock: Arc::new(SystemClock),
            events_tx,
            events_rx,
        }
    }

    /// Use `clock` for submission timestamps and expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// In-flight operations.
    #[inline]
    pub fn registry(&self) -> &FetchRegistry {
        &self.registry
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Join the broadcast set and start the expiry sweeper.
    pub fn open(&mut self) {
        if self.state != ConnectionState::Connecting {
            tracing::warn!("Connection {} cannot open from {:?}", self.id, self.state);
            return;
        }
        self.clients.add_client(self.id, self.writer.clone());
        self.state = ConnectionState::Open;
        tracing::info!("Connection opened: {} (id={})", self.peer, self.id);

        self.sweeper.start();
        if self.sweeper.is_running() {
            tracing::info!("Scheduling fetcher expiration every {:?}", self.fetch_ttl);
        }
    }

    /// Drive the connection until the transport closes.
    ///
    /// Opens the connection first if needed.
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        if self.state == ConnectionState::Connecting {
            self.open();
        }

        while self.state == ConnectionState::Open {
            let step = tokio::select! {
                frame = inbound.next() => Step::Frame(frame),
                Some(event) = self.events_rx.recv() => Step::Event(event),
                _ = self.sweeper.tick() => Step::Sweep,
            };

            match step {
                Step::Frame(Some(frame)) => self.handle_frame(frame).await,
                Step::Frame(None) => self.close(CloseInfo::abnormal("transport closed")),
                Step::Event(event) => self.handle_event(event).await,
                Step::Sweep => {
                    self.sweep_expired();
                }
            }
        }
    }

    /// Handle one frame from the client.
    pub async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Close(info) => self.close(info),
            _ if self.state != ConnectionState::Open => {
                tracing::debug!("Connection {} not open, ignoring frame", self.id);
            }
            InboundFrame::Text(text) => self.handle_text(&text).await,
            InboundFrame::Binary(_) => {
                let e = DataserverError::UnsupportedFrame;
                tracing::warn!("{}", e);
                self.send_json(&ErrorReply::new(e.to_string())).await;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let envelope = match JsonCodec::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("{}", e);
                self.send_json(&ErrorReply::new(e.to_string())).await;
                return;
            }
        };

        if envelope.reported_error().is_some() {
            tracing::error!("Invalid request object: {}", envelope);
            return;
        }

        if let Err(e) = self.dispatch(&envelope) {
            tracing::error!("{} {}", e, envelope);
        }
    }

    /// Route a decoded envelope to the engine.
    fn dispatch(&mut self, envelope: &RequestEnvelope) -> Result<FetchKey> {
        let request = if envelope.is_annotations() {
            tracing::info!("Annotation Request: {}", envelope);
            SubmitRequest::Annotations(envelope.clone())
        } else {
            let request = GraphRequest::try_from(envelope)?;
            log_request(&request);
            SubmitRequest::Graph(request)
        };
        self.submit(request)
    }

    /// Submit a request and register its operation.
    ///
    /// Nothing is registered if the engine rejects the request.
    pub fn submit(&mut self, request: SubmitRequest) -> Result<FetchKey> {
        let key = FetchKey::new(request.id(), self.clock.now());
        let meta = request.meta();

        let handle = self.engine.submit(request)?;
        let (events, cancel) = handle.into_parts();

        let generation = self.registry.next_generation();
        let forwarder = tokio::spawn(forward_events(
            key.clone(),
            generation,
            events,
            self.events_tx.clone(),
        ));

        let entry = FetchEntry::new(generation, meta, cancel).with_forwarder(forwarder);
        self.registry.insert(key.clone(), entry);
        Ok(key)
    }

    /// Wait for the next event from any in-flight operation.
    pub async fn next_event(&mut self) -> Option<OperationEvent> {
        self.events_rx.recv().await
    }

    /// Apply one operation event: stream it to the client and update the registry.
    pub async fn handle_event(&mut self, event: OperationEvent) {
        let OperationEvent {
            key,
            generation,
            event,
        } = event;

        match event {
            FetchEvent::Partial(outcome) => {
                let meta = match self.registry.get(&key) {
                    Some(entry) if entry.generation() == generation => entry.meta().clone(),
                    _ => {
                        tracing::debug!("Dropping partial for inactive fetcher {}", key);
                        return;
                    }
                };

                match outcome {
                    Ok(partial) => {
                        let response =
                            ResponseEnvelope::partial(meta, partial.sub_query, partial.payload);
                        self.send_json(&response).await;
                        log_response(&response);
                    }
                    Err(failure) if failure.error.is_cancelled() => {}
                    Err(failure) => {
                        tracing::error!("{}", failure.error);
                        let response = self.engine.error_envelope(&meta, &failure);
                        self.send_json(&response).await;
                    }
                }
            }
            FetchEvent::Terminal(outcome) => {
                let entry = match self.registry.remove_current(&key, generation) {
                    Some(entry) => entry,
                    None => {
                        tracing::debug!("Dropping completion for inactive fetcher {}", key);
                        return;
                    }
                };

                match outcome {
                    Ok(Some(payload)) => {
                        let response = ResponseEnvelope::complete(entry.meta().clone(), payload);
                        self.send_json(&response).await;
                        log_response(&response);
                    }
                    Ok(None) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!("{}", e),
                }
            }
        }
    }

    /// Cancel and drop every operation older than the fetch TTL.
    ///
    /// Returns how many were expired.
    pub fn sweep_expired(&mut self) -> usize {
        tracing::info!("Starting fetcher expiration...");
        let expired = self.registry.sweep(self.clock.now(), self.fetch_ttl);
        tracing::info!("Expired {} fetchers", expired.len());
        expired.len()
    }

    /// Cancel everything in flight and leave the broadcast set.
    ///
    /// Closing a closed connection is a no-op.
    pub fn close(&mut self, info: CloseInfo) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            tracing::debug!("Connection {} already closed", self.id);
            return;
        }
        self.state = ConnectionState::Closing;
        tracing::info!(
            "Connection closed: wasClean={} code={:?} reason={}",
            info.was_clean,
            info.code,
            info.reason
        );

        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} in-flight fetchers", cancelled);
        }
        self.sweeper.stop();
        self.clients.remove_client(self.id);
        self.state = ConnectionState::Closed;
    }

    async fn send_json<T: serde::Serialize>(&self, value: &T) {
        let text = match JsonCodec::encode(value) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode response: {}", e);
                return;
            }
        };
        if let Err(e) = self.writer.send(text).await {
            tracing::warn!("Failed to send to {}: {}", self.peer, e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.registry.cancel_all();
            self.sweeper.stop();
            self.clients.remove_client(self.id);
        }
    }
}

/// Relay one operation's events onto its connection.
async fn forward_events(
    key: FetchKey,
    generation: u64,
    mut events: FetchEvents,
    tx: mpsc::UnboundedSender<OperationEvent>,
) {
    while let Some(event) = events.next().await {
        let event = OperationEvent {
            key: key.clone(),
            generation,
            event,
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}

fn log_request(request: &GraphRequest) {
    tracing::info!(
        "Request type={}, name='{}', sub-queries={}, id={}, start='{}'",
        request.graph_type,
        request.name,
        request.series.len(),
        request.id,
        format_start(request.start)
    );
}

fn log_response(response: &ResponseEnvelope) {
    let meta = &response.meta;
    let kind = match response.body {
        ResponseBody::Complete(_) => "complete",
        ResponseBody::Partial { .. } => "partial",
        ResponseBody::Error(_) => "error",
    };
    tracing::info!(
        "Response ({}) type={}, id={}, name='{}', start='{}'",
        kind,
        meta.graph_type.as_deref().unwrap_or("-"),
        meta.id,
        meta.name.as_deref().unwrap_or("-"),
        meta.start.map(format_start).unwrap_or_default()
    );
}
