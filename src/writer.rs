//! Dedicated writer task for outbound text frames.
//!
//! Every message a connection sends goes through one mpsc channel to a
//! writer task that owns the transport's sink. Messages from one connection
//! therefore reach the client in the order they were queued.
//!
//! # Architecture
//!
//! ```text
//! Connection loop ─┐
//! ClientSet       ─┼─► mpsc::Sender<String> ─► Writer Task ─► Sink (websocket)
//! ```
//!
//! The task batches whatever is already queued into a single flush and
//! tracks a pending count for backpressure.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{DataserverError, Result};

/// Default maximum pending messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Maximum pending messages before backpressure kicks in.
    pub max_pending_messages: usize,
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Outbound messages queued but not yet flushed.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

impl Pending {
    fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Queueing side of a connection's outbound channel.
///
/// Clones share the same queue and pending count.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<String>,
    pending: Arc<Pending>,
    limit: usize,
    wait: Duration,
}

impl fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .field("limit", &self.limit)
            .finish()
    }
}

impl WriterHandle {
    fn with_pending(tx: mpsc::Sender<String>, pending: Arc<Pending>, config: &WriterConfig) -> Self {
        Self {
            tx,
            pending,
            limit: config.max_pending_messages,
            wait: config.backpressure_timeout,
        }
    }

    /// Create a handle whose messages land on a [`WriterReceiver`] instead
    /// of a sink.
    pub fn channel(config: WriterConfig) -> (Self, WriterReceiver) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let pending = Arc::new(Pending::default());
        let handle = Self::with_pending(tx, pending.clone(), &config);
        (handle, WriterReceiver { rx, pending })
    }

    /// Queue a message.
    ///
    /// While the pending count is at the limit this waits for the writer to
    /// drain, up to the configured backpressure timeout.
    pub async fn send(&self, message: String) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.wait, self.drained())
                .await
                .map_err(|_| DataserverError::BackpressureTimeout)?;
        }

        self.pending.add();
        self.tx.send(message).await.map_err(|_| {
            self.pending.release(1);
            DataserverError::ConnectionClosed
        })
    }

    async fn drained(&self) {
        loop {
            // registered before the check so a release in between is not missed
            let notified = self.pending.drained.notified();
            if !self.is_backpressure_active() {
                return;
            }
            notified.await;
        }
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: String) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(DataserverError::BackpressureTimeout);
        }

        self.pending.add();
        self.tx.try_send(message).map_err(|e| {
            self.pending.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => DataserverError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => DataserverError::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.get() >= self.limit
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.get()
    }
}

/// Receiving end of [`WriterHandle::channel`].
///
/// Each received message frees its pending slot, the way the writer task
/// does after a flush.
#[derive(Debug)]
pub struct WriterReceiver {
    rx: mpsc::Receiver<String>,
    pending: Arc<Pending>,
}

impl WriterReceiver {
    /// Wait for the next message. `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        let message = self.rx.recv().await;
        if message.is_some() {
            self.pending.release(1);
        }
        message
    }

    /// Take a message if one is queued.
    pub fn try_recv(&mut self) -> std::result::Result<String, mpsc::error::TryRecvError> {
        let message = self.rx.try_recv()?;
        self.pending.release(1);
        Ok(message)
    }
}

/// Spawn the writer task over `sink` and return a handle for queueing.
///
/// The task ends when every handle is dropped, closing the sink, or when
/// the sink fails.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<String> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(Pending::default());
    let handle = WriterHandle::with_pending(tx, pending.clone(), &config);
    let task = tokio::spawn(writer_loop(rx, sink, pending));
    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<S>(sink: S) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<String> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    spawn_writer_task(sink, WriterConfig::default())
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<String>,
    mut sink: S,
    pending: Arc<Pending>,
) -> Result<()>
where
    S: Sink<String> + Unpin,
    S::Error: fmt::Display,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        // every handle dropped
        if rx.recv_many(&mut batch, MAX_BATCH_SIZE).await == 0 {
            return sink.close().await.map_err(transport_error);
        }

        let flushed = batch.len();
        let written = write_batch(&mut sink, &mut batch).await;
        pending.release(flushed);
        written?;
    }
}

/// Feed a batch into the sink and flush once.
async fn write_batch<S>(sink: &mut S, batch: &mut Vec<String>) -> Result<()>
where
    S: Sink<String> + Unpin,
    S::Error: fmt::Display,
{
    for message in batch.drain(..) {
        sink.feed(message).await.map_err(transport_error)?;
    }
    sink.flush().await.map_err(transport_error)
}

fn transport_error<E: fmt::Display>(e: E) -> DataserverError {
    DataserverError::Transport(e.to_string())
}
