//! Duplex transport contract used by stream sessions.
//!
//! A transport delivers ordered messages in both directions over one logical
//! stream. Implementations must allow one sender and one receiver to operate
//! concurrently on a shared reference.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Ordered, reliable, full-duplex message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Message type written by the local side.
    type Outbound: Send + 'static;
    /// Message type produced by the remote side.
    type Inbound: Send + 'static;

    /// Returns `true` when the transport can accept a new session.
    fn is_ready(&self) -> bool;

    /// Sends one message, waiting for capacity if the transport is full.
    async fn send_message(&self, message: Self::Outbound) -> Result<(), TransportError>;

    /// Waits for the next inbound message.
    ///
    /// `Ok(None)` signals end-of-stream: the peer will send nothing more.
    async fn receive_message(&self) -> Result<Option<Self::Inbound>, TransportError>;

    /// Half-closes the send direction.
    ///
    /// Receiving keeps working after this call. Calling it twice is a no-op.
    async fn close_send(&self) -> Result<(), TransportError>;
}

/// Errors reported by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport was not connected or already torn down.
    #[error("transport is not ready")]
    NotReady,

    /// Send attempted after the send side was half-closed.
    #[error("send side is closed")]
    SendClosed,

    /// Remote endpoint went away without half-closing.
    #[error("peer disconnected")]
    Disconnected,

    /// Underlying byte stream failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Inbound data could not be decoded into a message.
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// Frame longer than the transport accepts.
    #[error("frame exceeds {max} bytes")]
    FrameTooLong { max: usize },

    /// Transport-specific failure.
    #[error("{0}")]
    Other(String),
}

/// In-memory duplex transport backed by bounded tokio channels.
///
/// Sends wait while the peer's queue is full, so a slow consumer applies
/// backpressure to the producer. A peer dropped without calling
/// [`Transport::close_send`] is reported as [`TransportError::Disconnected`]
/// rather than end-of-stream.
pub struct ChannelTransport<Out, In> {
    tx: StdMutex<Option<mpsc::Sender<Out>>>,
    rx: Mutex<mpsc::Receiver<In>>,
    send_closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
}

/// Creates two connected channel transports.
///
/// Messages sent on one end are received on the other. `capacity` bounds each
/// direction's queue and is clamped to at least one.
pub fn channel_pair<A, B>(capacity: usize) -> (ChannelTransport<A, B>, ChannelTransport<B, A>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let capacity = capacity.max(1);
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));
    (
        ChannelTransport {
            tx: StdMutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
            send_closed: Arc::clone(&a_closed),
            peer_closed: Arc::clone(&b_closed),
        },
        ChannelTransport {
            tx: StdMutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
            send_closed: b_closed,
            peer_closed: a_closed,
        },
    )
}

impl<Out, In> ChannelTransport<Out, In> {

    fn sender_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<Out>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<Out, In> fmt::Debug for ChannelTransport<Out, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("send_open", &self.sender_slot().is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<Out, In> Transport for ChannelTransport<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    type Outbound = Out;
    type Inbound = In;

    fn is_ready(&self) -> bool {
        matches!(self.sender_slot().as_ref(), Some(tx) if !tx.is_closed())
    }

    async fn send_message(&self, message: Out) -> Result<(), TransportError> {
        // Clone out of the lock so close_send never waits on a blocked send.
        let tx = self
            .sender_slot()
            .as_ref()
            .cloned()
            .ok_or(TransportError::SendClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive_message(&self) -> Result<Option<In>, TransportError> {
        match self.rx.lock().await.recv().await {
            Some(message) => Ok(Some(message)),
            None if self.peer_closed.load(Ordering::Acquire) => Ok(None),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn close_send(&self) -> Result<(), TransportError> {
        // Publish the half-close before the sender drops so the peer sees it
        // together with the closed channel.
        self.send_closed.store(true, Ordering::Release);
        self.sender_slot().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{channel_pair, Transport, TransportError};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    #[test]
    fn half_close_surfaces_as_end_of_stream_on_peer() {
        runtime().block_on(async {
            let (client, server) = channel_pair::<u32, u32>(4);
            client.send_message(1).await.expect("send");
            client.close_send().await.expect("close");

            assert_eq!(server.receive_message().await.expect("recv"), Some(1));
            assert_eq!(server.receive_message().await.expect("recv"), None);

            // The other direction is still open after the client half-closed.
            server.send_message(7).await.expect("reply");
            assert_eq!(client.receive_message().await.expect("recv"), Some(7));
        });
    }

    #[test]
    fn send_after_close_is_rejected() {
        runtime().block_on(async {
            let (client, _server) = channel_pair::<u32, u32>(1);
            client.close_send().await.expect("close");
            client.close_send().await.expect("second close is a no-op");
            assert!(matches!(
                client.send_message(1).await,
                Err(TransportError::SendClosed)
            ));
            assert!(!client.is_ready());
        });
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        runtime().block_on(async {
            let (client, server) = channel_pair::<u32, u32>(1);
            assert!(client.is_ready());
            drop(server);
            assert!(!client.is_ready());
            assert!(matches!(
                client.send_message(1).await,
                Err(TransportError::Disconnected)
            ));
        });
    }

    #[test]
    fn peer_dropped_without_half_close_is_not_end_of_stream() {
        runtime().block_on(async {
            let (client, server) = channel_pair::<u32, u32>(2);
            server.send_message(5).await.expect("send");
            drop(server);

            // Messages already queued are still delivered first.
            assert_eq!(client.receive_message().await.expect("recv"), Some(5));
            assert!(matches!(
                client.receive_message().await,
                Err(TransportError::Disconnected)
            ));
        });
    }

    #[test]
    fn full_queue_applies_backpressure() {
        runtime().block_on(async {
            let (client, server) = channel_pair::<u32, u32>(1);
            client.send_message(1).await.expect("first send fits");

            let blocked =
                tokio::time::timeout(Duration::from_millis(20), client.send_message(2)).await;
            assert!(blocked.is_err(), "second send should wait for capacity");

            assert_eq!(server.receive_message().await.expect("recv"), Some(1));
            client.send_message(3).await.expect("capacity freed");
            assert_eq!(server.receive_message().await.expect("recv"), Some(3));
        });
    }
}
