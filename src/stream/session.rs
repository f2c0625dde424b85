//! Bidirectional stream session over a single duplex transport.
//!
//! `StreamSession` drives a send loop and a receive loop concurrently on one
//! transport and joins them into a single result. The two directions finish
//! independently: the peer may keep sending after the local side has
//! half-closed, and a failure on one side leaves the other running unless
//! [`FailurePolicy::AbortSendOnReceiveFailure`] is selected.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::stream::transport::{Transport, TransportError};

/// What the send side does when the receive side fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Each direction runs until its own terminal signal.
    #[default]
    Independent,
    /// Stop sending once the receive side fails.
    AbortSendOnReceiveFailure,
}

/// Default values used by [`SessionOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    /// No pacing between outbound messages.
    pub const SEND_INTERVAL: Option<Duration> = None;
    /// Directions fail independently.
    pub const FAILURE_POLICY: FailurePolicy = FailurePolicy::Independent;
}

/// Tunables for a [`StreamSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    /// Delay inserted between consecutive outbound messages.
    pub send_interval: Option<Duration>,
    /// Reaction of the send side to a receive failure.
    pub failure_policy: FailurePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_interval: SessionDefaults::SEND_INTERVAL,
            failure_policy: SessionDefaults::FAILURE_POLICY,
        }
    }
}

impl SessionOptions {
    /// Paces outbound messages by `interval`. A zero interval disables pacing.
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Sets how the send side reacts to a receive failure.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Counts for a session where both directions completed normally.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionSummary {
    /// Outbound messages accepted by the transport.
    pub sent: usize,
    /// Inbound messages delivered to the consumer.
    pub received: usize,
}

/// Per-direction outcome of a session that did not complete cleanly.
///
/// `None` for a direction means it finished normally.
#[derive(Debug)]
pub struct SessionReport {
    /// Outbound messages accepted before the send side stopped.
    pub sent: usize,
    /// Inbound messages delivered before the receive side stopped.
    pub received: usize,
    /// Why the send side stopped early, if it did.
    pub send: Option<SendError>,
    /// Why the receive side stopped early, if it did.
    pub receive: Option<ReceiveError>,
}

impl SessionReport {
    /// Message counts without the per-direction errors.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            sent: self.sent,
            received: self.received,
        }
    }

    /// Returns `true` when either direction stopped because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.send, Some(SendError::Cancelled))
            || matches!(self.receive, Some(ReceiveError::Cancelled))
    }

    fn is_clean(&self) -> bool {
        self.send.is_none() && self.receive.is_none()
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sent {}, received {}", self.sent, self.received)?;
        if let Some(err) = &self.send {
            write!(f, "; send: {err}")?;
        }
        if let Some(err) = &self.receive {
            write!(f, "; receive: {err}")?;
        }
        Ok(())
    }
}

/// Send-side failures.
#[derive(Debug, Error)]
pub enum SendError {
    /// Transport rejected the message at zero-based position `index`.
    #[error("failed to send message {index}: {source}")]
    Message {
        index: usize,
        #[source]
        source: TransportError,
    },

    /// Every message was sent but the half-close failed.
    #[error("failed to half-close send side: {0}")]
    HalfClose(#[source] TransportError),

    /// Stopped because the receive side failed under
    /// [`FailurePolicy::AbortSendOnReceiveFailure`].
    #[error("send aborted after receive failure")]
    Aborted,

    /// Stopped by [`SessionHandle::cancel`].
    #[error("send cancelled")]
    Cancelled,
}

/// Receive-side failures.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Transport failed while waiting for the message at zero-based position
    /// `index`.
    #[error("failed to receive message {index}: {source}")]
    Message {
        index: usize,
        #[source]
        source: TransportError,
    },

    /// Stopped by [`SessionHandle::cancel`].
    #[error("receive cancelled")]
    Cancelled,
}

/// Errors returned by [`StreamSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport was not ready when the session was opened.
    #[error("connection error: {0}")]
    Connection(#[source] TransportError),

    /// [`SessionHandle::cancel`] stopped the session.
    #[error("session cancelled ({report})")]
    Cancelled { report: SessionReport },

    /// At least one direction failed.
    #[error("session failed ({report})")]
    Failed { report: SessionReport },
}

impl SessionError {
    /// Returns the per-direction report for sessions that ran.
    pub fn report(&self) -> Option<&SessionReport> {
        match self {
            Self::Connection(_) => None,
            Self::Cancelled { report } | Self::Failed { report } => Some(report),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    cancel: watch::Sender<bool>,
    send_done: AtomicBool,
    receive_done: AtomicBool,
    sent: AtomicUsize,
    received: AtomicUsize,
}

/// Cloneable control handle for a running session.
///
/// Safe to use from any task or thread.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    state: Arc<SessionState>,
}

impl SessionHandle {
    /// Requests early termination of both directions.
    ///
    /// In-flight transport calls are dropped and [`StreamSession::run`]
    /// returns [`SessionError::Cancelled`]. Repeated calls are no-ops.
    pub fn cancel(&self) {
        if !self.state.cancel.send_replace(true) {
            debug!(event = "session_cancel_requested");
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.state.cancel.borrow()
    }

    /// Returns `true` once the send side has reached a terminal state.
    pub fn is_send_done(&self) -> bool {
        self.state.send_done.load(Ordering::Acquire)
    }

    /// Returns `true` once the receive side has reached a terminal state.
    pub fn is_receive_done(&self) -> bool {
        self.state.receive_done.load(Ordering::Acquire)
    }

    /// Messages accepted by the transport so far.
    pub fn sent(&self) -> usize {
        self.state.sent.load(Ordering::Acquire)
    }

    /// Messages delivered to the consumer so far.
    pub fn received(&self) -> usize {
        self.state.received.load(Ordering::Acquire)
    }
}

/// One bidirectional stream bound to an exclusively owned transport.
pub struct StreamSession<T> {
    transport: T,
    options: SessionOptions,
    state: Arc<SessionState>,
}

impl<T> fmt::Debug for StreamSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("options", &self.options)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> StreamSession<T> {
    /// Binds a session to a connected transport with default options.
    pub fn open(transport: T) -> Result<Self, SessionError> {
        Self::open_with_options(transport, SessionOptions::default())
    }

    /// Binds a session to a connected transport.
    ///
    /// Fails with [`SessionError::Connection`] if the transport is not ready.
    pub fn open_with_options(transport: T, options: SessionOptions) -> Result<Self, SessionError> {
        if !transport.is_ready() {
            warn!(event = "session_open_rejected", reason = "transport_not_ready");
            return Err(SessionError::Connection(TransportError::NotReady));
        }

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            transport,
            options,
            state: Arc::new(SessionState {
                cancel,
                send_done: AtomicBool::new(false),
                receive_done: AtomicBool::new(false),
                sent: AtomicUsize::new(0),
                received: AtomicUsize::new(0),
            }),
        })
    }

    /// Returns a handle that stays valid while [`run`](Self::run) owns the
    /// session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Same as [`SessionHandle::cancel`].
    pub fn cancel(&self) {
        self.handle().cancel();
    }

    /// Sends `outbound` while delivering every inbound message to
    /// `on_message`, returning once both directions have finished.
    ///
    /// The transport is released when this returns.
    pub async fn run<I, F>(self, outbound: I, on_message: F) -> Result<SessionSummary, SessionError>
    where
        I: IntoIterator<Item = T::Outbound>,
        F: FnMut(T::Inbound),
    {
        self.run_stream(futures_util::stream::iter(outbound), on_message)
            .await
    }

    /// Like [`run`](Self::run), but pulls outbound messages from a stream.
    ///
    /// The send side half-closes when `outbound` ends.
    pub async fn run_stream<S, F>(
        self,
        outbound: S,
        mut on_message: F,
    ) -> Result<SessionSummary, SessionError>
    where
        S: Stream<Item = T::Outbound>,
        F: FnMut(T::Inbound),
    {
        let Self {
            transport,
            options,
            state,
        } = self;
        let (abort_tx, abort_rx) = watch::channel(false);

        debug!(
            event = "session_started",
            send_interval_ms = options
                .send_interval
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            failure_policy = ?options.failure_policy
        );

        let send = async {
            let outcome = tokio::select! {
                biased;
                _ = wait_for_signal(state.cancel.subscribe()) => Err(SendError::Cancelled),
                _ = wait_for_signal(abort_rx.clone()) => Err(SendError::Aborted),
                result = send_all(&transport, outbound, options.send_interval, &state.sent) => result,
            };

            if let Err(err) = &outcome {
                warn!(event = "session_send_failed", error = %err);
                if matches!(err, SendError::Message { .. } | SendError::Aborted) {
                    // Let the peer finish its side even though we stopped early.
                    tokio::select! {
                        biased;
                        _ = wait_for_signal(state.cancel.subscribe()) => {}
                        closed = transport.close_send() => {
                            if let Err(close_err) = closed {
                                debug!(event = "session_half_close_failed", error = %close_err);
                            }
                        }
                    }
                }
            }
            state.send_done.store(true, Ordering::Release);
            outcome.err()
        };

        let receive = async {
            let outcome = tokio::select! {
                biased;
                _ = wait_for_signal(state.cancel.subscribe()) => Err(ReceiveError::Cancelled),
                result = receive_all(&transport, &mut on_message, &state.received) => result,
            };

            if let Err(err) = &outcome {
                warn!(event = "session_receive_failed", error = %err);
                if !matches!(err, ReceiveError::Cancelled)
                    && options.failure_policy == FailurePolicy::AbortSendOnReceiveFailure
                {
                    abort_tx.send_replace(true);
                }
            }
            state.receive_done.store(true, Ordering::Release);
            outcome.err()
        };

        let (send_error, receive_error) = tokio::join!(send, receive);
        drop(transport);

        let report = SessionReport {
            sent: state.sent.load(Ordering::Acquire),
            received: state.received.load(Ordering::Acquire),
            send: send_error,
            receive: receive_error,
        };

        if report.is_cancelled() {
            debug!(
                event = "session_cancelled",
                sent = report.sent,
                received = report.received
            );
            return Err(SessionError::Cancelled { report });
        }
        if !report.is_clean() {
            return Err(SessionError::Failed { report });
        }

        debug!(
            event = "session_completed",
            sent = report.sent,
            received = report.received
        );
        Ok(report.summary())
    }
}

async fn send_all<T, S>(
    transport: &T,
    outbound: S,
    send_interval: Option<Duration>,
    sent: &AtomicUsize,
) -> Result<(), SendError>
where
    T: Transport,
    S: Stream<Item = T::Outbound>,
{
    pin_mut!(outbound);

    let mut index = 0;
    while let Some(message) = outbound.next().await {
        if index > 0 {
            if let Some(interval) = send_interval {
                tokio::time::sleep(interval).await;
            }
        }
        transport
            .send_message(message)
            .await
            .map_err(|source| SendError::Message { index, source })?;
        sent.fetch_add(1, Ordering::AcqRel);
        debug!(event = "session_message_sent", index);
        index += 1;
    }

    transport.close_send().await.map_err(SendError::HalfClose)?;
    debug!(event = "session_send_closed", sent = index);
    Ok(())
}

async fn receive_all<T, F>(
    transport: &T,
    on_message: &mut F,
    received: &AtomicUsize,
) -> Result<(), ReceiveError>
where
    T: Transport,
    F: FnMut(T::Inbound),
{
    let mut index = 0;
    loop {
        match transport.receive_message().await {
            Ok(Some(message)) => {
                on_message(message);
                received.fetch_add(1, Ordering::AcqRel);
                index += 1;
            }
            Ok(None) => {
                debug!(event = "session_end_of_stream", received = index);
                return Ok(());
            }
            Err(source) => return Err(ReceiveError::Message { index, source }),
        }
    }
}

/// Resolves once the flag is raised. Never resolves if the sender is gone.
async fn wait_for_signal(mut rx: watch::Receiver<bool>) {
    let raised = rx.wait_for(|raised| *raised).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}
