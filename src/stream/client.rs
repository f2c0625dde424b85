//! Typed user-service client.
//!
//! Every RPC opens a fresh transport through a [`Connector`] and runs over a
//! [`StreamSession`], so unary and half-streamed calls share the half-close
//! and cancellation handling of the fully bidirectional call.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::stream::proto::{Method, ServerMessage, User, UserStatus};
use crate::stream::session::{SessionError, SessionOptions, SessionSummary, StreamSession};
use crate::stream::transport::{Transport, TransportError};

/// Opens one transport per RPC call.
///
/// Dialing, credentials, and routing `method` to the right remote endpoint are
/// up to the implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport<Outbound = User, Inbound = ServerMessage>;

    async fn connect(&self, method: Method) -> Result<Self::Transport, TransportError>;
}

/// Client for the four user-service RPCs.
#[derive(Clone, Debug)]
pub struct UserServiceClient<C> {
    connector: C,
    options: SessionOptions,
}

impl<C: Connector> UserServiceClient<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            options: SessionOptions::default(),
        }
    }

    /// Sets the options used for every session this client opens.
    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Paces client-streamed requests by `interval`.
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.options = self.options.with_send_interval(interval);
        self
    }

    /// Connects `method` and binds a session to the new transport.
    pub async fn open(&self, method: Method) -> Result<StreamSession<C::Transport>, CallError> {
        let transport = self
            .connector
            .connect(method)
            .await
            .map_err(CallError::Connect)?;
        debug!(
            event = "rpc_connected",
            method = method.path(),
            client_streaming = method.client_streaming(),
            server_streaming = method.server_streaming()
        );
        Ok(StreamSession::open_with_options(
            transport,
            self.options.clone(),
        )?)
    }

    /// Unary `AddUser`: one request, one stored user back.
    pub async fn add_user(&self, user: User) -> Result<User, CallError> {
        let method = Method::AddUser;
        let mut responses = Vec::new();
        self.open(method)
            .await?
            .run([user], |message| responses.push(message))
            .await?;

        match single_response(method, responses)? {
            ServerMessage::User { user } => Ok(user),
            other => Err(unexpected_response(method, &other)),
        }
    }

    /// Server-streamed `AddUserVerbose`: one request, every progress status
    /// forwarded to `on_status` in arrival order.
    pub async fn add_user_verbose<F>(
        &self,
        user: User,
        on_status: F,
    ) -> Result<SessionSummary, CallError>
    where
        F: FnMut(UserStatus, Option<User>),
    {
        self.run_status_stream(Method::AddUserVerbose, [user], on_status)
            .await
    }

    /// Client-streamed `AddUsers`: many requests, one aggregated reply.
    pub async fn add_users<I>(&self, users: I) -> Result<Vec<User>, CallError>
    where
        I: IntoIterator<Item = User>,
    {
        let method = Method::AddUsers;
        let mut responses = Vec::new();
        self.open(method)
            .await?
            .run(users, |message| responses.push(message))
            .await?;

        match single_response(method, responses)? {
            ServerMessage::Users { users } => Ok(users),
            other => Err(unexpected_response(method, &other)),
        }
    }

    /// Bidirectional `AddUserStreamBoth`.
    ///
    /// Use [`open_stream_both`](Self::open_stream_both) instead when the
    /// caller needs a [`SessionHandle`](crate::stream::session::SessionHandle)
    /// to cancel the call.
    pub async fn add_user_stream_both<I, F>(
        &self,
        users: I,
        on_result: F,
    ) -> Result<SessionSummary, CallError>
    where
        I: IntoIterator<Item = User>,
        F: FnMut(UserStatus, Option<User>),
    {
        self.run_status_stream(Method::AddUserStreamBoth, users, on_result)
            .await
    }

    pub async fn open_stream_both(&self) -> Result<StreamSession<C::Transport>, CallError> {
        self.open(Method::AddUserStreamBoth).await
    }

    async fn run_status_stream<I, F>(
        &self,
        method: Method,
        users: I,
        mut on_status: F,
    ) -> Result<SessionSummary, CallError>
    where
        I: IntoIterator<Item = User>,
        F: FnMut(UserStatus, Option<User>),
    {
        let mut unexpected = None;
        let summary = self
            .open(method)
            .await?
            .run(users, |message| match message {
                ServerMessage::Status { status, user } => on_status(status, user),
                other => {
                    unexpected.get_or_insert(other);
                }
            })
            .await?;

        if let Some(other) = unexpected {
            return Err(unexpected_response(method, &other));
        }
        debug!(
            event = "rpc_completed",
            method = method.path(),
            sent = summary.sent,
            received = summary.received
        );
        Ok(summary)
    }
}

/// Errors produced by [`UserServiceClient`] calls.
#[derive(Debug, Error)]
pub enum CallError {
    /// Connector could not establish a transport.
    #[error("failed to connect: {0}")]
    Connect(#[source] TransportError),

    /// Session failed, was cancelled, or could not be opened.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Peer answered outside the RPC contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn single_response(
    method: Method,
    responses: Vec<ServerMessage>,
) -> Result<ServerMessage, CallError> {
    let count = responses.len();
    let mut responses = responses.into_iter();
    match (responses.next(), count) {
        (Some(message), 1) => Ok(message),
        (None, _) => Err(CallError::Protocol(format!(
            "{method} ended without a response"
        ))),
        (Some(_), _) => Err(CallError::Protocol(format!(
            "{method} expected one response, got {count}"
        ))),
    }
}

fn unexpected_response(method: Method, message: &ServerMessage) -> CallError {
    CallError::Protocol(format!(
        "{method} received unexpected {} response",
        message.kind()
    ))
}
