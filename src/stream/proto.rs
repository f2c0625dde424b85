use std::fmt;

use serde::{Deserialize, Serialize};

/// User record exchanged with the user service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Caller-chosen identifier; the service may rewrite it on insert.
    pub id: String,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Progress status reported by the streaming user RPCs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStatus {
    /// Request accepted.
    Init,
    /// Insert in progress.
    Inserting,
    /// User has been stored.
    UserHasBeenInserted,
    /// Final status of the call.
    Completed,
    /// Status string this SDK does not know about.
    Other(String),
}

impl UserStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Init => "init",
            Self::Inserting => "inserting",
            Self::UserHasBeenInserted => "user_has_been_inserted",
            Self::Completed => "completed",
            Self::Other(value) => value,
        }
    }

    fn from_wire(value: String) -> Self {
        match value.as_str() {
            "init" => Self::Init,
            "inserting" => Self::Inserting,
            "user_has_been_inserted" => Self::UserHasBeenInserted,
            "completed" => Self::Completed,
            _ => Self::Other(value),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for UserStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UserStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from_wire)
    }
}

/// Messages the user service sends back to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of a unary `AddUser` call.
    User { user: User },
    /// One step of a streamed insert.
    Status {
        status: UserStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<User>,
    },
    /// Result of a client-streamed `AddUsers` call.
    Users { users: Vec<User> },
}

impl ServerMessage {
    /// Wire tag of the message, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Status { .. } => "status",
            Self::Users { .. } => "users",
        }
    }
}

/// RPC methods exposed by the user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Single request, single response.
    AddUser,
    /// Single request, streamed status responses.
    AddUserVerbose,
    /// Streamed requests, single aggregated response.
    AddUsers,
    /// Streamed requests and streamed responses.
    AddUserStreamBoth,
}

impl Method {
    /// Fully-qualified RPC path.
    pub fn path(self) -> &'static str {
        match self {
            Self::AddUser => "/pb.UserService/AddUser",
            Self::AddUserVerbose => "/pb.UserService/AddUserVerbose",
            Self::AddUsers => "/pb.UserService/AddUsers",
            Self::AddUserStreamBoth => "/pb.UserService/AddUserStreamBoth",
        }
    }

    /// `true` when the caller sends a stream of requests.
    pub fn client_streaming(self) -> bool {
        matches!(self, Self::AddUsers | Self::AddUserStreamBoth)
    }

    /// `true` when the service answers with a stream of responses.
    pub fn server_streaming(self) -> bool {
        matches!(self, Self::AddUserVerbose | Self::AddUserStreamBoth)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
