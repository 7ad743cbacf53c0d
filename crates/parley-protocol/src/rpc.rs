//! Request and response bodies carried inside `Request` / `Response` frames.
//!
//! These are the operations a Parley backend offers to clients. Records
//! returned by the backend ([`ClientRecord`], [`Receipt`], [`Delivery`]) are
//! shared with the client core unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric error codes carried by `Response::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// Username already registered.
    DuplicateUser = 1001,
    /// Username not registered.
    UnknownUser = 1002,
    /// Conversation id not known to the backend.
    UnknownConversation = 1003,
    /// Acting user is not a member of the conversation.
    NotMember = 1004,
    /// Malformed or out-of-limits request.
    BadRequest = 1005,
    /// Request acts for an identity the connection has not registered.
    Forbidden = 1006,
    /// Backend-side failure.
    Internal = 1500,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1001 => Ok(ErrorCode::DuplicateUser),
            1002 => Ok(ErrorCode::UnknownUser),
            1003 => Ok(ErrorCode::UnknownConversation),
            1004 => Ok(ErrorCode::NotMember),
            1005 => Ok(ErrorCode::BadRequest),
            1006 => Ok(ErrorCode::Forbidden),
            1500 => Ok(ErrorCode::Internal),
            _ => Err("Invalid error code"),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

/// A device registered for a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Backend-assigned client id, unique across all users.
    pub client_id: String,
    /// Owning username.
    pub username: String,
    /// Device label chosen by the client.
    pub device: String,
    /// Registration time (ms since the Unix epoch).
    pub registered_at: u64,
}

/// Backend acknowledgment of an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Message identity used for deduplication.
    pub message_id: Uuid,
    /// Position of the message in its conversation, starting at 1.
    pub sequence: u64,
    /// Acceptance time (ms since the Unix epoch).
    pub timestamp: u64,
}

/// One entry of a device's delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Queue position; strictly increasing per device.
    pub cursor: u64,
    /// What happened.
    pub event: DeliveryEvent,
}

/// Queue payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// The device's user is a member of this conversation.
    Welcome {
        conversation_id: Uuid,
        name: String,
        members: Vec<String>,
    },
    /// A member joined a conversation the device's user belongs to.
    MemberAdded {
        conversation_id: Uuid,
        username: String,
        invited_by: String,
    },
    /// A member left or was removed. Sent to the removed user's devices
    /// too.
    MemberRemoved {
        conversation_id: Uuid,
        username: String,
        removed_by: String,
    },
    /// A message was accepted in a conversation.
    Message {
        conversation_id: Uuid,
        message_id: Uuid,
        sender: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
        sequence: u64,
        timestamp: u64,
    },
}

impl DeliveryEvent {
    /// The conversation this delivery belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        match self {
            DeliveryEvent::Welcome {
                conversation_id, ..
            }
            | DeliveryEvent::MemberAdded {
                conversation_id, ..
            }
            | DeliveryEvent::MemberRemoved {
                conversation_id, ..
            }
            | DeliveryEvent::Message {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Operations a client can ask of the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Register a new username together with its first device.
    RegisterUser { username: String, device: String },
    /// Attach another device to an existing username.
    RegisterClient { username: String, device: String },
    /// Create a conversation with the creator as sole member.
    CreateConversation {
        creator: String,
        conversation_id: Uuid,
        name: String,
    },
    /// Add `username` to a conversation `inviter` belongs to.
    InviteMember {
        inviter: String,
        conversation_id: Uuid,
        username: String,
    },
    /// Remove `username` from a conversation `remover` belongs to. A
    /// member may remove itself.
    RemoveMember {
        remover: String,
        conversation_id: Uuid,
        username: String,
    },
    /// Post a message to a conversation.
    SendMessage {
        sender: String,
        conversation_id: Uuid,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Read the device queue past `after`.
    FetchMessages { client_id: String, after: u64 },
    /// List every device registered for `username`.
    ListClients { username: String },
}

impl Request {
    /// Short operation name, used for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RegisterUser { .. } => "register_user",
            Request::RegisterClient { .. } => "register_client",
            Request::CreateConversation { .. } => "create_conversation",
            Request::InviteMember { .. } => "invite_member",
            Request::RemoveMember { .. } => "remove_member",
            Request::SendMessage { .. } => "send_message",
            Request::FetchMessages { .. } => "fetch_messages",
            Request::ListClients { .. } => "list_clients",
        }
    }
}

/// Backend answers. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// `RegisterUser` / `RegisterClient` succeeded.
    Registered { client: ClientRecord },
    /// Operation succeeded without a payload.
    Done,
    /// `SendMessage` succeeded.
    Accepted { receipt: Receipt },
    /// `FetchMessages` result, ordered by cursor.
    Deliveries { deliveries: Vec<Delivery> },
    /// `ListClients` result.
    Clients { clients: Vec<ClientRecord> },
    /// Operation failed.
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Create an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Whether this response reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}
