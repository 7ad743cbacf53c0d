//! Frame types for the Parley protocol.
//!
//! Frames are the unit exchanged on a backend connection. Each frame is
//! serialized with MessagePack and length-prefixed by the codec.

use serde::{Deserialize, Serialize};

use crate::rpc::{Request, Response};
use crate::version::Version;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Accepted = 0x02,
    Request = 0x03,
    Response = 0x04,
    Ping = 0x05,
    Pong = 0x06,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Accepted),
            0x03 => Ok(FrameType::Request),
            0x04 => Ok(FrameType::Response),
            0x05 => Ok(FrameType::Ping),
            0x06 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client greeting, first frame on every connection.
    #[serde(rename = "hello")]
    Hello {
        /// Client protocol version.
        version: Version,
    },

    /// Backend reply to `Hello`.
    #[serde(rename = "accepted")]
    Accepted {
        /// Negotiated protocol version.
        version: Version,
        /// Free-form backend identification.
        server: String,
    },

    /// An RPC call.
    #[serde(rename = "request")]
    Request {
        /// Correlation id, echoed by the matching response.
        id: u64,
        /// The operation.
        request: Request,
    },

    /// The answer to the request with the same id.
    #[serde(rename = "response")]
    Response {
        /// Id of the answered request.
        id: u64,
        /// The result.
        response: Response,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Accepted { .. } => FrameType::Accepted,
            Frame::Request { .. } => FrameType::Request,
            Frame::Response { .. } => FrameType::Response,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Hello frame.
    #[must_use]
    pub fn hello(version: Version) -> Self {
        Frame::Hello { version }
    }

    /// Create an Accepted frame.
    #[must_use]
    pub fn accepted(version: Version, server: impl Into<String>) -> Self {
        Frame::Accepted {
            version,
            server: server.into(),
        }
    }

    /// Create a Request frame.
    #[must_use]
    pub fn request(id: u64, request: Request) -> Self {
        Frame::Request { id, request }
    }

    /// Create a Response frame.
    #[must_use]
    pub fn response(id: u64, response: Response) -> Self {
        Frame::Response { id, response }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
