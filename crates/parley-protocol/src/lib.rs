//! # parley-protocol
//!
//! Wire protocol spoken between Parley clients and a Parley backend.
//!
//! Every exchange is a [`Frame`]. A session opens with `Hello` / `Accepted`
//! (version negotiation), after which the client issues `Request` frames
//! tagged with a request id and the backend answers each with exactly one
//! `Response` frame carrying the same id.
//!
//! ## Requests
//!
//! - `RegisterUser` / `RegisterClient` - Identity and devices
//! - `CreateConversation` / `InviteMember` - Conversations and membership
//! - `SendMessage` / `FetchMessages` - Message delivery
//! - `ListClients` - Devices known for a user
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame, Request};
//!
//! let frame = Frame::request(7, Request::ListClients { username: "alice".into() });
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod rpc;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType};
pub use rpc::{ClientRecord, Delivery, DeliveryEvent, ErrorCode, Receipt, Request, Response};
pub use version::{Version, PROTOCOL_VERSION};
