//! Serving protocol requests from a [`Backend`].

use bytes::Bytes;
use parley_protocol::{ClientRecord, ErrorCode, Request, Response};
use tracing::{debug, warn};

use super::{Backend, BackendError};

/// Execute one request against `backend` and build the response.
///
/// Never fails: backend errors become [`Response::Error`].
pub async fn dispatch(backend: &dyn Backend, request: Request) -> Response {
    let kind = request.kind();
    let result = match request {
        Request::RegisterUser { username, device } => backend
            .register_user(&username, &device)
            .await
            .map(|client| Response::Registered { client }),
        Request::RegisterClient { username, device } => backend
            .register_client(&username, &device)
            .await
            .map(|client| Response::Registered { client }),
        Request::CreateConversation {
            creator,
            conversation_id,
            name,
        } => backend
            .create_conversation(&creator, conversation_id, &name)
            .await
            .map(|()| Response::Done),
        Request::InviteMember {
            inviter,
            conversation_id,
            username,
        } => backend
            .invite_member(&inviter, conversation_id, &username)
            .await
            .map(|()| Response::Done),
        Request::RemoveMember {
            remover,
            conversation_id,
            username,
        } => backend
            .remove_member(&remover, conversation_id, &username)
            .await
            .map(|()| Response::Done),
        Request::SendMessage {
            sender,
            conversation_id,
            payload,
        } => backend
            .send_message(&sender, conversation_id, Bytes::from(payload))
            .await
            .map(|receipt| Response::Accepted { receipt }),
        Request::FetchMessages { client_id, after } => backend
            .fetch_messages(&client_id, after)
            .await
            .map(|deliveries| Response::Deliveries { deliveries }),
        Request::ListClients { username } => backend
            .list_clients(&username)
            .await
            .map(|clients| Response::Clients { clients }),
    };

    result.unwrap_or_else(|e| {
        debug!(request = kind, error = %e, "Request failed");
        match e {
            BackendError::Rejected { code, message } => Response::error(code, message),
            BackendError::Transport(message) | BackendError::Protocol(message) => {
                Response::error(ErrorCode::Internal, message)
            }
        }
    })
}

/// The identity one connection acts for.
///
/// A connection starts anonymous and is bound to the device returned by its
/// last successful `RegisterUser` / `RegisterClient`. Every other request
/// must act for that user, and queue reads must name that device.
#[derive(Debug, Default, Clone)]
pub struct Peer {
    identity: Option<ClientRecord>,
}

impl Peer {
    /// Create an anonymous peer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The device this connection registered, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&ClientRecord> {
        self.identity.as_ref()
    }

    /// Check that `request` acts for this peer's identity.
    fn authorize(&self, request: &Request) -> Result<(), String> {
        let claimed = match request {
            Request::RegisterUser { .. } | Request::RegisterClient { .. } => return Ok(()),
            Request::CreateConversation { creator: user, .. }
            | Request::InviteMember { inviter: user, .. }
            | Request::RemoveMember { remover: user, .. }
            | Request::SendMessage { sender: user, .. }
            | Request::ListClients { username: user } => user,
            Request::FetchMessages { client_id, .. } => {
                return match &self.identity {
                    Some(bound) if bound.client_id == *client_id => Ok(()),
                    _ => Err(format!("queue {client_id} belongs to another device")),
                };
            }
        };
        match &self.identity {
            Some(bound) if bound.username == *claimed => Ok(()),
            Some(bound) => Err(format!(
                "connection is registered as {}, not {claimed}",
                bound.username
            )),
            None => Err("connection has not registered a user".to_string()),
        }
    }

    /// Serve one request on behalf of this peer.
    ///
    /// Requests acting for anyone but the registered identity are answered
    /// with `ErrorCode::Forbidden` without reaching the backend.
    pub async fn dispatch(&mut self, backend: &dyn Backend, request: Request) -> Response {
        if let Err(reason) = self.authorize(&request) {
            warn!(request = request.kind(), reason = %reason, "Request refused");
            return Response::error(ErrorCode::Forbidden, reason);
        }
        let response = dispatch(backend, request).await;
        if let Response::Registered { client } = &response {
            debug!(client = %client.client_id, "Connection bound to device");
            self.identity = Some(client.clone());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use uuid::Uuid;

    fn forbidden(response: &Response) -> bool {
        matches!(
            response,
            Response::Error {
                code: ErrorCode::Forbidden,
                ..
            }
        )
    }

    #[tokio::test]
    async fn test_peer_acts_only_for_its_identity() {
        let backend = MemoryBackend::new();
        let mut alice = Peer::new();
        let mut mallory = Peer::new();

        alice
            .dispatch(
                &backend,
                Request::RegisterUser {
                    username: "alice".into(),
                    device: "primary".into(),
                },
            )
            .await;
        assert_eq!(alice.identity().map(|c| c.client_id.as_str()), Some("alice#1"));

        let conversation_id = Uuid::new_v4();
        let created = alice
            .dispatch(
                &backend,
                Request::CreateConversation {
                    creator: "alice".into(),
                    conversation_id,
                    name: "secret".into(),
                },
            )
            .await;
        assert_eq!(created, Response::Done);

        // Anonymous connections can neither read nor post.
        let read = mallory
            .dispatch(
                &backend,
                Request::FetchMessages {
                    client_id: "alice#1".into(),
                    after: 0,
                },
            )
            .await;
        assert!(forbidden(&read));
        let post = mallory
            .dispatch(
                &backend,
                Request::SendMessage {
                    sender: "alice".into(),
                    conversation_id,
                    payload: b"forged".to_vec(),
                },
            )
            .await;
        assert!(forbidden(&post));

        // Registering as someone else does not grant alice's rights.
        mallory
            .dispatch(
                &backend,
                Request::RegisterUser {
                    username: "mallory".into(),
                    device: "primary".into(),
                },
            )
            .await;
        let read = mallory
            .dispatch(
                &backend,
                Request::FetchMessages {
                    client_id: "alice#1".into(),
                    after: 0,
                },
            )
            .await;
        assert!(forbidden(&read));
        let list = mallory
            .dispatch(
                &backend,
                Request::ListClients {
                    username: "alice".into(),
                },
            )
            .await;
        assert!(forbidden(&list));

        let own = alice
            .dispatch(
                &backend,
                Request::FetchMessages {
                    client_id: "alice#1".into(),
                    after: 0,
                },
            )
            .await;
        assert!(matches!(own, Response::Deliveries { ref deliveries } if deliveries.len() == 1));
        assert_eq!(backend.queue_len("alice#1"), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_binding() {
        let backend = MemoryBackend::new();
        let mut peer = Peer::new();
        let register = |username: &str| Request::RegisterUser {
            username: username.into(),
            device: "primary".into(),
        };

        peer.dispatch(&backend, register("alice")).await;
        let duplicate = peer.dispatch(&backend, register("alice")).await;
        assert!(duplicate.is_error());
        assert_eq!(peer.identity().map(|c| c.username.as_str()), Some("alice"));
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let backend = MemoryBackend::new();

        let response = dispatch(
            &backend,
            Request::RegisterUser {
                username: "alice".into(),
                device: "primary".into(),
            },
        )
        .await;
        assert!(matches!(
            response,
            Response::Registered { ref client } if client.client_id == "alice#1"
        ));

        let conversation_id = Uuid::new_v4();
        let response = dispatch(
            &backend,
            Request::CreateConversation {
                creator: "alice".into(),
                conversation_id,
                name: "team".into(),
            },
        )
        .await;
        assert_eq!(response, Response::Done);

        let response = dispatch(
            &backend,
            Request::SendMessage {
                sender: "alice".into(),
                conversation_id,
                payload: b"hi".to_vec(),
            },
        )
        .await;
        assert!(matches!(response, Response::Accepted { receipt } if receipt.sequence == 1));
    }

    #[tokio::test]
    async fn test_dispatch_maps_errors() {
        let backend = MemoryBackend::new();
        let response = dispatch(
            &backend,
            Request::ListClients {
                username: "nobody".into(),
            },
        )
        .await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::UnknownUser,
                ..
            }
        ));

        backend.set_online(false);
        let response = dispatch(
            &backend,
            Request::FetchMessages {
                client_id: "alice#1".into(),
                after: 0,
            },
        )
        .await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Internal,
                ..
            }
        ));
    }
}
