//! WebSocket connections carrying Parley frames.
//!
//! This module provides the connection type used on both ends: [`connect`]
//! dials a backend, [`accept`] completes the handshake for an incoming
//! stream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, Frame, ProtocolError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};
use url::Url;

use crate::traits::{Connection, ConnectionId, TransportError};

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Limit for establishing the connection and the protocol handshake.
    pub connect_timeout: Duration,
    /// Limit for each request/response round-trip.
    pub request_timeout: Duration,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}

/// A WebSocket connection speaking length-prefixed frames.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    stream: WebSocketStream<S>,
    read_buffer: BytesMut,
    max_message_size: usize,
    is_open: bool,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
            is_open: true,
        }
    }

    /// Take the stream back, with any bytes already read but not decoded.
    pub fn into_parts(self) -> (WebSocketStream<S>, BytesMut) {
        (self.stream, self.read_buffer)
    }
}

/// Check one incoming WebSocket message and append its payload to `buffer`.
///
/// Returns `false` for control messages that carry no frame data.
pub(crate) fn absorb(
    buffer: &mut BytesMut,
    message: &Message,
    max_message_size: usize,
) -> Result<bool, TransportError> {
    let data: &[u8] = match message {
        Message::Binary(data) => data,
        // For compatibility, treat text as binary
        Message::Text(text) => text.as_bytes(),
        _ => return Ok(false),
    };
    if data.len() > max_message_size {
        warn!(
            size = data.len(),
            max = max_message_size,
            "Message too large"
        );
        return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(
            data.len(),
        )));
    }
    buffer.extend_from_slice(data);
    Ok(true)
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            match self.stream.next().await {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!(connection = %self.id, error = %e, "Failed to send pong");
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Ok(message)) => {
                    absorb(&mut self.read_buffer, &message, self.max_message_size)?;
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!(connection = %self.id, "Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = codec::encode(&frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {e}")))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Dial a backend.
///
/// # Errors
///
/// Returns `TransportError::Timeout` if the connection is not established
/// within `connect_timeout`, or `TransportError::Handshake` if the WebSocket
/// upgrade fails.
pub async fn connect(
    url: &Url,
    config: &WebSocketConfig,
) -> Result<WebSocketConnection<MaybeTlsStream<TcpStream>>, TransportError> {
    let dial = connect_async(url.as_str());
    let (stream, _response) = tokio::time::timeout(config.connect_timeout, dial)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Handshake(format!("WebSocket connect to {url} failed: {e}")))?;
    debug!(url = %url, "WebSocket connected");
    Ok(WebSocketConnection::new(stream, config.max_message_size))
}

/// Complete the WebSocket handshake for an incoming stream.
///
/// # Errors
///
/// Returns `TransportError::Handshake` if the upgrade fails.
pub async fn accept<S>(
    stream: S,
    max_message_size: usize,
) -> Result<WebSocketConnection<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::Handshake(format!("WebSocket handshake failed: {e}")))?;
    Ok(WebSocketConnection::new(stream, max_message_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_absorb_limits_and_control_messages() {
        let mut buffer = BytesMut::new();
        assert!(absorb(&mut buffer, &Message::Binary(vec![1, 2, 3]), 8).unwrap());
        assert_eq!(&buffer[..], &[1, 2, 3]);

        assert!(!absorb(&mut buffer, &Message::Pong(vec![]), 8).unwrap());
        assert!(matches!(
            absorb(&mut buffer, &Message::Binary(vec![0; 9]), 8),
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge(9)))
        ));
    }

    #[tokio::test]
    async fn test_frames_cross_a_real_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = accept(stream, 1024).await.unwrap();
            let frame = conn.recv().await.unwrap().unwrap();
            conn.send(frame).await.unwrap();
            assert!(conn.recv().await.unwrap().is_none());
        });

        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let mut conn = connect(&url, &WebSocketConfig::default()).await.unwrap();
        conn.send(Frame::ping()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(Frame::ping()));
        conn.close().await.unwrap();
        assert!(!conn.is_open());

        server.await.unwrap();
    }
}
