//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the endpoint of one ComfyUI server and
//! implements [`SocketConnector`], the seam the session manager uses to
//! open sockets. Each open socket is exposed as a [`FrameStream`] of
//! transport-neutral [`Frame`]s.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// One inbound frame from the backend socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON status / progress message.
    Text(String),
    /// Binary payload (preview or final image).
    Binary(Vec<u8>),
    /// The server closed the socket, with its close reason if any.
    Close(Option<String>),
}

/// Inbound frames of one open socket.
pub type FrameStream = BoxStream<'static, Result<Frame, ComfyUIClientError>>;

/// Opens sockets to the backend.
///
/// Implemented by [`ComfyUIClient`]; tests substitute in-memory
/// connectors.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Endpoint description used in logs and session metadata.
    fn endpoint(&self) -> &str;

    /// Open a socket addressed to `client_id`.
    async fn connect(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError>;
}

/// Configuration handle for a ComfyUI instance.
///
/// Stores the WebSocket and HTTP API URLs needed to communicate with
/// one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
}

impl ComfyUIClient {
    /// Create a new client from explicit URLs.
    ///
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Self {
        Self { ws_url, api_url }
    }

    /// Derive both URLs from the resolved HTTP base URL.
    ///
    /// `http://` maps to `ws://` and `https://` to `wss://`; a trailing
    /// slash is dropped.
    pub fn from_base_url(base_url: &str) -> Self {
        let api_url = base_url.trim_end_matches('/').to_string();
        let ws_url = if let Some(rest) = api_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = api_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{api_url}")
        };
        Self { ws_url, api_url }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl SocketConnector for ComfyUIClient {
    fn endpoint(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// The `client_id` is appended as a query parameter so that ComfyUI
    /// addresses progress and image frames back to this socket.
    async fn connect(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Close(frame)) => {
                    Some(Ok(Frame::Close(frame.map(|f| f.reason.to_string()))))
                }
                // Ping/Pong are handled by tungstenite.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(ComfyUIClientError::Protocol(e.to_string()))),
            }
        });

        Ok(frames.boxed())
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_url_maps_to_ws() {
        let client = ComfyUIClient::from_base_url("http://127.0.0.1:8188/");
        assert_eq!(client.api_url(), "http://127.0.0.1:8188");
        assert_eq!(client.ws_url(), "ws://127.0.0.1:8188");
    }

    #[test]
    fn https_base_url_maps_to_wss() {
        let client = ComfyUIClient::from_base_url("https://gpu.example.com");
        assert_eq!(client.ws_url(), "wss://gpu.example.com");
        assert_eq!(client.endpoint(), "wss://gpu.example.com");
    }

    #[test]
    fn schemeless_base_url_defaults_to_ws() {
        let client = ComfyUIClient::from_base_url("localhost:8188");
        assert_eq!(client.ws_url(), "ws://localhost:8188");
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_error() {
        let client = ComfyUIClient::from_base_url("http://127.0.0.1:9");
        let result = client.connect("test-client").await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
