//! WebSocket frame processing loop.
//!
//! Reads frames from an open session socket, parses them into typed
//! [`SessionMessage`]s and fans them out on the session's broadcast
//! channel. Returns when the socket closes or fails so the session can
//! record the reason.

use futures::StreamExt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::{Frame, FrameStream};
use crate::messages::{parse_binary_frame, parse_message, BinaryImage, ComfyUIMessage};

/// A decoded item delivered to session subscribers.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Message(ComfyUIMessage),
    Image(BinaryImage),
}

/// Why frame processing stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The server sent a close frame.
    Closed(Option<String>),
    /// Receiving failed.
    Failed(String),
    /// The stream ended without a close frame.
    Exhausted,
}

impl StreamEnd {
    /// Human-readable reason for logs and health reporting.
    pub fn describe(&self) -> String {
        match self {
            StreamEnd::Closed(Some(reason)) if !reason.is_empty() => {
                format!("socket closed by backend: {reason}")
            }
            StreamEnd::Closed(_) => "socket closed by backend".to_string(),
            StreamEnd::Failed(error) => format!("socket error: {error}"),
            StreamEnd::Exhausted => "socket stream ended".to_string(),
        }
    }
}

/// Process frames until the socket closes, fails or is exhausted.
///
/// Text frames are parsed via [`parse_message`]; binary frames via
/// [`parse_binary_frame`]. Unparseable frames are logged and skipped.
pub async fn process_frames(
    stream: &mut FrameStream,
    session_id: Uuid,
    tx: &broadcast::Sender<SessionMessage>,
) -> StreamEnd {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Text(text)) => handle_text_frame(&text, session_id, tx),
            Ok(Frame::Binary(data)) => match parse_binary_frame(&data) {
                Ok(image) => {
                    tracing::debug!(
                        session_id = %session_id,
                        mime = %image.mime,
                        size = image.bytes.len(),
                        "Image frame received",
                    );
                    // No subscribers simply means nobody is generating.
                    let _ = tx.send(SessionMessage::Image(image));
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Ignoring binary frame");
                }
            },
            Ok(Frame::Close(reason)) => {
                tracing::info!(session_id = %session_id, ?reason, "ComfyUI WebSocket closed");
                return StreamEnd::Closed(reason);
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "WebSocket receive error");
                return StreamEnd::Failed(e.to_string());
            }
        }
    }
    StreamEnd::Exhausted
}

fn handle_text_frame(text: &str, session_id: Uuid, tx: &broadcast::Sender<SessionMessage>) {
    match parse_message(text) {
        Ok(msg) => {
            match &msg {
                ComfyUIMessage::Status(data) => tracing::debug!(
                    session_id = %session_id,
                    queue_remaining = data.queue_remaining(),
                    "ComfyUI queue status",
                ),
                ComfyUIMessage::Progress(data) => tracing::trace!(
                    session_id = %session_id,
                    value = data.value,
                    max = data.max,
                    "Generation progress",
                ),
                other => tracing::debug!(
                    session_id = %session_id,
                    prompt_id = ?other.prompt_id(),
                    "ComfyUI message",
                ),
            }
            let _ = tx.send(SessionMessage::Message(msg));
        }
        Err(e) => {
            // Newer servers emit message kinds we do not model.
            tracing::debug!(
                session_id = %session_id,
                error = %e,
                raw_message = %text,
                "Skipping unrecognised ComfyUI message",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ComfyUIClientError;

    fn stream_of(frames: Vec<Result<Frame, ComfyUIClientError>>) -> FrameStream {
        futures::stream::iter(frames).boxed()
    }

    #[tokio::test]
    async fn text_and_binary_frames_are_forwarded() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut png = 1u32.to_be_bytes().to_vec();
        png.extend_from_slice(&2u32.to_be_bytes());
        png.extend_from_slice(b"img");

        let mut stream = stream_of(vec![
            Ok(Frame::Text(
                r#"{"type":"progress","data":{"value":1,"max":4}}"#.into(),
            )),
            Ok(Frame::Text("garbage".into())),
            Ok(Frame::Binary(png)),
            Ok(Frame::Close(Some("bye".into()))),
        ]);

        let end = process_frames(&mut stream, Uuid::nil(), &tx).await;
        assert_eq!(end, StreamEnd::Closed(Some("bye".into())));

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionMessage::Message(ComfyUIMessage::Progress(_))
        ));
        match rx.recv().await.unwrap() {
            SessionMessage::Image(image) => assert_eq!(image.bytes, b"img"),
            other => panic!("Expected Image, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn receive_error_ends_processing() {
        let (tx, _rx) = broadcast::channel(4);
        let mut stream = stream_of(vec![Err(ComfyUIClientError::Protocol("reset".into()))]);
        let end = process_frames(&mut stream, Uuid::nil(), &tx).await;
        assert_eq!(end, StreamEnd::Failed("Protocol error: reset".into()));
        assert!(end.describe().contains("socket error"));
    }

    #[tokio::test]
    async fn exhausted_stream_is_reported() {
        let (tx, _rx) = broadcast::channel(4);
        let mut stream = stream_of(vec![]);
        assert_eq!(
            process_frames(&mut stream, Uuid::nil(), &tx).await,
            StreamEnd::Exhausted
        );
    }
}
