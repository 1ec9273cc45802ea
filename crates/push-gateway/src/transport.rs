//! Frame-level view of a duplex connection.
//!
//! The rest of the crate never touches `axum::extract::ws` directly: the read
//! half is consumed as a `Stream<Item = Result<Frame, TransportError>>` and the
//! write half sits behind [`FrameSink`], so the lifecycle and dispatcher can be
//! exercised against an in-memory transport in tests.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;

/// Errors raised by the write or read half of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection already closed")]
    Closed,

    /// Another write held the guard for the whole wait. The socket is busy,
    /// not broken.
    #[error("write guard busy for {0:?}")]
    Busy(Duration),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport I/O error: {0}")]
    Io(String),
}

impl From<axum::Error> for TransportError {
    fn from(err: axum::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// One message-oriented frame, independent of the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Opaque push payload. The gateway only delivers bytes; it never inspects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// The "fetch new data" signal clients react to by re-polling history.
    pub fn new_data_signal() -> Self {
        Payload::Text(r#"{"type":4}"#.to_string())
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Payload::Text(text) => Frame::Text(text),
            Payload::Binary(data) => Frame::Binary(data),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

/// Write half of a transport. Not safe for concurrent writers; callers go
/// through the connection's write guard.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a close frame (best effort) and shut the write half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.send(frame.into()).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The peer may already be gone; the close frame is a courtesy.
        let _ = self.send(Message::Close(None)).await;
        SinkExt::close(self).await.map_err(TransportError::from)
    }
}

/// Adapt the read half of an axum WebSocket into a frame stream.
pub fn frame_stream(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin {
    stream.map(|item| item.map(Frame::from).map_err(TransportError::from))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_axum_messages() {
        let frame = Frame::Text("hello".into());
        let msg: Message = frame.clone().into();
        assert_eq!(Frame::from(msg), frame);

        let msg: Message = Frame::Close.into();
        assert!(matches!(msg, Message::Close(None)));
    }

    #[test]
    fn new_data_signal_is_minimal_json() {
        let payload = Payload::new_data_signal();
        assert_eq!(payload, Payload::Text(r#"{"type":4}"#.into()));
        let value: serde_json::Value = match payload.into_frame() {
            Frame::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(value["type"], 4);
    }

    #[test]
    fn payload_length() {
        assert!(Payload::from("").is_empty());
        assert_eq!(Payload::from(Bytes::from_static(b"abc")).len(), 3);
    }
}
