//! Duplex connection abstraction.
//!
//! A [`Connection`] is a boxed frame sink plus a boxed frame stream. The
//! session splits it: the outbound loop owns the sink, the inbound loop owns
//! the stream. Adapters:
//!
//! - [`Connection::from_axum`]: an upgraded `axum` WebSocket
//! - [`Connection::pair`]: an in-memory connection and its [`PeerConnection`]

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use sockbus_core::errors::TransportError;

/// One transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame. Every protocol packet travels as text.
    Text(String),
    /// Binary frame. Not supported by the protocol; dropped on receipt.
    Binary(Vec<u8>),
    /// Low-level liveness probe.
    Ping(Vec<u8>),
    /// Low-level liveness reply.
    Pong(Vec<u8>),
    /// Close frame.
    Close,
}

impl Frame {
    /// Shorthand for a text frame.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
/// Inbound half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An established duplex connection handed over by the upgrade layer.
pub struct Connection {
    pub(crate) sink: FrameSink,
    pub(crate) stream: FrameStream,
}

impl Connection {
    /// Build from any frame sink and stream.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Adapt an upgraded axum WebSocket.
    ///
    /// Inbound pings are answered by axum itself.
    pub fn from_axum(socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        let sink = tx
            .sink_map_err(|e| TransportError::Write(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));
        let stream = rx.map(|r| {
            r.map(from_message)
                .map_err(|e| TransportError::Read(e.to_string()))
        });
        Self::new(sink, stream)
    }

    /// In-memory connection with `capacity` frames of buffering per direction.
    pub fn pair(capacity: usize) -> (Self, PeerConnection) {
        let (to_peer, from_server) = mpsc::channel::<Frame>(capacity);
        let (to_server, from_peer) = mpsc::channel::<Result<Frame, TransportError>>(capacity);

        let sink = to_peer.sink_map_err(|e| {
            if e.is_disconnected() {
                TransportError::Closed
            } else {
                TransportError::Write(e.to_string())
            }
        });
        let conn = Self::new(sink, from_peer);
        let peer = PeerConnection {
            tx: to_server,
            rx: from_server,
        };
        (conn, peer)
    }

    /// Split into sink and stream.
    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}

/// The far end of an in-memory [`Connection`].
///
/// Dropping it ends the server's read stream and fails its writes.
#[derive(Debug)]
pub struct PeerConnection {
    tx: mpsc::Sender<Result<Frame, TransportError>>,
    rx: mpsc::Receiver<Frame>,
}

impl PeerConnection {
    /// Send a frame to the server.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send a text frame to the server.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Make the server's next read fail with `err`.
    pub async fn inject_error(&mut self, err: TransportError) -> Result<(), TransportError> {
        self.tx.send(Err(err)).await.map_err(|_| TransportError::Closed)
    }

    /// Next frame written by the server, or `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    /// Next text frame, skipping low-level ping/pong frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.next().await? {
                Frame::Text(text) => return Some(text),
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Binary(_) | Frame::Close => return None,
            }
        }
    }

    /// Split into the raw channel halves.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<Result<Frame, TransportError>>,
        mpsc::Receiver<Frame>,
    ) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_frames_both_ways() {
        let (conn, mut peer) = Connection::pair(8);
        let (mut sink, mut stream) = conn.into_parts();

        sink.send(Frame::text("hello")).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::text("hello")));

        peer.send_text("world").await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(Frame::text("world"))));
    }

    #[tokio::test]
    async fn dropping_peer_ends_stream_and_fails_writes() {
        let (conn, peer) = Connection::pair(8);
        let (mut sink, mut stream) = conn.into_parts();
        drop(peer);

        assert_eq!(stream.next().await, None);
        assert_eq!(
            sink.send(Frame::text("x")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn injected_error_surfaces_on_read() {
        let (conn, mut peer) = Connection::pair(8);
        let (_sink, mut stream) = conn.into_parts();

        peer.inject_error(TransportError::Read("reset".into()))
            .await
            .unwrap();

        assert_eq!(
            stream.next().await,
            Some(Err(TransportError::Read("reset".into())))
        );
    }

    #[tokio::test]
    async fn recv_text_skips_pings() {
        let (conn, mut peer) = Connection::pair(8);
        let (mut sink, _stream) = conn.into_parts();

        sink.send(Frame::Ping(Vec::new())).await.unwrap();
        sink.send(Frame::text("40")).await.unwrap();

        assert_eq!(peer.recv_text().await.as_deref(), Some("40"));
    }

    #[test]
    fn axum_message_mapping() {
        assert_eq!(from_message(Message::Text("2".into())), Frame::text("2"));
        assert_eq!(from_message(Message::Close(None)), Frame::Close);
        assert!(matches!(to_message(Frame::Ping(vec![])), Message::Ping(_)));
        assert!(matches!(to_message(Frame::text("3")), Message::Text(t) if t.as_str() == "3"));
    }
}
