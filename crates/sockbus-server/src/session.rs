//! One live client connection.
//!
//! A session runs two loops against its [`Connection`](crate::transport::Connection):
//!
//! - **inbound**: reads frames, enforces the read limit and liveness deadline,
//!   answers heartbeats, and dispatches event envelopes to handlers
//! - **outbound**: the single writer. Forwards broker deliveries and heartbeat
//!   replies, emits low-level pings, bounds every write by the write timeout
//!
//! The first failure on either loop runs [`Session::teardown`] exactly once:
//! cancel both loops, close the subscription, fire `onDisconnect`, signal the
//! control loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant as StdInstant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use sockbus_broker::{Broker, Feed, SubscriptionHandle};
use sockbus_core::codec::{self, Envelope, PONG_PACKET, Packet};
use sockbus_core::errors::{BrokerError, ProtocolError, RegistrationError, TransportError};
use sockbus_core::topics::{self, SessionId};
use sockbus_core::{Error, Result};
use sockbus_settings::BusSettings;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{
    BUS_PUBLISH_ERRORS_TOTAL, BUS_PUBLISH_TOTAL, WS_FRAMES_IN_TOTAL, WS_FRAMES_MALFORMED_TOTAL,
};
use crate::registry::{ServerRegistry, SessionHandler, SessionRegistry};
use crate::transport::{Frame, FrameSink, FrameStream};

/// Opaque per-connection context supplied at admission (query parameters,
/// auth claims, and the like).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Teardown reasons passed to `onDisconnect`.
pub mod reason {
    /// The client sent the `41` disconnect packet.
    pub const CLIENT_DISCONNECT: &str = "client disconnect";
    /// The client closed the connection or the stream ended.
    pub const TRANSPORT_CLOSED: &str = "transport closed";
    /// Reading from the connection failed.
    pub const READ_ERROR: &str = "read error";
    /// No liveness reply inside the pong wait.
    pub const PING_TIMEOUT: &str = "ping timeout";
    /// An inbound frame exceeded the read limit.
    pub const FRAME_TOO_LARGE: &str = "frame too large";
    /// Writing to the connection failed or timed out.
    pub const WRITE_ERROR: &str = "write error";
    /// The broker ended the session's subscription.
    pub const SUBSCRIPTION_CLOSED: &str = "subscription closed";
    /// [`Session::disconnect`](super::Session::disconnect) was called.
    pub const SERVER_DISCONNECT: &str = "server disconnect";
    /// The server is shutting down.
    pub const SERVER_SHUTDOWN: &str = "server shutdown";
    /// Reason handed to the server-scope `onDisconnect`.
    pub const DISCONNECT: &str = "disconnect";
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Loops running, handlers dispatching.
    Active,
    /// Teardown has started; loops are stopping.
    Closing,
    /// Both loops have exited.
    Closed,
}

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Everything the control loop hands a new session.
pub(crate) struct SessionContext {
    pub id: SessionId,
    pub metadata: Metadata,
    pub broker: Arc<dyn Broker>,
    pub subscription: SubscriptionHandle,
    pub server_handlers: Arc<ServerRegistry>,
    pub settings: Arc<BusSettings>,
    pub removals: mpsc::UnboundedSender<SessionId>,
}

struct SessionInner {
    id: SessionId,
    metadata: Metadata,
    broker: Arc<dyn Broker>,
    subscription: SubscriptionHandle,
    handlers: SessionRegistry,
    server_handlers: Arc<ServerRegistry>,
    settings: Arc<BusSettings>,
    /// Heartbeat replies for the outbound loop.
    replies: mpsc::Sender<String>,
    removals: mpsc::UnboundedSender<SessionId>,
    state: AtomicU8,
    /// Teardown latch.
    closing: AtomicBool,
    /// Loops still running.
    running: AtomicU8,
    cancel: CancellationToken,
    closed: CancellationToken,
    started_at: StdInstant,
}

/// Handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build the session and spawn both loops. The handshake must already be
    /// written to `sink`.
    pub(crate) fn start(ctx: SessionContext, sink: FrameSink, stream: FrameStream, feed: Feed) -> Self {
        let (replies_tx, replies_rx) = mpsc::channel(ctx.settings.outbound_buffer);
        let session = Self {
            inner: Arc::new(SessionInner {
                id: ctx.id,
                metadata: ctx.metadata,
                broker: ctx.broker,
                subscription: ctx.subscription,
                handlers: SessionRegistry::default(),
                server_handlers: ctx.server_handlers,
                settings: ctx.settings,
                replies: replies_tx,
                removals: ctx.removals,
                state: AtomicU8::new(ACTIVE),
                closing: AtomicBool::new(false),
                running: AtomicU8::new(2),
                cancel: CancellationToken::new(),
                closed: CancellationToken::new(),
                started_at: StdInstant::now(),
            }),
        };

        let _inbound = tokio::spawn(session.clone().inbound_loop(stream));
        let _outbound = tokio::spawn(session.clone().outbound_loop(sink, feed, replies_rx));
        session
    }

    /// Session id, also its direct-message topic.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Context supplied at admission.
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match self.inner.state.load(Ordering::Acquire) {
            ACTIVE => SessionState::Active,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Time since admission.
    pub fn age(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }

    /// Topics the session currently receives from.
    pub fn topics(&self) -> Vec<String> {
        self.inner.subscription.topics()
    }

    /// Resolves once both loops have exited.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    // ── Handlers ────────────────────────────────────────────────────────

    /// Register a handler. Reserved names (`onDisconnect`, `onError`) require
    /// their specific shape.
    pub fn on(&self, event: &str, handler: SessionHandler) -> Result<(), RegistrationError> {
        self.inner.handlers.register(event, handler)
    }

    /// Register an async handler for inbound `event` frames.
    pub fn on_event<F, Fut>(&self, event: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(event, SessionHandler::event(f))
    }

    /// Register the disconnect handler; it receives the teardown reason.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.handlers.set_disconnect(Arc::new(f));
    }

    /// Register the error handler.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.handlers.set_error(Arc::new(f));
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send `event` to this session's own client.
    pub async fn emit(&self, event: &str, payload: &str) -> Result<()> {
        self.publish(self.inner.id.as_str(), event, payload).await
    }

    /// Send `event` to every subscriber of `room`. The sender receives it too
    /// if it has joined the room. Session ids are valid rooms here.
    pub async fn to(&self, room: &str, event: &str, payload: &str) -> Result<()> {
        self.publish(room, event, payload).await
    }

    /// Start receiving events sent to `room`.
    pub async fn join(&self, room: &str) -> Result<()> {
        topics::validate_room(room)?;
        self.inner.subscription.join(room).await?;
        debug!(session_id = %self.inner.id, room, "joined room");
        Ok(())
    }

    /// Stop receiving events sent to `room`.
    pub async fn leave(&self, room: &str) -> Result<()> {
        topics::validate_room(room)?;
        self.inner.subscription.leave(room).await?;
        debug!(session_id = %self.inner.id, room, "left room");
        Ok(())
    }

    /// Close the connection from the server side.
    pub async fn disconnect(&self) {
        self.teardown(reason::SERVER_DISCONNECT).await;
    }

    async fn publish(&self, topic: &str, event: &str, payload: &str) -> Result<()> {
        topics::validate_event_topic(topic)?;
        let result = publish_event(self.inner.broker.as_ref(), topic, event, payload).await;
        if let Err(e) = &result {
            self.report_error(e);
        }
        result
    }

    // ── Errors ──────────────────────────────────────────────────────────

    /// Log `err` and hand it to the session, then server, error handlers.
    pub(crate) fn report_error(&self, err: &Error) {
        if err.is_fatal() {
            error!(session_id = %self.inner.id, error = %err, "session error");
        } else {
            warn!(session_id = %self.inner.id, error = %err, "session error");
        }
        if let Some(handler) = self.inner.handlers.error_handler() {
            handler(err);
        }
        if let Some(handler) = self.inner.server_handlers.error_handler() {
            handler(self, err);
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Idempotent teardown. Only the first caller has any effect.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub(crate) async fn teardown(&self, reason: &str) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            debug!("teardown already ran");
            return;
        }
        let _ = self
            .inner
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire);

        // Taken before the loops can exit and clear the table.
        let on_disconnect = self.inner.handlers.disconnect_handler();

        self.inner.cancel.cancel();
        self.inner.subscription.close().await;

        if let Some(handler) = on_disconnect {
            handler(reason.to_owned());
        }
        if self.inner.removals.send(self.inner.id.clone()).is_err() {
            debug!("control loop already stopped");
        }
        info!(reason, "session closed");
    }

    fn loop_exited(&self) {
        if self.inner.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.state.store(CLOSED, Ordering::Release);
            // Handlers commonly capture the session; dropping them breaks the cycle.
            self.inner.handlers.clear();
            self.inner.closed.cancel();
        }
    }

    // ── Loops ───────────────────────────────────────────────────────────

    async fn inbound_loop(self, mut stream: FrameStream) {
        let pong_wait = self.inner.settings.pong_wait();
        let limit = self.inner.settings.max_message_size;
        let mut deadline = Instant::now() + pong_wait;

        let reason = loop {
            let next = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break None,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    self.report_error(&e.into());
                    break Some(reason::READ_ERROR);
                }
                Ok(None) => break Some(reason::TRANSPORT_CLOSED),
                Err(_) => {
                    let err = TransportError::PongTimeout(self.inner.settings.pong_wait_ms);
                    self.report_error(&err.into());
                    break Some(reason::PING_TIMEOUT);
                }
            };

            match frame {
                Frame::Pong(_) => deadline = Instant::now() + pong_wait,
                Frame::Ping(_) => {}
                Frame::Close => break Some(reason::TRANSPORT_CLOSED),
                Frame::Binary(data) => {
                    counter!(WS_FRAMES_MALFORMED_TOTAL).increment(1);
                    let err = ProtocolError::BadEnvelope(format!("binary frame of {} bytes", data.len()));
                    self.report_error(&err.into());
                }
                Frame::Text(text) => {
                    if text.len() > limit {
                        let err = TransportError::FrameTooLarge { size: text.len(), limit };
                        self.report_error(&err.into());
                        break Some(reason::FRAME_TOO_LARGE);
                    }
                    counter!(WS_FRAMES_IN_TOTAL).increment(1);
                    match codec::decode_packet(&text) {
                        Ok(Packet::Ping) => {
                            if self.inner.replies.send(PONG_PACKET.to_owned()).await.is_err() {
                                break None;
                            }
                        }
                        Ok(Packet::Disconnect) => break Some(reason::CLIENT_DISCONNECT),
                        Ok(Packet::Pong | Packet::Control(_)) => {}
                        Ok(Packet::Event(envelope)) => self.dispatch(envelope),
                        Err(e) => {
                            counter!(WS_FRAMES_MALFORMED_TOTAL).increment(1);
                            debug!(session_id = %self.inner.id, frame = %text, "dropping malformed frame");
                            self.report_error(&e.into());
                        }
                    }
                }
            }
        };

        if let Some(reason) = reason {
            self.teardown(reason).await;
        }
        self.loop_exited();
    }

    async fn outbound_loop(self, mut sink: FrameSink, mut feed: Feed, mut replies: mpsc::Receiver<String>) {
        let period = self.inner.settings.ping_period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let frame = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break None,
                Some(reply) = replies.recv() => Frame::Text(reply),
                delivery = feed.recv() => match delivery {
                    Some(msg) => match String::from_utf8(msg.payload.to_vec()) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => {
                            let err = ProtocolError::BadEnvelope(format!("non-utf8 delivery on '{}'", msg.topic));
                            self.report_error(&err.into());
                            continue;
                        }
                    },
                    None => {
                        self.report_error(&BrokerError::Closed.into());
                        break Some(reason::SUBSCRIPTION_CLOSED);
                    }
                },
                _ = ticker.tick() => Frame::Ping(Vec::new()),
            };

            if let Err(e) = write_frame(&mut sink, frame, &self.inner.settings).await {
                self.report_error(&e.into());
                break Some(reason::WRITE_ERROR);
            }
        };

        if let Some(reason) = reason {
            self.teardown(reason).await;
        }
        let _ = write_frame(&mut sink, Frame::Close, &self.inner.settings).await;
        let _ = tokio::time::timeout(self.inner.settings.write_timeout(), sink.close()).await;
        self.loop_exited();
    }

    /// Session handler first, then the server-scope fallback. Unknown events
    /// are dropped.
    fn dispatch(&self, envelope: Envelope) {
        let Envelope { event, payload } = envelope;
        if let Some(handler) = self.inner.handlers.event(&event) {
            debug!(session_id = %self.inner.id, %event, "dispatching");
            let _handle = tokio::spawn(handler(payload));
        } else if let Some(handler) = self.inner.server_handlers.event(&event) {
            debug!(session_id = %self.inner.id, %event, "dispatching to server handler");
            let _handle = tokio::spawn(handler(self.clone(), payload));
        } else {
            debug!(session_id = %self.inner.id, %event, "no handler, dropping");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Write one frame, bounded by the write timeout.
pub(crate) async fn write_frame(
    sink: &mut FrameSink,
    frame: Frame,
    settings: &BusSettings,
) -> Result<(), TransportError> {
    match tokio::time::timeout(settings.write_timeout(), sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::WriteTimeout(settings.write_timeout_ms)),
    }
}

/// Encode an envelope and publish it to `topic`.
pub(crate) async fn publish_event(
    broker: &dyn Broker,
    topic: &str,
    event: &str,
    payload: &str,
) -> Result<()> {
    let frame = codec::encode_event(event, payload)?;
    match broker.publish(topic, Bytes::from(frame)).await {
        Ok(()) => {
            counter!(BUS_PUBLISH_TOTAL).increment(1);
            debug!(topic, event, "published");
            Ok(())
        }
        Err(e) => {
            counter!(BUS_PUBLISH_ERRORS_TOTAL).increment(1);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, PeerConnection};
    use assert_matches::assert_matches;
    use sockbus_broker::MemoryBroker;
    use sockbus_core::errors::TopicError;
    use sockbus_core::topics::{CROSS_PROCESS_TOPIC, SERVER_BROADCAST_TOPIC};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        session: Session,
        peer: PeerConnection,
        broker: MemoryBroker,
        removals: mpsc::UnboundedReceiver<SessionId>,
    }

    async fn harness_with(settings: BusSettings) -> Harness {
        harness_on(settings, 32).await
    }

    async fn harness_on(settings: BusSettings, capacity: usize) -> Harness {
        let broker = MemoryBroker::new();
        let id = SessionId::generate();
        let sub = broker
            .subscribe(&[id.to_string(), SERVER_BROADCAST_TOPIC.to_owned()])
            .await
            .unwrap();
        let (handle, feed) = sub.into_parts();
        let (conn, peer) = Connection::pair(capacity);
        let (sink, stream) = conn.into_parts();
        let (removals_tx, removals) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            id,
            metadata: Metadata::new(),
            broker: Arc::new(broker.clone()),
            subscription: handle,
            server_handlers: Arc::new(ServerRegistry::default()),
            settings: Arc::new(settings),
            removals: removals_tx,
        };
        let session = Session::start(ctx, sink, stream, feed);
        Harness { session, peer, broker, removals }
    }

    async fn harness() -> Harness {
        harness_with(BusSettings::default()).await
    }

    #[tokio::test]
    async fn heartbeat_is_answered() {
        let mut h = harness().await;
        h.peer.send_text("2").await.unwrap();
        assert_eq!(h.peer.recv_text().await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn emit_reaches_own_client() {
        let mut h = harness().await;
        h.session.emit("hello", "world").await.unwrap();
        assert_eq!(
            h.peer.recv_text().await.as_deref(),
            Some(r#"42["hello","world"]"#)
        );
    }

    #[tokio::test]
    async fn inbound_event_reaches_handler() {
        let mut h = harness().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.session
            .on_event("chat", move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                }
            })
            .unwrap();

        h.peer.send_text(r#"42["chat","hi"]"#).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_and_session_survives() {
        let mut h = harness().await;
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let e = errors.clone();
        h.session.on_error(move |err| e.lock().push(err.clone()));

        h.peer.send_text("42not json").await.unwrap();
        h.peer.send_text("2").await.unwrap();
        assert_eq!(h.peer.recv_text().await.as_deref(), Some("3"));

        assert_matches!(
            errors.lock().as_slice(),
            [Error::Protocol(ProtocolError::InvalidJson(_))]
        );
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn inbound_reserved_name_does_not_reach_error_handler() {
        let mut h = harness().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let c = hits.clone();
        h.session.on_error(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });

        h.peer.send_text(r#"42["onError","boom"]"#).await.unwrap();
        h.peer.send_text("2").await.unwrap();
        assert_eq!(h.peer.recv_text().await.as_deref(), Some("3"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_disconnect_packet_tears_down() {
        let mut h = harness().await;
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let r = reasons.clone();
        h.session.on_disconnect(move |reason| r.lock().push(reason));

        h.peer.send_text("41").await.unwrap();
        h.session.closed().await;

        assert_eq!(*reasons.lock(), vec![reason::CLIENT_DISCONNECT.to_string()]);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.removals.recv().await.as_ref(), Some(h.session.id()));
        assert_eq!(h.broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn oversize_frame_is_fatal() {
        let settings = BusSettings {
            max_message_size: 16,
            ..BusSettings::default()
        };
        let mut h = harness_with(settings).await;
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let r = reasons.clone();
        h.session.on_disconnect(move |reason| r.lock().push(reason));

        h.peer
            .send_text(r#"42["chat","this payload is too long"]"#)
            .await
            .unwrap();
        h.session.closed().await;
        assert_eq!(*reasons.lock(), vec![reason::FRAME_TOO_LARGE.to_string()]);
    }

    #[tokio::test]
    async fn concurrent_failures_tear_down_once() {
        let h = harness().await;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.session.on_disconnect(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });

        let session = h.session.clone();
        drop(h.peer);
        let explicit = tokio::spawn(async move { session.disconnect().await });
        h.session.disconnect().await;
        explicit.await.unwrap();
        h.session.closed().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_write_times_out_and_tears_down() {
        let settings = BusSettings {
            write_timeout_ms: 50,
            ..BusSettings::default()
        };
        // The peer never reads, so the one-slot connection fills up.
        let mut h = harness_on(settings, 1).await;
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (r, e) = (reasons.clone(), errors.clone());
        h.session.on_disconnect(move |reason| r.lock().push(reason));
        h.session.on_error(move |err| e.lock().push(err.clone()));

        for i in 0..8 {
            h.session.emit("tick", &i.to_string()).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), h.session.closed())
            .await
            .unwrap();

        assert_eq!(*reasons.lock(), vec![reason::WRITE_ERROR.to_string()]);
        assert!(errors.lock().contains(&Error::Transport(TransportError::WriteTimeout(50))));
        assert_eq!(h.removals.recv().await.as_ref(), Some(h.session.id()));
        assert_eq!(h.broker.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_times_out() {
        let settings = BusSettings {
            ping_period_ms: 900,
            pong_wait_ms: 1_000,
            ..BusSettings::default()
        };
        let mut h = harness_with(settings).await;
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let r = reasons.clone();
        h.session.on_disconnect(move |reason| r.lock().push(reason));

        assert_matches!(h.peer.recv().await, Some(Frame::Ping(_)));
        h.session.closed().await;
        assert_eq!(*reasons.lock(), vec![reason::PING_TIMEOUT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_refreshes_deadline() {
        let settings = BusSettings {
            ping_period_ms: 900,
            pong_wait_ms: 1_000,
            ..BusSettings::default()
        };
        let mut h = harness_with(settings).await;

        for _ in 0..3 {
            assert_matches!(h.peer.recv().await, Some(Frame::Ping(_)));
            h.peer.send(Frame::Pong(Vec::new())).await.unwrap();
        }
        assert_eq!(h.session.state(), SessionState::Active);
        h.session.disconnect().await;
    }

    #[tokio::test]
    async fn join_rejects_reserved_and_session_topics() {
        let h = harness().await;
        assert_matches!(
            h.session.join(SERVER_BROADCAST_TOPIC).await,
            Err(Error::Topic(TopicError::Reserved(_)))
        );
        assert_matches!(
            h.session.join(CROSS_PROCESS_TOPIC).await,
            Err(Error::Topic(TopicError::Reserved(_)))
        );
        assert_matches!(
            h.session.leave(h.session.id().as_str()).await,
            Err(Error::Topic(TopicError::SessionNamespace(_)))
        );
        assert_matches!(h.session.join("").await, Err(Error::Topic(TopicError::Empty)));
    }

    #[tokio::test]
    async fn cannot_emit_to_cross_process_topic() {
        let h = harness().await;
        assert_matches!(
            h.session.to(CROSS_PROCESS_TOPIC, "x", "y").await,
            Err(Error::Topic(TopicError::Reserved(_)))
        );
    }

    #[tokio::test]
    async fn room_membership_follows_join_and_leave() {
        let mut h = harness().await;
        h.session.join("lobby").await.unwrap();
        assert!(h.session.topics().contains(&"lobby".to_string()));

        h.session.to("lobby", "news", "one").await.unwrap();
        assert_eq!(h.peer.recv_text().await.as_deref(), Some(r#"42["news","one"]"#));

        h.session.leave("lobby").await.unwrap();
        h.session.to("lobby", "news", "two").await.unwrap();
        h.session.emit("marker", "").await.unwrap();
        assert_eq!(h.peer.recv_text().await.as_deref(), Some(r#"42["marker",""]"#));
    }

    #[tokio::test]
    async fn broker_loss_tears_down() {
        let h = harness().await;
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let e = errors.clone();
        h.session.on_error(move |err| e.lock().push(err.clone()));

        h.broker.close();
        tokio::time::timeout(Duration::from_secs(5), h.session.closed())
            .await
            .unwrap();
        assert!(errors.lock().contains(&Error::Broker(BrokerError::Closed)));
    }
}
