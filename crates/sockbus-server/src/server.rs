//! Server handle and the control loop that owns the session map.
//!
//! Every mutation of the session map (admission, removal, shutdown) and every
//! query runs on one task. Callers talk to it over a bounded command queue;
//! sessions signal their own removal over an unbounded queue so teardown never
//! blocks on a busy loop.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use sockbus_broker::{Broker, BrokerMessage, Feed, Subscription, SubscriptionHandle};
use sockbus_core::codec;
use sockbus_core::errors::RegistrationError;
use sockbus_core::topics::{self, CROSS_PROCESS_TOPIC, SERVER_BROADCAST_TOPIC, SessionId};
use sockbus_core::{Error, Result};
use sockbus_settings::BusSettings;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::registry::{self, HandlerError, ServerHandler, ServerRegistry};
use crate::session::{self, Metadata, Session, SessionContext, reason};
use crate::transport::{Connection, Frame, FrameSink, FrameStream};

/// A connection that finished the handshake and awaits registration.
struct Pending {
    id: SessionId,
    metadata: Metadata,
    subscription: Subscription,
    sink: FrameSink,
    stream: FrameStream,
}

impl Pending {
    async fn abandon(self) {
        use futures::SinkExt;

        self.subscription.handle.close().await;
        let mut sink = self.sink;
        let _ = sink.close().await;
    }
}

enum Command {
    Admit {
        pending: Pending,
        reply: oneshot::Sender<Session>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Lookup {
        id: SessionId,
        reply: oneshot::Sender<Option<Session>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    broker: Arc<dyn Broker>,
    settings: Arc<BusSettings>,
    handlers: Arc<ServerRegistry>,
    commands: mpsc::Sender<Command>,
    stopped: CancellationToken,
}

/// Entry point of the bus: admits connections and owns server-scope handlers.
///
/// Cloning is cheap; clones drive the same control loop. The loop stops on
/// [`shutdown`](Self::shutdown) or once every clone is dropped. Handlers are
/// owned by the loop, so a handler that captures a `Server` keeps it running
/// until `shutdown`; capture a [`WeakServer`] instead.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

/// Non-owning handle to a [`Server`], for use inside handlers.
#[derive(Clone)]
pub struct WeakServer {
    shared: Weak<Shared>,
}

impl WeakServer {
    /// The server, if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<Server> {
        self.shared.upgrade().map(|shared| Server { shared })
    }
}

impl std::fmt::Debug for WeakServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakServer")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Server {
    /// Create a server over `broker`, subscribe to the cross-process topic,
    /// and spawn the control loop.
    pub async fn new<B: Broker>(broker: B, settings: BusSettings) -> Result<Self> {
        Self::with_broker(Arc::new(broker), settings).await
    }

    /// Like [`new`](Self::new) for an already shared broker.
    pub async fn with_broker(broker: Arc<dyn Broker>, mut settings: BusSettings) -> Result<Self> {
        settings.validate();
        let settings = Arc::new(settings);

        let cross_process = broker.subscribe(&[CROSS_PROCESS_TOPIC.to_owned()]).await?;
        let (cross_handle, cross_feed) = cross_process.into_parts();

        let (commands_tx, commands_rx) = mpsc::channel(settings.control_buffer);
        let (removals_tx, removals_rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(ServerRegistry::default());
        let stopped = CancellationToken::new();

        let control = ControlLoop {
            sessions: HashMap::new(),
            broker: broker.clone(),
            settings: settings.clone(),
            handlers: handlers.clone(),
            removals: removals_tx,
            cross_process: cross_handle,
            stopped: stopped.clone(),
        };
        let _handle = tokio::spawn(control.run(commands_rx, removals_rx, cross_feed));

        info!(
            max_message_size = settings.max_message_size,
            ping_period_ms = settings.ping_period_ms,
            pong_wait_ms = settings.pong_wait_ms,
            "server started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                broker,
                settings,
                handlers,
                commands: commands_tx,
                stopped,
            }),
        })
    }

    /// Effective settings.
    pub fn settings(&self) -> &BusSettings {
        &self.shared.settings
    }

    /// Non-owning handle for capture inside handlers.
    pub fn downgrade(&self) -> WeakServer {
        WeakServer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ── Handlers ────────────────────────────────────────────────────────

    /// Register a server-scope handler. Reserved names (`onConnect`,
    /// `onDisconnect`, `onError`, `broadcast-to-server`) require their
    /// specific shape; any other name takes a freeform event handler used when
    /// a session has none of its own.
    pub fn on(&self, name: &str, handler: ServerHandler) -> Result<(), RegistrationError> {
        self.shared.handlers.register(name, handler)
    }

    /// Register the connect handler. An `Err` is logged and reported; the
    /// session stays open.
    pub fn on_connect<F, Fut>(&self, f: F)
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.shared.handlers.set_connect(registry::connect_fn(f));
    }

    /// Register the disconnect handler.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(Session, String) + Send + Sync + 'static,
    {
        self.shared.handlers.set_disconnect(Arc::new(f));
    }

    /// Register the error handler. Runs after the session's own.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Session, &Error) + Send + Sync + 'static,
    {
        self.shared.handlers.set_error(Arc::new(f));
    }

    /// Register the handler for payloads published with
    /// [`broadcast_to_server`](Self::broadcast_to_server) by any process.
    pub fn on_server_broadcast<F, Fut>(&self, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.shared.handlers.set_cross_process(registry::cross_process_fn(f));
    }

    /// Register a fallback handler for inbound `event` frames.
    pub fn on_event<F, Fut>(&self, event: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(Session, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(event, ServerHandler::event(f))
    }

    // ── Admission ───────────────────────────────────────────────────────

    /// Admit an upgraded connection.
    ///
    /// Opens the session's subscription (own id plus `server-broadcast`),
    /// writes the handshake, and registers the session with the control loop,
    /// which starts its loops and runs `onConnect`.
    #[instrument(skip_all)]
    pub async fn serve_connection(&self, conn: Connection, metadata: Metadata) -> Result<Session> {
        if self.shared.stopped.is_cancelled() {
            return Err(Error::ServerClosed);
        }

        let id = SessionId::generate();
        let subscription = self
            .shared
            .broker
            .subscribe(&[id.to_string(), SERVER_BROADCAST_TOPIC.to_owned()])
            .await
            .inspect_err(|e| warn!(session_id = %id, error = %e, "subscribe failed"))?;

        let (mut sink, stream) = conn.into_parts();
        if let Err(e) = self.write_handshake(&id, &mut sink).await {
            warn!(session_id = %id, error = %e, "handshake failed");
            subscription.handle.close().await;
            return Err(e);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = Pending {
            id,
            metadata,
            subscription,
            sink,
            stream,
        };
        if let Err(mpsc::error::SendError(cmd)) = self
            .shared
            .commands
            .send(Command::Admit { pending, reply: reply_tx })
            .await
        {
            if let Command::Admit { pending, .. } = cmd {
                pending.abandon().await;
            }
            return Err(Error::ServerClosed);
        }
        reply_rx.await.map_err(|_| Error::ServerClosed)
    }

    async fn write_handshake(&self, id: &SessionId, sink: &mut FrameSink) -> Result<()> {
        let settings = &self.shared.settings;
        let frames = codec::handshake(
            id.as_str(),
            settings.handshake_ping_interval_ms,
            settings.handshake_ping_timeout_ms,
        )?;
        for frame in frames {
            session::write_frame(sink, Frame::Text(frame), settings).await?;
        }
        Ok(())
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// Send `event` to every session on every process.
    pub async fn broadcast(&self, event: &str, payload: &str) -> Result<()> {
        self.broadcast_to(SERVER_BROADCAST_TOPIC, event, payload).await
    }

    /// Send `event` to every subscriber of `room`.
    pub async fn broadcast_to(&self, room: &str, event: &str, payload: &str) -> Result<()> {
        topics::validate_event_topic(room)?;
        session::publish_event(self.shared.broker.as_ref(), room, event, payload)
            .await
            .inspect_err(|e| warn!(room, event, error = %e, "broadcast failed"))
    }

    /// Send `event` to one session, wherever it is connected.
    pub async fn emit_to(&self, session_id: &SessionId, event: &str, payload: &str) -> Result<()> {
        self.broadcast_to(session_id.as_str(), event, payload).await
    }

    /// Publish `payload` verbatim to the cross-process topic. Every process
    /// subscribed to it, this one included, runs its cross-process handler.
    /// No session ever receives it.
    pub async fn broadcast_to_server(&self, payload: &str) -> Result<()> {
        self.shared
            .broker
            .publish(CROSS_PROCESS_TOPIC, Bytes::copy_from_slice(payload.as_bytes()))
            .await
            .inspect_err(|e| warn!(error = %e, "cross-process publish failed"))?;
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Number of registered sessions.
    pub async fn session_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Count { reply }).await?;
        rx.await.map_err(|_| Error::ServerClosed)
    }

    /// Look up a registered session.
    pub async fn session(&self, id: &SessionId) -> Result<Option<Session>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Lookup { id: id.clone(), reply }).await?;
        rx.await.map_err(|_| Error::ServerClosed)
    }

    /// Tear down every session, close the cross-process subscription, and
    /// stop the control loop. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.stopped.is_cancelled() {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.shared.stopped.cancel();
    }

    /// Resolves once the control loop has stopped.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.shared
            .commands
            .send(cmd)
            .await
            .map_err(|_| Error::ServerClosed)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("settings", &self.shared.settings)
            .field("stopped", &self.shared.stopped.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control loop
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    session: Session,
    /// Running `onConnect`; awaited before `onDisconnect` fires.
    connect: Option<JoinHandle<()>>,
    admitted_at: Instant,
}

struct ControlLoop {
    sessions: HashMap<SessionId, Entry>,
    broker: Arc<dyn Broker>,
    settings: Arc<BusSettings>,
    handlers: Arc<ServerRegistry>,
    removals: mpsc::UnboundedSender<SessionId>,
    cross_process: SubscriptionHandle,
    stopped: CancellationToken,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut removals: mpsc::UnboundedReceiver<SessionId>,
        feed: Feed,
    ) {
        let mut cross_feed = Some(feed);

        loop {
            tokio::select! {
                biased;
                Some(id) = removals.recv() => self.remove(&id),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        debug!("all server handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                delivery = next_delivery(&mut cross_feed) => match delivery {
                    Some(msg) => self.dispatch_cross_process(msg),
                    None => {
                        warn!("cross-process subscription ended");
                        cross_feed = None;
                    }
                },
            }
        }

        // Connections still queued for admission are closed, not admitted.
        commands.close();
        while let Some(cmd) = commands.recv().await {
            match cmd {
                Command::Admit { pending, .. } => pending.abandon().await,
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                Command::Count { .. } | Command::Lookup { .. } => {}
            }
        }
        self.stopped.cancel();
        info!("control loop stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Admit { pending, reply } => {
                let session = self.admit(pending);
                let _ = reply.send(session);
            }
            Command::Count { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            Command::Lookup { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).map(|e| e.session.clone()));
            }
            // Handled in `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %pending.id))]
    fn admit(&mut self, pending: Pending) -> Session {
        let Pending {
            id,
            metadata,
            subscription,
            sink,
            stream,
        } = pending;
        let (handle, feed) = subscription.into_parts();

        let ctx = SessionContext {
            id: id.clone(),
            metadata,
            broker: self.broker.clone(),
            subscription: handle,
            server_handlers: self.handlers.clone(),
            settings: self.settings.clone(),
            removals: self.removals.clone(),
        };
        let session = Session::start(ctx, sink, stream, feed);

        let connect = self.handlers.connect_handler().map(|handler| {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(session.clone()).await {
                    warn!(session_id = %session.id(), error = %e, "connect handler failed");
                    session.report_error(&Error::ConnectRejected(e.to_string()));
                }
            })
        });

        let _ = self.sessions.insert(
            id,
            Entry {
                session: session.clone(),
                connect,
                admitted_at: Instant::now(),
            },
        );
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.sessions.len() as f64);
        info!(sessions = self.sessions.len(), "session admitted");
        session
    }

    /// Unregister a session and run the server `onDisconnect` once its
    /// `onConnect` has finished. Unknown ids are ignored.
    fn remove(&mut self, id: &SessionId) {
        let Some(entry) = self.sessions.remove(id) else {
            debug!(session_id = %id, "removal of unknown session ignored");
            return;
        };
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.sessions.len() as f64);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(entry.admitted_at.elapsed().as_secs_f64());
        info!(session_id = %id, sessions = self.sessions.len(), "session removed");

        let Entry { session, connect, .. } = entry;
        let on_disconnect = self.handlers.disconnect_handler();
        if connect.is_none() && on_disconnect.is_none() {
            return;
        }
        let _handle = tokio::spawn(async move {
            if let Some(connect) = connect {
                let _ = connect.await;
            }
            if let Some(handler) = on_disconnect {
                handler(session, reason::DISCONNECT.to_owned());
            }
        });
    }

    fn dispatch_cross_process(&self, msg: BrokerMessage) {
        let Some(handler) = self.handlers.cross_process_handler() else {
            debug!("no cross-process handler, dropping");
            return;
        };
        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
        let _handle = tokio::spawn(handler(payload));
    }

    async fn shutdown(&mut self) {
        info!(sessions = self.sessions.len(), "shutting down");
        let sessions: Vec<Session> = self.sessions.values().map(|e| e.session.clone()).collect();
        for session in &sessions {
            session.teardown(reason::SERVER_SHUTDOWN).await;
        }
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.remove(id);
        }
        self.cross_process.close().await;
    }
}

async fn next_delivery(feed: &mut Option<Feed>) -> Option<BrokerMessage> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}
