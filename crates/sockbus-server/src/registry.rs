//! Event-name → handler tables at session and server scope.
//!
//! Handler shapes are a closed set of enum variants. Reserved names accept
//! exactly one shape; registering the wrong one is a [`RegistrationError`]
//! returned to the caller. Reserved handlers replace the default no-op and are
//! never reachable by an inbound event of the same name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use sockbus_core::errors::RegistrationError;
use sockbus_core::topics::CROSS_PROCESS_TOPIC;
use sockbus_core::Error;

use crate::session::Session;

/// Server-scope handler invoked once per admitted session.
pub const ON_CONNECT: &str = "onConnect";
/// Handler invoked once when a session ends.
pub const ON_DISCONNECT: &str = "onDisconnect";
/// Handler invoked for every non-fatal and fatal session error.
pub const ON_ERROR: &str = "onError";

/// Error type returned by a failing `onConnect` handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Session-scope freeform event handler.
pub type EventFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Session-scope disconnect handler, given the teardown reason.
pub type DisconnectFn = Arc<dyn Fn(String) + Send + Sync>;
/// Session-scope error handler.
pub type ErrorFn = Arc<dyn Fn(&Error) + Send + Sync>;

/// Server-scope connect handler.
pub type ConnectFn = Arc<dyn Fn(Session) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
/// Server-scope disconnect handler.
pub type ServerDisconnectFn = Arc<dyn Fn(Session, String) + Send + Sync>;
/// Server-scope error handler, invoked after the session's own.
pub type ServerErrorFn = Arc<dyn Fn(&Session, &Error) + Send + Sync>;
/// Server-scope freeform event handler, used when the session has none.
pub type ServerEventFn = Arc<dyn Fn(Session, String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Handler for payloads published to the cross-process topic.
pub type CrossProcessFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// A handler registrable on a session.
#[derive(Clone)]
pub enum SessionHandler {
    /// Freeform event handler.
    Event(EventFn),
    /// Required shape for `onDisconnect`.
    Disconnect(DisconnectFn),
    /// Required shape for `onError`.
    Error(ErrorFn),
}

impl SessionHandler {
    /// Wrap an async payload handler.
    pub fn event<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Event(Arc::new(move |payload| Box::pin(f(payload))))
    }

    /// Wrap a disconnect handler.
    pub fn disconnect<F>(f: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self::Disconnect(Arc::new(f))
    }

    /// Wrap an error handler.
    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        Self::Error(Arc::new(f))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "an event handler",
            Self::Disconnect(_) => "a disconnect handler",
            Self::Error(_) => "an error handler",
        }
    }
}

/// A handler registrable on the server.
#[derive(Clone)]
pub enum ServerHandler {
    /// Required shape for `onConnect`.
    Connect(ConnectFn),
    /// Required shape for `onDisconnect`.
    Disconnect(ServerDisconnectFn),
    /// Required shape for `onError`.
    Error(ServerErrorFn),
    /// Required shape for `broadcast-to-server`.
    CrossProcess(CrossProcessFn),
    /// Freeform event handler.
    Event(ServerEventFn),
}

impl ServerHandler {
    /// Wrap an async connect handler.
    pub fn connect<F, Fut>(f: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::Connect(connect_fn(f))
    }

    /// Wrap a disconnect handler.
    pub fn disconnect<F>(f: F) -> Self
    where
        F: Fn(Session, String) + Send + Sync + 'static,
    {
        Self::Disconnect(Arc::new(f))
    }

    /// Wrap an error handler.
    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&Session, &Error) + Send + Sync + 'static,
    {
        Self::Error(Arc::new(f))
    }

    /// Wrap an async cross-process payload handler.
    pub fn cross_process<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::CrossProcess(cross_process_fn(f))
    }

    /// Wrap an async freeform event handler.
    pub fn event<F, Fut>(f: F) -> Self
    where
        F: Fn(Session, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Event(Arc::new(move |session, payload| Box::pin(f(session, payload))))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "a connect handler",
            Self::Disconnect(_) => "a disconnect handler",
            Self::Error(_) => "an error handler",
            Self::CrossProcess(_) => "a cross-process handler",
            Self::Event(_) => "an event handler",
        }
    }
}

pub(crate) fn connect_fn<F, Fut>(f: F) -> ConnectFn
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

pub(crate) fn cross_process_fn<F, Fut>(f: F) -> CrossProcessFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

fn mismatch(event: &str, expected: &'static str, found: &'static str) -> RegistrationError {
    RegistrationError::ShapeMismatch {
        event: event.to_owned(),
        expected,
        found,
    }
}

#[derive(Default)]
struct SessionTable {
    events: HashMap<String, EventFn>,
    on_disconnect: Option<DisconnectFn>,
    on_error: Option<ErrorFn>,
}

/// Handler table owned by one session.
#[derive(Default)]
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
}

impl SessionRegistry {
    /// Register `handler` under `name`, replacing any previous one.
    ///
    /// Server-only names (`onConnect`, `broadcast-to-server`) are rejected.
    pub fn register(&self, name: &str, handler: SessionHandler) -> Result<(), RegistrationError> {
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        match (name, handler) {
            (ON_CONNECT | CROSS_PROCESS_TOPIC, _) => {
                return Err(RegistrationError::ReservedName(name.to_owned()));
            }
            (ON_DISCONNECT, SessionHandler::Disconnect(f)) => self.set_disconnect(f),
            (ON_ERROR, SessionHandler::Error(f)) => self.set_error(f),
            (ON_DISCONNECT, other) => {
                return Err(mismatch(name, "a disconnect handler", other.kind()));
            }
            (ON_ERROR, other) => return Err(mismatch(name, "an error handler", other.kind())),
            (_, SessionHandler::Event(f)) => {
                let _ = self.table.write().events.insert(name.to_owned(), f);
            }
            (_, other) => return Err(mismatch(name, "an event handler", other.kind())),
        }
        Ok(())
    }

    /// Install the `onDisconnect` handler.
    pub fn set_disconnect(&self, f: DisconnectFn) {
        self.table.write().on_disconnect = Some(f);
    }

    /// Install the `onError` handler.
    pub fn set_error(&self, f: ErrorFn) {
        self.table.write().on_error = Some(f);
    }

    /// Freeform handler for `event`.
    pub fn event(&self, event: &str) -> Option<EventFn> {
        self.table.read().events.get(event).cloned()
    }

    /// The registered `onDisconnect`, if any.
    pub fn disconnect_handler(&self) -> Option<DisconnectFn> {
        self.table.read().on_disconnect.clone()
    }

    /// The registered `onError`, if any.
    pub fn error_handler(&self) -> Option<ErrorFn> {
        self.table.read().on_error.clone()
    }

    /// Drop every handler.
    pub fn clear(&self) {
        *self.table.write() = SessionTable::default();
    }
}

#[derive(Default)]
struct ServerTable {
    events: HashMap<String, ServerEventFn>,
    on_connect: Option<ConnectFn>,
    on_disconnect: Option<ServerDisconnectFn>,
    on_error: Option<ServerErrorFn>,
    cross_process: Option<CrossProcessFn>,
}

/// Handler table shared by a server and all of its sessions.
#[derive(Default)]
pub struct ServerRegistry {
    table: RwLock<ServerTable>,
}

impl ServerRegistry {
    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: &str, handler: ServerHandler) -> Result<(), RegistrationError> {
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        match (name, handler) {
            (ON_CONNECT, ServerHandler::Connect(f)) => self.set_connect(f),
            (ON_DISCONNECT, ServerHandler::Disconnect(f)) => self.set_disconnect(f),
            (ON_ERROR, ServerHandler::Error(f)) => self.set_error(f),
            (CROSS_PROCESS_TOPIC, ServerHandler::CrossProcess(f)) => self.set_cross_process(f),
            (ON_CONNECT, other) => return Err(mismatch(name, "a connect handler", other.kind())),
            (ON_DISCONNECT, other) => {
                return Err(mismatch(name, "a disconnect handler", other.kind()));
            }
            (ON_ERROR, other) => return Err(mismatch(name, "an error handler", other.kind())),
            (CROSS_PROCESS_TOPIC, other) => {
                return Err(mismatch(name, "a cross-process handler", other.kind()));
            }
            (_, ServerHandler::Event(f)) => {
                let _ = self.table.write().events.insert(name.to_owned(), f);
            }
            (_, other) => return Err(mismatch(name, "an event handler", other.kind())),
        }
        Ok(())
    }

    /// Install the `onConnect` handler.
    pub fn set_connect(&self, f: ConnectFn) {
        self.table.write().on_connect = Some(f);
    }

    /// Install the `onDisconnect` handler.
    pub fn set_disconnect(&self, f: ServerDisconnectFn) {
        self.table.write().on_disconnect = Some(f);
    }

    /// Install the `onError` handler.
    pub fn set_error(&self, f: ServerErrorFn) {
        self.table.write().on_error = Some(f);
    }

    /// Install the cross-process handler.
    pub fn set_cross_process(&self, f: CrossProcessFn) {
        self.table.write().cross_process = Some(f);
    }

    /// Freeform handler for `event`.
    pub fn event(&self, event: &str) -> Option<ServerEventFn> {
        self.table.read().events.get(event).cloned()
    }

    /// The registered `onConnect`, if any.
    pub fn connect_handler(&self) -> Option<ConnectFn> {
        self.table.read().on_connect.clone()
    }

    /// The registered `onDisconnect`, if any.
    pub fn disconnect_handler(&self) -> Option<ServerDisconnectFn> {
        self.table.read().on_disconnect.clone()
    }

    /// The registered `onError`, if any.
    pub fn error_handler(&self) -> Option<ServerErrorFn> {
        self.table.read().on_error.clone()
    }

    /// The registered cross-process handler, if any.
    pub fn cross_process_handler(&self) -> Option<CrossProcessFn> {
        self.table.read().cross_process.clone()
    }
}
