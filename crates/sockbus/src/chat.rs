//! Demo chat handlers.
//!
//! Each client may:
//! - send `msg`: echoed back, broadcast to everyone, and relayed to every server
//! - send `join` / `leave` with a room name
//! - send `say` with `room|text` to talk in a room it has joined

use sockbus_server::{HandlerError, Server, Session, WeakServer};
use tracing::{info, warn};

/// Register every demo handler on `server`.
pub fn install(server: &Server) {
    let relay = server.downgrade();
    server.on_connect(move |session| {
        let relay = relay.clone();
        async move {
            info!(session_id = %session.id(), metadata = ?session.metadata(), "connected");
            register_session_handlers(&relay, &session)?;
            session.emit("welcome", session.id().as_str()).await?;
            Ok::<(), HandlerError>(())
        }
    });

    server.on_disconnect(|session, reason| {
        info!(session_id = %session.id(), %reason, "disconnected");
    });

    server.on_error(|session, err| {
        warn!(session_id = %session.id(), error = %err, "client error");
    });

    server.on_server_broadcast(|payload| async move {
        info!(%payload, "message from another server");
    });
}

fn register_session_handlers(
    server: &WeakServer,
    session: &Session,
) -> Result<(), sockbus_core::errors::RegistrationError> {
    let (s, relay) = (session.clone(), server.clone());
    session.on_event("msg", move |msg| {
        let (s, relay) = (s.clone(), relay.clone());
        async move {
            info!(session_id = %s.id(), %msg, "msg");
            let _ = s.emit("msg", &msg).await;
            if let Some(server) = relay.upgrade() {
                let _ = server.broadcast("msg", &msg).await;
                let _ = server.broadcast_to_server(&msg).await;
            }
        }
    })?;

    let s = session.clone();
    session.on_event("join", move |room| {
        let s = s.clone();
        async move {
            match s.join(&room).await {
                Ok(()) => {
                    let _ = s.to(&room, "joined", s.id().as_str()).await;
                }
                Err(e) => {
                    let _ = s.emit("error", &e.to_string()).await;
                }
            }
        }
    })?;

    let s = session.clone();
    session.on_event("leave", move |room| {
        let s = s.clone();
        async move {
            if let Err(e) = s.leave(&room).await {
                let _ = s.emit("error", &e.to_string()).await;
            }
        }
    })?;

    let s = session.clone();
    session.on_event("say", move |line| {
        let s = s.clone();
        async move {
            let Some((room, text)) = split_say(&line) else {
                let _ = s.emit("error", "expected room|text").await;
                return;
            };
            let _ = s.to(room, "say", text).await;
        }
    })?;

    session.on_disconnect(|reason| info!(%reason, "session handler saw disconnect"));
    session.on_error(|err| warn!(error = %err, "session handler saw error"));
    Ok(())
}

fn split_say(line: &str) -> Option<(&str, &str)> {
    let (room, text) = line.split_once('|')?;
    (!room.is_empty()).then_some((room, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockbus_broker::MemoryBroker;
    use sockbus_server::{Connection, Metadata, PeerConnection};
    use sockbus_settings::BusSettings;
    use std::time::Duration;

    #[test]
    fn say_requires_room() {
        assert_eq!(split_say("lobby|hi|there"), Some(("lobby", "hi|there")));
        assert_eq!(split_say("|hi"), None);
        assert_eq!(split_say("no separator"), None);
    }

    async fn recv(peer: &mut PeerConnection) -> String {
        tokio::time::timeout(Duration::from_secs(5), peer.recv_text())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn handlers_do_not_keep_server_alive() {
        let server = Server::new(MemoryBroker::new(), BusSettings::default())
            .await
            .unwrap();
        install(&server);

        let (conn, mut peer) = Connection::pair(32);
        let session = server.serve_connection(conn, Metadata::new()).await.unwrap();
        assert!(recv(&mut peer).await.starts_with('0'));
        assert_eq!(recv(&mut peer).await, "40");

        drop(server);
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn welcome_then_msg_echo_and_broadcast() {
        let server = Server::new(MemoryBroker::new(), BusSettings::default())
            .await
            .unwrap();
        install(&server);

        let (conn, mut peer) = Connection::pair(32);
        let session = server.serve_connection(conn, Metadata::new()).await.unwrap();
        assert!(recv(&mut peer).await.starts_with('0'));
        assert_eq!(recv(&mut peer).await, "40");
        assert_eq!(
            recv(&mut peer).await,
            format!(r#"42["welcome","{}"]"#, session.id())
        );

        peer.send_text(r#"42["msg","hey"]"#).await.unwrap();
        assert_eq!(recv(&mut peer).await, r#"42["msg","hey"]"#);
        assert_eq!(recv(&mut peer).await, r#"42["msg","hey"]"#);
    }
}
