use std::path::Path;
use axum::{
    extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::services::{ServeDir, ServeFile};

use crate::commands::ClientCommand;
use crate::device::{BridgeState, LinkStatus};
use crate::session::Session;

/// Health report: link status plus how many clients are attached
#[derive(Debug, Serialize)]
pub struct Health {
    #[serde(flatten)]
    pub link: LinkStatus,
    pub clients: usize,
}

/// Routes for the bridge. `build_dir` holds the compiled web UI.
pub fn router(state: BridgeState, build_dir: &Path) -> Router {
    let index = build_dir.join("index.html");

    Router::new()
        .route("/defaults", get(defaults_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route_service("/", ServeFile::new(&index))
        .route_service("/plot", ServeFile::new(&index))
        .fallback_service(ServeDir::new(build_dir))
        .with_state(state)
}

async fn defaults_handler(State(state): State<BridgeState>) -> Response {
    match state.defaults() {
        Some(defaults) => Json(defaults).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Device not connected").into_response(),
    }
}

async fn health_handler(State(state): State<BridgeState>) -> Json<Health> {
    let clients = state.registry().client_count().await;
    Json(Health {
        link: state.status(),
        clients,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> Response {
    if !state.is_available() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Device not connected").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Register a session for a new socket. The device may have gone away
/// since the upgrade was accepted, and a session registered after the
/// registry was cleared would never be closed, so check again.
pub(crate) async fn attach_session(state: &BridgeState) -> Option<Session> {
    let session = state.registry().register().await;
    if state.is_available() {
        return Some(session);
    }
    state.registry().unregister(&session.id).await;
    None
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let registry = state.registry().clone();
    let Some(session) = attach_session(&state).await else {
        log::info!("Device went away during upgrade, closing socket");
        return;
    };
    let session_id = session.id;
    let mut outbound = session.outbound;
    let (mut sender, mut receiver) = socket.split();

    // Registry -> client. The queue ends when the registry drops the session.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sender.send(Message::Text(message.to_text().into())).await.is_err() {
                return;
            }
        }
        let close = CloseFrame {
            code: close_code::AWAY,
            reason: "device disconnected".into(),
        };
        let _ = sender.send(Message::Close(Some(close))).await;
    });

    // Client -> coordinator
    let submit_registry = registry.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("WebSocket error on session {}: {}", session_id, e);
                    break;
                }
            };

            match ClientCommand::parse(text.as_str()) {
                Ok(command) => {
                    log::debug!("Session {} sent {}", session_id, command.action());
                    if !submit_registry.submit(command).await {
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring frame from session {}: {}", session_id, e),
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    registry.unregister(&session_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::device::{Coordinator, CoordinatorConfig};
    use crate::serial::{EmulatorConnector, EmulatorHandle};
    use crate::session::SessionRegistry;

    #[tokio::test]
    async fn test_attach_refused_while_device_unavailable() {
        let connector = Arc::new(EmulatorConnector::new(EmulatorHandle::new(2), Duration::from_millis(20)));
        let (_coordinator, state) =
            Coordinator::new(connector, Arc::new(SessionRegistry::new()), CoordinatorConfig::default());

        assert!(attach_session(&state).await.is_none());
        assert!(!state.registry().has_clients().await);
    }
}
