use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::SESSION_COOKIE;
use crate::protocol::{AgentCommand, DashboardCommand, DashboardEvent};
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    #[serde(default)]
    token: Option<String>,
}

/// The dashboard relay endpoint: `GET /ws/dashboard`. Authenticated by the
/// session cookie the web application issues (query token accepted for
/// non-browser clients); 401 before upgrade otherwise.
pub async fn dashboard_ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = session_token(&headers, query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.auth.authenticate_dashboard(&token) {
        Ok(user_id) => ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state, user_id)),
        Err(err) => {
            debug!(error = %err, "dashboard connection refused");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

fn session_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(cookie_value)
        .or(query_token)
}

fn cookie_value(cookies: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

async fn handle_dashboard_socket(socket: WebSocket, state: GatewayState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Subscription starts at "now": no replay of older events. History for
    // session output is available on request from the ring buffer.
    let mut events = state.router.subscribe(&user_id);
    // Direct channel for replies that belong to this connection only
    // (history backfill), not to every dashboard of the owner.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<DashboardEvent>();

    debug!(user = %user_id, "dashboard connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if forward(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Drop-oldest: a slow dashboard loses events, the
                    // producers never block.
                    warn!(user = %user_id, skipped, "dashboard lagging; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = reply_rx.recv() => match reply {
                Some(event) => {
                    if forward(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(user = %user_id, error = %err, "dashboard socket error");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<DashboardCommand>(&text) {
                        Ok(command) => handle_dashboard_command(&state, &user_id, command, &reply_tx).await,
                        Err(err) => debug!(user = %user_id, error = %err, "dropping malformed dashboard command"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    debug!(user = %user_id, "dashboard disconnected");
}

async fn forward<S>(sender: &mut S, event: &DashboardEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let Ok(json) = serde_json::to_string(event) else {
        return Ok(());
    };
    sender.send(Message::Text(json)).await.map_err(|_| ())
}

/// Relay a dashboard command to the addressed agent connection. Commands
/// for machines the user does not own, or with no live agent, are silently
/// dropped; no error is propagated to the dashboard.
async fn handle_dashboard_command(
    state: &GatewayState,
    user_id: &str,
    command: DashboardCommand,
    reply_tx: &mpsc::UnboundedSender<DashboardEvent>,
) {
    match command {
        DashboardCommand::StartSession {
            machine_id,
            request_id,
            command,
            workdir,
            env,
        } => {
            if state.registry.machine_owner(&machine_id).await.as_deref() != Some(user_id) {
                debug!(user = %user_id, machine = %machine_id, "start_session for foreign machine dropped");
                return;
            }
            state.router.send_command(
                &machine_id,
                AgentCommand::StartSession {
                    request_id,
                    command,
                    workdir,
                    env,
                },
            );
        }

        DashboardCommand::StopSession { session_id, force } => {
            let target = session_id.clone();
            let command = AgentCommand::StopSession { session_id, force };
            relay_session_command(state, user_id, &target, command).await;
        }
        DashboardCommand::PauseSession { session_id } => {
            let target = session_id.clone();
            let command = AgentCommand::PauseSession { session_id };
            relay_session_command(state, user_id, &target, command).await;
        }
        DashboardCommand::ResumeSession { session_id } => {
            let target = session_id.clone();
            let command = AgentCommand::ResumeSession { session_id };
            relay_session_command(state, user_id, &target, command).await;
        }
        DashboardCommand::SessionInput { session_id, data } => {
            let target = session_id.clone();
            let command = AgentCommand::SessionInput { session_id, data };
            relay_session_command(state, user_id, &target, command).await;
        }
        DashboardCommand::Resize {
            session_id,
            cols,
            rows,
        } => {
            let target = session_id.clone();
            let command = AgentCommand::Resize {
                session_id,
                cols,
                rows,
            };
            relay_session_command(state, user_id, &target, command).await;
        }

        DashboardCommand::FetchHistory {
            session_id,
            offset,
            limit,
        } => {
            let Some((_, owner_id)) = state.directory.resolve_owner(&session_id).await else {
                debug!(session = %session_id, "history for unknown session dropped");
                return;
            };
            if owner_id != user_id {
                debug!(user = %user_id, session = %session_id, "history for foreign session dropped");
                return;
            }
            let limit = limit
                .unwrap_or(state.output_max_lines)
                .min(state.output_max_lines);
            match state
                .buffer
                .read(&session_id, offset.unwrap_or(0), limit)
                .await
            {
                Ok(chunks) => {
                    for data in chunks {
                        let _ = reply_tx.send(DashboardEvent::SessionOutput {
                            session_id: session_id.clone(),
                            data,
                        });
                    }
                }
                Err(err) => warn!(session = %session_id, error = %err, "history read failed"),
            }
        }
    }
}

/// Session-addressed commands resolve their machine through the directory
/// and are dropped unless the session belongs to the requesting user.
async fn relay_session_command(
    state: &GatewayState,
    user_id: &str,
    session_id: &str,
    command: AgentCommand,
) {
    let Some((machine_id, owner_id)) = state.directory.resolve_owner(session_id).await else {
        debug!(session = %session_id, "command for unknown session dropped");
        return;
    };
    if owner_id != user_id {
        debug!(user = %user_id, session = %session_id, "command for foreign session dropped");
        return;
    }
    state.router.send_command(&machine_id, command);
}
