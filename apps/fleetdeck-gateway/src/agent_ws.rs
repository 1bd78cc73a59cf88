use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    AgentCommand, AgentMessage, AlertSeverity, DashboardEvent, MachineSnapshot, MachineStatus,
};
use crate::registry::RegisterAttrs;
use crate::router::AgentLink;
use crate::state::GatewayState;
use crate::store::TelemetrySample;

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    token: Option<String>,
}

/// The agent relay endpoint: `GET /ws/agent?token=<api key>`. The bearer
/// key is authenticated before the upgrade; missing or invalid keys get a
/// 401 and no upgrade.
pub async fn agent_ws_handler(
    State(state): State<GatewayState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.auth.authenticate_agent(&token).await {
        Ok(owner_id) => ws.on_upgrade(move |socket| handle_agent_socket(socket, state, owner_id)),
        Err(err) => {
            debug!(error = %err, "agent connection refused");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Per-connection state for one agent socket. Owned exclusively by the
/// connection task and torn down when the socket closes.
struct AgentConnection {
    connection_id: Uuid,
    owner_id: String,
    machine_id: Option<String>,
    tx: mpsc::UnboundedSender<AgentCommand>,
    last_heartbeat: Arc<RwLock<Instant>>,
}

async fn handle_agent_socket(socket: WebSocket, state: GatewayState, owner_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentCommand>();

    // Forward queued commands to the socket until the channel closes.
    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&command) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = AgentConnection {
        connection_id: Uuid::new_v4(),
        owner_id,
        machine_id: None,
        tx,
        last_heartbeat: Arc::new(RwLock::new(Instant::now())),
    };
    debug!(connection = %conn.connection_id, owner = %conn.owner_id, "agent connected");

    let mut ping = tokio::time::interval(state.heartbeat_interval);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if conn.tx.send(AgentCommand::Ping).is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(connection = %conn.connection_id, error = %err, "agent socket error");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                        Ok(parsed) => handle_agent_message(&state, &mut conn, parsed).await,
                        // Malformed or unknown envelopes are dropped; the
                        // connection stays open.
                        Err(err) => debug!(connection = %conn.connection_id, error = %err, "dropping malformed agent message"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // The select loop has ended: the ping interval is gone and no further
    // commands will be accepted before cleanup runs.
    drop(conn.tx);

    if let Some(machine_id) = conn.machine_id.take() {
        let removed = state
            .router
            .unregister_agent(&machine_id, conn.connection_id);
        // A superseded connection no longer owns the machine's liveness;
        // only the current link's close demotes it.
        if removed && state.registry.mark_offline(&machine_id).await {
            publish_machine_update(&state, &conn.owner_id, &machine_id, MachineStatus::Offline)
                .await;
        }
    }
    let _ = writer.await;
    debug!(connection = %conn.connection_id, "agent disconnected");
}

async fn handle_agent_message(state: &GatewayState, conn: &mut AgentConnection, message: AgentMessage) {
    match message {
        AgentMessage::Register {
            machine_id,
            name,
            os,
            hostname,
            version,
        } => {
            if machine_id.trim().is_empty() {
                debug!(connection = %conn.connection_id, "register with empty machine id ignored");
                return;
            }
            let accepted = state
                .registry
                .upsert_on_register(
                    &conn.owner_id,
                    &machine_id,
                    RegisterAttrs {
                        name,
                        os,
                        hostname,
                        version,
                    },
                )
                .await;
            if !accepted {
                return;
            }

            *conn.last_heartbeat.write().await = Instant::now();
            state.router.register_agent(
                &machine_id,
                AgentLink {
                    connection_id: conn.connection_id,
                    owner_id: conn.owner_id.clone(),
                    tx: conn.tx.clone(),
                    last_heartbeat: conn.last_heartbeat.clone(),
                },
            );
            info!(machine = %machine_id, owner = %conn.owner_id, "machine registered");
            conn.machine_id = Some(machine_id.clone());
            publish_machine_update(state, &conn.owner_id, &machine_id, MachineStatus::Online).await;
        }

        AgentMessage::Heartbeat {
            machine_id: claimed,
            cpu,
            memory,
            disk,
            session_count,
        } => {
            let Some(machine_id) = conn.machine_id.clone() else {
                debug!(connection = %conn.connection_id, "heartbeat before register ignored");
                return;
            };
            if claimed != machine_id {
                warn!(
                    connection = %conn.connection_id,
                    claimed = %claimed,
                    registered = %machine_id,
                    "heartbeat machine id mismatch; using registered id"
                );
            }

            *conn.last_heartbeat.write().await = Instant::now();
            state
                .registry
                .refresh_on_heartbeat(
                    &machine_id,
                    TelemetrySample {
                        machine_id: machine_id.clone(),
                        cpu,
                        memory,
                        disk,
                        session_count,
                        captured_at: Utc::now(),
                    },
                )
                .await;
            state.router.publish(
                &conn.owner_id,
                DashboardEvent::MachineUpdated {
                    machine: MachineSnapshot {
                        id: machine_id,
                        status: MachineStatus::Online,
                        cpu,
                        memory,
                    },
                },
            );
        }

        AgentMessage::SessionStarted { session } => {
            let Some(machine_id) = conn.machine_id.clone() else {
                debug!(connection = %conn.connection_id, "session_started before register ignored");
                return;
            };
            state.directory.record_started(&machine_id, &session).await;
            state
                .router
                .publish(&conn.owner_id, DashboardEvent::SessionStarted { session });
        }

        AgentMessage::SessionStopped {
            session_id,
            exit_code,
        } => {
            let Some(session_owner) = owned_session(state, conn, &session_id).await else {
                return;
            };
            if state
                .directory
                .record_stopped(&session_id, exit_code)
                .await
                .applied()
            {
                state.router.publish(
                    &session_owner,
                    DashboardEvent::SessionStopped {
                        session_id,
                        exit_code,
                    },
                );
            }
        }

        AgentMessage::SessionCrashed { session_id, error } => {
            let Some(session_owner) = owned_session(state, conn, &session_id).await else {
                return;
            };
            // Terminal transitions are applied at most once, so a replayed
            // crash can never fire a duplicate alert.
            if state
                .directory
                .record_crashed(&session_id, &error)
                .await
                .applied()
            {
                state.router.publish(
                    &session_owner,
                    DashboardEvent::SessionCrashed {
                        session_id: session_id.clone(),
                        error: error.clone(),
                    },
                );
                state.router.publish(
                    &session_owner,
                    DashboardEvent::AlertFired {
                        alert_id: Uuid::new_v4().to_string(),
                        message: format!("session {} crashed: {}", session_id, error),
                        severity: AlertSeverity::Error,
                    },
                );
            }
        }

        AgentMessage::SessionOutput { session_id, data } => {
            let Some(session_owner) = owned_session(state, conn, &session_id).await else {
                return;
            };
            if let Err(err) = state.buffer.append(&session_id, data.clone()).await {
                warn!(session = %session_id, error = %err, "failed to buffer session output");
            }
            state
                .router
                .publish(&session_owner, DashboardEvent::SessionOutput { session_id, data });
        }
    }
}

/// Resolve a session through the directory and return its owner, but only
/// when the session belongs to this connection's registered machine. The
/// agent's claimed owner is never trusted for routing output or alerts.
async fn owned_session(
    state: &GatewayState,
    conn: &AgentConnection,
    session_id: &str,
) -> Option<String> {
    let Some(machine_id) = conn.machine_id.as_deref() else {
        debug!(connection = %conn.connection_id, "session message before register ignored");
        return None;
    };
    let Some((session_machine, session_owner)) = state.directory.resolve_owner(session_id).await
    else {
        debug!(session = %session_id, "message for unknown session dropped");
        return None;
    };
    if session_machine != machine_id {
        warn!(
            session = %session_id,
            machine = %machine_id,
            "session message from a machine that does not own it dropped"
        );
        return None;
    }
    Some(session_owner)
}

async fn publish_machine_update(
    state: &GatewayState,
    owner_id: &str,
    machine_id: &str,
    status: MachineStatus,
) {
    let telemetry = state.registry.last_telemetry(machine_id).await;
    state.router.publish(
        owner_id,
        DashboardEvent::MachineUpdated {
            machine: MachineSnapshot {
                id: machine_id.to_string(),
                status,
                cpu: telemetry.as_ref().map(|t| t.cpu).unwrap_or(0.0),
                memory: telemetry.as_ref().map(|t| t.memory).unwrap_or(0.0),
            },
        },
    );
}
