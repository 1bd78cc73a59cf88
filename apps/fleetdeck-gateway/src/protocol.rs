use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating systems an agent may report at registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Windows,
    Macos,
    Linux,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

/// A session as announced by an agent in `session_started`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpawn {
    pub id: String,
    pub pid: u32,
    pub process_name: String,
    pub workdir: String,
    pub started_at: DateTime<Utc>,
}

/// Messages sent from an agent to the gateway.
///
/// Payloads in `session_output` are base64-encoded raw bytes; the gateway
/// treats them as opaque and never decodes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        machine_id: String,
        name: String,
        os: OsKind,
        hostname: String,
        version: String,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        machine_id: String,
        cpu: f64,
        memory: f64,
        disk: f64,
        session_count: u32,
    },
    SessionStarted {
        session: SessionSpawn,
    },
    #[serde(rename_all = "camelCase")]
    SessionStopped {
        session_id: String,
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    SessionCrashed {
        session_id: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionOutput {
        session_id: String,
        data: String,
    },
}

/// Commands delivered from the gateway to an agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Ping,
    #[serde(rename_all = "camelCase")]
    StartSession {
        request_id: String,
        command: String,
        workdir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },
    #[serde(rename_all = "camelCase")]
    StopSession {
        session_id: String,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename_all = "camelCase")]
    PauseSession {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeSession {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionInput {
        session_id: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

/// Compact machine view carried by `machine_updated` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSnapshot {
    pub id: String,
    pub status: MachineStatus,
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

/// Events fanned out to every dashboard connection of an owner.
///
/// Session events mirror the agent-side shapes so dashboards can consume
/// them without translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    MachineUpdated {
        machine: MachineSnapshot,
    },
    SessionStarted {
        session: SessionSpawn,
    },
    #[serde(rename_all = "camelCase")]
    SessionStopped {
        session_id: String,
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    SessionCrashed {
        session_id: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionOutput {
        session_id: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    AlertFired {
        alert_id: String,
        message: String,
        severity: AlertSeverity,
    },
}

/// Commands a dashboard sends to the gateway for relay to an agent.
///
/// `start_session` is addressed by machine; the session-scoped commands are
/// resolved to their machine through the session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardCommand {
    #[serde(rename_all = "camelCase")]
    StartSession {
        machine_id: String,
        request_id: String,
        command: String,
        workdir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },
    #[serde(rename_all = "camelCase")]
    StopSession {
        session_id: String,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename_all = "camelCase")]
    PauseSession {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeSession {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionInput {
        session_id: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    FetchHistory {
        session_id: String,
        #[serde(default)]
        offset: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}
