use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{Config, StoreBackend};
use crate::protocol::{MachineStatus, OsKind};
use crate::store_redis::RedisStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub os: OsKind,
    pub hostname: String,
    pub version: String,
    pub status: MachineStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Crashed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Crashed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub machine_id: String,
    pub process_name: String,
    pub workdir: String,
    pub pid: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Last telemetry figures reported by a heartbeat. Cache-only; the machine
/// status never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub machine_id: String,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub session_count: u32,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub owner_id: String,
    pub label: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Outcome of applying a terminal transition to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    AlreadyTerminal,
    NotFound,
}

impl TransitionOutcome {
    pub fn applied(self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Durable records the relay touches: machines, sessions, API keys, and the
/// short-TTL telemetry cache. The wider application schema stays outside
/// the gateway.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn put_machine(&self, record: MachineRecord) -> Result<(), StoreError>;
    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRecord>, StoreError>;
    /// Conditionally moves a machine to `status`, refreshing last-seen.
    /// Returns whether the status actually changed.
    async fn set_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn put_session(&self, record: SessionRecord) -> Result<(), StoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    /// Applies a terminal transition. Repeats against an already-terminal
    /// session report `AlreadyTerminal` and leave the record untouched.
    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        stopped_at: DateTime<Utc>,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn put_telemetry(&self, sample: TelemetrySample, ttl: Duration)
        -> Result<(), StoreError>;
    async fn get_telemetry(&self, machine_id: &str)
        -> Result<Option<TelemetrySample>, StoreError>;

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
    async fn put_api_key(&self, record: ApiKeyRecord) -> Result<(), StoreError>;
    async fn touch_api_key(&self, key_hash: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

pub async fn build_store(cfg: &Config) -> Arc<dyn RelayStore> {
    match cfg.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => match RedisStore::connect(&cfg.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, "failed to connect redis store; falling back to memory");
                Arc::new(MemoryStore::new())
            }
        },
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<String, MachineRecord>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    telemetry: Mutex<HashMap<String, (TelemetrySample, DateTime<Utc>)>>,
    api_keys: Mutex<HashMap<String, ApiKeyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn put_machine(&self, record: MachineRecord) -> Result<(), StoreError> {
        self.machines.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRecord>, StoreError> {
        Ok(self.machines.lock().await.get(machine_id).cloned())
    }

    async fn set_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut machines = self.machines.lock().await;
        match machines.get_mut(machine_id) {
            Some(machine) => {
                let changed = machine.status != status;
                machine.status = status;
                machine.last_seen = last_seen;
                Ok(changed)
            }
            None => Ok(false),
        }
    }

    async fn put_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.sessions.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        stopped_at: DateTime<Utc>,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.status.is_terminal() => Ok(TransitionOutcome::AlreadyTerminal),
            Some(session) => {
                session.status = status;
                session.stopped_at = Some(stopped_at);
                session.exit_code = exit_code;
                session.error = error;
                Ok(TransitionOutcome::Applied)
            }
            None => Ok(TransitionOutcome::NotFound),
        }
    }

    async fn put_telemetry(
        &self,
        sample: TelemetrySample,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = sample.captured_at + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.telemetry
            .lock()
            .await
            .insert(sample.machine_id.clone(), (sample, expires_at));
        Ok(())
    }

    async fn get_telemetry(
        &self,
        machine_id: &str,
    ) -> Result<Option<TelemetrySample>, StoreError> {
        let telemetry = self.telemetry.lock().await;
        Ok(telemetry.get(machine_id).and_then(|(sample, expires_at)| {
            if *expires_at > Utc::now() {
                Some(sample.clone())
            } else {
                None
            }
        }))
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.api_keys.lock().await.get(key_hash).cloned())
    }

    async fn put_api_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        self.api_keys
            .lock()
            .await
            .insert(record.key_hash.clone(), record);
        Ok(())
    }

    async fn touch_api_key(&self, key_hash: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(record) = self.api_keys.lock().await.get_mut(key_hash) {
            record.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(id: &str) -> MachineRecord {
        MachineRecord {
            id: id.to_string(),
            owner_id: "u1".to_string(),
            name: "box".to_string(),
            os: OsKind::Linux,
            hostname: "box.local".to_string(),
            version: "1.0.0".to_string(),
            status: MachineStatus::Online,
            last_seen: Utc::now(),
        }
    }

    fn running_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            machine_id: "m1".to_string(),
            process_name: "bash".to_string(),
            workdir: "/home/dev".to_string(),
            pid: 4242,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            stopped_at: None,
            exit_code: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn status_change_reports_whether_it_changed() {
        let store = MemoryStore::new();
        store.put_machine(machine("m1")).await.unwrap();

        let changed = store
            .set_machine_status("m1", MachineStatus::Offline, Utc::now())
            .await
            .unwrap();
        assert!(changed);

        let changed = store
            .set_machine_status("m1", MachineStatus::Offline, Utc::now())
            .await
            .unwrap();
        assert!(!changed, "second offline transition must be a no-op");
    }

    #[tokio::test]
    async fn terminal_sessions_absorb_repeat_transitions() {
        let store = MemoryStore::new();
        store.put_session(running_session("s1")).await.unwrap();

        let first = store
            .finish_session("s1", SessionStatus::Stopped, Utc::now(), Some(0), None)
            .await
            .unwrap();
        assert_eq!(first, TransitionOutcome::Applied);
        let stopped_at = store.get_session("s1").await.unwrap().unwrap().stopped_at;

        let second = store
            .finish_session("s1", SessionStatus::Crashed, Utc::now(), None, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(second, TransitionOutcome::AlreadyTerminal);

        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Stopped);
        assert_eq!(record.stopped_at, stopped_at, "terminal timestamp must not move");
    }

    #[tokio::test]
    async fn expired_api_keys_are_unusable() {
        let now = Utc::now();
        let expired = ApiKeyRecord {
            key_hash: "h".into(),
            owner_id: "u1".into(),
            label: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            revoked: false,
            last_used_at: None,
        };
        assert!(!expired.is_usable(now));

        let revoked = ApiKeyRecord {
            revoked: true,
            expires_at: None,
            ..expired.clone()
        };
        assert!(!revoked.is_usable(now));
    }
}
