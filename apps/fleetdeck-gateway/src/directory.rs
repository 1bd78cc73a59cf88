use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::metrics;
use crate::protocol::SessionSpawn;
use crate::store::{RelayStore, SessionRecord, SessionStatus, TransitionOutcome};

/// Owns the session running/stopped/crashed state machine and resolves a
/// session to its owning machine and user. Transitions are monotonic:
/// running may move to stopped or crashed; both are terminal and absorb
/// repeats without side effects.
#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<dyn RelayStore>,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Record a session the agent just spawned. Best-effort like every
    /// registry write.
    pub async fn record_started(&self, machine_id: &str, spawn: &SessionSpawn) {
        let record = SessionRecord {
            id: spawn.id.clone(),
            machine_id: machine_id.to_string(),
            process_name: spawn.process_name.clone(),
            workdir: spawn.workdir.clone(),
            pid: spawn.pid,
            status: SessionStatus::Running,
            started_at: spawn.started_at,
            stopped_at: None,
            exit_code: None,
            error: None,
        };
        if let Err(err) = self.store.put_session(record).await {
            metrics::STORE_ERRORS.with_label_values(&["session"]).inc();
            warn!(session = %spawn.id, error = %err, "failed to persist session start");
        }
    }

    pub async fn record_stopped(&self, session_id: &str, exit_code: Option<i32>) -> TransitionOutcome {
        self.finish(session_id, SessionStatus::Stopped, exit_code, None)
            .await
    }

    pub async fn record_crashed(&self, session_id: &str, error: &str) -> TransitionOutcome {
        self.finish(
            session_id,
            SessionStatus::Crashed,
            None,
            Some(error.to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> TransitionOutcome {
        match self
            .store
            .finish_session(session_id, status, Utc::now(), exit_code, error)
            .await
        {
            Ok(outcome) => {
                if outcome == TransitionOutcome::NotFound {
                    debug!(session = %session_id, "terminal transition for unknown session ignored");
                }
                outcome
            }
            Err(err) => {
                metrics::STORE_ERRORS.with_label_values(&["session"]).inc();
                warn!(session = %session_id, error = %err, "failed to persist session transition");
                TransitionOutcome::NotFound
            }
        }
    }

    /// Resolve a session to `(machine_id, owner_id)` through the machine
    /// record, never trusting a peer's claimed owner. Used to route output
    /// and to gate dashboard-issued session commands.
    pub async fn resolve_owner(&self, session_id: &str) -> Option<(String, String)> {
        let session = match self.store.get_session(session_id).await {
            Ok(session) => session?,
            Err(err) => {
                warn!(session = %session_id, error = %err, "session lookup failed");
                return None;
            }
        };
        let machine = match self.store.get_machine(&session.machine_id).await {
            Ok(machine) => machine?,
            Err(err) => {
                warn!(machine = %session.machine_id, error = %err, "machine lookup failed");
                return None;
            }
        };
        Some((machine.id, machine.owner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MachineStatus, OsKind};
    use crate::store::{MachineRecord, MemoryStore};

    fn spawn(id: &str) -> SessionSpawn {
        SessionSpawn {
            id: id.to_string(),
            pid: 4242,
            process_name: "cargo".into(),
            workdir: "/home/dev/project".into(),
            started_at: Utc::now(),
        }
    }

    async fn directory_with_machine() -> (SessionDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .put_machine(MachineRecord {
                id: "m1".into(),
                owner_id: "u1".into(),
                name: "box".into(),
                os: OsKind::Linux,
                hostname: "box.local".into(),
                version: "1.0.0".into(),
                status: MachineStatus::Online,
                last_seen: Utc::now(),
            })
            .await
            .unwrap();
        (SessionDirectory::new(store.clone()), store)
    }

    #[tokio::test]
    async fn stop_applies_once_then_absorbs() {
        let (directory, _store) = directory_with_machine().await;
        directory.record_started("m1", &spawn("s1")).await;

        assert_eq!(
            directory.record_stopped("s1", Some(0)).await,
            TransitionOutcome::Applied
        );
        assert_eq!(
            directory.record_stopped("s1", Some(0)).await,
            TransitionOutcome::AlreadyTerminal
        );
        // A crash after a stop is also absorbed: terminal is terminal.
        assert_eq!(
            directory.record_crashed("s1", "late crash").await,
            TransitionOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn crash_records_error_text() {
        let (directory, store) = directory_with_machine().await;
        directory.record_started("m1", &spawn("s1")).await;

        assert_eq!(
            directory.record_crashed("s1", "segfault").await,
            TransitionOutcome::Applied
        );
        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Crashed);
        assert_eq!(record.error.as_deref(), Some("segfault"));
    }

    #[tokio::test]
    async fn unknown_sessions_are_ignored() {
        let (directory, _store) = directory_with_machine().await;
        assert_eq!(
            directory.record_stopped("s-ghost", None).await,
            TransitionOutcome::NotFound
        );
        assert!(directory.resolve_owner("s-ghost").await.is_none());
    }

    #[tokio::test]
    async fn resolve_owner_goes_through_the_machine_record() {
        let (directory, _store) = directory_with_machine().await;
        directory.record_started("m1", &spawn("s1")).await;

        let (machine_id, owner_id) = directory.resolve_owner("s1").await.unwrap();
        assert_eq!(machine_id, "m1");
        assert_eq!(owner_id, "u1");
    }
}
