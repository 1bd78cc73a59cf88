use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::metrics;
use crate::protocol::{MachineStatus, OsKind};
use crate::store::{MachineRecord, RelayStore, TelemetrySample};

/// Attributes carried by an agent's `register` message.
#[derive(Debug, Clone)]
pub struct RegisterAttrs {
    pub name: String,
    pub os: OsKind,
    pub hostname: String,
    pub version: String,
}

/// Owns the machine online/offline state machine. All mutations are
/// best-effort relative to connection liveness: the socket is the source of
/// truth for reachability, the durable record a trailing projection, so a
/// failed write is logged and never terminates a connection.
#[derive(Clone)]
pub struct MachineRegistry {
    store: Arc<dyn RelayStore>,
    telemetry_ttl: Duration,
}

impl MachineRegistry {
    pub fn new(store: Arc<dyn RelayStore>, telemetry_ttl: Duration) -> Self {
        Self {
            store,
            telemetry_ttl,
        }
    }

    /// Idempotent create-or-update on `register`: forces status online and
    /// refreshes last-seen. Safe to replay with the same machine id.
    /// Returns false only on a confirmed owner mismatch: a machine id
    /// cannot be re-registered under a different owner.
    pub async fn upsert_on_register(
        &self,
        owner_id: &str,
        machine_id: &str,
        attrs: RegisterAttrs,
    ) -> bool {
        match self.store.get_machine(machine_id).await {
            Ok(Some(existing)) if existing.owner_id != owner_id => {
                warn!(
                    machine = %machine_id,
                    "register rejected: machine belongs to another owner"
                );
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                // Can't verify ownership, but liveness wins; proceed.
                warn!(machine = %machine_id, error = %err, "machine lookup failed during register");
            }
        }

        let record = MachineRecord {
            id: machine_id.to_string(),
            owner_id: owner_id.to_string(),
            name: attrs.name,
            os: attrs.os,
            hostname: attrs.hostname,
            version: attrs.version,
            status: MachineStatus::Online,
            last_seen: Utc::now(),
        };
        if let Err(err) = self.store.put_machine(record).await {
            metrics::STORE_ERRORS.with_label_values(&["machine"]).inc();
            warn!(machine = %machine_id, error = %err, "failed to persist machine registration");
        }
        true
    }

    /// Refreshes last-seen, forces status online, and overwrites the
    /// short-TTL telemetry cache entry.
    pub async fn refresh_on_heartbeat(&self, machine_id: &str, sample: TelemetrySample) {
        if let Err(err) = self
            .store
            .set_machine_status(machine_id, MachineStatus::Online, Utc::now())
            .await
        {
            metrics::STORE_ERRORS.with_label_values(&["machine"]).inc();
            warn!(machine = %machine_id, error = %err, "failed to refresh machine liveness");
        }
        if let Err(err) = self.store.put_telemetry(sample, self.telemetry_ttl).await {
            metrics::STORE_ERRORS.with_label_values(&["telemetry"]).inc();
            warn!(machine = %machine_id, error = %err, "failed to cache telemetry sample");
        }
    }

    /// Owner of a machine record, if one exists. Used to gate
    /// dashboard-issued machine commands.
    pub async fn machine_owner(&self, machine_id: &str) -> Option<String> {
        match self.store.get_machine(machine_id).await {
            Ok(machine) => machine.map(|m| m.owner_id),
            Err(err) => {
                warn!(machine = %machine_id, error = %err, "machine lookup failed");
                None
            }
        }
    }

    /// Last cached telemetry figures for a machine, if the cache entry has
    /// not expired. Used to fill `machine_updated` snapshots.
    pub async fn last_telemetry(&self, machine_id: &str) -> Option<TelemetrySample> {
        self.store.get_telemetry(machine_id).await.ok().flatten()
    }

    /// Demote a machine to offline. Idempotent: returns true only when the
    /// status actually changed, so the close handler and the watchdog
    /// converge on a single offline transition. A failed write returns
    /// false and is retried by the watchdog's next scan.
    pub async fn mark_offline(&self, machine_id: &str) -> bool {
        match self
            .store
            .set_machine_status(machine_id, MachineStatus::Offline, Utc::now())
            .await
        {
            Ok(changed) => changed,
            Err(err) => {
                metrics::STORE_ERRORS.with_label_values(&["machine"]).inc();
                warn!(machine = %machine_id, error = %err, "failed to mark machine offline");
                false
            }
        }
    }
}
