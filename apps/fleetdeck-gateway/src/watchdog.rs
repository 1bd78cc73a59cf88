use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::protocol::{DashboardEvent, MachineSnapshot, MachineStatus};
use crate::registry::MachineRegistry;
use crate::router::MessageRouter;

/// Bound on a single per-machine demotion so a wedged store write can never
/// stall the scan loop.
const MARK_OFFLINE_TIMEOUT: Duration = Duration::from_secs(5);

/// One periodic scanner per process: demotes machines whose live connection
/// has gone quiet for longer than the timeout window. Deliberately
/// decoupled from socket close: a machine can go offline while its socket
/// is technically still open, and a clean close marks offline immediately
/// regardless of scan timing. Both paths converge on the registry's
/// idempotent `mark_offline`.
pub struct Watchdog {
    router: Arc<MessageRouter>,
    registry: MachineRegistry,
    interval: Duration,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(
        router: Arc<MessageRouter>,
        registry: MachineRegistry,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            registry,
            interval,
            timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        })
    }

    async fn scan(&self) {
        // Clone links out of the map first; heartbeat locks are checked
        // without holding any map guard across an await.
        let links = self.router.agents_snapshot();

        let mut stale = Vec::new();
        for (machine_id, link) in links {
            let last_heartbeat = *link.last_heartbeat.read().await;
            if last_heartbeat.elapsed() > self.timeout {
                stale.push((machine_id, link.owner_id));
            }
        }

        for (machine_id, owner_id) in stale {
            match tokio::time::timeout(MARK_OFFLINE_TIMEOUT, self.registry.mark_offline(&machine_id))
                .await
            {
                Ok(true) => {
                    info!(machine = %machine_id, "heartbeat timeout; machine marked offline");
                    let telemetry = self.registry.last_telemetry(&machine_id).await;
                    self.router.publish(
                        &owner_id,
                        DashboardEvent::MachineUpdated {
                            machine: MachineSnapshot {
                                id: machine_id,
                                status: MachineStatus::Offline,
                                cpu: telemetry.as_ref().map(|t| t.cpu).unwrap_or(0.0),
                                memory: telemetry.as_ref().map(|t| t.memory).unwrap_or(0.0),
                            },
                        },
                    );
                }
                Ok(false) => {}
                Err(_) => {
                    // Retried on the next tick.
                    warn!(machine = %machine_id, "mark_offline timed out; will retry next scan");
                }
            }
        }
    }
}
