use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics;
use crate::protocol::{AgentCommand, DashboardEvent};

/// Fan-out capacity per owner. Slow dashboards observe `Lagged` (the oldest
/// events are dropped); producers never block.
const OWNER_CHANNEL_CAPACITY: usize = 256;

/// The one live relay link for a registered machine. Owned by the agent
/// connection task that created it; superseded wholesale on re-register.
#[derive(Clone)]
pub struct AgentLink {
    pub connection_id: Uuid,
    pub owner_id: String,
    pub tx: mpsc::UnboundedSender<AgentCommand>,
    pub last_heartbeat: Arc<RwLock<Instant>>,
}

/// Routes agent-originated events to every dashboard connection of the
/// machine's owner, and dashboard-originated commands to the one live agent
/// connection for the addressed machine.
pub struct MessageRouter {
    dashboards: DashMap<String, broadcast::Sender<DashboardEvent>>,
    agents: DashMap<String, AgentLink>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            dashboards: DashMap::new(),
            agents: DashMap::new(),
        }
    }

    /// Subscribe a dashboard connection to its owner's event channel.
    /// Subscriptions start at "now"; there is no replay.
    pub fn subscribe(&self, owner_id: &str) -> broadcast::Receiver<DashboardEvent> {
        self.dashboards
            .entry(owner_id.to_string())
            .or_insert_with(|| broadcast::channel(OWNER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to every live dashboard subscription of an owner.
    pub fn publish(&self, owner_id: &str, event: DashboardEvent) {
        metrics::EVENTS_PUBLISHED
            .with_label_values(&[event_kind(&event)])
            .inc();
        if let Some(tx) = self.dashboards.get(owner_id) {
            // Send fails only when no receiver is subscribed.
            let _ = tx.send(event);
        }
    }

    /// Register the live connection for a machine. A reconnect supersedes
    /// the previous link (last-writer-wins); the old socket is not closed
    /// and is left to time out or close on its own.
    pub fn register_agent(&self, machine_id: &str, link: AgentLink) {
        if let Some(previous) = self.agents.insert(machine_id.to_string(), link) {
            info!(
                machine = %machine_id,
                superseded = %previous.connection_id,
                "agent reconnected; previous link superseded"
            );
        }
    }

    /// Remove a machine's link, but only if it still belongs to the closing
    /// connection. Returns whether a link was removed; a superseded
    /// connection's close is a no-op here.
    pub fn unregister_agent(&self, machine_id: &str, connection_id: Uuid) -> bool {
        self.agents
            .remove_if(machine_id, |_, link| link.connection_id == connection_id)
            .is_some()
    }

    /// Relay a command to the addressed machine's live agent connection.
    /// With no live connection the command is dropped (at-most-once).
    pub fn send_command(&self, machine_id: &str, command: AgentCommand) -> bool {
        let delivered = self
            .agents
            .get(machine_id)
            .map(|link| link.tx.send(command).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(machine = %machine_id, "no live agent connection; command dropped");
        }
        metrics::COMMANDS_RELAYED
            .with_label_values(&[if delivered { "delivered" } else { "dropped" }])
            .inc();
        delivered
    }

    pub fn agent_link(&self, machine_id: &str) -> Option<AgentLink> {
        self.agents.get(machine_id).map(|link| link.clone())
    }

    /// Snapshot of the live links for the watchdog scan. Links are cloned
    /// out so no map guard is held across an await.
    pub fn agents_snapshot(&self) -> Vec<(String, AgentLink)> {
        self.agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn event_kind(event: &DashboardEvent) -> &'static str {
    match event {
        DashboardEvent::MachineUpdated { .. } => "machine_updated",
        DashboardEvent::SessionStarted { .. } => "session_started",
        DashboardEvent::SessionStopped { .. } => "session_stopped",
        DashboardEvent::SessionCrashed { .. } => "session_crashed",
        DashboardEvent::SessionOutput { .. } => "session_output",
        DashboardEvent::AlertFired { .. } => "alert_fired",
    }
}
