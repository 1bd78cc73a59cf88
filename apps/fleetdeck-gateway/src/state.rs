use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::buffer::OutputBuffer;
use crate::config::Config;
use crate::directory::SessionDirectory;
use crate::registry::MachineRegistry;
use crate::router::MessageRouter;
use crate::store::RelayStore;

/// Shared handles for the relay endpoints. Everything is constructed in
/// `main` and injected here; components never reach for globals.
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<MessageRouter>,
    pub registry: MachineRegistry,
    pub directory: SessionDirectory,
    pub auth: Authenticator,
    pub buffer: Arc<dyn OutputBuffer>,
    pub heartbeat_interval: Duration,
    pub output_max_lines: usize,
}

impl GatewayState {
    pub fn new(cfg: &Config, store: Arc<dyn RelayStore>, buffer: Arc<dyn OutputBuffer>) -> Self {
        // Telemetry entries outlive two heartbeats at most; they are a
        // cache, not a liveness source.
        let telemetry_ttl = cfg.heartbeat_interval * 2;
        Self {
            router: Arc::new(MessageRouter::new()),
            registry: MachineRegistry::new(store.clone(), telemetry_ttl),
            directory: SessionDirectory::new(store.clone()),
            auth: Authenticator::new(store, &cfg.session_secret),
            buffer,
            heartbeat_interval: cfg.heartbeat_interval,
            output_max_lines: cfg.output_max_lines,
        }
    }
}
