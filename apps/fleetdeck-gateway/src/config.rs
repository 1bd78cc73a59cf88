use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Cookie carrying the dashboard session token.
pub const SESSION_COOKIE: &str = "fleetdeck_session";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub heartbeat_interval: Duration,
    pub agent_timeout_multiplier: u32,
    pub output_max_lines: usize,
    pub output_ttl: Duration,
    pub redis_url: String,
    pub store_backend: StoreBackend,
    pub session_secret: String,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port: u16 = env::var("FLEETDECK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("valid addr");
        let upstream_host =
            env::var("FLEETDECK_UPSTREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let upstream_port = env::var("FLEETDECK_UPSTREAM_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let heartbeat_interval = Duration::from_secs(
            env::var("FLEETDECK_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );
        let agent_timeout_multiplier = env::var("FLEETDECK_AGENT_TIMEOUT_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let output_max_lines = env::var("FLEETDECK_OUTPUT_MAX_LINES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000);
        let output_ttl = Duration::from_secs(
            env::var("FLEETDECK_OUTPUT_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(604_800), // 7 days
        );
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store_backend = StoreBackend::from_env();
        let session_secret = env::var("FLEETDECK_SESSION_SECRET")
            .unwrap_or_else(|_| "fleetdeck-dev-secret".to_string());
        let log_filter =
            env::var("RUST_LOG").unwrap_or_else(|_| "info,fleetdeck_gateway=debug".into());

        Self {
            bind_addr,
            upstream_host,
            upstream_port,
            heartbeat_interval,
            agent_timeout_multiplier,
            output_max_lines,
            output_ttl,
            redis_url,
            store_backend,
            session_secret,
            log_filter,
        }
    }

    /// How long a machine may go without a heartbeat before the watchdog
    /// demotes it.
    pub fn agent_timeout(&self) -> Duration {
        self.heartbeat_interval * self.agent_timeout_multiplier
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid addr"),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 3000,
            heartbeat_interval: Duration::from_secs(30),
            agent_timeout_multiplier: 3,
            output_max_lines: 2000,
            output_ttl: Duration::from_secs(604_800),
            redis_url: "redis://localhost:6379".to_string(),
            store_backend: StoreBackend::Memory,
            session_secret: "fleetdeck-dev-secret".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl StoreBackend {
    fn from_env() -> Self {
        match env::var("FLEETDECK_STORE_BACKEND")
            .unwrap_or_else(|_| "redis".into())
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_a_multiple_of_the_heartbeat() {
        let cfg = Config::default();
        assert_eq!(cfg.agent_timeout(), Duration::from_secs(90));
    }
}
