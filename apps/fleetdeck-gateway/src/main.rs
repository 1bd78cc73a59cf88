use clap::Parser;
use fleetdeck_gateway::cli::{Cli, Commands};
use fleetdeck_gateway::config::Config;
use fleetdeck_gateway::metrics;
use fleetdeck_gateway::proxy::ProxyState;
use fleetdeck_gateway::state::GatewayState;
use fleetdeck_gateway::watchdog::Watchdog;
use fleetdeck_gateway::{buffer, cli, store, telemetry};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cfg = Config::from_env();
    telemetry::init_tracing(&cfg.log_filter);

    let args = Cli::parse();
    if let Some(Commands::Tail {
        url,
        token,
        user,
        history,
    }) = args.command
    {
        if let Err(err) = cli::run_tail(url, token, user, history, &cfg.session_secret).await {
            error!("tail client error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let store = store::build_store(&cfg).await;
    let buffer = buffer::build_buffer(&cfg).await;
    let state = GatewayState::new(&cfg, store, buffer);
    let proxy_state = ProxyState::new(cfg.upstream_host.clone(), cfg.upstream_port);

    let _watchdog = Watchdog::new(
        state.router.clone(),
        state.registry.clone(),
        cfg.heartbeat_interval,
        cfg.agent_timeout(),
    )
    .spawn();

    let app = fleetdeck_gateway::app(state, proxy_state);

    info!(
        addr = %cfg.bind_addr,
        upstream = %format!("{}:{}", cfg.upstream_host, cfg.upstream_port),
        heartbeat_secs = cfg.heartbeat_interval.as_secs(),
        timeout_secs = cfg.agent_timeout().as_secs(),
        backend = ?cfg.store_backend,
        "starting fleetdeck gateway"
    );
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .expect("bind");
    axum::serve(listener, app).await.expect("server");
}
