use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::error;

use crate::auth::mint_session_token;
use crate::protocol::{decode_payload, DashboardCommand, DashboardEvent};

#[derive(Parser, Debug)]
#[command(name = "fleetdeck-gateway")]
#[command(about = "Fleetdeck relay gateway and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a dashboard client and print the live event stream
    Tail {
        /// Gateway URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session token; when omitted, one is minted locally for --user
        /// with the gateway's configured secret
        #[arg(short, long)]
        token: Option<String>,

        /// User id to mint a local token for
        #[arg(long)]
        user: Option<String>,

        /// Request output history for this session before tailing
        #[arg(long)]
        history: Option<String>,
    },
}

pub async fn run_tail(
    url: String,
    token: Option<String>,
    user: Option<String>,
    history: Option<String>,
    session_secret: &str,
) -> Result<()> {
    let token = match (token, user) {
        (Some(token), _) => token,
        (None, Some(user)) => mint_session_token(session_secret, &user, chrono::Duration::minutes(30))?,
        (None, None) => bail!("provide --token or --user"),
    };

    let ws_url = format!("{}/ws/dashboard?token={}", url.trim_end_matches('/'), token);
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!("failed to connect to {}: {}", ws_url, err);
            bail!("connection failed: {}", err);
        }
        Err(_) => bail!("connection timeout - is the gateway running?"),
    };
    let (mut write, mut read) = ws_stream.split();

    if let Some(session_id) = history {
        let request = DashboardCommand::FetchHistory {
            session_id,
            offset: None,
            limit: None,
        };
        write
            .send(Message::Text(serde_json::to_string(&request)?.into()))
            .await?;
    }

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<DashboardEvent>(&text) {
                Ok(event) => print_event(event),
                Err(_) => println!("?? {}", text),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

fn print_event(event: DashboardEvent) {
    match event {
        DashboardEvent::MachineUpdated { machine } => {
            println!(
                "machine {} {:?} cpu={:.0}% mem={:.0}%",
                machine.id, machine.status, machine.cpu, machine.memory
            );
        }
        DashboardEvent::SessionStarted { session } => {
            println!(
                "session {} started: {} in {} (pid {})",
                session.id, session.process_name, session.workdir, session.pid
            );
        }
        DashboardEvent::SessionStopped {
            session_id,
            exit_code,
        } => {
            println!("session {} stopped (exit {:?})", session_id, exit_code);
        }
        DashboardEvent::SessionCrashed { session_id, error } => {
            println!("session {} crashed: {}", session_id, error);
        }
        DashboardEvent::SessionOutput { session_id, data } => {
            let text = decode_payload(&data)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or(data);
            print!("[{}] {}", session_id, text);
        }
        DashboardEvent::AlertFired {
            severity, message, ..
        } => {
            println!("ALERT [{:?}] {}", severity, message);
        }
    }
}
