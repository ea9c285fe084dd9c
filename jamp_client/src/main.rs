//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p jamp_client -- [--addr 127.0.0.1:29070] [--name Kyle]
//!
//! Console commands:
//!   say <message>       - Chat
//!   forward|right|up N  - Set movement intent (-1..1)
//!   download <path>     - Fetch a file from the server
//!   cmd <text>          - Send a raw client command
//!   status              - Show connection status
//!   disconnect | quit   - Leave the server

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use jamp_client::{ConnState, GameClient};
use jamp_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cfg = EngineConfig::from_args(&args)?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let frame = Duration::from_millis(u64::from(1000 / cfg.sv_fps.max(1)));
    let mut printed = 0;
    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                client.disconnect().await?;
                return Ok(());
            }
            match client.exec_console(&line).await {
                Ok(out) => out.iter().for_each(|l| println!("{l}")),
                Err(e) => println!("error: {e:#}"),
            }
        }

        client.frame(frame).await?;

        let prints = &client.session.prints;
        for text in &prints[printed..] {
            print!("{text}");
        }
        printed = prints.len();

        if client.state() == ConnState::Disconnected {
            let reason = client.session.disconnect_reason.clone().unwrap_or_default();
            info!(%reason, "Connection closed");
            return Ok(());
        }
    }
}
