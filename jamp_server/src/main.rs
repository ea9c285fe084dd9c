//! Dedicated server binary.
//!
//! Usage:
//!   cargo run -p jamp_server -- [--addr 0.0.0.0:29070] [--sv_fps 20] [--maps maps] [--map ffa_bespin]
//!
//! Operator commands are read from stdin: `map`, `devmap`, `map_restart`,
//! `status`, `kick`, `ban`, `listbans`, `serverinfo`, `svsay`, `quit` and
//! any cvar or game command.

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use jamp_server::GameServer;
use jamp_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cfg = EngineConfig::from_args(&args)?;
    info!(?cfg, "Starting dedicated server");

    let mut server = GameServer::new(cfg.clone())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

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

    if let Some(map) = &cfg.start_map {
        if let Err(e) = server.spawn_server(map) {
            error!(map, error = %e, "could not load start map");
        }
    }

    let frame = std::time::Duration::from_millis(u64::from(1000 / cfg.sv_fps.max(1)));
    let mut next_frame = tokio::time::Instant::now();

    while !server.should_quit() {
        server.step().await?;
        next_frame += frame;
        tokio::time::sleep_until(next_frame).await;
    }
    info!("Server exited");
    Ok(())
}
