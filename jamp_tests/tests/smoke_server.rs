//! Server start-up and level loading without any clients.

use tokio::sync::mpsc;

use jamp_server::{ServerError, ServerState};
use jamp_shared::info::value_for_key;
use jamp_shared::limits::{CS_MESSAGE, CS_SERVERINFO, MAX_CLIENTS};
use jamp_shared::math::Vec3;
use jamp_tests::{init_tracing, TestDirs};

#[tokio::test]
async fn idle_server_runs_frames() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("idle")?;
    let mut server = dirs.server(None).await?;
    server.run_for_frames(3).await?;
    assert_eq!(server.state(), ServerState::Dead);
    assert_eq!(server.core.time, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_entities_do_not_stop_the_level() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("spawn")?;
    let mut server = dirs.server(Some("arena")).await?;
    assert_eq!(server.state(), ServerState::Game);
    assert_eq!(server.core.configstrings[CS_MESSAGE], "Smoke Arena");
    assert_eq!(value_for_key(&server.core.configstrings[CS_SERVERINFO], "mapname"), "arena");

    // The spawn point after the unknown classname was still spawned.
    let game = server.vms().game().expect("game module");
    let spawn = Vec3::new(128.0, 64.0, 24.0);
    let found = (MAX_CLIENTS..game.num_entities())
        .filter_map(|n| game.shared_entity(n))
        .any(|e| e.s.origin == spawn);
    assert!(found, "spawn point missing");

    let before = server.core.time;
    server.run_for_frames(4).await?;
    assert_eq!(server.core.time, before + 4 * 50);
    Ok(())
}

#[tokio::test]
async fn bad_map_leaves_the_server_dead() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("badmap")?;
    let mut server = dirs.server(None).await?;

    let err = server.spawn_server("broken").expect_err("no worldspawn");
    assert!(err.to_string().contains("worldspawn"), "{err}");
    assert_eq!(server.state(), ServerState::Dead);
    assert!(matches!(server.spawn_server("missing"), Err(ServerError::MapNotFound(_))));

    let out = server.exec_console("map arena")?;
    assert_eq!(out, vec!["Map 'arena' loaded".to_string()]);
    assert_eq!(server.state(), ServerState::Game);
    Ok(())
}

#[tokio::test]
async fn console_quit_shuts_down() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("quit")?;
    let mut server = dirs.server(Some("arena")).await?;
    let (tx, rx) = mpsc::channel(4);
    server.set_console_input(rx);

    tx.try_send("status".to_string())?;
    server.step().await?;
    assert!(!server.should_quit());

    tx.try_send("quit".to_string())?;
    server.step().await?;
    assert!(server.should_quit());
    assert_eq!(server.state(), ServerState::Dead);
    Ok(())
}
