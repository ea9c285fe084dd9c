//! Client and server talking over loopback UDP.

use std::time::Duration;

use anyhow::ensure;

use jamp_client::{ConnState, GameClient};
use jamp_server::client::ClientState;
use jamp_server::ServerState;
use jamp_shared::limits::CS_MESSAGE;
use jamp_tests::{drive, init_tracing, TestDirs, README};

const WAIT: Duration = Duration::from_secs(5);

async fn join(cfg: &jamp_shared::config::EngineConfig) -> anyhow::Result<GameClient> {
    let mut client = GameClient::connect(cfg).await?;
    let active = client.run_until(WAIT, |s| s.state == ConnState::Active).await?;
    ensure!(active, "client never went active: {:?}", client.state());
    Ok(client)
}

#[tokio::test]
async fn client_joins_and_chats() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("chat")?;
    let mut server = dirs.server(Some("arena")).await?;
    let cfg = dirs.client_config(&server, "Kyle")?;

    let client = drive(&mut server, async {
        let mut client = join(&cfg).await?;
        client.exec_console("say hello there").await?;
        let heard = client
            .run_until(WAIT, |s| s.prints.iter().any(|p| p.contains("Kyle: hello there")))
            .await?;
        ensure!(heard, "no chat echo in {:?}", client.session.prints);
        anyhow::Ok(client)
    })
    .await?;

    assert_eq!(client.session.configstring(CS_MESSAGE), "Smoke Arena");
    assert_eq!(client.session.server_id, server.core.server_id);
    assert!(client.session.snap.is_some());
    assert_eq!(server.core.client_state(client.session.client_num), ClientState::Active);
    Ok(())
}

#[tokio::test]
async fn disconnect_frees_the_slot_after_zombie_time() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("leave")?;
    let mut server = dirs.server(Some("arena")).await?;
    let cfg = dirs.client_config(&server, "Jan")?;

    let slot = drive(&mut server, async {
        let mut client = join(&cfg).await?;
        client.disconnect().await?;
        anyhow::Ok(client.session.client_num)
    })
    .await?;

    server.run_for_frames(2).await?;
    assert_eq!(server.core.client_state(slot), ClientState::Zombie);
    // sv_zombietime is two seconds of server time.
    server.run_for_frames(50).await?;
    assert_eq!(server.core.client_state(slot), ClientState::Free);
    Ok(())
}

#[tokio::test]
async fn kick_reaches_the_client() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("kick")?;
    let mut server = dirs.server(Some("arena")).await?;
    let cfg = dirs.client_config(&server, "Rosh")?;

    let mut client = drive(&mut server, join(&cfg)).await?;
    assert!(server.exec_console("kick Rosh")?.is_empty());

    let reason = drive(&mut server, async {
        let gone = client.run_until(WAIT, |s| s.state == ConnState::Disconnected).await?;
        ensure!(gone, "client still {:?}", client.state());
        anyhow::Ok(client.session.disconnect_reason.clone())
    })
    .await?;
    assert_eq!(reason.as_deref(), Some("was kicked"));
    Ok(())
}

#[tokio::test]
async fn map_restart_keeps_the_client_in_game() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("restart")?;
    let mut server = dirs.server(Some("arena")).await?;
    let cfg = dirs.client_config(&server, "Tavion")?;

    let mut client = drive(&mut server, join(&cfg)).await?;
    let old_id = client.session.server_id;
    server.exec_console("map_restart")?;
    let new_id = server.core.server_id;
    let restart_time = server.core.time;
    assert_ne!(old_id, new_id);

    drive(&mut server, async {
        let back = client
            .run_until(WAIT, |s| {
                s.server_id == new_id && s.snap.as_ref().is_some_and(|snap| snap.server_time > restart_time)
            })
            .await?;
        ensure!(back, "no snapshot after map_restart");
        anyhow::Ok(())
    })
    .await?;

    assert_eq!(client.state(), ConnState::Active);
    assert_eq!(server.state(), ServerState::Game);
    assert_eq!(server.core.client_state(client.session.client_num), ClientState::Active);
    Ok(())
}

#[tokio::test]
async fn file_download_over_the_channel() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("download")?;
    let mut server = dirs.server(Some("arena")).await?;
    let cfg = dirs.client_config(&server, "Mara")?;

    let files = drive(&mut server, async {
        let mut client = join(&cfg).await?;
        client.exec_console("download readme.txt").await?;
        let done = client.run_until(WAIT, |s| !s.downloaded.is_empty()).await?;
        ensure!(done, "download never finished");
        anyhow::Ok(client.session.downloaded.clone())
    })
    .await?;

    assert_eq!(files, vec![dirs.client().join("readme.txt")]);
    assert_eq!(std::fs::read(&files[0])?, README);
    Ok(())
}

#[tokio::test]
async fn connect_is_refused_without_a_map() -> anyhow::Result<()> {
    init_tracing();
    let dirs = TestDirs::new("nomap")?;
    let mut server = dirs.server(None).await?;
    let cfg = dirs.client_config(&server, "Kyle")?;

    let err = drive(&mut server, async { GameClient::connect(&cfg).await.map(|_| ()) })
        .await
        .expect_err("connect should fail");
    assert!(err.to_string().contains("Server is not running"), "{err:#}");
    assert_eq!(server.state(), ServerState::Dead);
    Ok(())
}
