//! Shared fixtures for the end-to-end tests.
//!
//! A `TestDirs` owns a scratch tree with a map directory, a download root
//! and a client download directory. `drive` steps a server while some
//! other future (usually a client) runs against its socket.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use jamp_server::GameServer;
use jamp_shared::config::EngineConfig;

/// A small arena: a spawn point, a self-removing `info_null` and a
/// classname nothing knows how to spawn.
pub const ARENA: &str = r#"
{
"classname" "worldspawn"
"message" "Smoke Arena"
}
{
"classname" "info_null"
"origin" "0 0 0"
}
{
"classname" "nonexistent_class"
"origin" "8 8 8"
}
{
"classname" "info_player_deathmatch"
"origin" "128 64 24"
"angle" "90"
}
"#;

/// Contents of the downloadable file.
pub const README: &[u8] = b"may the force";

/// Installs a test subscriber once per process. `RUST_LOG` picks the
/// verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Scratch directories removed on drop.
pub struct TestDirs {
    root: PathBuf,
}

impl TestDirs {
    pub fn new(tag: &str) -> anyhow::Result<Self> {
        let root = std::env::temp_dir().join(format!("jamp_it_{tag}_{}", std::process::id()));
        let dirs = Self { root };
        std::fs::create_dir_all(dirs.maps()).context("create maps dir")?;
        std::fs::create_dir_all(dirs.base()).context("create base dir")?;
        std::fs::create_dir_all(dirs.client()).context("create client dir")?;
        std::fs::write(dirs.maps().join("arena.ent"), ARENA)?;
        std::fs::write(dirs.maps().join("broken.ent"), r#"{ "classname" "info_player_deathmatch" }"#)?;
        std::fs::write(dirs.base().join("readme.txt"), README)?;
        Ok(dirs)
    }

    pub fn maps(&self) -> PathBuf {
        self.root.join("maps")
    }

    pub fn base(&self) -> PathBuf {
        self.root.join("base")
    }

    /// Where the client stores downloads.
    pub fn client(&self) -> PathBuf {
        self.root.join("client")
    }

    /// A server on an ephemeral port, with `map` loaded when given.
    pub async fn server(&self, map: Option<&str>) -> anyhow::Result<GameServer> {
        let mut server = jamp_server::bind_ephemeral(self.maps(), self.base()).await?;
        if let Some(map) = map {
            server.spawn_server(map)?;
        }
        Ok(server)
    }

    /// Client settings pointing at `server`.
    pub fn client_config(&self, server: &GameServer, name: &str) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig {
            server_addr: server.local_addr()?.to_string(),
            download_dir: path_string(&self.client()),
            player_name: name.to_string(),
            ..Default::default()
        })
    }
}

impl Drop for TestDirs {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn path_string(p: &Path) -> String {
    p.display().to_string()
}

/// Steps `server` in real time until `work` finishes, then returns its
/// output. A server error ends the run early.
pub async fn drive<T>(server: &mut GameServer, work: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    let frame = Duration::from_millis(u64::from(1000 / server.cfg.sv_fps.max(1)));
    let serve = async {
        loop {
            if let Err(e) = server.step().await {
                return Err::<T, _>(e.context("server frame"));
            }
            tokio::time::sleep(frame).await;
        }
    };
    tokio::select! {
        r = serve => r,
        r = work => r,
    }
}
