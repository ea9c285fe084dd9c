//! Configuration system.
//!
//! Loads engine configuration from a JSON string or file.
//! Command-line overrides use `--key value` pairs.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:29070`.
    pub server_addr: String,
    /// Server frames per second.
    #[serde(default = "default_sv_fps")]
    pub sv_fps: u32,
    #[serde(default = "default_maxclients")]
    pub maxclients: usize,
    /// Directory holding `<map>.ent` entity text.
    #[serde(default = "default_maps_dir")]
    pub maps_dir: String,
    /// Root of files clients may download.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Seconds without traffic before a client is dropped.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    /// Seconds a dropped client slot stays ZOMBIE.
    #[serde(default = "default_zombie_time")]
    pub zombie_secs: u32,
    /// Map loaded at startup, if any.
    #[serde(default)]
    pub start_map: Option<String>,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
}

fn default_sv_fps() -> u32 {
    20
}

fn default_maxclients() -> usize {
    8
}

fn default_maps_dir() -> String {
    "maps".to_string()
}

fn default_download_dir() -> String {
    "base".to_string()
}

fn default_timeout() -> u32 {
    200
}

fn default_zombie_time() -> u32 {
    2
}

fn default_player_name() -> String {
    "Padawan".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:29070".to_string(),
            sv_fps: default_sv_fps(),
            maxclients: default_maxclients(),
            maps_dir: default_maps_dir(),
            download_dir: default_download_dir(),
            timeout_secs: default_timeout(),
            zombie_secs: default_zombie_time(),
            start_map: None,
            player_name: default_player_name(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads a JSON config file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {path}"))
    }

    /// Applies `--key value` overrides. `--config <path>` replaces the base
    /// config before the remaining overrides are applied.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut cfg = match args.iter().position(|a| a == "--config") {
            Some(i) => {
                let path = args.get(i + 1).context("--config needs a path")?;
                Self::load(path)?
            }
            None => Self::default(),
        };

        let mut it = args.iter();
        while let Some(flag) = it.next() {
            let Some(key) = flag.strip_prefix("--") else {
                continue;
            };
            let value = it
                .next()
                .with_context(|| format!("--{key} needs a value"))?;
            cfg.apply_override(key, value)?;
        }
        Ok(cfg)
    }

    fn apply_override(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "config" => {}
            "addr" | "server_addr" => self.server_addr = value.to_string(),
            "sv_fps" => self.sv_fps = value.parse().context("sv_fps")?,
            "maxclients" => self.maxclients = value.parse().context("maxclients")?,
            "maps" | "maps_dir" => self.maps_dir = value.to_string(),
            "download_dir" => self.download_dir = value.to_string(),
            "timeout" => self.timeout_secs = value.parse().context("timeout")?,
            "zombietime" => self.zombie_secs = value.parse().context("zombietime")?,
            "map" => self.start_map = Some(value.to_string()),
            "name" => self.player_name = value.to_string(),
            other => bail!("unknown option --{other}"),
        }
        Ok(())
    }
}
