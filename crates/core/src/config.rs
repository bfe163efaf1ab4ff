use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::protocol::constants::DEFAULT_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name broadcast in presence packets.
    pub nickname: String,
    /// Host string carried in every frame.
    pub hostname: String,
    /// Group name broadcast alongside the nickname.
    pub group: String,
    /// UDP control port; the bulk TCP listener binds the same number.
    pub port: u16,
    /// Where accepted files land.
    pub save_dir: PathBuf,
    /// Extra per-subnet broadcast addresses besides 255.255.255.255.
    pub broadcast_addrs: Vec<IpAddr>,
    /// Presence heartbeat interval. Zero disables re-announcing.
    pub announce_interval_secs: u64,
    /// Bulk TCP dial timeout.
    pub connect_timeout_secs: u64,
    /// Expire peers unseen for this long. `None` keeps the protocol's
    /// baseline behavior: peers leave only by explicit exit broadcast.
    pub peer_expiry_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            group: String::new(),
            port: DEFAULT_PORT,
            save_dir: dirs::download_dir()
                .or_else(dirs::data_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lanmsg"),
            broadcast_addrs: Vec::new(),
            announce_interval_secs: 30,
            connect_timeout_secs: 20,
            peer_expiry_secs: None,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.nickname = "alice".to_string();
        config.peer_expiry_secs = Some(90);
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.nickname, "alice");
        assert_eq!(loaded.peer_expiry_secs, Some(90));
        assert_eq!(loaded.port, DEFAULT_PORT);
    }
}
