//! Agent configuration
//!
//! Read from `<config_dir>/vigie-agent/config.toml`, then overridden by
//! environment variables so a node can be provisioned with a single
//! `VIGIE_AGENT_TOKEN=... VIGIE_CONTROLLER_URL=...` line.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vigie_proto::is_token_shaped;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// 32-hex node token issued by the controller.
    pub token: String,
    pub controller_url: String,
    pub update_interval_secs: u64,
    pub auth_log: PathBuf,
    pub external_ip_url: String,
    pub speedtest_bin: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            controller_url: "http://127.0.0.1:8080".to_string(),
            update_interval_secs: 5,
            auth_log: PathBuf::from("/var/log/auth.log"),
            external_ip_url: "https://api.ipify.org".to_string(),
            speedtest_bin: "speedtest-cli".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, then apply env overrides.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        let config = Self::load_from(&config_path, |name| std::env::var(name).ok()).await?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get("VIGIE_AGENT_TOKEN") {
            self.token = token;
        }
        if let Some(url) = get("VIGIE_CONTROLLER_URL") {
            self.controller_url = url;
        }
        if let Some(interval) = get("VIGIE_UPDATE_INTERVAL") {
            self.update_interval_secs = interval
                .parse()
                .with_context(|| format!("VIGIE_UPDATE_INTERVAL is not a number: {interval}"))?;
        }
        if let Some(path) = get("VIGIE_AUTH_LOG") {
            self.auth_log = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            bail!("no node token configured (set VIGIE_AGENT_TOKEN or `token` in config.toml)");
        }
        if !is_token_shaped(&self.token) {
            bail!("node token must be 32 hexadecimal characters");
        }
        if self.update_interval_secs == 0 {
            bail!("update interval must be at least 1 second");
        }
        Ok(())
    }

    pub fn heartbeat_url(&self) -> String {
        format!("{}/heartbeat", self.controller_url.trim_end_matches('/'))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("vigie-agent");
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    #[tokio::test]
    async fn test_missing_file_uses_defaults_plus_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = |name: &str| match name {
            "VIGIE_AGENT_TOKEN" => Some(TOKEN.to_string()),
            "VIGIE_UPDATE_INTERVAL" => Some(" 10 ".to_string()),
            _ => None,
        };
        let config = AgentConfig::load_from(&dir.path().join("config.toml"), env).await.unwrap();
        assert_eq!(config.token, TOKEN);
        assert_eq!(config.update_interval_secs, 10);
        assert_eq!(config.heartbeat_url(), "http://127.0.0.1:8080/heartbeat");
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!("token = \"{TOKEN}\"\ncontroller_url = \"https://vigie.example.net/\"\nauth_log = \"/var/log/secure\"\n"),
        )
        .unwrap();
        let env = |name: &str| (name == "VIGIE_AUTH_LOG").then(|| "/tmp/auth.log".to_string());
        let config = AgentConfig::load_from(&path, env).await.unwrap();
        assert_eq!(config.heartbeat_url(), "https://vigie.example.net/heartbeat");
        assert_eq!(config.auth_log, PathBuf::from("/tmp/auth.log"));
        assert_eq!(config.update_interval_secs, 5);
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let bad_interval = |name: &str| (name == "VIGIE_UPDATE_INTERVAL").then(|| "soon".to_string());
        assert!(AgentConfig::load_from(&path, bad_interval).await.is_err());

        let config = AgentConfig::load_from(&path, |_| None).await.unwrap();
        assert!(config.validate().is_err());
        let short = AgentConfig { token: "abc".into(), ..AgentConfig::default() };
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("vigie-agent"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
