/**
 * CONFIGURATION KERNEL - Variables d'environnement + fichier système JSON
 *
 * RÔLE :
 * - `KernelEnv` : ce que l'opérateur fournit au démarrage (.env / docker / systemd)
 * - `SystemConfig` : seuils, intervalles et cooldowns, modifiables à chaud
 *
 * FONCTIONNEMENT :
 * Le fichier `system_config.json` est en clair ; chaque clé est optionnelle
 * et retombe sur sa valeur par défaut. Un fichier invalide n'empêche pas le
 * démarrage : on log et on prend les défauts.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Docker,
    Systemd,
}

/// Paramètres de démarrage lus dans l'environnement.
#[derive(Debug, Clone)]
pub struct KernelEnv {
    pub bot_token: Option<String>,
    pub admin_id: Option<i64>,
    pub web_host: String,
    pub web_port: u16,
    pub deploy_mode: DeployMode,
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub auth_log: Option<PathBuf>,
    pub ban_log: Option<PathBuf>,
}

impl KernelEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let admin_id = match get("VIGIE_ADMIN_ID") {
            Some(v) => Some(v.parse::<i64>().map_err(|_| ConfigError::InvalidEnv {
                name: "VIGIE_ADMIN_ID",
                value: v.clone(),
            })?),
            None => None,
        };

        let web_port = match get("VIGIE_WEB_PORT") {
            Some(v) => v.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                name: "VIGIE_WEB_PORT",
                value: v.clone(),
            })?,
            None => 8080,
        };

        let deploy_mode = match get("VIGIE_DEPLOY_MODE").as_deref() {
            Some("docker") => DeployMode::Docker,
            Some("systemd") | None => DeployMode::Systemd,
            Some(other) => {
                return Err(ConfigError::InvalidEnv { name: "VIGIE_DEPLOY_MODE", value: other.to_string() })
            }
        };

        Ok(Self {
            bot_token: get("VIGIE_BOT_TOKEN"),
            admin_id,
            web_host: get("VIGIE_WEB_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            web_port,
            deploy_mode,
            data_dir: get("VIGIE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data")),
            api_key: get("VIGIE_API_KEY"),
            auth_log: get("VIGIE_AUTH_LOG").map(PathBuf::from),
            ban_log: get("VIGIE_BAN_LOG").map(PathBuf::from),
        })
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join("install.secret")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("nodes.enc")
    }

    pub fn subscriptions_path(&self) -> PathBuf {
        self.data_dir.join("alert_subscriptions.enc")
    }

    pub fn system_config_path(&self) -> PathBuf {
        self.data_dir.join("system_config.json")
    }
}

/// Seuils et intervalles (secondes / pourcentages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct SystemConfig {
    pub traffic_interval: u64,
    pub resource_check_interval: u64,
    pub cpu_threshold: f64,
    pub ram_threshold: f64,
    pub disk_threshold: f64,
    pub resource_alert_cooldown: i64,
    pub node_offline_timeout: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            traffic_interval: 5,
            resource_check_interval: 60,
            cpu_threshold: 90.0,
            ram_threshold: 90.0,
            disk_threshold: 95.0,
            resource_alert_cooldown: 1800,
            node_offline_timeout: 20,
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("CPU_THRESHOLD", self.cpu_threshold),
            ("RAM_THRESHOLD", self.ram_threshold),
            ("DISK_THRESHOLD", self.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0..=100, got {v}")));
            }
        }
        if self.traffic_interval == 0 || self.resource_check_interval == 0 {
            return Err(ConfigError::Invalid("intervals must be at least 1 second".into()));
        }
        if self.resource_alert_cooldown < 0 || self.node_offline_timeout <= 0 {
            return Err(ConfigError::Invalid("cooldown and offline timeout must be positive".into()));
        }
        Ok(())
    }

    /// Charge la config ; absente ou invalide => défauts.
    pub async fn load(path: &Path) -> Self {
        let txt = match fs::read_to_string(path).await {
            Ok(txt) => txt,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("no {}, using default system config", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("cannot read {}: {e}, using default system config", path.display());
                return Self::default();
            }
        };
        if txt.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<SystemConfig>(&txt) {
            Ok(cfg) => match cfg.validate() {
                Ok(()) => cfg,
                Err(e) => {
                    warn!("system config rejected: {e}, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!("system config invalid: {e}, using defaults");
                Self::default()
            }
        }
    }

    /// Applique une mise à jour partielle : seules les clés présentes changent.
    pub fn merged(&self, patch: &serde_json::Map<String, serde_json::Value>) -> Result<Self, ConfigError> {
        let mut current = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut current {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        let cfg: SystemConfig = serde_json::from_value(current)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_env_defaults() {
        let env = KernelEnv::from_lookup(|_| None).unwrap();
        assert_eq!(env.web_host, "0.0.0.0");
        assert_eq!(env.web_port, 8080);
        assert_eq!(env.deploy_mode, DeployMode::Systemd);
        assert!(env.admin_id.is_none());
        assert_eq!(env.registry_path(), PathBuf::from("./data/nodes.enc"));
    }

    #[test]
    fn test_env_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VIGIE_ADMIN_ID", "42"),
            ("VIGIE_WEB_PORT", "9000"),
            ("VIGIE_DEPLOY_MODE", "docker"),
            ("VIGIE_BOT_TOKEN", "  "),
        ]);
        let env = KernelEnv::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(env.admin_id, Some(42));
        assert_eq!(env.web_port, 9000);
        assert_eq!(env.deploy_mode, DeployMode::Docker);
        assert!(env.bot_token.is_none());
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let err = KernelEnv::from_lookup(|k| (k == "VIGIE_WEB_PORT").then(|| "http".to_string()));
        assert!(matches!(err, Err(ConfigError::InvalidEnv { name: "VIGIE_WEB_PORT", .. })));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: SystemConfig = serde_json::from_str(r#"{"CPU_THRESHOLD": 80.0, "UNKNOWN": 1}"#).unwrap();
        assert_eq!(cfg.cpu_threshold, 80.0);
        assert_eq!(cfg.disk_threshold, 95.0);
        assert_eq!(cfg.node_offline_timeout, 20);
    }

    #[test]
    fn test_validate() {
        assert!(SystemConfig::default().validate().is_ok());
        let bad = SystemConfig { ram_threshold: 120.0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system_config.json");
        assert_eq!(SystemConfig::load(&path).await, SystemConfig::default());

        let cfg = SystemConfig { cpu_threshold: 75.5, traffic_interval: 3, ..Default::default() };
        cfg.save(&path).await.unwrap();
        assert_eq!(SystemConfig::load(&path).await, cfg);

        tokio::fs::write(&path, "{not json").await.unwrap();
        assert_eq!(SystemConfig::load(&path).await, SystemConfig::default());
    }

    #[test]
    fn test_partial_update_keeps_other_settings() {
        let current = SystemConfig { ram_threshold: 70.0, node_offline_timeout: 45, ..Default::default() };
        let patch = json!({ "CPU_THRESHOLD": 80.0, "UNKNOWN_KEY": 1 });
        let updated = current.merged(patch.as_object().unwrap()).unwrap();
        assert_eq!(updated.cpu_threshold, 80.0);
        assert_eq!(updated.ram_threshold, 70.0);
        assert_eq!(updated.node_offline_timeout, 45);

        let invalid = json!({ "DISK_THRESHOLD": 101.0 });
        assert!(matches!(current.merged(invalid.as_object().unwrap()), Err(ConfigError::Invalid(_))));
        let wrong_type = json!({ "TRAFFIC_INTERVAL": "fast" });
        assert!(matches!(current.merged(wrong_type.as_object().unwrap()), Err(ConfigError::Json(_))));
    }
}
