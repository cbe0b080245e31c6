use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};
use tokio::fs;
use tracing::warn;

/// Erreurs de configuration (fichier poller.yaml ou descripteur d'équipement)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),
    #[error("unknown module {module} for device type {device_type}")]
    UnknownModule { device_type: String, module: String },
    #[error("module {module}: missing required setting {setting}")]
    MissingSetting { module: String, setting: String },
    #[error("module {module}: invalid value for setting {setting}")]
    InvalidSetting { module: String, setting: String },
    #[error("module {module}: initialisation failed: {reason}")]
    ModuleInit { module: String, reason: String },
    #[error("device {0}: timeout must be greater than zero")]
    InvalidTimeout(String),
    #[error("device {0}: address is empty")]
    EmptyAddress(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    pub source: SourceConf,
    pub mqtt: MqttConf,
    pub intervals: IntervalsConf,
    /// Délai entre le démarrage des tâches système et les annonces
    pub startup_delay_ms: u64,
    /// Attente maximale des workers à l'arrêt
    pub shutdown_grace_secs: u64,
}

/// Origine de la liste des équipements désirés
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConf {
    Http {
        url: String,
        #[serde(default = "default_source_timeout")]
        timeout_secs: u64,
    },
    File {
        path: PathBuf,
    },
}

fn default_source_timeout() -> u64 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub max_packet_kb: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IntervalsConf {
    pub reconcile_secs: u64,
    pub dispatch_secs: u64,
    pub supervise_secs: u64,
    /// Pause entre deux cycles d'un worker (0 = reboucle tout de suite)
    pub cycle_secs: u64,
    /// Plancher appliqué à la pause d'un worker
    pub min_cycle_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            source: SourceConf::default(),
            mqtt: MqttConf::default(),
            intervals: IntervalsConf::default(),
            startup_delay_ms: 1000,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for SourceConf {
    fn default() -> Self {
        SourceConf::File { path: PathBuf::from("devices.yaml") }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "symbion-poller".into(),
            topic_prefix: "symbion/poller".into(),
            max_packet_kb: 1024,
        }
    }
}

impl Default for IntervalsConf {
    fn default() -> Self {
        Self {
            reconcile_secs: 5,
            dispatch_secs: 5,
            supervise_secs: 5,
            cycle_secs: 0,
            min_cycle_ms: 500,
        }
    }
}

impl IntervalsConf {
    pub fn reconcile(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs.max(1))
    }

    pub fn dispatch(&self) -> Duration {
        Duration::from_secs(self.dispatch_secs.max(1))
    }

    pub fn supervise(&self) -> Duration {
        Duration::from_secs(self.supervise_secs.max(1))
    }

    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_secs).max(Duration::from_millis(self.min_cycle_ms))
    }
}

impl PollerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Version annoncée au backend (VERSION prioritaire, sinon celle du crate)
    pub fn version() -> String {
        std::env::var("VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
    }
}

pub fn parse_config(txt: &str) -> Result<PollerConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(PollerConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

/// Surcharges par variables d'environnement, `lookup` abstrait `std::env::var`
pub fn apply_env_overrides<F>(cfg: &mut PollerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("SYMBION_MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = lookup("SYMBION_MQTT_PORT") {
        match port.parse() {
            Ok(port) => cfg.mqtt.port = port,
            Err(_) => warn!("ignoring invalid SYMBION_MQTT_PORT: {port}"),
        }
    }
    if let Some(url) = lookup("SYMBION_POLLER_REGISTRY_URL") {
        let timeout_secs = match &cfg.source {
            SourceConf::Http { timeout_secs, .. } => *timeout_secs,
            SourceConf::File { .. } => default_source_timeout(),
        };
        cfg.source = SourceConf::Http { url, timeout_secs };
    }
}

pub async fn read_config(path: &Path) -> Result<PollerConfig, ConfigError> {
    let txt = fs::read_to_string(path).await?;
    parse_config(&txt)
}

pub async fn load_config() -> PollerConfig {
    let path = std::env::var("SYMBION_POLLER_CONFIG").unwrap_or_else(|_| "poller.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        read_config(Path::new(&path)).await.unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            PollerConfig::default()
        })
    } else {
        warn!("no {path}, using default config");
        PollerConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.intervals.reconcile(), Duration::from_secs(5));
        assert_eq!(cfg.intervals.dispatch(), Duration::from_secs(5));
        assert_eq!(cfg.intervals.supervise(), Duration::from_secs(5));
        assert_eq!(cfg.source, SourceConf::File { path: PathBuf::from("devices.yaml") });
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            r#"
source:
  kind: http
  url: http://registry.local/api/devices
mqtt:
  host: broker.local
intervals:
  dispatch_secs: 10
  cycle_secs: 2
"#,
        )
        .unwrap();

        assert_eq!(
            cfg.source,
            SourceConf::Http { url: "http://registry.local/api/devices".into(), timeout_secs: 10 }
        );
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.intervals.dispatch(), Duration::from_secs(10));
        assert_eq!(cfg.intervals.reconcile(), Duration::from_secs(5));
        assert_eq!(cfg.intervals.cycle(), Duration::from_secs(2));
    }

    #[test]
    fn test_cycle_floor() {
        let intervals = IntervalsConf::default();
        assert_eq!(intervals.cycle(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_config("source: [not, a, map").is_err());
    }

    #[tokio::test]
    async fn test_read_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.yaml");
        std::fs::write(&path, "mqtt:\n  topic_prefix: lab/poller\nstartup_delay_ms: 0\n").unwrap();

        let cfg = read_config(&path).await.unwrap();
        assert_eq!(cfg.mqtt.topic_prefix, "lab/poller");
        assert_eq!(cfg.startup_delay(), Duration::ZERO);

        let missing = read_config(&dir.path().join("absent.yaml")).await;
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SYMBION_MQTT_HOST", "10.1.1.1"),
            ("SYMBION_MQTT_PORT", "not-a-port"),
            ("SYMBION_POLLER_REGISTRY_URL", "http://registry/devices"),
        ]);
        let mut cfg = PollerConfig::default();
        apply_env_overrides(&mut cfg, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.mqtt.host, "10.1.1.1");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(
            cfg.source,
            SourceConf::Http { url: "http://registry/devices".into(), timeout_secs: 10 }
        );
    }
}
