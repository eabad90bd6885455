use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ── Broker transport ──────────────────────────────────────────────────────────

/// Which transport backs the event channel.
///
/// | Transport | Behaviour                                                        |
/// |-----------|------------------------------------------------------------------|
/// | `mqtt`    | Broker-backed queue; watcher and consumer may run as separate processes. |
/// | `memory`  | Process-local queue; only usable when both units run under `filebox run`. |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Mqtt,
    Memory,
}

/// When the consumer acknowledges a delivered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge as soon as the message arrives, before any processing.
    OnReceive,
    /// Acknowledge once processing reaches a terminal state.  Abandoned
    /// messages are forwarded to the dead-letter queue first.
    #[default]
    AfterResolve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: Transport,
    /// Broker address, `mqtt://host:port`.  Overridden at runtime by the
    /// `FILEBOX_BROKER_URL` environment variable when set.
    pub url: String,
    /// Name of the single queue events travel through.
    pub queue: String,
    /// Base client id.  The consumer uses it verbatim so its persistent
    /// broker session survives restarts; notifiers append a random suffix.
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the broker to accept the session.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Mqtt,
            url: "mqtt://localhost:1883".to_string(),
            queue: "file-box".to_string(),
            client_id: "filebox".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directory observed for file lifecycle events.  Overridden at runtime by
    /// the `FILEBOX_WATCH_DIR` environment variable when set.
    pub source_dir: String,
    pub recursive: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            source_dir: ".".to_string(),
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Read size used when streaming a file through the hasher.
    pub chunk_size: usize,
    /// Token appended to the name of a content-duplicate file.
    pub duplicate_suffix: String,
    /// Extensions (with leading dot) the consumer processes.  Matching is
    /// exact and case-sensitive.
    pub supported_extensions: Vec<String>,
    /// Wall-clock length of one size-tier token.  `0` disables the simulated
    /// processing delay entirely.
    pub processing_unit_ms: u64,
    pub ack_policy: AckPolicy,
    /// Queue that receives bodies of abandoned messages under
    /// [`AckPolicy::AfterResolve`].  Empty disables dead-lettering.
    pub dead_letter_queue: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            duplicate_suffix: "_dup_#".to_string(),
            supported_extensions: default_supported_extensions(),
            processing_unit_ms: 1000,
            ack_policy: AckPolicy::AfterResolve,
            dead_letter_queue: "file-box.dead-letter".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn processing_unit(&self) -> Duration {
        Duration::from_millis(self.processing_unit_ms)
    }
}

pub fn default_supported_extensions() -> Vec<String> {
    [
        ".ppt", ".pptx", ".pdf", ".txt", ".html", ".mp4", ".jpg", ".png", ".xls", ".xlsx",
        ".xml", ".vsd", ".py", ".doc", ".docx", ".json",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

/// Supervised reconnect loop parameters shared by the notifier and the
/// consumer subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub backoff_secs: u64,
    /// Growth factor applied to the delay after every failed attempt.
    /// `1.0` keeps the delay fixed.
    pub multiplier: f64,
    pub max_backoff_secs: u64,
    /// Attempts before the connection is reported as lost for good.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_secs: 10,
            multiplier: 2.0,
            max_backoff_secs: 300,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: ".filebox/consumer.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file_prefix: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: ".filebox/logs".to_string(),
            log_file_prefix: "file_event_handler.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub watcher: WatcherConfig,
    pub consumer: ConsumerConfig,
    pub reconnect: ReconnectConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parsing config at {}", path.display()))?;
        }

        if let Ok(value) = env::var("FILEBOX_BROKER_URL") {
            if !value.is_empty() {
                config.broker.url = value;
            }
        }

        if let Ok(value) = env::var("FILEBOX_WATCH_DIR") {
            if !value.is_empty() {
                config.watcher.source_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_pipeline_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.broker.queue, "file-box");
        assert_eq!(cfg.broker.transport, Transport::Mqtt);
        assert_eq!(cfg.consumer.chunk_size, 1024);
        assert_eq!(cfg.consumer.duplicate_suffix, "_dup_#");
        assert_eq!(cfg.reconnect.backoff_secs, 10);
        assert_eq!(cfg.consumer.ack_policy, AckPolicy::AfterResolve);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn default_extension_allow_list() {
        let exts = default_supported_extensions();
        assert_eq!(exts.len(), 16);
        for ext in [".txt", ".docx", ".json", ".vsd", ".mp4"] {
            assert!(exts.contains(&ext.to_string()), "missing {ext}");
        }
        assert!(!exts.contains(&".bin".to_string()));
    }

    #[test]
    fn processing_unit_converts_millis() {
        let mut consumer = ConsumerConfig::default();
        assert_eq!(consumer.processing_unit(), Duration::from_secs(1));
        consumer.processing_unit_ms = 0;
        assert!(consumer.processing_unit().is_zero());
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.broker.queue, "file-box");
        assert_eq!(cfg.store.path, ".filebox/consumer.redb");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[broker]
transport = "memory"
queue = "inbox"

[watcher]
recursive = false

[consumer]
duplicate_suffix = ".copy"
supported_extensions = [".md"]
processing_unit_ms = 0
ack_policy = "on_receive"

[reconnect]
multiplier = 1.0
max_attempts = 1
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.broker.transport, Transport::Memory);
        assert_eq!(cfg.broker.queue, "inbox");
        assert!(!cfg.watcher.recursive);
        assert_eq!(cfg.consumer.duplicate_suffix, ".copy");
        assert_eq!(cfg.consumer.supported_extensions, vec![".md".to_string()]);
        assert_eq!(cfg.consumer.processing_unit_ms, 0);
        assert_eq!(cfg.consumer.ack_policy, AckPolicy::OnReceive);
        assert_eq!(cfg.reconnect.max_attempts, 1);
        // Unspecified fields should have defaults
        assert_eq!(cfg.consumer.chunk_size, 1024);
        assert_eq!(cfg.reconnect.backoff_secs, 10);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.broker.queue = "uploads".to_string();
        cfg.consumer.ack_policy = AckPolicy::OnReceive;
        cfg.store.path = "/var/lib/filebox/db.redb".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.broker.queue, "uploads");
        assert_eq!(loaded.consumer.ack_policy, AckPolicy::OnReceive);
        assert_eq!(loaded.store.path, "/var/lib/filebox/db.redb");
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped: AppConfig =
            toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(shipped.to_toml().unwrap(), AppConfig::default().to_toml().unwrap());
    }

    #[test]
    fn ack_policy_serde_labels() {
        for (policy, label) in [
            (AckPolicy::OnReceive, "\"on_receive\""),
            (AckPolicy::AfterResolve, "\"after_resolve\""),
        ] {
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, label);
            let back: AckPolicy = serde_json::from_str(&json).unwrap();
            assert_eq!(back, policy);
        }
    }

    #[test]
    fn env_overrides_broker_url_and_watch_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[broker]
url = "mqtt://from-file:1883"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for these env vars.
        unsafe {
            env::set_var("FILEBOX_BROKER_URL", "mqtt://from-env:1883");
            env::set_var("FILEBOX_WATCH_DIR", "/srv/inbox");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("FILEBOX_BROKER_URL");
            env::remove_var("FILEBOX_WATCH_DIR");
        }
        assert_eq!(cfg.broker.url, "mqtt://from-env:1883");
        assert_eq!(cfg.watcher.source_dir, "/srv/inbox");
    }
}
