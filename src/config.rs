use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the receiver.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// UDP address receiving reassembled fragments. Default: "0.0.0.0:10000".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Receive scratch buffer size in bytes; bounds the largest accepted
    /// fragment. Default: 4MB.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,

    /// Number of shard worker threads (1-32). Default: 4.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Maximum timestamp spread within one aggregate, in ticks. Default: 100.
    #[serde(default = "default_timestamp_slop")]
    pub timestamp_slop: u64,

    /// How long an incomplete aggregate may wait before it is released
    /// anyway. Default: 1s.
    #[serde(default = "default_frame_timeout", with = "humantime_serde")]
    pub frame_timeout: Duration,

    /// Fragment count at which an aggregate is complete (1-127). Default: 1.
    #[serde(default = "default_expected_fragments")]
    pub expected_fragments: usize,

    /// Statistics reporting interval. Default: 5s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Record output configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Record output configuration. At least one sink must be enabled.
#[derive(Debug, Default, Deserialize)]
pub struct SinksConfig {
    /// Event-transfer ring publishing.
    #[serde(default)]
    pub ets: EtsSinkConfig,

    /// Rolling-file output.
    #[serde(default)]
    pub file: FileSinkConfig,
}

/// Event-transfer sink configuration.
#[derive(Debug, Deserialize)]
pub struct EtsSinkConfig {
    /// Enable publishing to the event-transfer ring. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Session name identifying the ring.
    #[serde(default)]
    pub session: String,

    /// Optional host of a remote ring (empty for local).
    #[serde(default)]
    pub host: String,

    /// Optional port of a remote ring (0 for default).
    #[serde(default)]
    pub port: u16,

    /// Event slot capacity in bytes; records larger than this are dropped
    /// for this sink. Default: 2MB.
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: usize,

    /// Number of event slots in the ring. Default: 512.
    #[serde(default = "default_slots")]
    pub slots: usize,
}

/// Rolling-file sink configuration.
#[derive(Debug, Deserialize)]
pub struct FileSinkConfig {
    /// Enable rolling-file output. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Output directory, created at start-up if missing.
    #[serde(default)]
    pub directory: PathBuf,

    /// Filename prefix. Default: "frames".
    #[serde(default = "default_file_prefix")]
    pub prefix: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:10000".to_string()
}

fn default_recv_buffer_bytes() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_shards() -> usize {
    4
}

fn default_timestamp_slop() -> u64 {
    100
}

fn default_frame_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_expected_fragments() -> usize {
    1
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_slot_capacity() -> usize {
    2 * 1024 * 1024 // 2MB
}

fn default_slots() -> usize {
    512
}

fn default_file_prefix() -> String {
    "frames".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            recv_buffer_bytes: default_recv_buffer_bytes(),
            shards: default_shards(),
            timestamp_slop: default_timestamp_slop(),
            frame_timeout: default_frame_timeout(),
            expected_fragments: default_expected_fragments(),
            report_interval: default_report_interval(),
            sinks: SinksConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for EtsSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session: String::new(),
            host: String::new(),
            port: 0,
            slot_capacity: default_slot_capacity(),
            slots: default_slots(),
        }
    }
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::new(),
            prefix: default_file_prefix(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.sinks.ets.enabled && !self.sinks.file.enabled {
            bail!("at least one sink (sinks.ets or sinks.file) must be enabled");
        }

        if !(1..=32).contains(&self.shards) {
            bail!("shards must be between 1 and 32");
        }

        // The stream count travels in a 7-bit field of the record status.
        if !(1..=127).contains(&self.expected_fragments) {
            bail!("expected_fragments must be between 1 and 127");
        }

        if self.recv_buffer_bytes == 0 {
            bail!("recv_buffer_bytes must be positive");
        }

        if self.sinks.ets.enabled {
            if self.sinks.ets.session.is_empty() {
                bail!("sinks.ets.session is required when the ETS sink is enabled");
            }
            if self.sinks.ets.slot_capacity == 0 {
                bail!("sinks.ets.slot_capacity must be positive");
            }
            if self.sinks.ets.slots == 0 {
                bail!("sinks.ets.slots must be positive");
            }
        }

        if self.sinks.file.enabled && self.sinks.file.directory.as_os_str().is_empty() {
            bail!("sinks.file.directory is required when the file sink is enabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            sinks: SinksConfig {
                ets: EtsSinkConfig {
                    enabled: true,
                    session: "agg".to_string(),
                    ..Default::default()
                },
                file: FileSinkConfig::default(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.shards, 4);
        assert_eq!(cfg.timestamp_slop, 100);
        assert_eq!(cfg.frame_timeout, Duration::from_secs(1));
        assert_eq!(cfg.expected_fragments, 1);
        assert_eq!(cfg.sinks.ets.slot_capacity, 2 * 1024 * 1024);
        assert_eq!(cfg.sinks.file.prefix, "frames");
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_no_sink_rejected() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one sink"));
    }

    #[test]
    fn test_shard_range_enforced() {
        for shards in [0usize, 33] {
            let cfg = Config {
                shards,
                ..valid_config()
            };
            assert!(cfg.validate().unwrap_err().to_string().contains("shards"));
        }
    }

    #[test]
    fn test_expected_fragments_range_enforced() {
        for expected in [0usize, 128] {
            let cfg = Config {
                expected_fragments: expected,
                ..valid_config()
            };
            assert!(cfg
                .validate()
                .unwrap_err()
                .to_string()
                .contains("expected_fragments"));
        }
    }

    #[test]
    fn test_ets_requires_session_name() {
        let mut cfg = valid_config();
        cfg.sinks.ets.session.clear();
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("sinks.ets.session"));
    }

    #[test]
    fn test_file_sink_requires_directory() {
        let cfg = Config {
            sinks: SinksConfig {
                ets: EtsSinkConfig::default(),
                file: FileSinkConfig {
                    enabled: true,
                    directory: PathBuf::new(),
                    prefix: "frames".to_string(),
                },
            },
            ..Default::default()
        };
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("sinks.file.directory"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
listen: "127.0.0.1:20000"
shards: 8
expected_fragments: 12
frame_timeout: 250ms
sinks:
  file:
    enabled: true
    directory: /data/frames
    prefix: run42
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.listen, "127.0.0.1:20000");
        assert_eq!(cfg.shards, 8);
        assert_eq!(cfg.expected_fragments, 12);
        assert_eq!(cfg.frame_timeout, Duration::from_millis(250));
        assert!(cfg.sinks.file.enabled);
        assert_eq!(cfg.sinks.file.directory, PathBuf::from("/data/frames"));
        assert_eq!(cfg.sinks.file.prefix, "run42");
    }
}
