use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::decode::OpenOptions;
use crate::retry::{RetryPlan, DEFAULT_RETRY_DELAYS_SECS};

const DEFAULT_STALL_THRESHOLD_MS: u64 = 2_500;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 100;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SUPPORTED_CODECS: &[&str] = &["h264", "hevc", "h265", "mpeg4", "msmpeg4v3", "h263"];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EngineConfigFile {
    stall_threshold_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    retry_delays_ms: Option<Vec<u64>>,
    watchdog_interval_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    supported_codecs: Option<Vec<String>>,
}

/// Static engine settings, supplied at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// No-frame interval after which a playing stream counts as stalled.
    pub stall_threshold: Duration,
    /// One-time deadline for opening a source and decoding its first frame.
    pub connect_timeout: Duration,
    /// Delay before each successive restart; its length bounds the attempts.
    pub retry_delays: Vec<Duration>,
    /// Watchdog polling cadence.
    pub watchdog_interval: Duration,
    /// How long `stop()` waits for a decode thread before abandoning it.
    pub join_timeout: Duration,
    /// Codecs accepted from network sources.
    pub supported_codecs: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(EngineConfigFile::default())
    }
}

impl EngineConfig {
    /// Defaults, then the file named by `VISIONSTREAM_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("VISIONSTREAM_CONFIG").ok().as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, still honouring env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let retry_delays = file
            .retry_delays_ms
            .map(|delays| delays.into_iter().map(Duration::from_millis).collect())
            .unwrap_or_else(|| {
                DEFAULT_RETRY_DELAYS_SECS
                    .iter()
                    .map(|s| Duration::from_secs(*s))
                    .collect()
            });
        let supported_codecs = file.supported_codecs.unwrap_or_else(|| {
            DEFAULT_SUPPORTED_CODECS
                .iter()
                .map(|c| c.to_string())
                .collect()
        });
        Self {
            stall_threshold: Duration::from_millis(
                file.stall_threshold_ms.unwrap_or(DEFAULT_STALL_THRESHOLD_MS),
            ),
            connect_timeout: Duration::from_millis(
                file.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            retry_delays,
            watchdog_interval: Duration::from_millis(
                file.watchdog_interval_ms
                    .unwrap_or(DEFAULT_WATCHDOG_INTERVAL_MS),
            ),
            join_timeout: Duration::from_millis(
                file.join_timeout_ms.unwrap_or(DEFAULT_JOIN_TIMEOUT_MS),
            ),
            supported_codecs,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_millis("VISIONSTREAM_STALL_THRESHOLD_MS")? {
            self.stall_threshold = ms;
        }
        if let Some(ms) = env_millis("VISIONSTREAM_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout = ms;
        }
        if let Some(ms) = env_millis("VISIONSTREAM_WATCHDOG_INTERVAL_MS")? {
            self.watchdog_interval = ms;
        }
        if let Ok(delays) = std::env::var("VISIONSTREAM_RETRY_DELAYS_MS") {
            let parsed = split_csv(&delays)
                .into_iter()
                .map(|entry| {
                    entry.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                        anyhow!("VISIONSTREAM_RETRY_DELAYS_MS entries must be integer milliseconds")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.retry_delays = parsed;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stall_threshold.is_zero() {
            return Err(anyhow!("stall threshold must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeout must be greater than zero"));
        }
        if self.watchdog_interval.is_zero() {
            return Err(anyhow!("watchdog interval must be greater than zero"));
        }
        if self.join_timeout.is_zero() {
            return Err(anyhow!("join timeout must be greater than zero"));
        }
        if self.retry_delays.is_empty() {
            return Err(anyhow!("retry schedule must contain at least one delay"));
        }
        Ok(())
    }

    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn retry_plan(&self) -> RetryPlan {
        RetryPlan::new(self.retry_delays.clone())
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{key} must be an integer number of milliseconds"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.stall_threshold, Duration::from_millis(2500));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.watchdog_interval, Duration::from_millis(100));
        assert_eq!(cfg.join_timeout, Duration::from_secs(1));
        assert_eq!(
            cfg.retry_delays,
            [0, 2, 5, 10, 30].map(Duration::from_secs).to_vec()
        );
        assert!(cfg.supported_codecs.iter().any(|c| c == "hevc"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_and_empty_values() {
        let mut cfg = EngineConfig::default();
        cfg.retry_delays.clear();
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            stall_threshold: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_csv_skips_blank_entries() {
        assert_eq!(split_csv(" 0, 200,,500 "), vec!["0", "200", "500"]);
    }
}
