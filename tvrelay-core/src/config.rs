use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::source::{ContentKind, OutputFormat};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub streaming: StreamingConfig,
    pub hls: HlsConfig,
    pub reaper: ReaperConfig,
    pub channels: Vec<ChannelConfig>,
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL runs the node with the in-process state store.
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "tvrelay:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Extra filter directives, e.g. "tvrelay_livestream::supervisor=debug".
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            directives: Vec::new(),
        }
    }
}

/// Tunables for the shared-stream engine.
///
/// Every timeout here is a default, not a protocol constant: operators are
/// expected to adjust them to their upstream providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub ffmpeg_path: String,
    pub default_user_agent: String,
    /// Bytes accumulated from the subprocess before a buffer chunk is appended.
    pub chunk_size: usize,
    /// Minimum age of a chunk before pruning may remove it.
    pub buffer_ttl_seconds: u64,
    /// Backstop expiry on chunk keys, covers a node dying mid-stream.
    pub orphan_ttl_seconds: u64,
    pub client_inactivity_seconds: u64,
    pub grace_period_seconds: u64,
    pub first_byte_timeout_seconds: u64,
    pub gap_timeout_seconds: u64,
    pub failover_extension_seconds: u64,
    pub stall_timeout_seconds: u64,
    pub max_respawns: u32,
    pub respawn_backoff_ms: u64,
    pub lock_ttl_ms: u64,
    pub stop_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_read_chunks: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            default_user_agent: "tvrelay/0.1".to_string(),
            chunk_size: 188 * 64,
            buffer_ttl_seconds: 60,
            orphan_ttl_seconds: 3600,
            client_inactivity_seconds: 60,
            grace_period_seconds: 5,
            first_byte_timeout_seconds: 10,
            gap_timeout_seconds: 30,
            failover_extension_seconds: 30,
            stall_timeout_seconds: 20,
            max_respawns: 3,
            respawn_backoff_ms: 1000,
            lock_ttl_ms: 10_000,
            stop_timeout_seconds: 5,
            poll_interval_ms: 100,
            max_read_chunks: 16,
        }
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    #[must_use]
    pub const fn client_inactivity(&self) -> Duration {
        Duration::from_secs(self.client_inactivity_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Each channel gets `{root_dir}/{channel_id}/stream.m3u8` plus segments.
    pub root_dir: String,
    pub manifest_attempts: u32,
    pub manifest_poll_interval_ms: u64,
    /// A job with no segment request for this long is reaped.
    pub idle_ttl_seconds: u64,
    pub segment_seconds: u32,
    pub list_size: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root_dir: "./data/hls".to_string(),
            manifest_attempts: 10,
            manifest_poll_interval_ms: 1000,
            idle_ttl_seconds: 60,
            segment_seconds: 4,
            list_size: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_seconds: 10 }
    }
}

/// A channel or on-demand item in the static catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: ContentKind,
    pub url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
    /// Output template id, see [`ProfileConfig`].
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub failover: Vec<FailoverSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSourceConfig {
    pub url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub auto_matched: bool,
    #[serde(default)]
    pub match_quality: f32,
}

/// Output command template. Arguments may contain `{streamUrl}`,
/// `{userAgent}` and `{outputDir}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (TVRELAY_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("TVRELAY")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn redis_enabled(&self) -> bool {
        !self.redis.url.is_empty()
    }

    /// Check the configuration for mistakes that would only surface at
    /// stream time. Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.streaming.ffmpeg_path.trim().is_empty() {
            errors.push("streaming.ffmpeg_path must not be empty".to_string());
        }
        if self.streaming.chunk_size == 0 {
            errors.push("streaming.chunk_size must be non-zero".to_string());
        }
        if self.streaming.poll_interval_ms == 0 {
            errors.push("streaming.poll_interval_ms must be non-zero".to_string());
        }
        if self.streaming.first_byte_timeout_seconds == 0 || self.streaming.gap_timeout_seconds == 0 {
            errors.push("streaming read timeouts must be non-zero".to_string());
        }
        if self.streaming.stall_timeout_seconds == 0 {
            errors.push("streaming.stall_timeout_seconds must be non-zero".to_string());
        }
        if self.streaming.gap_timeout_seconds <= self.streaming.stall_timeout_seconds {
            errors.push(format!(
                "streaming.gap_timeout_seconds ({}) must exceed stall_timeout_seconds ({})",
                self.streaming.gap_timeout_seconds, self.streaming.stall_timeout_seconds
            ));
        }
        if self.streaming.lock_ttl_ms == 0 {
            errors.push("streaming.lock_ttl_ms must be non-zero".to_string());
        }
        if self.hls.manifest_attempts == 0 {
            errors.push("hls.manifest_attempts must be non-zero".to_string());
        }
        if self.reaper.interval_seconds == 0 {
            errors.push("reaper.interval_seconds must be non-zero".to_string());
        }

        let profile_ids: HashSet<&str> = self.profiles.iter().map(|p| p.id.as_str()).collect();
        if profile_ids.len() != self.profiles.len() {
            errors.push("profiles contain duplicate ids".to_string());
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id.as_str()) {
                errors.push(format!("duplicate channel id: {}", channel.id));
            }
            if channel.url.trim().is_empty() {
                errors.push(format!("channel {} has an empty url", channel.id));
            }
            if let Some(profile) = &channel.profile {
                if !profile_ids.contains(profile.as_str()) {
                    errors.push(format!(
                        "channel {} references unknown profile {profile}",
                        channel.id
                    ));
                }
            }
            if channel.kind == ContentKind::OnDemand && !channel.failover.is_empty() {
                errors.push(format!(
                    "on-demand item {} cannot declare failover sources",
                    channel.id
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            title: String::new(),
            kind: ContentKind::Live,
            url: "http://upstream.example/live.ts".to_string(),
            user_agent: None,
            format: OutputFormat::Ts,
            profile: None,
            failover: Vec::new(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.redis_enabled());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.http_port = 0;
        config.streaming.ffmpeg_path = String::new();
        let mut bad = channel("news");
        bad.profile = Some("missing".to_string());
        config.channels = vec![bad, channel("news")];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("duplicate channel id")));
        assert!(errors.iter().any(|e| e.contains("unknown profile")));
    }

    #[test]
    fn test_gap_must_outlast_stall() {
        let mut config = Config::default();
        config.streaming.gap_timeout_seconds = 1;
        config.streaming.stall_timeout_seconds = 3;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("gap_timeout_seconds"));

        config.streaming.gap_timeout_seconds = 3;
        assert!(config.validate().is_err());

        config.streaming.gap_timeout_seconds = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_on_demand_without_failover() {
        let mut config = Config::default();
        let mut vod = channel("movie");
        vod.kind = ContentKind::OnDemand;
        vod.failover.push(FailoverSourceConfig {
            url: "http://backup.example/movie.ts".to_string(),
            user_agent: None,
            priority: 0,
            auto_matched: false,
            match_quality: 0.0,
        });
        config.channels = vec![vod];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tvrelay.yaml");
        std::fs::write(
            &path,
            r#"
server:
  http_port: 9090
streaming:
  stall_timeout_seconds: 7
channels:
  - id: news
    url: http://a.example/news.ts
    failover:
      - url: http://b.example/news.ts
        priority: 1
"#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.streaming.stall_timeout_seconds, 7);
        assert_eq!(config.streaming.max_respawns, 3);
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].failover[0].priority, 1);
        assert_eq!(config.channels[0].format, OutputFormat::Ts);
    }
}
