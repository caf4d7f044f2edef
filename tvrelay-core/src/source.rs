//! Source resolution contract.
//!
//! Channel catalogs, playlists and stream profiles are owned by external
//! collaborators. The engine only ever sees them through [`SourceResolver`],
//! which turns a content reference into a [`ResolvedSource`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{ChannelConfig, Config, ProfileConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Live,
    OnDemand,
}

impl ContentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::OnDemand => "vod",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery format of a shared stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Raw MPEG transport stream piped through the buffer store.
    #[default]
    Ts,
    /// Segmented HLS written to a per-channel directory.
    Hls,
}

impl OutputFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Hls => "hls",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub kind: ContentKind,
    pub id: String,
}

impl ContentRef {
    pub fn live(id: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Live,
            id: id.into(),
        }
    }

    pub fn on_demand(id: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::OnDemand,
            id: id.into(),
        }
    }
}

/// An alternate upstream for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSource {
    pub url: String,
    pub user_agent: String,
    pub priority: i32,
    pub auto_matched: bool,
    pub match_quality: f32,
}

/// Opaque output command. The engine substitutes placeholders and runs it,
/// nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTemplate {
    pub command: String,
    pub args: Vec<String>,
}

impl From<&ProfileConfig> for OutputTemplate {
    fn from(profile: &ProfileConfig) -> Self {
        Self {
            command: profile.command.clone(),
            args: profile.args.clone(),
        }
    }
}

/// Something the engine can stream: knows where its bytes come from and
/// which alternates exist.
pub trait StreamableSource: Send + Sync + fmt::Debug {
    fn content(&self) -> &ContentRef;
    fn resolve_url(&self) -> &str;
    fn resolve_user_agent(&self) -> &str;
    fn resolve_failover_candidates(&self) -> Vec<CandidateSource>;

    /// Whether a clean upstream end is expected (finite content).
    fn ends_naturally(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct LiveChannel {
    pub content: ContentRef,
    pub url: String,
    pub user_agent: String,
    pub failover: Vec<CandidateSource>,
}

impl StreamableSource for LiveChannel {
    fn content(&self) -> &ContentRef {
        &self.content
    }

    fn resolve_url(&self) -> &str {
        &self.url
    }

    fn resolve_user_agent(&self) -> &str {
        &self.user_agent
    }

    fn resolve_failover_candidates(&self) -> Vec<CandidateSource> {
        self.failover.clone()
    }

    fn ends_naturally(&self) -> bool {
        false
    }
}

/// A finite item (episode, movie). Never has failover candidates.
#[derive(Debug, Clone)]
pub struct OnDemandEpisode {
    pub content: ContentRef,
    pub url: String,
    pub user_agent: String,
}

impl StreamableSource for OnDemandEpisode {
    fn content(&self) -> &ContentRef {
        &self.content
    }

    fn resolve_url(&self) -> &str {
        &self.url
    }

    fn resolve_user_agent(&self) -> &str {
        &self.user_agent
    }

    fn resolve_failover_candidates(&self) -> Vec<CandidateSource> {
        Vec::new()
    }

    fn ends_naturally(&self) -> bool {
        true
    }
}

/// Result of `resolveSource(id)`.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub source: Arc<dyn StreamableSource>,
    pub title: String,
    pub format: OutputFormat,
    pub profile_id: Option<String>,
}

impl ResolvedSource {
    #[must_use]
    pub fn url(&self) -> &str {
        self.source.resolve_url()
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        self.source.resolve_user_agent()
    }

    #[must_use]
    pub fn content(&self) -> &ContentRef {
        self.source.content()
    }
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve_source(&self, content: &ContentRef) -> Result<ResolvedSource>;

    async fn resolve_stream_profile(&self, profile_id: &str) -> Result<Option<OutputTemplate>>;
}

/// Resolver over the static `channels` / `profiles` configuration.
pub struct CatalogResolver {
    channels: HashMap<(ContentKind, String), ChannelConfig>,
    profiles: HashMap<String, OutputTemplate>,
    default_user_agent: String,
}

impl CatalogResolver {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|c| ((c.kind, c.id.clone()), c.clone()))
            .collect();
        let profiles = config
            .profiles
            .iter()
            .map(|p| (p.id.clone(), OutputTemplate::from(p)))
            .collect();

        Self {
            channels,
            profiles,
            default_user_agent: config.streaming.default_user_agent.clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn user_agent(&self, configured: Option<&String>) -> String {
        configured
            .filter(|ua| !ua.is_empty())
            .cloned()
            .unwrap_or_else(|| self.default_user_agent.clone())
    }
}

#[async_trait]
impl SourceResolver for CatalogResolver {
    async fn resolve_source(&self, content: &ContentRef) -> Result<ResolvedSource> {
        let channel = self
            .channels
            .get(&(content.kind, content.id.clone()))
            .ok_or_else(|| Error::NotFound(format!("{} {}", content.kind, content.id)))?;

        let user_agent = self.user_agent(channel.user_agent.as_ref());
        let source: Arc<dyn StreamableSource> = match content.kind {
            ContentKind::Live => Arc::new(LiveChannel {
                content: content.clone(),
                url: channel.url.clone(),
                user_agent,
                failover: channel
                    .failover
                    .iter()
                    .map(|f| CandidateSource {
                        url: f.url.clone(),
                        user_agent: self.user_agent(f.user_agent.as_ref()),
                        priority: f.priority,
                        auto_matched: f.auto_matched,
                        match_quality: f.match_quality,
                    })
                    .collect(),
            }),
            ContentKind::OnDemand => Arc::new(OnDemandEpisode {
                content: content.clone(),
                url: channel.url.clone(),
                user_agent,
            }),
        };

        Ok(ResolvedSource {
            source,
            title: if channel.title.is_empty() {
                channel.id.clone()
            } else {
                channel.title.clone()
            },
            format: channel.format,
            profile_id: channel.profile.clone(),
        })
    }

    async fn resolve_stream_profile(&self, profile_id: &str) -> Result<Option<OutputTemplate>> {
        Ok(self.profiles.get(profile_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverSourceConfig;

    fn catalog() -> CatalogResolver {
        let mut config = Config::default();
        config.channels = vec![
            ChannelConfig {
                id: "news".to_string(),
                title: "News 24".to_string(),
                kind: ContentKind::Live,
                url: "http://a.example/news.ts".to_string(),
                user_agent: None,
                format: OutputFormat::Ts,
                profile: Some("copy".to_string()),
                failover: vec![FailoverSourceConfig {
                    url: "http://b.example/news.ts".to_string(),
                    user_agent: Some("backup-agent".to_string()),
                    priority: 1,
                    auto_matched: true,
                    match_quality: 0.8,
                }],
            },
            ChannelConfig {
                id: "movie".to_string(),
                title: String::new(),
                kind: ContentKind::OnDemand,
                url: "http://vod.example/movie.mkv".to_string(),
                user_agent: Some("vod-agent".to_string()),
                format: OutputFormat::Hls,
                profile: None,
                failover: Vec::new(),
            },
        ];
        config.profiles = vec![ProfileConfig {
            id: "copy".to_string(),
            command: "ffmpeg".to_string(),
            args: vec!["-i".to_string(), "{streamUrl}".to_string()],
        }];
        CatalogResolver::from_config(&config)
    }

    #[tokio::test]
    async fn test_resolve_live_channel() {
        let resolver = catalog();
        let resolved = resolver.resolve_source(&ContentRef::live("news")).await.unwrap();

        assert_eq!(resolved.url(), "http://a.example/news.ts");
        assert_eq!(resolved.user_agent(), "tvrelay/0.1");
        assert_eq!(resolved.title, "News 24");
        assert!(!resolved.source.ends_naturally());

        let candidates = resolved.source.resolve_failover_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_agent, "backup-agent");
    }

    #[tokio::test]
    async fn test_resolve_on_demand() {
        let resolver = catalog();
        let resolved = resolver
            .resolve_source(&ContentRef::on_demand("movie"))
            .await
            .unwrap();

        assert_eq!(resolved.title, "movie");
        assert_eq!(resolved.format, OutputFormat::Hls);
        assert_eq!(resolved.user_agent(), "vod-agent");
        assert!(resolved.source.ends_naturally());
        assert!(resolved.source.resolve_failover_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_not_found() {
        let resolver = catalog();
        let err = resolver
            .resolve_source(&ContentRef::on_demand("news"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_profile() {
        let resolver = catalog();
        let template = resolver.resolve_stream_profile("copy").await.unwrap().unwrap();
        assert_eq!(template.command, "ffmpeg");
        assert!(resolver.resolve_stream_profile("nope").await.unwrap().is_none());
    }
}
