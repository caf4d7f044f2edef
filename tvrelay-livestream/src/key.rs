// Stream key derivation
//
// Format: "{kind}:{content_id}:{format}:{url_hash}"
// - kind:       "live" or "vod"
// - url_hash:   first 12 hex chars of SHA-256 over the resolved primary URL
//
// The key is derived once, from the primary source, and stays fixed across
// failover swaps.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tvrelay_core::source::{ContentKind, ContentRef, OutputFormat};

const URL_HASH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    #[must_use]
    pub fn derive(content: &ContentRef, url: &str, format: OutputFormat) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        let hash = hex::encode(digest);
        Self(format!(
            "{}:{}:{}:{}",
            content.kind.as_str(),
            content.id,
            format.as_str(),
            &hash[..URL_HASH_LEN]
        ))
    }

    /// Parse a key received from outside (admin routes). Returns `None` if
    /// the string is not a well-formed key.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let key = Self(raw.to_string());
        key.parts().is_some().then_some(key)
    }

    fn parts(&self) -> Option<(ContentKind, &str, OutputFormat, &str)> {
        let (kind, rest) = self.0.split_once(':')?;
        let (rest, hash) = rest.rsplit_once(':')?;
        let (id, format) = rest.rsplit_once(':')?;

        let kind = match kind {
            "live" => ContentKind::Live,
            "vod" => ContentKind::OnDemand,
            _ => return None,
        };
        let format = match format {
            "ts" => OutputFormat::Ts,
            "hls" => OutputFormat::Hls,
            _ => return None,
        };
        if id.is_empty()
            || hash.len() != URL_HASH_LEN
            || !hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        Some((kind, id, format, hash))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn format(&self) -> Option<OutputFormat> {
        self.parts().map(|(_, _, format, _)| format)
    }

    #[must_use]
    pub fn content(&self) -> Option<ContentRef> {
        self.parts().map(|(kind, id, _, _)| ContentRef {
            kind,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let content = ContentRef::live("news");
        let a = StreamKey::derive(&content, "http://a.example/news.ts", OutputFormat::Ts);
        let b = StreamKey::derive(&content, "http://a.example/news.ts", OutputFormat::Ts);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("live:news:ts:"));
        assert_eq!(a.as_str().len(), "live:news:ts:".len() + 12);
    }

    #[test]
    fn test_derive_separates_url_and_format() {
        let content = ContentRef::live("news");
        let ts = StreamKey::derive(&content, "http://a.example/news.ts", OutputFormat::Ts);
        let hls = StreamKey::derive(&content, "http://a.example/news.ts", OutputFormat::Hls);
        let other = StreamKey::derive(&content, "http://b.example/news.ts", OutputFormat::Ts);
        assert_ne!(ts, hls);
        assert_ne!(ts, other);
    }

    #[test]
    fn test_parse_roundtrip_with_colon_in_id() {
        let content = ContentRef::on_demand("show:s01e02");
        let key = StreamKey::derive(&content, "http://vod.example/e2.mkv", OutputFormat::Hls);
        let parsed = StreamKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed.content().unwrap(), content);
        assert_eq!(parsed.format(), Some(OutputFormat::Hls));
    }

    #[test]
    fn test_parse_keeps_raw_text() {
        let raw = "live:news:ts:0123456789ab";
        let parsed = StreamKey::parse(raw).unwrap();
        assert_eq!(parsed.as_str(), raw);
        assert_eq!(parsed.content().unwrap(), ContentRef::live("news"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StreamKey::parse("nope").is_none());
        assert!(StreamKey::parse("live:news:ts:xyz").is_none());
        assert!(StreamKey::parse("radio:news:ts:0123456789ab").is_none());
        assert!(StreamKey::parse("live::ts:0123456789ab").is_none());
    }
}
