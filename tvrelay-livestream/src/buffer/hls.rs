// HLS output directory
//
// Layout: "{root}/{channel}/stream.m3u8" plus numbered segment files.
// The process writes segments; readers serve whatever is on disk. The
// manifest is only ever replaced by rename, so a reader never observes a
// half-written manifest.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tvrelay_core::source::{ContentKind, ContentRef};

use crate::error::{StreamError, StreamResult};

pub const MANIFEST_NAME: &str = "stream.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";
const ENDLIST: &str = "#EXT-X-ENDLIST";
const CHANNEL_ID_MAX: usize = 64;
const CHANNEL_HASH_BYTES: usize = 4;

fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Segment names the process is allowed to produce and readers may fetch.
#[must_use]
pub fn is_valid_segment_name(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    matches!(ext, "ts" | "m4s" | "mp4" | "aac")
        && !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Directory name for a piece of content: a readable, sanitized id plus a
/// hash of the raw `kind:id`. Sanitizing alone would fold `a.b` and `a_b`
/// onto one directory.
#[must_use]
pub fn channel_name(content: &ContentRef) -> String {
    let readable: String = content
        .id
        .chars()
        .take(CHANNEL_ID_MAX)
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    let digest = Sha256::digest(format!("{}:{}", content.kind.as_str(), content.id).as_bytes());
    let hash = hex::encode(&digest[..CHANNEL_HASH_BYTES]);
    match content.kind {
        ContentKind::Live => format!("{readable}-{hash}"),
        ContentKind::OnDemand => format!("vod_{readable}-{hash}"),
    }
}

#[derive(Debug, Clone)]
pub struct HlsDirectory {
    root: PathBuf,
}

impl HlsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel: &str) -> StreamResult<PathBuf> {
        if !is_safe_component(channel) {
            return Err(StreamError::StreamNotFound(format!(
                "invalid channel name: {channel}"
            )));
        }
        Ok(self.root.join(channel))
    }

    pub fn manifest_path(&self, channel: &str) -> StreamResult<PathBuf> {
        Ok(self.channel_dir(channel)?.join(MANIFEST_NAME))
    }

    /// Create an empty directory for a fresh process, removing leftovers of
    /// an earlier run.
    pub async fn prepare(&self, channel: &str) -> StreamResult<PathBuf> {
        let dir = self.channel_dir(channel)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn manifest_exists(&self, channel: &str) -> bool {
        match self.manifest_path(channel) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read_manifest(&self, channel: &str) -> StreamResult<Option<Bytes>> {
        read_optional(&self.manifest_path(channel)?).await
    }

    pub async fn read_segment(&self, channel: &str, name: &str) -> StreamResult<Option<Bytes>> {
        if !is_valid_segment_name(name) {
            return Err(StreamError::StreamNotFound(format!("invalid segment name: {name}")));
        }
        read_optional(&self.channel_dir(channel)?.join(name)).await
    }

    pub async fn manifest_modified(&self, channel: &str) -> Option<SystemTime> {
        let path = self.manifest_path(channel).ok()?;
        fs::metadata(&path).await.ok()?.modified().ok()
    }

    /// Replace the manifest in one step: write a temp file, then rename.
    pub async fn write_manifest(&self, channel: &str, contents: &str) -> StreamResult<()> {
        let dir = self.channel_dir(channel)?;
        let tmp = dir.join(format!(".{MANIFEST_NAME}.{}.tmp", nanoid::nanoid!(8)));
        fs::write(&tmp, contents).await?;
        if let Err(e) = fs::rename(&tmp, dir.join(MANIFEST_NAME)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Mark the playlist finished so pollers stop asking for more segments.
    /// Returns false if there was no manifest to finalize.
    pub async fn finalize_manifest(&self, channel: &str) -> StreamResult<bool> {
        let Some(current) = self.read_manifest(channel).await? else {
            return Ok(false);
        };
        let text = String::from_utf8_lossy(&current);
        if text.lines().any(|line| line.trim() == ENDLIST) {
            return Ok(true);
        }

        let mut finished = text.trim_end().to_string();
        finished.push('\n');
        finished.push_str(ENDLIST);
        finished.push('\n');
        self.write_manifest(channel, &finished).await?;
        Ok(true)
    }

    pub async fn remove(&self, channel: &str) -> StreamResult<()> {
        let dir = self.channel_dir(channel)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(channel, "Removed HLS directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Channel directories currently on disk.
    pub async fn list_channels(&self) -> StreamResult<Vec<String>> {
        let mut channels = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(channels),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_safe_component(&name) {
                channels.push(name);
            }
        }
        channels.sort();
        Ok(channels)
    }
}

async fn read_optional(path: &Path) -> StreamResult<Option<Bytes>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
