// Process command construction
//
// Without a profile the engine runs ffmpeg itself:
// - TS:  copy the input into an MPEG-TS stream on stdout
// - HLS: write a rolling playlist plus segments into the channel directory
//
// With a profile the template is opaque: each argument gets its placeholders
// substituted and nothing else is interpreted.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tvrelay_core::config::HlsConfig;
use tvrelay_core::source::{OutputFormat, OutputTemplate};

use crate::buffer::hls::{MANIFEST_NAME, SEGMENT_PATTERN};

pub const PLACEHOLDER_URL: &str = "{streamUrl}";
pub const PLACEHOLDER_USER_AGENT: &str = "{userAgent}";
pub const PLACEHOLDER_OUTPUT_DIR: &str = "{outputDir}";

/// One upstream to pull from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTarget {
    pub url: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    /// True when output arrives on stdout, false when the process writes
    /// files into an output directory.
    pub stdout_output: bool,
}

impl ProcessCommand {
    pub fn passthrough(ffmpeg: &str, target: &SourceTarget) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-user_agent",
            target.user_agent.as_str(),
            "-i",
            target.url.as_str(),
            "-c",
            "copy",
            "-f",
            "mpegts",
            "pipe:1",
        ];
        Self {
            program: ffmpeg.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            stdout_output: true,
        }
    }

    pub fn hls(ffmpeg: &str, target: &SourceTarget, output_dir: &Path, hls: &HlsConfig) -> Self {
        let segment_path = output_dir.join(SEGMENT_PATTERN);
        let manifest_path = output_dir.join(MANIFEST_NAME);
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-user_agent".to_string(),
            target.user_agent.clone(),
            "-i".to_string(),
            target.url.clone(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            hls.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            hls.list_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+temp_file".to_string(),
            "-hls_segment_filename".to_string(),
            segment_path.to_string_lossy().into_owned(),
            manifest_path.to_string_lossy().into_owned(),
        ];
        Self {
            program: ffmpeg.to_string(),
            args,
            stdout_output: false,
        }
    }

    pub fn from_template(
        template: &OutputTemplate,
        target: &SourceTarget,
        output_dir: Option<&Path>,
    ) -> Self {
        let dir = output_dir
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = template
            .args
            .iter()
            .map(|arg| {
                arg.replace(PLACEHOLDER_URL, &target.url)
                    .replace(PLACEHOLDER_USER_AGENT, &target.user_agent)
                    .replace(PLACEHOLDER_OUTPUT_DIR, &dir)
            })
            .collect();
        Self {
            program: template.command.clone(),
            args,
            stdout_output: output_dir.is_none(),
        }
    }

    /// Pick the command for a stream: the profile template if one is
    /// configured, the built-in ffmpeg invocation otherwise.
    pub fn for_stream(
        format: OutputFormat,
        template: Option<&OutputTemplate>,
        ffmpeg: &str,
        target: &SourceTarget,
        output_dir: Option<&Path>,
        hls: &HlsConfig,
    ) -> Self {
        match (template, format, output_dir) {
            (Some(template), OutputFormat::Ts, _) => Self::from_template(template, target, None),
            (Some(template), OutputFormat::Hls, dir) => Self::from_template(template, target, dir),
            (None, OutputFormat::Hls, Some(dir)) => Self::hls(ffmpeg, target, dir, hls),
            (None, _, _) => Self::passthrough(ffmpeg, target),
        }
    }

    /// Redacted one-line rendering for logs (query strings often carry
    /// credentials).
    #[must_use]
    pub fn describe(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| match arg.split_once('?') {
                Some((base, _)) if base.contains("://") => format!("{base}?…"),
                _ => arg.clone(),
            })
            .collect();
        format!("{} {}", self.program, args.join(" "))
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(if self.stdout_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
