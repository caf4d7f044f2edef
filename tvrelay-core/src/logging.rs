// Logging setup
//
// Engine events carry the stream they concern as structured fields:
// `stream_key` on everything per-stream, `client_id` on viewer events and
// `channel` on HLS directory work.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Crates whose own chatter is only useful when debugging them.
const QUIET_TARGETS: &[&str] = &["hyper", "h2", "reqwest", "redis", "tower_http"];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the
/// relay crates and dependencies stay at warn unless the level is more
/// verbose than info.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(level, &config.directives))
            .map_err(|e| anyhow::anyhow!("Invalid log directives: {e}"))?,
    };

    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(open_log_file(path)?),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let fmt_layer = if config.format.as_str() == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;
    Ok(())
}

/// Default filter: `level` for everything, dependencies held at warn unless
/// `level` is debug or trace, then any configured extras.
fn filter_directives(level: Level, extra: &[String]) -> String {
    let level = level.to_string().to_lowercase();
    let mut directives = vec![level.clone()];
    for target in ["tvrelay", "tvrelay_core", "tvrelay_livestream", "tvrelay_api"] {
        directives.push(format!("{target}={level}"));
    }
    if !matches!(level.as_str(), "debug" | "trace") {
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    }
    directives.extend(extra.iter().map(|d| d.trim().to_string()).filter(|d| !d.is_empty()));
    directives.join(",")
}

fn open_log_file(path: &str) -> anyhow::Result<std::sync::Arc<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {path}: {e}"))?;
    Ok(std::sync::Arc::new(file))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("DEBUG").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_default_directives_quiet_dependencies() {
        let directives = filter_directives(Level::INFO, &[]);
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("tvrelay_livestream=info"));
        assert!(directives.contains("hyper=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());

        let verbose = filter_directives(Level::DEBUG, &[]);
        assert!(verbose.contains("tvrelay_api=debug"));
        assert!(!verbose.contains("hyper=warn"));
    }

    #[test]
    fn test_extra_directives_come_last() {
        let extra = vec![
            "tvrelay_livestream::supervisor=trace".to_string(),
            "  ".to_string(),
        ];
        let directives = filter_directives(Level::WARN, &extra);
        assert!(directives.ends_with(",tvrelay_livestream::supervisor=trace"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
