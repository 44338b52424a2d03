//! Log setup for plugin processes and forwarding of plugin output on the host
//!
//! A plugin's stdout belongs to the handshake, so plugins log to stderr. With
//! JSON output enabled the host can parse each line and re-emit it at the
//! level the plugin used; anything else is forwarded as plain text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

/// Logging setup for a plugin process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Write JSON lines the host can parse
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json_format: true,
        }
    }
}

/// Install a stderr subscriber for a plugin process
pub fn init_plugin_logging(
    config: &LoggingConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.as_str()));

    let fmt_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
}

/// A plugin log line after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLogLine {
    /// Level name in upper case, `None` for plain text
    pub level: Option<String>,
    /// Message text
    pub message: String,
    /// Module the plugin logged from
    pub target: Option<String>,
}

impl PluginLogLine {
    /// Parse a JSON line from the plugin, falling back to plain text
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        let plain = || Self {
            level: None,
            message: line.to_string(),
            target: None,
        };

        let Ok(Value::Object(entry)) = serde_json::from_str::<Value>(line) else {
            return plain();
        };

        let level = entry
            .get("level")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase);
        let message = entry
            .get("fields")
            .and_then(|f| f.get("message"))
            .or_else(|| entry.get("message"))
            .or_else(|| entry.get("@message"))
            .and_then(Value::as_str);
        let target = entry
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string);

        match message {
            Some(message) => Self {
                level,
                message: message.to_string(),
                target,
            },
            None => plain(),
        }
    }
}

/// Re-emit one stderr line from a plugin on the host's subscriber
pub fn forward_plugin_line(plugin: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let parsed = PluginLogLine::parse(line);
    let target = parsed.target.as_deref().unwrap_or("");
    let message = parsed.message.as_str();
    match parsed.level.as_deref() {
        Some("ERROR") => error!(plugin, plugin_target = target, "{message}"),
        Some("WARN") => warn!(plugin, plugin_target = target, "{message}"),
        Some("INFO") => info!(plugin, plugin_target = target, "{message}"),
        Some("TRACE") => trace!(plugin, plugin_target = target, "{message}"),
        _ => debug!(plugin, plugin_target = target, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracing_json() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"WARN","fields":{"message":"disk low"},"target":"kv_plugin"}"#;
        let parsed = PluginLogLine::parse(line);
        assert_eq!(parsed.level.as_deref(), Some("WARN"));
        assert_eq!(parsed.message, "disk low");
        assert_eq!(parsed.target.as_deref(), Some("kv_plugin"));
    }

    #[test]
    fn test_parse_flat_json() {
        let parsed = PluginLogLine::parse(r#"{"@level":"debug","level":"info","@message":"ready"}"#);
        assert_eq!(parsed.level.as_deref(), Some("INFO"));
        assert_eq!(parsed.message, "ready");
    }

    #[test]
    fn test_plain_text_passthrough() {
        let parsed = PluginLogLine::parse("panicked at src/main.rs:3\n");
        assert_eq!(parsed.level, None);
        assert_eq!(parsed.message, "panicked at src/main.rs:3");

        let parsed = PluginLogLine::parse(r#"{"no_message":true}"#);
        assert_eq!(parsed.level, None);
    }

    #[test]
    fn test_forward_does_not_panic_without_subscriber() {
        forward_plugin_line("greeter", r#"{"level":"ERROR","fields":{"message":"x"}}"#);
        forward_plugin_line("greeter", "");
        forward_plugin_line("greeter", "plain");
    }

    #[test]
    fn test_default_config_is_json() {
        let config = LoggingConfig::default();
        assert!(config.json_format);
        assert_eq!(config.default_filter, "info");
    }
}
