//! Key/value plugin served over gRPC by default

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use plugbridge::logging::{LoggingConfig, init_plugin_logging};
use plugbridge::{PluginSet, Protocol, ServeConfig, serve};
use plugbridge_examples::kv::{self, KvPlugin, MemoryStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kv-plugin", about = "In-memory key/value plugin")]
struct Args {
    /// Transport to serve
    #[arg(long, env = "KV_PLUGIN_PROTOCOL", default_value = "grpc")]
    protocol: Protocol,

    /// Artificial delay per operation, in milliseconds
    #[arg(long, env = "KV_PLUGIN_LATENCY_MS", default_value_t = 0)]
    latency_ms: u64,

    /// Log plain text instead of JSON
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_plugin_logging(&LoggingConfig {
        json_format: !args.plain_logs,
        ..LoggingConfig::default()
    })?;

    let store = MemoryStore::new().with_latency(Duration::from_millis(args.latency_ms));
    let plugins = PluginSet::new().with(kv::NAME, KvPlugin::serving(store))?;
    let config =
        ServeConfig::new(plugbridge_examples::handshake(), plugins).with_protocol(args.protocol);

    info!(protocol = %args.protocol, latency_ms = args.latency_ms, "kv plugin starting");
    serve(config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() -> Result<()> {
        let args = Args::try_parse_from(["kv-plugin"])?;
        assert_eq!(args.protocol, Protocol::Grpc);
        assert_eq!(args.latency_ms, 0);
        Ok(())
    }

    #[test]
    fn parse_netrpc() -> Result<()> {
        let args = Args::try_parse_from(["kv-plugin", "--protocol", "netrpc", "--latency-ms", "5"])?;
        assert_eq!(args.protocol, Protocol::NetRpc);
        assert_eq!(args.latency_ms, 5);
        Ok(())
    }
}
