//! Greeter plugin served over netrpc
//!
//! Must be launched by a host; run by hand it explains that and exits.

use anyhow::Result;
use plugbridge::logging::{LoggingConfig, init_plugin_logging};
use plugbridge::{PluginSet, Protocol, ServeConfig, serve};
use plugbridge_examples::greeter::{self, GreeterPlugin, Hello};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_plugin_logging(&LoggingConfig::default())?;

    let plugins = PluginSet::new().with(greeter::NAME, GreeterPlugin::serving(Hello))?;
    let config =
        ServeConfig::new(plugbridge_examples::handshake(), plugins).with_protocol(Protocol::NetRpc);

    info!("greeter plugin starting");
    serve(config).await?;
    info!("greeter plugin exiting");
    Ok(())
}
