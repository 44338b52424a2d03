//! plugbridge-host - drives the example plugins
//!
//! Each command launches the plugin binary found next to this executable (or
//! in `--plugin-dir`), makes its calls and kills the plugin again.

#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugbridge::client::sibling_executable;
use plugbridge::prelude::*;
use plugbridge_examples::greeter::{self, GreeterPlugin};
use plugbridge_examples::kv::{self, KvPlugin};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "plugbridge-host")]
#[command(about = "Call the example plugins through the bridge")]
#[command(version)]
struct Cli {
    /// Directory holding the plugin binaries
    #[arg(long, global = true, env = "PLUGBRIDGE_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// Directory for unix sockets
    #[arg(long, global = true, env = "PLUGIN_UNIX_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Seconds to wait for the plugin to start
    #[arg(long, global = true, default_value_t = 60)]
    start_timeout: u64,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the greeter plugin for a greeting
    Greet,

    /// Key/value plugin commands
    #[command(subcommand)]
    Kv(KvCommands),
}

#[derive(Subcommand, Debug)]
enum KvCommands {
    /// Store a value, then read it back
    Put {
        /// Key
        key: String,
        /// Value, stored as UTF-8 bytes
        value: String,
    },
    /// Read a value
    Get {
        /// Key
        key: String,
    },
}

impl Cli {
    fn plugin_command(&self, binary: &str) -> Result<PluginCommand> {
        let path = match &self.plugin_dir {
            Some(dir) => dir.join(format!("{binary}{}", std::env::consts::EXE_SUFFIX)),
            None => sibling_executable(binary)?,
        };
        Ok(PluginCommand::new(path))
    }

    fn client(&self, binary: &str) -> Result<PluginClient> {
        let options = ClientOptions {
            allowed_protocols: vec![Protocol::NetRpc, Protocol::Grpc],
            start_timeout: Duration::from_secs(self.start_timeout),
            unix_socket_dir: self.socket_dir.clone(),
            managed: true,
            ..ClientOptions::default()
        };
        let config = ClientConfig::new(plugbridge_examples::handshake(), plugbridge_examples::host_plugins()?)
            .with_command(self.plugin_command(binary)?)
            .with_options(options);
        Ok(PluginClient::new(config)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = execute(&cli).await;
    cleanup_clients().await;
    result
}

async fn execute(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Greet => {
            let client = cli.client("greeter-plugin")?;
            let greeter = client
                .dispense::<GreeterPlugin>(greeter::NAME)
                .await
                .context("failed to dispense greeter")?;
            println!("{}", greeter.greet().await?);
            client.kill().await?;
        }
        Commands::Kv(cmd) => {
            let client = cli.client("kv-plugin")?;
            let store = client
                .dispense::<KvPlugin>(kv::NAME)
                .await
                .context("failed to dispense kv")?;
            debug!(protocol = ?client.protocol(), "kv plugin connected");

            match cmd {
                KvCommands::Put { key, value } => {
                    store.put(key, value.as_bytes()).await?;
                    let stored = store.get(key).await?;
                    println!("{}", String::from_utf8_lossy(&stored));
                }
                KvCommands::Get { key } => match store.get(key).await {
                    Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                    Err(e) if kv::is_not_found(&e) => println!("{key} is not set"),
                    Err(e) => return Err(e.into()),
                },
            }
            client.kill().await?;
        }
    }
    Ok(())
}
