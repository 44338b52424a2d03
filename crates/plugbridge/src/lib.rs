//! Out-of-process plugins for Rust hosts
//!
//! A host launches each plugin as a child process and talks to it over a
//! local socket. Crashes stay isolated in the plugin, and plugins can be
//! built and shipped separately.
//!
//! # Architecture
//!
//! - [`handshake`]: magic cookie, version negotiation and the handshake line
//! - [`registry`]: named plugin sets shared by host and plugin
//! - [`adapter`]: typed clients on the host, dispatch tables in the plugin
//! - [`client`]: host side lifecycle (launch, handshake, dispense, kill)
//! - [`server`]: plugin side serve loop
//! - [`transport`]: netrpc and gRPC transports over TCP or unix sockets
//! - [`broker`]: extra connections multiplexed by id for callbacks
//! - [`codec`]: netrpc framing
//! - [`secure`]: checksum verification of plugin executables
//! - [`logging`]: plugin log setup and forwarding into the host
//! - [`error`]: error taxonomy
//!
//! # Handshake
//!
//! The host sets the magic cookie and the protocol versions it accepts in
//! the plugin's environment. The plugin binds a listener and prints a single
//! line to stdout:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL
//! ```
//!
//! after which stdout is free for ordinary output.
//!
//! # Example
//!
//! ```no_run
//! use plugbridge::prelude::*;
//!
//! # struct Greeter;
//! # impl Plugin for Greeter {
//! #     type Client = CallChannel;
//! #     fn server(&self, _: &Broker) -> BridgeResult<std::sync::Arc<dyn ServerAdapter>> {
//! #         Err(BridgeError::Unbound("greeter".into()))
//! #     }
//! #     fn client(&self, channel: CallChannel, _: &Broker) -> CallChannel { channel }
//! # }
//! async fn greet() -> BridgeResult<String> {
//!     let handshake = HandshakeConfig::new(1, "BASIC_PLUGIN", "hello");
//!     let plugins = PluginSet::new().with("greeter", Greeter)?;
//!     let config = ClientConfig::new(handshake, plugins)
//!         .with_command(PluginCommand::new("./greeter-plugin"));
//!
//!     let client = PluginClient::new(config)?;
//!     let greeter = client.dispense::<Greeter>("greeter").await?;
//!     let reply: String = greeter.call("greet", &()).await?;
//!     client.kill().await?;
//!     Ok(reply)
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapter;
pub mod broker;
pub mod client;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod prelude;
pub mod registry;
pub mod secure;
pub mod server;
pub mod transport;

pub use adapter::{Call, CallChannel, Invoker, LocalInvoker, ServerAdapter, reply};
pub use broker::Broker;
pub use client::{
    ClientConfig, ClientOptions, ClientState, PluginClient, PluginCommand, ReattachConfig,
    cleanup_clients,
};
pub use error::{
    BridgeError, BridgeResult, HandshakeError, RemoteError, TransportError, TransportResult,
};
pub use handshake::{CORE_PROTOCOL_VERSION, HandshakeConfig, HandshakeLine, Network, Protocol};
pub use registry::{Plugin, PluginSet, VersionedPlugins};
pub use secure::SecureConfig;
pub use server::{PluginServer, ServeConfig, ServeOptions, ServerState, serve};

/// Re-exported so adapters can implement [`ServerAdapter`] without a direct dependency
pub use async_trait::async_trait;
