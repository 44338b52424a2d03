//! Prelude module for convenient imports

pub use crate::adapter::{Call, CallChannel, Invoker, ServerAdapter, reply};
pub use crate::broker::Broker;
pub use crate::client::{
    ClientConfig, ClientOptions, ClientState, PluginClient, PluginCommand, ReattachConfig,
    cleanup_clients,
};
pub use crate::error::{BridgeError, BridgeResult, HandshakeError, RemoteError, TransportError};
pub use crate::handshake::{HandshakeConfig, Network, PluginEnv, Protocol};
pub use crate::logging::{LoggingConfig, init_plugin_logging};
pub use crate::registry::{Plugin, PluginSet, VersionedPlugins};
pub use crate::secure::SecureConfig;
pub use crate::server::{PluginServer, ServeConfig, ServeOptions, serve};
pub use async_trait::async_trait;
