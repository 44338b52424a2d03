//! Example interfaces shared by the demo host and its plugins
//!
//! Both sides link this crate, so the handshake and the adapter pairs are
//! identical in host and plugin by construction.
//!
//! - [`greeter`]: `Greet() -> string`, served over netrpc
//! - [`kv`]: `Put(key, value)` / `Get(key) -> value`, served over gRPC

#![deny(clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod greeter;
pub mod kv;

use plugbridge::{BridgeResult, HandshakeConfig, PluginSet};

/// Cookie variable the host sets for its plugins
pub const COOKIE_KEY: &str = "BASIC_PLUGIN";

/// Expected cookie value
pub const COOKIE_VALUE: &str = "hello";

/// Application protocol version of the example interfaces
pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake shared by the example host and plugins
pub fn handshake() -> HandshakeConfig {
    HandshakeConfig::new(PROTOCOL_VERSION, COOKIE_KEY, COOKIE_VALUE)
}

/// Plugin set the host registers: every interface, no implementations
pub fn host_plugins() -> BridgeResult<PluginSet> {
    PluginSet::new()
        .with(greeter::NAME, greeter::GreeterPlugin::host())?
        .with(kv::NAME, kv::KvPlugin::host())
}
