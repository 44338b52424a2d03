//! Handshake descriptor and negotiation line
//!
//! The handshake is a UX safety check, not a security boundary: it stops a
//! host from talking to the wrong binary and stops a plugin binary from being
//! run by hand. Both sides compile in the same [`HandshakeConfig`].
//!
//! The plugin announces itself with exactly one stdout line:
//!
//! ```text
//! <core-version>|<protocol-version>|<network>|<address>|<protocol>[|<server-cert>]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;

/// Version of the handshake line format and control surface
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Versions the host supports, comma separated
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Lowest TCP port the plugin may listen on
pub const ENV_MIN_PORT: &str = "PLUGIN_MIN_PORT";

/// Highest TCP port the plugin may listen on
pub const ENV_MAX_PORT: &str = "PLUGIN_MAX_PORT";

/// Directory for unix socket listeners
pub const ENV_UNIX_SOCKET_DIR: &str = "PLUGIN_UNIX_SOCKET_DIR";

/// Shared identity both processes must agree on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Application protocol version, ignored when versioned plugin sets are used
    pub protocol_version: u32,
    /// Environment variable the host sets for the plugin
    pub magic_cookie_key: String,
    /// Value of the cookie variable
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    /// Create a handshake descriptor
    pub fn new(
        protocol_version: u32,
        magic_cookie_key: impl Into<String>,
        magic_cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    /// Reject descriptors that cannot be carried through the environment
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.magic_cookie_key.is_empty() || self.magic_cookie_value.is_empty() {
            return Err(HandshakeError::InvalidConfig(
                "magic cookie key and value must both be set".to_string(),
            ));
        }

        if self.magic_cookie_key.contains('=') || self.magic_cookie_key.contains('\0') {
            return Err(HandshakeError::InvalidConfig(format!(
                "magic cookie key {:?} is not a valid environment variable name",
                self.magic_cookie_key
            )));
        }

        Ok(())
    }

    /// Check the cookie the host placed in the plugin's environment
    pub fn check_cookie(&self, env: &PluginEnv) -> Result<(), HandshakeError> {
        match env.get(&self.magic_cookie_key) {
            Some(value) if value == self.magic_cookie_value => Ok(()),
            _ => Err(HandshakeError::CookieMismatch {
                key: self.magic_cookie_key.clone(),
            }),
        }
    }
}

/// Snapshot of the environment a plugin was started with
#[derive(Debug, Clone, Default)]
pub struct PluginEnv {
    vars: HashMap<String, String>,
}

impl PluginEnv {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build an environment from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Set a variable
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Protocol versions advertised by the host
    pub fn protocol_versions(&self) -> Vec<u32> {
        self.get(ENV_PROTOCOL_VERSIONS)
            .map(parse_versions)
            .unwrap_or_default()
    }

    /// Parse a numeric variable, ignoring garbage
    pub fn port(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

/// Parse a comma separated version list, skipping entries that are not numbers
pub fn parse_versions(value: &str) -> Vec<u32> {
    value
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

/// Format a version list for [`ENV_PROTOCOL_VERSIONS`]
pub fn format_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Highest version present in both lists
pub fn negotiate_version(host: &[u32], plugin: &[u32]) -> Option<u32> {
    host.iter().filter(|v| plugin.contains(v)).max().copied()
}

/// RPC protocol carried by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Single connection, framed request/response
    NetRpc,
    /// gRPC over HTTP/2
    Grpc,
}

impl Protocol {
    /// Identifier used on the handshake line
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::NetRpc => "netrpc",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "netrpc" => Ok(Protocol::NetRpc),
            "grpc" => Ok(Protocol::Grpc),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// Socket family the plugin listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP on the loopback interface
    Tcp,
    /// Unix domain socket
    Unix,
}

impl Network {
    /// Identifier used on the handshake line
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }

    /// Unix sockets where available, TCP elsewhere
    pub fn platform_default() -> Self {
        #[cfg(unix)]
        {
            Network::Unix
        }
        #[cfg(not(unix))]
        {
            Network::Tcp
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unknown network type {other:?}")),
        }
    }
}

/// The single line a plugin prints once it is listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeLine {
    /// Core protocol version
    pub core_version: u32,
    /// Negotiated application protocol version
    pub protocol_version: u32,
    /// Listener socket family
    pub network: Network,
    /// Listener address (host:port or socket path)
    pub address: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Base64 server certificate, when the plugin offers TLS
    pub server_cert: Option<String>,
}

impl HandshakeLine {
    /// Whether a stdout line is shaped like a handshake rather than log output
    ///
    /// Only shape is checked: at least four separators and a numeric first
    /// field. Content errors are reported by [`HandshakeLine::from_str`].
    pub fn looks_like_handshake(line: &str) -> bool {
        let line = line.trim();
        let mut fields = line.split('|');
        let first_numeric = fields
            .next()
            .is_some_and(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
        first_numeric && line.matches('|').count() >= 4
    }

    /// Validate the line against what the host accepts
    pub fn validate(
        &self,
        host_versions: &[u32],
        allowed_protocols: &[Protocol],
    ) -> Result<(), HandshakeError> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion {
                plugin: self.core_version,
                core: CORE_PROTOCOL_VERSION,
            });
        }

        if !host_versions.contains(&self.protocol_version) {
            return Err(HandshakeError::ProtocolVersion {
                plugin: self.protocol_version,
                host: host_versions.to_vec(),
            });
        }

        if !allowed_protocols.contains(&self.protocol) {
            return Err(HandshakeError::ProtocolNotAllowed {
                protocol: self.protocol.to_string(),
                allowed: allowed_protocols.iter().map(Protocol::to_string).collect(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.protocol_version, self.network, self.address, self.protocol
        )?;
        if let Some(cert) = &self.server_cert {
            write!(f, "|{cert}")?;
        }
        Ok(())
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let malformed = |reason: &str| HandshakeError::Malformed {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.split('|').collect();
        let [core, version, network, address, protocol, rest @ ..] = parts.as_slice() else {
            return Err(malformed("expected at least 5 fields"));
        };

        let core_version = core
            .parse()
            .map_err(|e| malformed(&format!("core version: {e}")))?;
        let protocol_version = version
            .parse()
            .map_err(|e| malformed(&format!("protocol version: {e}")))?;
        let network = network.parse().map_err(|e: String| malformed(&e))?;
        if address.is_empty() {
            return Err(malformed("empty address"));
        }
        let protocol = protocol.parse().map_err(|e: String| malformed(&e))?;

        let server_cert = match rest {
            [] => None,
            [cert] if cert.is_empty() => None,
            [cert] => Some((*cert).to_string()),
            _ => return Err(malformed("too many fields")),
        };

        Ok(HandshakeLine {
            core_version,
            protocol_version,
            network,
            address: (*address).to_string(),
            protocol,
            server_cert,
        })
    }
}
