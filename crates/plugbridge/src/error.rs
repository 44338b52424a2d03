//! Error types for the bridge
//!
//! Errors are split by where they originate so callers can tell "the plugin
//! ran and failed" ([`BridgeError::Business`]) from "the plugin was
//! unreachable" ([`BridgeError::Transport`]).

use std::io;

use plugbridge_proto::{CallError, ErrorKind};
use thiserror::Error;

/// Handshake and version negotiation failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The handshake line could not be parsed
    #[error("unrecognized remote plugin message: {line:?} ({reason})")]
    Malformed {
        /// Offending line
        line: String,
        /// What was wrong with it
        reason: String,
    },

    /// Plugin speaks a different core protocol
    #[error(
        "incompatible core API version with plugin: plugin version {plugin}, core version {core}"
    )]
    CoreVersion {
        /// Version reported by the plugin
        plugin: u32,
        /// Version this build speaks
        core: u32,
    },

    /// Negotiated protocol version is not one the host supports
    #[error("incompatible API version with plugin: plugin version {plugin}, host versions {host:?}")]
    ProtocolVersion {
        /// Version the plugin selected
        plugin: u32,
        /// Versions the host accepts
        host: Vec<u32>,
    },

    /// The plugin chose a transport the host does not allow
    #[error("plugin selected protocol {protocol:?}, allowed protocols are {allowed:?}")]
    ProtocolNotAllowed {
        /// Protocol reported by the plugin
        protocol: String,
        /// Protocols the host accepts
        allowed: Vec<String>,
    },

    /// Magic cookie missing or wrong in the plugin's environment
    #[error(
        "magic cookie {key:?} is missing or does not match; this binary is a plugin and must be launched by its host"
    )]
    CookieMismatch {
        /// Cookie environment variable name
        key: String,
    },

    /// Plugin process ended before it wrote a handshake line
    #[error("plugin exited before handshake ({status}){}", stderr_suffix(.stderr))]
    ExitedEarly {
        /// Exit status description
        status: String,
        /// Last lines the plugin wrote to stderr
        stderr: Vec<String>,
    },

    /// No handshake line within the start timeout
    #[error("timeout while waiting for plugin to start after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// The descriptor itself is unusable
    #[error("invalid handshake configuration: {0}")]
    InvalidConfig(String),
}

fn stderr_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {}", lines.join(" | "))
    }
}

/// Connection and framing failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the plugin's listener
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address that was dialled
        address: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The transport is shut down; re-dispense from a new client
    #[error("transport is closed")]
    Closed,

    /// IO error on an established connection
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Message encoding failed
    #[error("message encoding failed: {0}")]
    EncodingFailed(String),

    /// Message decoding failed
    #[error("message decoding failed: {0}")]
    DecodingFailed(String),

    /// gRPC status other than a carried business error
    #[error("gRPC error: {0}")]
    Grpc(String),

    /// Timeout exceeded
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
}

/// A failure reported by the plugin's own implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Machine-readable code chosen by the implementation
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl RemoteError {
    /// Create a remote error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.code, self.message)
        }
    }
}

/// Top-level bridge error
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Handshake or version negotiation failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The plugin executable could not be started
    #[error("failed to launch plugin {command}: {source}")]
    Launch {
        /// Program that failed to start
        command: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The plugin was unreachable or the connection failed mid-call
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The plugin ran and its implementation reported a failure
    #[error("plugin error: {0}")]
    Business(RemoteError),

    /// No plugin registered under this name
    #[error("no plugin named {0:?}")]
    UnknownPlugin(String),

    /// The plugin exists but has no such method
    #[error("plugin {plugin:?} has no method {method:?}")]
    UnknownMethod {
        /// Plugin name
        plugin: String,
        /// Method name
        method: String,
    },

    /// Arguments or results failed to (de)serialize
    #[error("payload codec error: {0}")]
    Codec(String),

    /// A plugin registered on the host side was asked to serve
    #[error("plugin {0:?} has no implementation bound in this process")]
    Unbound(String),

    /// Executable integrity check failed
    #[error("security check failed: {0}")]
    Security(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error reported by the remote side that fits no other category
    #[error("remote internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a business error
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Business(RemoteError::new(code, message))
    }

    /// Create an unknown method error
    pub fn unknown_method(plugin: impl Into<String>, method: impl Into<String>) -> Self {
        BridgeError::UnknownMethod {
            plugin: plugin.into(),
            method: method.into(),
        }
    }

    /// Check if the plugin was unreachable rather than failing on its own
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport(_))
    }

    /// Check if the implementation itself reported this failure
    pub fn is_business(&self) -> bool {
        matches!(self, BridgeError::Business(_))
    }

    /// Check if this error leaves the client unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Handshake(_)
                | BridgeError::Launch { .. }
                | BridgeError::Security(_)
                | BridgeError::Transport(TransportError::Closed)
        )
    }

    /// The carried business error, if any
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            BridgeError::Business(remote) => Some(remote),
            _ => None,
        }
    }

    /// Convert into the wire form sent back to the host
    pub fn to_wire(&self) -> CallError {
        let (kind, code, message) = match self {
            BridgeError::Business(remote) => (
                ErrorKind::Business,
                remote.code.clone(),
                remote.message.clone(),
            ),
            BridgeError::UnknownPlugin(name) => {
                (ErrorKind::UnknownPlugin, String::new(), name.clone())
            }
            BridgeError::UnknownMethod { plugin, method } => {
                (ErrorKind::UnknownMethod, plugin.clone(), method.clone())
            }
            BridgeError::Codec(message) => (ErrorKind::Codec, String::new(), message.clone()),
            other => (ErrorKind::Internal, String::new(), other.to_string()),
        };

        let mut error = CallError {
            kind: 0,
            code,
            message,
        };
        error.set_kind(kind);
        error
    }

    /// Rebuild an error received from the plugin
    pub fn from_wire(error: CallError) -> Self {
        match error.kind() {
            ErrorKind::Business => BridgeError::Business(RemoteError {
                code: error.code,
                message: error.message,
            }),
            ErrorKind::UnknownPlugin => BridgeError::UnknownPlugin(error.message),
            ErrorKind::UnknownMethod => BridgeError::UnknownMethod {
                plugin: error.code,
                method: error.message,
            },
            ErrorKind::Codec => BridgeError::Codec(error.message),
            ErrorKind::Internal | ErrorKind::Unspecified => BridgeError::Internal(error.message),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

/// Specialized Result type for bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Specialized Result type for transport plumbing
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = BridgeError::business("not_found", "missing key");
        assert!(err.is_business());
        assert!(!err.is_transport());
        assert!(!err.is_fatal());

        let err = BridgeError::Transport(TransportError::Closed);
        assert!(err.is_transport());
        assert!(err.is_fatal());

        let err = BridgeError::Transport(TransportError::Timeout { timeout_ms: 10 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_business_error_survives_wire() {
        let err = BridgeError::business("not_found", "key \"a\" does not exist");
        let rebuilt = BridgeError::from_wire(err.to_wire());

        assert_eq!(
            rebuilt.remote(),
            Some(&RemoteError::new("not_found", "key \"a\" does not exist"))
        );
    }

    #[test]
    fn test_unknown_names_survive_wire() {
        let rebuilt = BridgeError::from_wire(BridgeError::UnknownPlugin("kv".into()).to_wire());
        assert!(matches!(rebuilt, BridgeError::UnknownPlugin(ref name) if name == "kv"));

        let rebuilt = BridgeError::from_wire(BridgeError::unknown_method("kv", "Scan").to_wire());
        assert!(matches!(
            rebuilt,
            BridgeError::UnknownMethod { ref plugin, ref method } if plugin == "kv" && method == "Scan"
        ));
    }

    #[test]
    fn test_internal_errors_collapse_to_message() {
        let err = BridgeError::Unbound("greeter".into());
        let rebuilt = BridgeError::from_wire(err.to_wire());
        assert!(matches!(rebuilt, BridgeError::Internal(ref msg) if msg.contains("greeter")));
    }

    #[test]
    fn test_exited_early_includes_stderr() {
        let err = HandshakeError::ExitedEarly {
            status: "exit status: 1".into(),
            stderr: vec!["this binary is a plugin".into()],
        };
        assert!(err.to_string().contains("this binary is a plugin"));
    }
}
