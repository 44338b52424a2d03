//! Named plugin registrations shared by host and plugin

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::{CallChannel, ServerAdapter};
use crate::broker::Broker;
use crate::error::{BridgeError, BridgeResult};

/// Prefix reserved for the bridge's own control surface
pub const RESERVED_PREFIX: &str = "plugbridge.";

/// Maximum length of a plugin name
pub const MAX_NAME_LEN: usize = 100;

/// Adapter pair factory for one business interface
///
/// The same type is registered on both sides. The plugin's instance carries
/// the real implementation and builds server adapters from it; the host's
/// instance usually carries nothing and only builds clients.
pub trait Plugin: Send + Sync + 'static {
    /// Host side client handed out by dispense
    type Client: Send + 'static;

    /// Build the server adapter for an incoming connection
    fn server(&self, broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>>;

    /// Build a client bound to the transport
    fn client(&self, channel: CallChannel, broker: &Broker) -> Self::Client;
}

trait RegisteredPlugin: Send + Sync {
    fn server(&self, broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>>;
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<P: Plugin> RegisteredPlugin for P {
    fn server(&self, broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
        Plugin::server(self, broker)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<P>()
    }
}

/// Plugin name to adapter pair mapping
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: BTreeMap<String, Arc<dyn RegisteredPlugin>>,
}

/// Plugin sets keyed by the protocol version they implement
pub type VersionedPlugins = BTreeMap<u32, PluginSet>;

impl PluginSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a plugin name
    pub fn validate_name(name: &str) -> BridgeResult<()> {
        if name.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "plugin name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_NAME_LEN {
            return Err(BridgeError::InvalidConfig(format!(
                "plugin name too long (max {MAX_NAME_LEN} characters)"
            )));
        }

        if name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
            return Err(BridgeError::InvalidConfig(format!(
                "plugin name {name:?} contains invalid characters"
            )));
        }

        if name.starts_with(RESERVED_PREFIX) {
            return Err(BridgeError::InvalidConfig(format!(
                "plugin name {name:?} uses the reserved prefix {RESERVED_PREFIX:?}"
            )));
        }

        Ok(())
    }

    /// Register an adapter pair under a unique name
    pub fn register<P: Plugin>(&mut self, name: impl Into<String>, plugin: P) -> BridgeResult<()> {
        let name = name.into();
        Self::validate_name(&name)?;

        if self.plugins.contains_key(&name) {
            return Err(BridgeError::InvalidConfig(format!(
                "plugin {name:?} is already registered"
            )));
        }

        self.plugins.insert(name, Arc::new(plugin));
        Ok(())
    }

    /// Builder form of [`PluginSet::register`]
    pub fn with<P: Plugin>(mut self, name: impl Into<String>, plugin: P) -> BridgeResult<Self> {
        self.register(name, plugin)?;
        Ok(self)
    }

    /// Look up the adapter pair registered under `name`
    pub fn lookup<P: Plugin>(&self, name: &str) -> BridgeResult<&P> {
        let entry = self
            .plugins
            .get(name)
            .ok_or_else(|| BridgeError::UnknownPlugin(name.to_string()))?;

        entry.as_any().downcast_ref::<P>().ok_or_else(|| {
            BridgeError::InvalidConfig(format!(
                "plugin {name:?} is registered as {}, not {}",
                entry.type_name(),
                std::any::type_name::<P>()
            ))
        })
    }

    /// Build the server adapter for `name`
    pub fn server_for(&self, name: &str, broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
        self.plugins
            .get(name)
            .ok_or_else(|| BridgeError::UnknownPlugin(name.to_string()))?
            .server(broker)
    }

    /// Whether a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.plugins.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Call, LocalInvoker};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ServerAdapter for Echo {
        async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>> {
            match call.method.as_str() {
                "Echo" => Ok(call.payload.clone()),
                _ => Err(call.unknown_method()),
            }
        }
    }

    struct EchoPlugin {
        bound: bool,
    }

    impl Plugin for EchoPlugin {
        type Client = CallChannel;

        fn server(&self, _broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
            if self.bound {
                Ok(Arc::new(Echo))
            } else {
                Err(BridgeError::Unbound("echo".into()))
            }
        }

        fn client(&self, channel: CallChannel, _broker: &Broker) -> Self::Client {
            channel
        }
    }

    struct Other;

    impl Plugin for Other {
        type Client = ();

        fn server(&self, _broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
            Err(BridgeError::Unbound("other".into()))
        }

        fn client(&self, _channel: CallChannel, _broker: &Broker) -> Self::Client {}
    }

    #[test]
    fn test_name_validation() {
        assert!(PluginSet::validate_name("kv").is_ok());
        assert!(PluginSet::validate_name("").is_err());
        assert!(PluginSet::validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(PluginSet::validate_name("a/b").is_err());
        assert!(PluginSet::validate_name("tab\there").is_err());
        assert!(PluginSet::validate_name("plugbridge.control").is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() -> BridgeResult<()> {
        let mut set = PluginSet::new();
        set.register("echo", EchoPlugin { bound: true })?;
        assert!(set.register("echo", EchoPlugin { bound: true }).is_err());
        assert_eq!(set.len(), 1);
        Ok(())
    }

    #[test]
    fn test_lookup_unknown_and_wrong_type() -> BridgeResult<()> {
        let set = PluginSet::new()
            .with("echo", EchoPlugin { bound: false })?
            .with("other", Other)?;

        assert!(set.lookup::<EchoPlugin>("echo").is_ok());
        assert!(matches!(
            set.lookup::<EchoPlugin>("missing"),
            Err(BridgeError::UnknownPlugin(ref n)) if n == "missing"
        ));
        assert!(matches!(
            set.lookup::<EchoPlugin>("other"),
            Err(BridgeError::InvalidConfig(_))
        ));
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["echo", "other"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_for_dispatches() -> BridgeResult<()> {
        let broker = Broker::detached();
        let set = PluginSet::new().with("echo", EchoPlugin { bound: true })?;

        let server = set.server_for("echo", &broker)?;
        let channel = set
            .lookup::<EchoPlugin>("echo")?
            .client(CallChannel::new("echo", Arc::new(LocalInvoker::new(server))), &broker);

        let out: String = channel.call("Echo", "hi").await?;
        assert_eq!(out, "hi");

        assert!(matches!(
            set.server_for("nope", &broker),
            Err(BridgeError::UnknownPlugin(_))
        ));
        Ok(())
    }

    #[test]
    fn test_host_side_registration_has_no_server() -> BridgeResult<()> {
        let set = PluginSet::new().with("echo", EchoPlugin { bound: false })?;
        assert!(matches!(
            set.server_for("echo", &Broker::detached()),
            Err(BridgeError::Unbound(_))
        ));
        Ok(())
    }
}
