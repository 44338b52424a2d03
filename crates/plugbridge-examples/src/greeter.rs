//! The greeter interface

use std::sync::Arc;

use async_trait::async_trait;
use plugbridge::{
    BridgeError, BridgeResult, Broker, Call, CallChannel, Plugin, ServerAdapter, reply,
};

/// Name the greeter is registered under
pub const NAME: &str = "greeter";

/// Something that greets
pub trait Greeter: Send + Sync + 'static {
    /// Produce a greeting
    fn greet(&self) -> String;
}

/// The greeting the example plugin serves
#[derive(Debug, Clone, Copy, Default)]
pub struct Hello;

impl Greeter for Hello {
    fn greet(&self) -> String {
        "Hello!".to_string()
    }
}

struct GreeterServer {
    imp: Arc<dyn Greeter>,
}

#[async_trait]
impl ServerAdapter for GreeterServer {
    async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>> {
        match call.method.as_str() {
            "Greet" => reply(&self.imp.greet()),
            _ => Err(call.unknown_method()),
        }
    }
}

/// Host side greeter
#[derive(Debug, Clone)]
pub struct GreeterClient {
    channel: CallChannel,
}

impl GreeterClient {
    /// Ask the plugin for a greeting
    pub async fn greet(&self) -> BridgeResult<String> {
        self.channel.call("Greet", &()).await
    }
}

/// Adapter pair for the greeter
#[derive(Clone, Default)]
pub struct GreeterPlugin {
    imp: Option<Arc<dyn Greeter>>,
}

impl GreeterPlugin {
    /// Registration for the host, which only needs the client half
    pub fn host() -> Self {
        Self { imp: None }
    }

    /// Registration for the plugin process with its implementation
    pub fn serving(imp: impl Greeter) -> Self {
        Self {
            imp: Some(Arc::new(imp)),
        }
    }
}

impl Plugin for GreeterPlugin {
    type Client = GreeterClient;

    fn server(&self, _broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
        match &self.imp {
            Some(imp) => Ok(Arc::new(GreeterServer { imp: imp.clone() })),
            None => Err(BridgeError::Unbound(NAME.to_string())),
        }
    }

    fn client(&self, channel: CallChannel, _broker: &Broker) -> GreeterClient {
        GreeterClient { channel }
    }
}
