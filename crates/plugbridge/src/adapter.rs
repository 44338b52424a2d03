//! Client and server halves of a plugin interface
//!
//! A business interface crosses the bridge through two pieces written once
//! and compiled into both binaries:
//!
//! - a [`ServerAdapter`] in the plugin that decodes a [`Call`], runs the real
//!   implementation and encodes the result
//! - a client type on the host that holds a [`CallChannel`] and turns each
//!   method into [`CallChannel::call`]
//!
//! Failures the implementation reports travel back as data and surface as
//! [`BridgeError::Business`] on the host.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::codec::{decode_payload, encode_payload};
use crate::error::{BridgeError, BridgeResult, TransportError};

/// A single remote method invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Registered plugin name
    pub plugin: String,
    /// Method name within the plugin's interface
    pub method: String,
    /// JSON encoded arguments
    pub payload: Vec<u8>,
}

impl Call {
    /// Create a call
    pub fn new(plugin: impl Into<String>, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            plugin: plugin.into(),
            method: method.into(),
            payload,
        }
    }

    /// Decode the arguments
    pub fn args<A: DeserializeOwned>(&self) -> BridgeResult<A> {
        decode_payload(&self.payload)
    }

    /// Error for a method this adapter does not implement
    pub fn unknown_method(&self) -> BridgeError {
        BridgeError::unknown_method(&self.plugin, &self.method)
    }
}

/// Encode a method result for the reply
pub fn reply<R: Serialize + ?Sized>(value: &R) -> BridgeResult<Vec<u8>> {
    encode_payload(value)
}

/// Plugin side dispatcher for one registered interface
#[async_trait]
pub trait ServerAdapter: Send + Sync + 'static {
    /// Run the named method against the bound implementation
    ///
    /// Returns the encoded result, or the failure to send back. Unknown
    /// methods must be reported with [`Call::unknown_method`].
    async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>>;
}

/// Host side sender of calls, implemented by each transport
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    /// Send a call and wait for its single response
    async fn invoke(&self, call: Call) -> BridgeResult<Vec<u8>>;

    /// Whether the underlying connection is gone
    fn is_closed(&self) -> bool;
}

/// Handle a dispensed client uses to reach its server adapter
#[derive(Clone)]
pub struct CallChannel {
    plugin: Arc<str>,
    invoker: Arc<dyn Invoker>,
    timeout: Option<Duration>,
}

impl CallChannel {
    /// Create a channel for one plugin name
    pub fn new(plugin: impl Into<Arc<str>>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            plugin: plugin.into(),
            invoker,
            timeout: None,
        }
    }

    /// Bound every call on this channel
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Plugin name calls are addressed to
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Whether the transport behind this channel is gone
    pub fn is_closed(&self) -> bool {
        self.invoker.is_closed()
    }

    /// Call a method with typed arguments and result
    pub async fn call<A, R>(&self, method: &str, args: &A) -> BridgeResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = encode_payload(args)?;
        let bytes = self.call_raw(method, payload).await?;
        decode_payload(&bytes)
    }

    /// Call a method with pre-encoded arguments
    pub async fn call_raw(&self, method: &str, payload: Vec<u8>) -> BridgeResult<Vec<u8>> {
        if self.invoker.is_closed() {
            return Err(TransportError::Closed.into());
        }

        trace!(plugin = %self.plugin, method, "invoking remote method");
        let call = Call::new(self.plugin.as_ref(), method, payload);
        match self.timeout {
            None => self.invoker.invoke(call).await,
            Some(timeout) => tokio::time::timeout(timeout, self.invoker.invoke(call))
                .await
                .map_err(|_elapsed| TransportError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })?,
        }
    }
}

impl fmt::Debug for CallChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallChannel")
            .field("plugin", &self.plugin)
            .field("closed", &self.invoker.is_closed())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Invoker that dispatches straight into a server adapter in this process
///
/// Useful for exercising an adapter pair without a second process.
pub struct LocalInvoker {
    adapter: Arc<dyn ServerAdapter>,
}

impl LocalInvoker {
    /// Wrap a server adapter
    pub fn new(adapter: Arc<dyn ServerAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, call: Call) -> BridgeResult<Vec<u8>> {
        // Round-trip the error through its wire form so local and remote
        // callers see the same variants.
        self.adapter
            .dispatch(&call)
            .await
            .map_err(|e| BridgeError::from_wire(e.to_wire()))
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServerAdapter for Counter {
        async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>> {
            match call.method.as_str() {
                "Add" => {
                    let (a, b): (i64, i64) = call.args()?;
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    reply(&(a + b))
                }
                "Fail" => Err(BridgeError::business("boom", "it broke")),
                "Sleep" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    reply(&())
                }
                _ => Err(call.unknown_method()),
            }
        }
    }

    fn channel() -> (CallChannel, Arc<Counter>) {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        let invoker = Arc::new(LocalInvoker::new(counter.clone()));
        (CallChannel::new("counter", invoker), counter)
    }

    #[tokio::test]
    async fn test_typed_call_round_trip() -> BridgeResult<()> {
        let (channel, counter) = channel();
        let sum: i64 = channel.call("Add", &(2, 40)).await?;
        assert_eq!(sum, 42);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_business_error_distinguished() {
        let (channel, _) = channel();
        let err = channel.call::<_, ()>("Fail", &()).await;
        match err {
            Err(BridgeError::Business(remote)) => {
                assert_eq!(remote.code, "boom");
                assert_eq!(remote.message, "it broke");
            }
            other => panic!("expected business error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (channel, _) = channel();
        let err = channel.call::<_, ()>("Nope", &()).await;
        assert!(matches!(err, Err(BridgeError::UnknownMethod { .. })));
    }

    #[tokio::test]
    async fn test_bad_arguments_are_codec_errors() {
        let (channel, counter) = channel();
        let err = channel.call::<_, i64>("Add", &"not a tuple").await;
        assert!(matches!(err, Err(BridgeError::Codec(_))));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let (channel, _) = channel();
        let channel = channel.with_timeout(Some(Duration::from_millis(50)));
        let err = channel.call::<_, ()>("Sleep", &()).await;
        assert!(matches!(
            err,
            Err(BridgeError::Transport(TransportError::Timeout { timeout_ms: 50 }))
        ));
    }
}
