//! The key/value interface
//!
//! Store failures cross the bridge as business errors with a stable code, so
//! the host can tell a missing key from a dead plugin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use plugbridge::{
    BridgeError, BridgeResult, Broker, Call, CallChannel, Plugin, ServerAdapter, reply,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Name the store is registered under
pub const NAME: &str = "kv";

/// Longest key the store accepts
pub const MAX_KEY_LEN: usize = 256;

/// Store failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    /// No value under this key
    #[error("key {0:?} not found")]
    NotFound(String),

    /// Key is empty or too long
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl KvError {
    /// Stable code carried on the wire
    pub fn code(&self) -> &'static str {
        match self {
            KvError::NotFound(_) => "not_found",
            KvError::InvalidKey(_) => "invalid_key",
        }
    }
}

impl From<KvError> for BridgeError {
    fn from(e: KvError) -> Self {
        BridgeError::business(e.code(), e.to_string())
    }
}

/// A key/value store
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Store `value` under `key`
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Read the value under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;
}

/// In-memory store with optional artificial latency
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    latency: Duration,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn check_key(key: &str) -> Result<(), KvError> {
    if key.is_empty() {
        return Err(KvError::InvalidKey("empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(KvError::InvalidKey(format!(
            "longer than {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        check_key(key)?;
        self.delay().await;
        debug!(key, len = value.len(), "put");
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        check_key(key)?;
        self.delay().await;
        self.values
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PutArgs {
    key: String,
    value: Vec<u8>,
}

struct KvServer {
    store: Arc<dyn KvStore>,
}

#[async_trait]
impl ServerAdapter for KvServer {
    async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>> {
        match call.method.as_str() {
            "Put" => {
                let args: PutArgs = call.args()?;
                self.store.put(&args.key, args.value).await?;
                reply(&())
            }
            "Get" => {
                let key: String = call.args()?;
                reply(&self.store.get(&key).await?)
            }
            _ => Err(call.unknown_method()),
        }
    }
}

/// Host side store
#[derive(Debug, Clone)]
pub struct KvClient {
    channel: CallChannel,
}

impl KvClient {
    /// Store `value` under `key`
    pub async fn put(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        let args = PutArgs {
            key: key.to_string(),
            value: value.to_vec(),
        };
        self.channel.call("Put", &args).await
    }

    /// Read the value under `key`
    pub async fn get(&self, key: &str) -> BridgeResult<Vec<u8>> {
        self.channel.call("Get", key).await
    }
}

/// Whether an error means the key was missing
pub fn is_not_found(error: &BridgeError) -> bool {
    error.remote().is_some_and(|r| r.code == "not_found")
}

/// Adapter pair for the store
#[derive(Clone, Default)]
pub struct KvPlugin {
    store: Option<Arc<dyn KvStore>>,
}

impl KvPlugin {
    /// Registration for the host
    pub fn host() -> Self {
        Self { store: None }
    }

    /// Registration for the plugin process
    pub fn serving(store: impl KvStore) -> Self {
        Self {
            store: Some(Arc::new(store)),
        }
    }
}

impl Plugin for KvPlugin {
    type Client = KvClient;

    fn server(&self, _broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
        match &self.store {
            Some(store) => Ok(Arc::new(KvServer {
                store: store.clone(),
            })),
            None => Err(BridgeError::Unbound(NAME.to_string())),
        }
    }

    fn client(&self, channel: CallChannel, _broker: &Broker) -> KvClient {
        KvClient { channel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbridge::LocalInvoker;

    fn local_client(store: MemoryStore) -> BridgeResult<KvClient> {
        let plugin = KvPlugin::serving(store);
        let adapter = plugin.server(&Broker::detached())?;
        let channel = CallChannel::new(NAME, Arc::new(LocalInvoker::new(adapter)));
        Ok(plugin.client(channel, &Broker::detached()))
    }

    #[tokio::test]
    async fn test_put_then_get() -> BridgeResult<()> {
        let kv = local_client(MemoryStore::new())?;
        kv.put("a", &[1, 2, 3]).await?;
        assert_eq!(kv.get("a").await?, vec![1, 2, 3]);

        kv.put("a", &[]).await?;
        assert!(kv.get("a").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_key_is_business_error() -> BridgeResult<()> {
        let kv = local_client(MemoryStore::new())?;
        let err = kv.get("missing").await;
        assert!(matches!(err, Err(ref e) if is_not_found(e)));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_key() -> BridgeResult<()> {
        let kv = local_client(MemoryStore::new())?;
        let err = kv.put("", &[1]).await;
        assert!(matches!(
            err,
            Err(BridgeError::Business(ref r)) if r.code == "invalid_key"
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() -> BridgeResult<()> {
        let kv = local_client(MemoryStore::new().with_latency(Duration::from_secs(3)))?;
        let started = tokio::time::Instant::now();
        kv.put("k", &[9]).await?;
        assert!(started.elapsed() >= Duration::from_secs(3));
        Ok(())
    }
}
