//! Extra connections between host and plugin
//!
//! One side calls [`Broker::accept`] with an id it obtained from
//! [`Broker::next_id`] and hands the id to its peer in a normal call. The
//! peer calls [`Broker::dial`] with the same id. The accepting side binds a
//! fresh listener and announces its address over the main transport; the
//! dialling side waits for that announcement and connects.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use plugbridge_proto::ConnInfo;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult, TransportError};
use crate::handshake::Network;
use crate::transport::{Connection, ListenOptions, Listener, connect, duration_ms};

/// How long a dial waits for the peer's announcement
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

enum Slot {
    Arrived(ConnInfo),
    Waiting(oneshot::Sender<ConnInfo>),
}

struct BrokerInner {
    next_id: AtomicU32,
    outbound: mpsc::UnboundedSender<ConnInfo>,
    inbox: Mutex<HashMap<u32, Slot>>,
    listen: ListenOptions,
    timeout: Duration,
    closed: AtomicBool,
}

/// Handle for opening extra connections to the peer
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker and the stream of announcements to send to the peer
    pub fn new(listen: ListenOptions) -> (Self, mpsc::UnboundedReceiver<ConnInfo>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let broker = Self {
            inner: Arc::new(BrokerInner {
                next_id: AtomicU32::new(0),
                outbound,
                inbox: Mutex::new(HashMap::new()),
                listen,
                timeout: DEFAULT_DIAL_TIMEOUT,
                closed: AtomicBool::new(false),
            }),
        };
        (broker, rx)
    }

    /// A broker with no peer; `accept` and `dial` fail
    pub fn detached() -> Self {
        let (broker, _) = Self::new(ListenOptions::default());
        broker.close();
        broker
    }

    /// Reserve a connection id
    pub fn next_id(&self) -> u32 {
        self.inner
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Listen for the peer to dial `id`
    pub async fn accept(&self, id: u32) -> BridgeResult<Connection> {
        self.ensure_open()?;

        let listener = Listener::bind(&self.inner.listen).await?;
        let info = ConnInfo {
            service_id: id,
            network: listener.network().to_string(),
            address: listener.address()?,
        };
        debug!(id, address = %info.address, "broker accepting");
        self.inner
            .outbound
            .send(info)
            .map_err(|_closed| TransportError::Closed)?;

        let timeout = self.inner.timeout;
        tokio::time::timeout(timeout, listener.accept())
            .await
            .map_err(|_elapsed| TransportError::Timeout {
                timeout_ms: duration_ms(timeout),
            })?
            .map_err(BridgeError::from)
    }

    /// Connect to the peer's listener for `id`
    pub async fn dial(&self, id: u32) -> BridgeResult<Connection> {
        self.ensure_open()?;

        let info = self.wait_for(id).await?;
        let network = Network::from_str(&info.network).map_err(|e| {
            TransportError::DecodingFailed(format!("broker announcement for {id}: {e}"))
        })?;
        debug!(id, address = %info.address, "broker dialling");
        Ok(connect(network, &info.address, self.inner.timeout).await?)
    }

    async fn wait_for(&self, id: u32) -> BridgeResult<ConnInfo> {
        let rx = {
            let mut inbox = self.inner.inbox.lock();
            if let Some(Slot::Arrived(info)) = inbox.remove(&id) {
                return Ok(info);
            }
            let (tx, rx) = oneshot::channel();
            inbox.insert(id, Slot::Waiting(tx));
            rx
        };

        let timeout = self.inner.timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_dropped)) => Err(TransportError::Closed.into()),
            Err(_elapsed) => {
                self.inner.inbox.lock().remove(&id);
                Err(TransportError::Timeout {
                    timeout_ms: duration_ms(timeout),
                }
                .into())
            }
        }
    }

    /// Record an announcement received from the peer
    pub fn deliver(&self, info: ConnInfo) {
        if self.is_closed() {
            return;
        }

        let id = info.service_id;
        let mut inbox = self.inner.inbox.lock();
        match inbox.remove(&id) {
            Some(Slot::Waiting(tx)) => {
                if let Err(info) = tx.send(info) {
                    inbox.insert(id, Slot::Arrived(info));
                }
            }
            Some(Slot::Arrived(_)) => {
                warn!(id, "duplicate broker announcement, keeping the latest");
                inbox.insert(id, Slot::Arrived(info));
            }
            None => {
                inbox.insert(id, Slot::Arrived(info));
            }
        }
    }

    /// Fail pending and future dials
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.inbox.lock().clear();
    }

    /// Whether the broker has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("network", &self.inner.listen.network)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Two brokers whose announcements are forwarded to each other
    fn linked_pair() -> (Broker, Broker) {
        let (a, mut a_out) = Broker::new(ListenOptions::new(Network::Tcp));
        let (b, mut b_out) = Broker::new(ListenOptions::new(Network::Tcp));

        let b_in = b.clone();
        tokio::spawn(async move {
            while let Some(info) = a_out.recv().await {
                b_in.deliver(info);
            }
        });
        let a_in = a.clone();
        tokio::spawn(async move {
            while let Some(info) = b_out.recv().await {
                a_in.deliver(info);
            }
        });
        (a, b)
    }

    #[tokio::test]
    async fn test_accept_and_dial() -> BridgeResult<()> {
        let (host, plugin) = linked_pair();
        let id = host.next_id();

        let accept = tokio::spawn({
            let host = host.clone();
            async move {
                let mut conn = host.accept(id).await?;
                conn.write_all(b"stream").await.map_err(TransportError::from)?;
                BridgeResult::Ok(())
            }
        });

        let mut conn = plugin.dial(id).await?;
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf)
            .await
            .map_err(TransportError::from)?;
        assert_eq!(&buf, b"stream");

        accept
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))??;
        Ok(())
    }

    #[test]
    fn test_ids_are_unique() {
        let (broker, _rx) = Broker::new(ListenOptions::default());
        let a = broker.next_id();
        let b = broker.next_id();
        assert_ne!(a, b);
        assert_eq!(a, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_times_out_without_announcement() {
        let (broker, _rx) = Broker::new(ListenOptions::default());
        let err = broker.dial(7).await;
        assert!(matches!(
            err,
            Err(BridgeError::Transport(TransportError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_close_fails_waiting_dial() {
        let (broker, _rx) = Broker::new(ListenOptions::default());
        let waiter = tokio::spawn({
            let broker = broker.clone();
            async move { broker.dial(3).await }
        });
        tokio::task::yield_now().await;
        broker.close();

        let result = waiter.await;
        assert!(matches!(
            result,
            Ok(Err(BridgeError::Transport(TransportError::Closed)))
        ));
        assert!(Broker::detached().is_closed());
    }
}
