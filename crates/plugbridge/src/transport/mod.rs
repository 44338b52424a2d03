//! Transports between host and plugin
//!
//! Both protocols share the socket plumbing here: a [`Listener`] the plugin
//! (or a broker) binds, the [`Connection`] it yields, and [`connect`] for
//! the dialling side. The host drives either protocol through
//! [`ClientProtocol`].

pub mod grpc;
pub mod netrpc;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::debug;

use crate::adapter::Invoker;
use crate::broker::Broker;
use crate::error::{BridgeResult, TransportError, TransportResult};
use crate::handshake::{ENV_MAX_PORT, ENV_MIN_PORT, ENV_UNIX_SOCKET_DIR, Network, PluginEnv, Protocol};

/// Port range used when only one bound is configured
const DEFAULT_MIN_PORT: u16 = 10000;
const DEFAULT_MAX_PORT: u16 = 25000;

/// Where and how to listen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenOptions {
    /// Socket family
    pub network: Network,
    /// Lowest TCP port to try
    pub min_port: Option<u16>,
    /// Highest TCP port to try
    pub max_port: Option<u16>,
    /// Directory for unix sockets, the system temp dir when unset
    pub socket_dir: Option<PathBuf>,
}

impl ListenOptions {
    /// Options for a socket family with defaults for everything else
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Read the port range and socket dir the host passed in
    pub fn from_env(network: Network, env: &PluginEnv) -> Self {
        Self {
            network,
            min_port: env.port(ENV_MIN_PORT),
            max_port: env.port(ENV_MAX_PORT),
            socket_dir: env.get(ENV_UNIX_SOCKET_DIR).map(PathBuf::from),
        }
    }

    /// Restrict TCP listeners to a port range
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = Some(min);
        self.max_port = Some(max);
        self
    }

    /// Place unix sockets in a directory
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }
}

/// A bound endpoint waiting for connections
#[derive(Debug)]
pub enum Listener {
    /// Loopback TCP listener
    Tcp(TcpListener),
    /// Unix socket listener, the socket file is removed on drop
    #[cfg(unix)]
    Unix {
        /// Listener
        listener: UnixListener,
        /// Socket path
        path: PathBuf,
    },
}

impl Listener {
    /// Bind according to the options
    pub async fn bind(options: &ListenOptions) -> TransportResult<Self> {
        match options.network {
            Network::Tcp => Self::bind_tcp(options).await.map(Listener::Tcp),
            #[cfg(unix)]
            Network::Unix => {
                let dir = options
                    .socket_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                let path = dir.join(format!("plugin-{}.sock", uuid::Uuid::new_v4().simple()));
                let listener = UnixListener::bind(&path)?;
                debug!(path = %path.display(), "bound unix listener");
                Ok(Listener::Unix { listener, path })
            }
            #[cfg(not(unix))]
            Network::Unix => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
        }
    }

    async fn bind_tcp(options: &ListenOptions) -> TransportResult<TcpListener> {
        if options.min_port.is_none() && options.max_port.is_none() {
            return Ok(TcpListener::bind(("127.0.0.1", 0)).await?);
        }

        let min = options.min_port.unwrap_or(DEFAULT_MIN_PORT);
        let max = options.max_port.unwrap_or(DEFAULT_MAX_PORT);
        for port in min..=max {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                return Ok(listener);
            }
        }

        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no free port in range {min}-{max}"),
        )))
    }

    /// Socket family
    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            Listener::Unix { .. } => Network::Unix,
        }
    }

    /// Address a peer should dial
    pub fn address(&self) -> TransportResult<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(path.display().to_string()),
        }
    }

    /// Wait for the next connection
    pub async fn accept(&self) -> TransportResult<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(%peer, "accepted tcp connection");
                Ok(Connection::from(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// An established duplex byte stream
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    guard: Option<ConnectionGuard>,
}

impl Connection {
    /// Count this connection in a tracker for as long as it lives
    pub fn tracked(mut self, tracker: &ConnectionTracker) -> Self {
        self.guard = Some(tracker.track());
        self
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Tcp(stream),
            guard: None,
        }
    }
}

#[cfg(unix)]
impl From<UnixStream> for Connection {
    fn from(stream: UnixStream) -> Self {
        Self {
            stream: Stream::Unix(stream),
            guard: None,
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl tonic::transport::server::Connected for Connection {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

/// Dial a listener
pub async fn connect(
    network: Network,
    address: &str,
    timeout: Duration,
) -> TransportResult<Connection> {
    let connect_err = |source: io::Error| TransportError::Connect {
        address: address.to_string(),
        source,
    };

    let attempt = async {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok::<_, io::Error>(Connection::from(stream))
            }
            #[cfg(unix)]
            Network::Unix => Ok::<_, io::Error>(Connection::from(
                UnixStream::connect(address).await?,
            )),
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result.map_err(connect_err),
        Err(_elapsed) => Err(TransportError::Timeout {
            timeout_ms: duration_ms(timeout),
        }),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackerState {
    active: usize,
    seen: bool,
}

/// Counts live connections so a server can stop when the host goes away
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: Arc<watch::Sender<TrackerState>>,
}

impl ConnectionTracker {
    /// Create a tracker with no connections
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TrackerState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    fn track(&self) -> ConnectionGuard {
        self.state.send_modify(|s| {
            s.active = s.active.saturating_add(1);
            s.seen = true;
        });
        ConnectionGuard {
            state: self.state.clone(),
        }
    }

    /// Number of live connections
    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    /// Resolve once at least one connection was seen and all have closed
    pub async fn idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.seen && s.active == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ConnectionGuard {
    state: Arc<watch::Sender<TrackerState>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state
            .send_modify(|s| s.active = s.active.saturating_sub(1));
    }
}

/// One-shot close flag shared by a transport's tasks and callers
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    /// Create an open signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close; returns true only for the call that closed it
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether it has been closed
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once closed
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Host side handle on an established transport
#[async_trait]
pub trait ClientProtocol: Send + Sync {
    /// Protocol in use
    fn protocol(&self) -> Protocol;

    /// Sender for business calls
    fn invoker(&self) -> Arc<dyn Invoker>;

    /// Broker for extra connections to the plugin
    fn broker(&self) -> Broker;

    /// Ask the plugin whether it serves `name`
    async fn dispense(&self, name: &str) -> BridgeResult<()>;

    /// Check the plugin is responsive
    async fn ping(&self) -> BridgeResult<()>;

    /// Ask the plugin to stop serving and exit
    async fn shutdown(&self) -> BridgeResult<()>;

    /// Tear the transport down; outstanding calls fail
    fn close(&self);

    /// Whether the transport is gone
    fn is_closed(&self) -> bool;
}

/// Where an already running plugin listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport protocol
    pub protocol: Protocol,
    /// Socket family
    pub network: Network,
    /// Listener address
    pub address: String,
}

/// Connect the host side of a transport
pub async fn connect_client(
    endpoint: &Endpoint,
    broker_listen: ListenOptions,
    timeout: Duration,
) -> BridgeResult<Arc<dyn ClientProtocol>> {
    match endpoint.protocol {
        Protocol::NetRpc => {
            let conn = connect(endpoint.network, &endpoint.address, timeout).await?;
            let client: Arc<dyn ClientProtocol> =
                netrpc::NetRpcClient::start(conn, broker_listen);
            Ok(client)
        }
        Protocol::Grpc => {
            let client: Arc<dyn ClientProtocol> =
                grpc::GrpcClient::connect(endpoint, broker_listen, timeout).await?;
            Ok(client)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn round_trip(options: ListenOptions) -> TransportResult<()> {
        let listener = Listener::bind(&options).await?;
        let address = listener.address()?;
        let network = listener.network();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await?;
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await?;
            conn.write_all(&buf).await?;
            TransportResult::Ok(())
        });

        let mut conn = connect(network, &address, Duration::from_secs(5)).await?;
        conn.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        server
            .await
            .map_err(|e| TransportError::Io(io::Error::other(e)))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_tcp_round_trip() -> TransportResult<()> {
        round_trip(ListenOptions::new(Network::Tcp)).await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_round_trip_and_cleanup() -> TransportResult<()> {
        let dir = tempfile::tempdir()?;
        round_trip(ListenOptions::new(Network::Unix).with_socket_dir(dir.path())).await?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await;
        let Ok(listener) = listener else { return };
        let Ok(addr) = listener.local_addr() else { return };
        drop(listener);

        let err = connect(Network::Tcp, &addr.to_string(), Duration::from_secs(5)).await;
        assert!(matches!(err, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_listen_options_from_env() {
        let env = PluginEnv::from_pairs([
            (ENV_MIN_PORT, "12000"),
            (ENV_MAX_PORT, "12010"),
            (ENV_UNIX_SOCKET_DIR, "/run/plugins"),
        ]);
        let options = ListenOptions::from_env(Network::Tcp, &env);
        assert_eq!(options.min_port, Some(12000));
        assert_eq!(options.max_port, Some(12010));
        assert_eq!(options.socket_dir, Some(PathBuf::from("/run/plugins")));
    }

    #[tokio::test]
    async fn test_tracker_idle_after_last_close() -> TransportResult<()> {
        let tracker = ConnectionTracker::new();
        let listener = Listener::bind(&ListenOptions::new(Network::Tcp)).await?;
        let address = listener.address()?;

        let client = connect(Network::Tcp, &address, Duration::from_secs(5)).await?;
        let server = listener.accept().await?.tracked(&tracker);
        assert_eq!(tracker.active(), 1);

        drop(server);
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), tracker.idle())
            .await
            .map_err(|_elapsed| TransportError::Timeout { timeout_ms: 5000 })?;
        assert_eq!(tracker.active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_signal_fires_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        signal.closed().await;
        assert!(signal.is_closed());
    }
}
