//! Plugin side serve loop
//!
//! A plugin binary builds a [`ServeConfig`] with the same handshake and plugin
//! names as its host and calls [`serve`]. That checks the magic cookie,
//! negotiates the protocol version, binds a listener, prints the handshake
//! line and serves calls until the host disconnects, asks it to shut down or
//! the process is terminated.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use plugbridge_proto::ConnInfo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapter::{Call, ServerAdapter, reply};
use crate::broker::Broker;
use crate::error::{BridgeResult, TransportError};
use crate::handshake::{
    CORE_PROTOCOL_VERSION, HandshakeConfig, HandshakeLine, Network, PluginEnv, Protocol,
    negotiate_version,
};
use crate::registry::{PluginSet, VersionedPlugins};
use crate::transport::netrpc::{self, CONTROL_PLUGIN, control_methods};
use crate::transport::{CloseSignal, ConnectionTracker, ListenOptions, Listener, grpc};

/// How long a stopping netrpc connection waits for in-flight calls
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Configured, nothing bound
    Created,
    /// Listener bound, handshake line available
    Listening,
    /// Serving calls
    Serving,
    /// Stopped
    Stopped,
}

/// Serving options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeOptions {
    /// Protocol to serve
    pub protocol: Protocol,
    /// Socket family to listen on
    pub network: Network,
    /// Stop once the host's last connection closes
    pub exit_on_disconnect: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::NetRpc,
            network: Network::platform_default(),
            exit_on_disconnect: true,
        }
    }
}

/// Everything a plugin process serves
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Handshake shared with the host
    pub handshake: HandshakeConfig,
    /// Plugins served at `handshake.protocol_version`
    pub plugins: PluginSet,
    /// Plugins per protocol version; takes precedence over `plugins`
    pub versioned_plugins: VersionedPlugins,
    /// Serving options
    pub options: ServeOptions,
}

impl ServeConfig {
    /// Serve a single plugin set at the handshake's protocol version
    pub fn new(handshake: HandshakeConfig, plugins: PluginSet) -> Self {
        Self {
            handshake,
            plugins,
            versioned_plugins: VersionedPlugins::new(),
            options: ServeOptions::default(),
        }
    }

    /// Serve different plugin sets per protocol version
    pub fn with_versioned_plugins(mut self, versioned_plugins: VersionedPlugins) -> Self {
        self.versioned_plugins = versioned_plugins;
        self
    }

    /// Set the protocol
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.options.protocol = protocol;
        self
    }

    /// Set the socket family
    pub fn with_network(mut self, network: Network) -> Self {
        self.options.network = network;
        self
    }

    /// Keep serving after the host disconnects
    pub fn with_exit_on_disconnect(mut self, exit_on_disconnect: bool) -> Self {
        self.options.exit_on_disconnect = exit_on_disconnect;
        self
    }

    /// Pick the protocol version and plugin set for the host's advertised versions
    ///
    /// Falls back to the default version when nothing overlaps; the host
    /// rejects that during its handshake check.
    pub fn negotiate(&self, env: &PluginEnv) -> (u32, PluginSet) {
        let host_versions = env.protocol_versions();
        let default_version = self.handshake.protocol_version;

        if self.versioned_plugins.is_empty() {
            return (default_version, self.plugins.clone());
        }

        let ours: Vec<u32> = self.versioned_plugins.keys().copied().collect();
        if let Some(version) = negotiate_version(&host_versions, &ours)
            && let Some(plugins) = self.versioned_plugins.get(&version)
        {
            return (version, plugins.clone());
        }

        let plugins = self
            .versioned_plugins
            .get(&default_version)
            .cloned()
            .unwrap_or_else(|| self.plugins.clone());
        (default_version, plugins)
    }
}

/// Routes calls to server adapters and handles control requests
pub(crate) struct Dispatcher {
    plugins: PluginSet,
    broker: Broker,
    broker_outbound: Mutex<Option<mpsc::UnboundedReceiver<ConnInfo>>>,
    adapters: Mutex<HashMap<String, Arc<dyn ServerAdapter>>>,
    stop: CloseSignal,
}

impl Dispatcher {
    fn new(
        plugins: PluginSet,
        broker: Broker,
        broker_outbound: mpsc::UnboundedReceiver<ConnInfo>,
    ) -> Self {
        Self {
            plugins,
            broker,
            broker_outbound: Mutex::new(Some(broker_outbound)),
            adapters: Mutex::new(HashMap::new()),
            stop: CloseSignal::new(),
        }
    }

    fn adapter(&self, name: &str) -> BridgeResult<Arc<dyn ServerAdapter>> {
        if let Some(adapter) = self.adapters.lock().get(name) {
            return Ok(adapter.clone());
        }

        let adapter = self.plugins.server_for(name, &self.broker)?;
        let mut adapters = self.adapters.lock();
        Ok(adapters.entry(name.to_string()).or_insert(adapter).clone())
    }

    /// Check `name` is served and its adapter can be built
    pub(crate) fn dispense(&self, name: &str) -> BridgeResult<()> {
        self.adapter(name).map(|_| ())
    }

    /// Stop serving
    pub(crate) fn shutdown(&self) {
        if self.stop.close() {
            info!("plugin shutdown requested by host");
        }
    }

    /// Route one call
    pub(crate) async fn handle(&self, call: Call) -> BridgeResult<Vec<u8>> {
        if call.plugin == CONTROL_PLUGIN {
            return self.control(&call);
        }

        let adapter = self.adapter(&call.plugin)?;
        debug!(plugin = %call.plugin, method = %call.method, "dispatching call");
        adapter.dispatch(&call).await
    }

    fn control(&self, call: &Call) -> BridgeResult<Vec<u8>> {
        match call.method.as_str() {
            control_methods::DISPENSE => {
                let name: String = call.args()?;
                self.dispense(&name)?;
                reply(&())
            }
            control_methods::PING => reply(&()),
            control_methods::SHUTDOWN => {
                self.shutdown();
                reply(&())
            }
            _ => Err(call.unknown_method()),
        }
    }

    pub(crate) fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Announcements for the peer; only the first connection gets them
    pub(crate) fn take_broker_outbound(&self) -> Option<mpsc::UnboundedReceiver<ConnInfo>> {
        self.broker_outbound.lock().take()
    }

    pub(crate) fn stop_signal(&self) -> CloseSignal {
        self.stop.clone()
    }
}

/// A bound plugin server
pub struct PluginServer {
    listener: Listener,
    line: HandshakeLine,
    dispatcher: Arc<Dispatcher>,
    options: ServeOptions,
    state: Arc<Mutex<ServerState>>,
}

impl PluginServer {
    /// Check the cookie, negotiate a version and bind the listener
    pub async fn bind(config: ServeConfig, env: &PluginEnv) -> BridgeResult<Self> {
        config.handshake.validate()?;
        config.handshake.check_cookie(env)?;

        let (protocol_version, plugins) = config.negotiate(env);
        let listen = ListenOptions::from_env(config.options.network, env);
        let listener = Listener::bind(&listen).await?;

        let line = HandshakeLine {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version,
            network: listener.network(),
            address: listener.address()?,
            protocol: config.options.protocol,
            server_cert: None,
        };

        let (broker, outbound) = Broker::new(listen);
        info!(
            protocol = %line.protocol,
            protocol_version,
            address = %line.address,
            plugins = ?plugins,
            "plugin server listening"
        );

        Ok(Self {
            listener,
            line,
            dispatcher: Arc::new(Dispatcher::new(plugins, broker, outbound)),
            options: config.options,
            state: Arc::new(Mutex::new(ServerState::Listening)),
        })
    }

    /// The line to print for the host
    pub fn handshake_line(&self) -> &HandshakeLine {
        &self.line
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Shared view of the state that outlives `run`
    pub fn state_handle(&self) -> Arc<Mutex<ServerState>> {
        self.state.clone()
    }

    /// Signal that stops the server when closed
    pub fn stop_signal(&self) -> CloseSignal {
        self.dispatcher.stop_signal()
    }

    /// Serve until stopped
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> BridgeResult<()> {
        let Self {
            listener,
            dispatcher,
            options,
            state,
            ..
        } = self;
        *state.lock() = ServerState::Serving;

        let stop = dispatcher.stop_signal();
        let tracker = ConnectionTracker::new();

        let watch = {
            let stop = stop.clone();
            let tracker = tracker.clone();
            async move {
                let disconnected = async {
                    if options.exit_on_disconnect {
                        tracker.idle().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                };
                tokio::select! {
                    () = shutdown => info!("plugin server shutting down"),
                    () = disconnected => info!("host disconnected"),
                    () = stop.closed() => {}
                }
                stop.close();
            }
        };

        let serving = async {
            match options.protocol {
                Protocol::NetRpc => serve_netrpc(listener, dispatcher.clone(), tracker.clone()).await,
                Protocol::Grpc => grpc::serve(listener, dispatcher.clone(), tracker.clone()).await,
            }
        };

        let (result, ()) = tokio::join!(serving, watch);
        dispatcher.broker().close();
        *state.lock() = ServerState::Stopped;
        info!("plugin server stopped");
        result
    }
}

async fn serve_netrpc(
    listener: Listener,
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
) -> BridgeResult<()> {
    let stop = dispatcher.stop_signal();
    let mut connections = JoinSet::new();

    let result = loop {
        let accepted = tokio::select! {
            () = stop.closed() => break Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                debug!("host connected");
                let conn = conn.tracked(&tracker);
                connections.spawn(netrpc::serve_connection(conn, dispatcher.clone(), DRAIN_TIMEOUT));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                stop.close();
                break Err(e.into());
            }
        }
    };

    while connections.join_next().await.is_some() {}
    result
}

/// Serve from a plugin binary's `main`
///
/// Reads the process environment, prints the handshake line on stdout and
/// serves until the host disconnects or asks to stop, or SIGTERM arrives.
/// Interrupts are ignored since the host owns the plugin's lifetime. Returns
/// an error without printing a handshake line when the magic cookie is
/// missing, which is the case when the binary is run by hand.
pub async fn serve(config: ServeConfig) -> BridgeResult<()> {
    let env = PluginEnv::from_process();
    let server = PluginServer::bind(config, &env).await?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", server.handshake_line()).map_err(TransportError::from)?;
        stdout.flush().map_err(TransportError::from)?;
    }

    server.run(termination()).await
}

async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = term.recv() => return,
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        let _ = term.recv().await;
                        return;
                    }
                    debug!("ignoring interrupt, the host manages this plugin");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
