//! Host side controller for one plugin process
//!
//! [`PluginClient`] launches the plugin executable (or reattaches to one that
//! is already running), reads and validates its handshake line, connects the
//! transport and hands out typed clients through [`PluginClient::dispense`].
//!
//! Lifecycle:
//!
//! ```text
//! Created -> Launching -> Handshaking -> Connected -> Dispensing
//!                              |              |            |
//!                       HandshakeFailed    Killed | Crashed
//! ```
//!
//! Dropping the last handle closes the transport and kills the process.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::adapter::CallChannel;
use crate::error::{BridgeError, BridgeResult, HandshakeError, TransportError};
use crate::handshake::{
    CORE_PROTOCOL_VERSION, ENV_MAX_PORT, ENV_MIN_PORT, ENV_PROTOCOL_VERSIONS, ENV_UNIX_SOCKET_DIR,
    HandshakeConfig, HandshakeLine, Network, Protocol, format_versions,
};
use crate::logging::forward_plugin_line;
use crate::registry::{Plugin, PluginSet, VersionedPlugins};
use crate::secure::SecureConfig;
use crate::transport::{ClientProtocol, Endpoint, ListenOptions, connect_client, duration_ms};

/// Host controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    /// Configured, nothing started
    Created,
    /// Spawning the plugin process
    Launching,
    /// Waiting for the handshake line
    Handshaking,
    /// Transport established
    Connected,
    /// At least one client handed out
    Dispensing,
    /// Torn down by [`PluginClient::kill`]
    Killed,
    /// The plugin process exited on its own
    Crashed,
    /// The plugin never completed its handshake
    HandshakeFailed,
}

impl ClientState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientState::Killed | ClientState::Crashed | ClientState::HandshakeFailed
        )
    }

    /// Whether calls can be made
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected | ClientState::Dispensing)
    }
}

/// Executable to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    /// Path to the plugin binary
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<OsString>,
    /// Extra environment on top of the inherited one
    pub env: Vec<(OsString, OsString)>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl PluginCommand {
    /// Launch `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the plugin
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn label(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Connection details for a plugin that is already running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachConfig {
    /// Transport protocol
    pub protocol: Protocol,
    /// Protocol version the plugin negotiated
    pub protocol_version: u32,
    /// Socket family
    pub network: Network,
    /// Listener address
    pub address: String,
    /// Process id, when known
    pub pid: Option<u32>,
}

impl ReattachConfig {
    /// Build from a handshake line
    pub fn from_line(line: &HandshakeLine, pid: Option<u32>) -> Self {
        Self {
            protocol: line.protocol,
            protocol_version: line.protocol_version,
            network: line.network,
            address: line.address.clone(),
            pid,
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: self.protocol,
            network: self.network,
            address: self.address.clone(),
        }
    }
}

/// Tunables for the host controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Protocols the plugin may choose
    pub allowed_protocols: Vec<Protocol>,
    /// Bound on launch, handshake and connect together
    pub start_timeout: Duration,
    /// How long to wait for a graceful exit before killing
    pub kill_timeout: Duration,
    /// Bound on each business call, unbounded when `None`
    pub call_timeout: Option<Duration>,
    /// Lowest TCP port the plugin may use
    pub min_port: Option<u16>,
    /// Highest TCP port the plugin may use
    pub max_port: Option<u16>,
    /// Directory for unix sockets on both sides
    pub unix_socket_dir: Option<PathBuf>,
    /// Tear this client down in [`cleanup_clients`]
    pub managed: bool,
    /// Stderr lines kept for error reports
    pub stderr_tail: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            allowed_protocols: vec![Protocol::NetRpc],
            start_timeout: Duration::from_secs(60),
            kill_timeout: Duration::from_secs(2),
            call_timeout: None,
            min_port: None,
            max_port: None,
            unix_socket_dir: None,
            managed: false,
            stderr_tail: 20,
        }
    }
}

/// Everything needed to run one plugin
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Handshake shared with the plugin
    pub handshake: HandshakeConfig,
    /// Plugins at `handshake.protocol_version`
    pub plugins: PluginSet,
    /// Plugins per protocol version; takes precedence over `plugins`
    pub versioned_plugins: VersionedPlugins,
    /// Executable to launch
    pub command: Option<PluginCommand>,
    /// Running plugin to connect to instead of launching
    pub reattach: Option<ReattachConfig>,
    /// Checksum to verify before launching
    pub secure: Option<SecureConfig>,
    /// Tunables
    pub options: ClientOptions,
}

impl ClientConfig {
    /// Configuration with a handshake and plugin set, nothing to run yet
    pub fn new(handshake: HandshakeConfig, plugins: PluginSet) -> Self {
        Self {
            handshake,
            plugins,
            versioned_plugins: VersionedPlugins::new(),
            command: None,
            reattach: None,
            secure: None,
            options: ClientOptions::default(),
        }
    }

    /// Launch this executable
    pub fn with_command(mut self, command: PluginCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Connect to a running plugin
    pub fn with_reattach(mut self, reattach: ReattachConfig) -> Self {
        self.reattach = Some(reattach);
        self
    }

    /// Verify the executable first
    pub fn with_secure(mut self, secure: SecureConfig) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Offer several protocol versions
    pub fn with_versioned_plugins(mut self, versioned_plugins: VersionedPlugins) -> Self {
        self.versioned_plugins = versioned_plugins;
        self
    }

    /// Replace the tunables
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Accept these protocols
    pub fn with_allowed_protocols(mut self, protocols: impl Into<Vec<Protocol>>) -> Self {
        self.options.allowed_protocols = protocols.into();
        self
    }

    /// Set the start timeout
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.options.start_timeout = timeout;
        self
    }

    /// Set the kill timeout
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.options.kill_timeout = timeout;
        self
    }

    /// Bound each business call
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.options.call_timeout = Some(timeout);
        self
    }

    /// Include in [`cleanup_clients`]
    pub fn managed(mut self) -> Self {
        self.options.managed = true;
        self
    }

    /// Protocol versions offered to the plugin, highest first
    pub fn host_versions(&self) -> Vec<u32> {
        if self.versioned_plugins.is_empty() {
            vec![self.handshake.protocol_version]
        } else {
            self.versioned_plugins.keys().rev().copied().collect()
        }
    }

    fn plugins_for(&self, version: u32) -> PluginSet {
        self.versioned_plugins
            .get(&version)
            .cloned()
            .unwrap_or_else(|| self.plugins.clone())
    }

    fn validate(&self) -> BridgeResult<()> {
        self.handshake.validate()?;

        match (&self.command, &self.reattach) {
            (Some(_), Some(_)) => Err(BridgeError::InvalidConfig(
                "only one of command and reattach may be set".to_string(),
            )),
            (None, None) => Err(BridgeError::InvalidConfig(
                "either a command or a reattach config is required".to_string(),
            )),
            _ if self.options.allowed_protocols.is_empty() => Err(BridgeError::InvalidConfig(
                "at least one protocol must be allowed".to_string(),
            )),
            _ if self.secure.is_some() && self.reattach.is_some() => {
                Err(BridgeError::InvalidConfig(
                    "a checksum cannot be verified when reattaching".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<Option<String>>,
}

impl ProcessHandle {
    fn force_kill(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    fn exit_status(&self) -> Option<String> {
        self.exited.borrow().clone()
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        matches!(
            tokio::time::timeout(timeout, exited.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        )
    }
}

struct Session {
    protocol: Arc<dyn ClientProtocol>,
    plugins: PluginSet,
    version: u32,
    endpoint: Endpoint,
    process: Option<ProcessHandle>,
}

struct Inner {
    config: ClientConfig,
    state: watch::Sender<ClientState>,
    start_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<Arc<Session>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Inner {
    /// Move to `next` unless the client already reached a terminal state
    fn advance(&self, next: ClientState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Resolve once the client is killed or otherwise finished
    async fn finished(&self) {
        let mut states = self.state.subscribe();
        let _ = states.wait_for(ClientState::is_terminal).await;
    }

    fn process_exited(&self, status: &str) {
        let crashed = self.state.send_if_modified(|state| {
            if state.is_connected() {
                *state = ClientState::Crashed;
                true
            } else {
                false
            }
        });

        if crashed {
            warn!(status, "plugin exited unexpectedly");
        } else {
            debug!(status, "plugin exited");
        }

        if let Some(session) = self.session.lock().as_ref() {
            session.protocol.close();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.protocol.close();
            if let Some(process) = &session.process {
                process.force_kill();
            }
        }
    }
}

static MANAGED: LazyLock<Mutex<Vec<Weak<Inner>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Kill every client created with [`ClientConfig::managed`]
///
/// Intended for the host's shutdown path.
pub async fn cleanup_clients() {
    let clients: Vec<_> = MANAGED
        .lock()
        .drain(..)
        .filter_map(|client| client.upgrade())
        .collect();

    for inner in clients {
        let client = PluginClient { inner };
        if let Err(e) = client.kill().await {
            warn!(error = %e, "failed to clean up plugin client");
        }
    }
}

/// Handle on one plugin process and its transport
#[derive(Clone)]
pub struct PluginClient {
    inner: Arc<Inner>,
}

impl PluginClient {
    /// Create a client; nothing is launched until [`PluginClient::start`]
    pub fn new(config: ClientConfig) -> BridgeResult<Self> {
        config.validate()?;

        let tail = config.options.stderr_tail;
        let (state, _) = watch::channel(ClientState::Created);
        let managed = config.options.managed;
        let inner = Arc::new(Inner {
            config,
            state,
            start_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(tail))),
        });

        if managed {
            let mut clients = MANAGED.lock();
            clients.retain(|client| client.strong_count() > 0);
            clients.push(Arc::downgrade(&inner));
        }

        Ok(Self { inner })
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Whether the plugin is gone or was never reached
    pub fn exited(&self) -> bool {
        let state = self.state();
        if state.is_terminal() {
            return true;
        }
        self.session()
            .is_some_and(|s| s.process.as_ref().is_some_and(|p| p.exit_status().is_some()))
    }

    /// Plugin process id
    pub fn pid(&self) -> Option<u32> {
        self.session().and_then(|s| match &s.process {
            Some(process) => process.pid,
            None => self.inner.config.reattach.as_ref().and_then(|r| r.pid),
        })
    }

    /// Protocol version agreed with the plugin
    pub fn negotiated_version(&self) -> Option<u32> {
        self.session().map(|s| s.version)
    }

    /// Protocol the plugin chose
    pub fn protocol(&self) -> Option<Protocol> {
        self.session().map(|s| s.protocol.protocol())
    }

    /// Details another host could use to reattach to this plugin
    pub fn reattach_config(&self) -> Option<ReattachConfig> {
        self.session().map(|s| ReattachConfig {
            protocol: s.endpoint.protocol,
            protocol_version: s.version,
            network: s.endpoint.network,
            address: s.endpoint.address.clone(),
            pid: s
                .process
                .as_ref()
                .and_then(|p| p.pid)
                .or_else(|| self.inner.config.reattach.as_ref().and_then(|r| r.pid)),
        })
    }

    /// Last lines the plugin wrote to stderr
    pub fn stderr_tail(&self) -> Vec<String> {
        self.inner.stderr_tail.lock().iter().cloned().collect()
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.lock().clone()
    }

    fn connected_session(&self) -> BridgeResult<Arc<Session>> {
        match self.session() {
            Some(session) if self.state().is_connected() && !session.protocol.is_closed() => {
                Ok(session)
            }
            _ => Err(TransportError::Closed.into()),
        }
    }

    /// Launch or reattach, handshake and connect
    ///
    /// Does nothing when already connected. Handshake failures are terminal
    /// for this client.
    pub async fn start(&self) -> BridgeResult<()> {
        let _start = self.inner.start_lock.lock().await;

        match self.state() {
            ClientState::Connected | ClientState::Dispensing => return Ok(()),
            state if state.is_terminal() => return Err(TransportError::Closed.into()),
            _ => {}
        }

        let config = &self.inner.config;
        let result = match (&config.reattach, &config.command) {
            (Some(reattach), _) => self.reattach(reattach).await,
            (None, Some(command)) => self.launch(command).await,
            (None, None) => Err(BridgeError::InvalidConfig(
                "nothing to launch or reattach to".to_string(),
            )),
        };

        let session = match result {
            Ok(session) => Arc::new(session),
            Err(e) => {
                if self.inner.advance(ClientState::HandshakeFailed) {
                    warn!(error = %e, "plugin failed to start");
                } else {
                    debug!(error = %e, "start abandoned");
                }
                return Err(e);
            }
        };

        info!(
            protocol = %session.endpoint.protocol,
            version = session.version,
            address = %session.endpoint.address,
            "plugin connected"
        );
        *self.inner.session.lock() = Some(session.clone());
        if !self.inner.advance(ClientState::Connected) {
            // Killed while the handshake was finishing.
            session.protocol.close();
            if let Some(process) = &session.process {
                process.force_kill();
                process.wait_exit(self.inner.config.options.kill_timeout).await;
            }
            return Err(TransportError::Closed.into());
        }

        if let Some(status) = session.process.as_ref().and_then(ProcessHandle::exit_status) {
            self.inner.process_exited(&status);
        }
        Ok(())
    }

    async fn reattach(&self, reattach: &ReattachConfig) -> BridgeResult<Session> {
        let config = &self.inner.config;
        if !self.inner.advance(ClientState::Handshaking) {
            return Err(TransportError::Closed.into());
        }

        let line = HandshakeLine {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version: reattach.protocol_version,
            network: reattach.network,
            address: reattach.address.clone(),
            protocol: reattach.protocol,
            server_cert: None,
        };
        line.validate(&config.host_versions(), &config.options.allowed_protocols)?;

        let endpoint = reattach.endpoint();
        let protocol = tokio::select! {
            protocol = connect_client(
                &endpoint,
                self.broker_listen(endpoint.network),
                config.options.start_timeout,
            ) => protocol?,
            () = self.inner.finished() => return Err(TransportError::Closed.into()),
        };

        Ok(Session {
            protocol,
            plugins: config.plugins_for(reattach.protocol_version),
            version: reattach.protocol_version,
            endpoint,
            process: None,
        })
    }

    async fn launch(&self, command: &PluginCommand) -> BridgeResult<Session> {
        let config = &self.inner.config;
        let options = &config.options;
        if !self.inner.advance(ClientState::Launching) {
            return Err(TransportError::Closed.into());
        }

        if let Some(secure) = &config.secure {
            secure.check(&command.program).await?;
        }

        let host_versions = config.host_versions();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .env(&config.handshake.magic_cookie_key, &config.handshake.magic_cookie_value)
            .env(ENV_PROTOCOL_VERSIONS, format_versions(&host_versions))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(min) = options.min_port {
            cmd.env(ENV_MIN_PORT, min.to_string());
        }
        if let Some(max) = options.max_port {
            cmd.env(ENV_MAX_PORT, max.to_string());
        }
        if let Some(dir) = &options.unix_socket_dir {
            cmd.env(ENV_UNIX_SOCKET_DIR, dir);
        }
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let label = command.label();
        let mut child = cmd.spawn().map_err(|source| BridgeError::Launch {
            command: command.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(plugin = %label, pid, "plugin started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, kill_rx, exit_tx, Arc::downgrade(&self.inner)));
        let process = ProcessHandle {
            pid,
            kill: Mutex::new(Some(kill_tx)),
            exited: exit_rx,
        };

        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            process.force_kill();
            return Err(BridgeError::Internal(
                "plugin stdio was not captured".to_string(),
            ));
        };
        let stderr_done = tokio::spawn(forward_stderr(
            stderr,
            label.clone(),
            self.inner.stderr_tail.clone(),
            options.stderr_tail,
        ));

        if !self.inner.advance(ClientState::Handshaking) {
            process.force_kill();
            process.wait_exit(options.kill_timeout).await;
            return Err(TransportError::Closed.into());
        }
        let handshake = tokio::time::timeout(options.start_timeout, async {
            let line = self.read_handshake(stdout, &label, &process, stderr_done).await?;
            line.validate(&host_versions, &options.allowed_protocols)?;

            let endpoint = Endpoint {
                protocol: line.protocol,
                network: line.network,
                address: line.address.clone(),
            };
            let protocol = connect_client(
                &endpoint,
                self.broker_listen(endpoint.network),
                options.start_timeout,
            )
            .await?;
            BridgeResult::Ok((line, endpoint, protocol))
        });
        let started = tokio::select! {
            started = handshake => started,
            () = self.inner.finished() => {
                debug!(plugin = %label, "killed during handshake");
                process.force_kill();
                process.wait_exit(options.kill_timeout).await;
                return Err(TransportError::Closed.into());
            }
        };

        let (line, endpoint, protocol) = match started {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                process.force_kill();
                return Err(e);
            }
            Err(_elapsed) => {
                process.force_kill();
                return Err(HandshakeError::Timeout {
                    timeout_ms: duration_ms(options.start_timeout),
                }
                .into());
            }
        };

        Ok(Session {
            protocol,
            plugins: config.plugins_for(line.protocol_version),
            version: line.protocol_version,
            endpoint,
            process: Some(process),
        })
    }

    async fn read_handshake(
        &self,
        stdout: ChildStdout,
        label: &str,
        process: &ProcessHandle,
        stderr_done: tokio::task::JoinHandle<()>,
    ) -> BridgeResult<HandshakeLine> {
        let mut lines = BufReader::new(stdout).lines();
        let found = next_handshake_line(&mut lines, label)
            .await
            .map_err(TransportError::from)?;

        let Some(raw) = found else {
            // Stdout closed: the process is exiting. Collect its status and
            // the rest of its stderr for the error.
            let grace = self.inner.config.options.kill_timeout;
            process.wait_exit(grace).await;
            let _ = tokio::time::timeout(grace, stderr_done).await;
            return Err(HandshakeError::ExitedEarly {
                status: process
                    .exit_status()
                    .unwrap_or_else(|| "stdout closed".to_string()),
                stderr: self.stderr_tail(),
            }
            .into());
        };

        let line: HandshakeLine = raw.parse()?;
        debug!(plugin = label, line = %raw, "received handshake");

        let label = label.to_string();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(plugin = %label, "{line}");
            }
        });
        Ok(line)
    }

    fn broker_listen(&self, network: Network) -> ListenOptions {
        let options = &self.inner.config.options;
        ListenOptions {
            network,
            min_port: options.min_port,
            max_port: options.max_port,
            socket_dir: options.unix_socket_dir.clone(),
        }
    }

    /// Hand out a client for the plugin registered under `name`
    ///
    /// Starts the plugin first if needed. Fails with
    /// [`BridgeError::UnknownPlugin`] when either side has no such name.
    pub async fn dispense<P: Plugin>(&self, name: &str) -> BridgeResult<P::Client> {
        if self.state() == ClientState::Created {
            self.start().await?;
        }

        let session = self.connected_session()?;
        let plugin = session.plugins.lookup::<P>(name)?;
        session.protocol.dispense(name).await?;

        self.inner.state.send_if_modified(|state| {
            if *state == ClientState::Connected {
                *state = ClientState::Dispensing;
                true
            } else {
                false
            }
        });

        debug!(plugin = name, "dispensed");
        let channel = CallChannel::new(name, session.protocol.invoker())
            .with_timeout(self.inner.config.options.call_timeout);
        Ok(plugin.client(channel, &session.protocol.broker()))
    }

    /// Check the plugin answers
    pub async fn ping(&self) -> BridgeResult<()> {
        self.connected_session()?.protocol.ping().await
    }

    /// Stop the plugin: ask it to exit, then force it after the kill timeout
    ///
    /// Outstanding calls fail with a transport error. Safe to call more than
    /// once and from any state.
    pub async fn kill(&self) -> BridgeResult<()> {
        let mut previous = ClientState::Created;
        self.inner.state.send_modify(|state| {
            previous = *state;
            if !state.is_terminal() {
                *state = ClientState::Killed;
            }
        });

        if matches!(previous, ClientState::Launching | ClientState::Handshaking) {
            // A start in progress sees the state change, stops its plugin and
            // releases the lock.
            drop(self.inner.start_lock.lock().await);
        }

        let Some(session) = self.session() else {
            info!(previous = ?previous, "plugin killed before it connected");
            return Ok(());
        };
        let timeout = self.inner.config.options.kill_timeout;

        if previous.is_connected() && !session.protocol.is_closed() {
            match tokio::time::timeout(timeout, session.protocol.shutdown()).await {
                Ok(Ok(())) => debug!("plugin acknowledged shutdown"),
                Ok(Err(e)) => debug!(error = %e, "graceful shutdown failed"),
                Err(_elapsed) => debug!("graceful shutdown timed out"),
            }
        }

        if let Some(process) = &session.process
            && !process.wait_exit(timeout).await
        {
            warn!(pid = process.pid, "plugin did not exit in time, killing");
            process.force_kill();
            process.wait_exit(timeout).await;
        }

        session.protocol.close();
        info!(previous = ?previous, "plugin killed");
        Ok(())
    }
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

async fn next_handshake_line(
    lines: &mut Lines<BufReader<ChildStdout>>,
    label: &str,
) -> std::io::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if HandshakeLine::looks_like_handshake(line) {
            return Ok(Some(line.to_string()));
        }
        if !line.is_empty() {
            info!(plugin = label, "{line}");
        }
    }
    Ok(None)
}

async fn forward_stderr(
    stderr: ChildStderr,
    label: String,
    tail: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                forward_plugin_line(&label, &line);
                if capacity > 0 {
                    let mut tail = tail.lock();
                    if tail.len() >= capacity {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %label, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    exited: watch::Sender<Option<String>>,
    inner: Weak<Inner>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown exit status ({e})"),
    };
    exited.send_replace(Some(status.clone()));

    if let Some(inner) = inner.upgrade() {
        inner.process_exited(&status);
    }
}

/// Path to a plugin binary next to the current executable
pub fn sibling_executable(name: &str) -> BridgeResult<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| BridgeError::InvalidConfig(format!("cannot locate current executable: {e}")))?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}
