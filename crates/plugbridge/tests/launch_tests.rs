//! Launch and handshake failures, driven by shell scripts posing as plugins
#![cfg(unix)]

use std::time::Duration;

use plugbridge::prelude::*;

fn handshake() -> HandshakeConfig {
    HandshakeConfig::new(1, "PLUGBRIDGE_LAUNCH_COOKIE", "launch")
}

fn script(body: &str) -> PluginCommand {
    PluginCommand::new("/bin/sh").args(["-c", body])
}

fn client_for(body: &str) -> BridgeResult<PluginClient> {
    PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(script(body))
            .with_start_timeout(Duration::from_secs(10))
            .with_kill_timeout(Duration::from_millis(500)),
    )
}

#[tokio::test]
async fn exit_before_handshake_reports_status_and_stderr() -> BridgeResult<()> {
    let client = client_for("echo 'config file missing' >&2; exit 3")?;

    match client.start().await {
        Err(BridgeError::Handshake(HandshakeError::ExitedEarly { status, stderr })) => {
            assert!(status.contains('3'), "status was {status}");
            assert!(stderr.iter().any(|line| line.contains("config file missing")));
        }
        other => {
            return Err(BridgeError::Internal(format!(
                "expected early exit, got {other:?}"
            )));
        }
    }
    assert_eq!(client.state(), ClientState::HandshakeFailed);
    assert!(client.exited());
    Ok(())
}

#[tokio::test]
async fn silent_plugin_times_out() -> BridgeResult<()> {
    let client = PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(script("sleep 30"))
            .with_start_timeout(Duration::from_millis(200)),
    )?;

    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Handshake(HandshakeError::Timeout { timeout_ms: 200 }))
    ));
    assert_eq!(client.state(), ClientState::HandshakeFailed);
    Ok(())
}

#[tokio::test]
async fn core_version_mismatch() -> BridgeResult<()> {
    let client = client_for("echo '2|1|tcp|127.0.0.1:1|netrpc'")?;
    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Handshake(HandshakeError::CoreVersion { plugin: 2, core: 1 }))
    ));
    Ok(())
}

#[tokio::test]
async fn app_version_mismatch() -> BridgeResult<()> {
    let client = client_for("echo '1|9|tcp|127.0.0.1:1|netrpc'")?;
    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Handshake(HandshakeError::ProtocolVersion { plugin: 9, .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn disallowed_protocol() -> BridgeResult<()> {
    let client = client_for("echo '1|1|tcp|127.0.0.1:1|grpc'")?;
    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Handshake(HandshakeError::ProtocolNotAllowed { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn malformed_line() -> BridgeResult<()> {
    let client = client_for("echo '1|1|carrier-pigeon|somewhere|netrpc'")?;
    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Handshake(HandshakeError::Malformed { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn environment_reaches_plugin() -> BridgeResult<()> {
    // Log lines before the handshake are skipped; the advertised versions are
    // echoed back as the chosen version. Nothing listens on port 1, so the
    // handshake passes and the connect fails.
    let body = r#"
        [ "$PLUGBRIDGE_LAUNCH_COOKIE" = launch ] || exit 7
        [ "$PLUGIN_MIN_PORT" = 20000 ] || exit 8
        echo "starting up"
        echo "1|$PLUGIN_PROTOCOL_VERSIONS|tcp|127.0.0.1:1|netrpc"
        sleep 5
    "#;
    let options = ClientOptions {
        min_port: Some(20000),
        max_port: Some(20100),
        start_timeout: Duration::from_secs(10),
        kill_timeout: Duration::from_millis(500),
        ..ClientOptions::default()
    };
    let client = PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(script(body))
            .with_options(options),
    )?;

    let result = client.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Transport(TransportError::Connect { .. }))
    ));
    assert_eq!(client.state(), ClientState::HandshakeFailed);
    Ok(())
}

#[tokio::test]
async fn missing_executable() -> BridgeResult<()> {
    let client = PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(PluginCommand::new("/nonexistent/plugbridge-plugin")),
    )?;
    assert!(matches!(
        client.start().await,
        Err(BridgeError::Launch { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn checksum_mismatch_blocks_launch() -> BridgeResult<()> {
    let client = PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(script("echo '1|1|tcp|127.0.0.1:1|netrpc'"))
            .with_secure(SecureConfig::sha256(vec![0u8; 32])),
    )?;
    assert!(matches!(client.start().await, Err(BridgeError::Security(_))));
    assert_eq!(client.state(), ClientState::HandshakeFailed);
    assert_eq!(client.pid(), None);
    Ok(())
}

#[tokio::test]
async fn kill_during_handshake_stops_plugin() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let pid_file = dir.path().join("plugin.pid");
    let command = script(r#"echo $$ > "$PLUGIN_PID_FILE"; exec sleep 30"#)
        .env("PLUGIN_PID_FILE", pid_file.display().to_string());
    let client = PluginClient::new(
        ClientConfig::new(handshake(), PluginSet::new())
            .with_command(command)
            .with_start_timeout(Duration::from_secs(30))
            .with_kill_timeout(Duration::from_millis(500)),
    )?;

    let starting = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });

    let pid = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(pid) = std::fs::read_to_string(&pid_file)
                && let Ok(pid) = pid.trim().parse::<u32>()
            {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    assert_eq!(client.state(), ClientState::Handshaking);

    client.kill().await?;
    assert_eq!(client.state(), ClientState::Killed);

    let started = tokio::time::timeout(Duration::from_secs(5), starting).await??;
    assert!(matches!(
        started,
        Err(BridgeError::Transport(TransportError::Closed))
    ));
    assert_eq!(client.state(), ClientState::Killed);
    assert!(client.ping().await.is_err());

    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()?;
    assert!(!alive.success(), "plugin {pid} still running after kill");
    Ok(())
}
