//! SSH tunnel to an edge cluster node
//!
//! Edge clusters are only reachable through their control-plane nodes, so the
//! API client dials through an SSH session. A loopback listener accepts the
//! client's TCP connections and relays each one over a `direct-tcpip` channel
//! to the API server. The same session runs remote commands.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SSH_PORT: u16 = 22;

/// Accepts whatever host key the server presents
///
/// The tunnel endpoint is a freshly installed node whose key is not known in
/// advance.
struct TunnelHandler;

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Output of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
    /// Everything written to standard output
    pub stdout: Vec<u8>,
    /// Everything written to standard error
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// True if the command exited with status zero
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Runs shell commands on a remote node
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` and collect its output
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
}

/// An authenticated SSH session plus the forwarders running over it
pub struct SshTunnel {
    server: String,
    session: Arc<Handle<TunnelHandler>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("server", &self.server)
            .field("closed", &self.stop.is_cancelled())
            .finish()
    }
}

impl SshTunnel {
    /// Connect to the first reachable server and authenticate with the PEM
    /// encoded private key
    ///
    /// Servers are `host` or `host:port`; port 22 is the default.
    pub async fn connect(servers: &[String], user: &str, key_pem: &[u8]) -> Result<Self> {
        let pem = std::str::from_utf8(key_pem)
            .map_err(|e| Error::internal_with_context("ssh", format!("private key is not UTF-8: {e}")))?;
        let key_pair = Arc::new(russh_keys::decode_secret_key(pem, None).map_err(|e| {
            Error::internal_with_context("ssh", format!("failed to decode private key: {e}"))
        })?);

        let mut last_error = None;
        for server in servers {
            match Self::connect_one(server, user, key_pair.clone()).await {
                Ok(session) => {
                    info!(server = %server, user = %user, "SSH session established");
                    return Ok(Self {
                        server: server.clone(),
                        session: Arc::new(session),
                        stop: CancellationToken::new(),
                    });
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "SSH connection failed, trying next server");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::hub_unreachable("no SSH servers given")))
    }

    async fn connect_one(
        server: &str,
        user: &str,
        key_pair: Arc<key::KeyPair>,
    ) -> Result<Handle<TunnelHandler>> {
        let address = with_default_port(server);
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, address.as_str(), TunnelHandler),
        )
        .await
        .map_err(|_| Error::hub_unreachable(format!("timed out connecting to '{address}'")))?
        .map_err(|e| Error::hub_unreachable(format!("failed to connect to '{address}': {e}")))?;

        let authenticated = session
            .authenticate_publickey(user, key_pair)
            .await
            .map_err(|e| Error::hub_unreachable(format!("SSH authentication with '{address}' failed: {e}")))?;
        if !authenticated {
            return Err(Error::Forbidden {
                message: format!("server '{address}' rejected the key for user '{user}'"),
            });
        }
        Ok(session)
    }

    /// Server this tunnel is connected to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Start relaying a loopback port to `host:port` on the far side
    ///
    /// Returns the local address to dial. The relay runs until the tunnel is
    /// closed.
    pub async fn forward(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::internal_with_context("ssh", format!("failed to bind forwarder: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::internal_with_context("ssh", e.to_string()))?;

        let session = self.session.clone();
        let stop = self.stop.clone();
        let host = host.to_string();
        debug!(local = %local, remote = %format!("{host}:{port}"), "Starting SSH forwarder");

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let session = session.clone();
                        let stop = stop.clone();
                        let host = host.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = stop.cancelled() => {}
                                result = relay(session, stream, peer, &host, port) => {
                                    if let Err(e) = result {
                                        debug!(peer = %peer, error = %e, "SSH relay ended with error");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "SSH forwarder failed to accept connection");
                    }
                }
            }
            debug!(local = %local, "SSH forwarder stopped");
        });

        Ok(local)
    }

    /// Stop the forwarders and disconnect the session
    pub async fn close(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(server = %self.server, error = %e, "SSH disconnect failed");
        }
        info!(server = %self.server, "SSH session closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl RemoteExec for SshTunnel {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| Error::transport(format!("failed to open SSH session channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::transport(format!("failed to start remote command: {e}")))?;

        let mut output = ExecOutput::default();
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => output.stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }
        debug!(
            server = %self.server,
            exit_status = ?output.exit_status,
            "Remote command finished"
        );
        Ok(output)
    }
}

async fn relay(
    session: Arc<Handle<TunnelHandler>>,
    mut stream: TcpStream,
    peer: SocketAddr,
    host: &str,
    port: u16,
) -> Result<()> {
    let channel = session
        .channel_open_direct_tcpip(host, u32::from(port), peer.ip().to_string(), u32::from(peer.port()))
        .await
        .map_err(|e| Error::transport(format!("failed to open direct-tcpip channel to {host}:{port}: {e}")))?;
    let mut remote = channel.into_stream();
    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut remote)
        .await
        .map_err(|e| Error::transport(e.to_string()))?;
    debug!(peer = %peer, sent, received, "SSH relay finished");
    Ok(())
}

/// Append the default SSH port when `server` has none
fn with_default_port(server: &str) -> String {
    if server.parse::<SocketAddr>().is_ok() {
        return server.to_string();
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => server.to_string(),
        _ if server.contains(':') => format!("[{server}]:{DEFAULT_SSH_PORT}"),
        _ => format!("{server}:{DEFAULT_SSH_PORT}"),
    }
}
