//! SSH tunnel to the warehouse host
//!
//! A session binds a local TCP listener and forwards every accepted
//! connection over a `direct-tcpip` channel to the remote database port.
//! Sessions live for one request and are released on `close` or drop.

use crate::config::TunnelConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::key;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// An open forwarded channel exposing the remote database on a local port
#[async_trait]
pub trait ChannelSession: Send {
    /// Locally bound address that forwards to the remote target
    fn local_addr(&self) -> SocketAddr;

    /// Release the listener and the SSH session. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Opens per-request channel sessions
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ChannelSession>>;
}

struct TunnelClient;

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(fingerprint = %server_public_key.fingerprint(), "SSH host key");
        Ok(true)
    }
}

type SshHandle = Arc<client::Handle<TunnelClient>>;

/// Opens SSH tunnels using `russh`
pub struct SshChannelOpener {
    config: TunnelConfig,
}

impl SshChannelOpener {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<client::Handle<TunnelClient>> {
        let cfg = &self.config;
        let ssh_config = Arc::new(client::Config::default());
        let addr = (cfg.ssh_host.as_str(), cfg.ssh_port);

        let handle = tokio::time::timeout(cfg.connect_timeout, client::connect(ssh_config, addr, TunnelClient))
            .await
            .map_err(|_| {
                QueryError::Channel(format!(
                    "Timed out connecting to {}:{} after {:?}",
                    cfg.ssh_host, cfg.ssh_port, cfg.connect_timeout
                ))
            })?
            .map_err(|e| QueryError::Channel(format!("Failed to connect to {}:{}: {}", cfg.ssh_host, cfg.ssh_port, e)))?;

        Ok(handle)
    }

    async fn authenticate(&self, handle: &mut client::Handle<TunnelClient>) -> Result<()> {
        let cfg = &self.config;
        let mut authenticated = false;

        if let Some(key_path) = &cfg.private_key {
            let key_pair = russh_keys::load_secret_key(key_path, cfg.private_key_password.as_deref())
                .map_err(|e| {
                    QueryError::Channel(format!("Failed to load private key {}: {}", key_path.display(), e))
                })?;
            authenticated = handle
                .authenticate_publickey(cfg.username.as_str(), Arc::new(key_pair))
                .await?;
        }

        if !authenticated {
            if let Some(password) = &cfg.password {
                authenticated = handle
                    .authenticate_password(cfg.username.as_str(), password.as_str())
                    .await?;
            }
        }

        if authenticated {
            Ok(())
        } else {
            Err(QueryError::Channel(format!(
                "SSH authentication rejected for user {}",
                cfg.username
            )))
        }
    }
}

#[async_trait]
impl ChannelOpener for SshChannelOpener {
    async fn open(&self) -> Result<Box<dyn ChannelSession>> {
        let cfg = &self.config;
        let mut handle = self.connect().await?;

        // Anything failing past this point must tear the SSH session down
        if let Err(e) = self.authenticate(&mut handle).await {
            disconnect(&handle).await;
            return Err(e);
        }

        let listener = match TcpListener::bind((cfg.local_host.as_str(), cfg.local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                disconnect(&handle).await;
                return Err(QueryError::Channel(format!(
                    "Failed to bind local port {}:{}: {}",
                    cfg.local_host, cfg.local_port, e
                )));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                disconnect(&handle).await;
                return Err(QueryError::Channel(format!("Failed to read local address: {}", e)));
            }
        };

        let handle: SshHandle = Arc::new(handle);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            handle.clone(),
            cfg.remote_host.clone(),
            cfg.remote_port,
        ));

        info!(
            local = %local_addr,
            ssh_host = %cfg.ssh_host,
            remote = %format!("{}:{}", cfg.remote_host, cfg.remote_port),
            "SSH tunnel opened"
        );

        Ok(Box::new(SshTunnelSession {
            local_addr,
            accept_task: Some(accept_task),
            handle: Some(handle),
        }))
    }
}

async fn disconnect(handle: &client::Handle<TunnelClient>) {
    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
        debug!("SSH disconnect failed: {}", e);
    }
}

async fn accept_loop(listener: TcpListener, handle: SshHandle, remote_host: String, remote_port: u16) {
    // Dropping the set when this task is aborted aborts every live forward
    let mut forwards = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Tunnel listener stopped accepting: {}", e);
                        break;
                    }
                };
                let handle = handle.clone();
                let remote_host = remote_host.clone();
                forwards.spawn(async move {
                    if let Err(e) = forward_connection(handle, stream, peer, remote_host, remote_port).await {
                        warn!(peer = %peer, "Tunnel forward failed: {}", e);
                    }
                });
            }
            Some(_) = forwards.join_next(), if !forwards.is_empty() => {}
        }
    }
}

async fn forward_connection(
    handle: SshHandle,
    mut local: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
) -> Result<()> {
    let channel = handle
        .channel_open_direct_tcpip(remote_host, remote_port as u32, peer.ip().to_string(), peer.port() as u32)
        .await?;
    let mut remote = channel.into_stream();
    let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    debug!(peer = %peer, sent, received, "Tunnel forward finished");
    Ok(())
}

/// A live SSH tunnel
pub struct SshTunnelSession {
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    handle: Option<SshHandle>,
}

#[async_trait]
impl ChannelSession for SshTunnelSession {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            // Wait for the listener to actually be dropped
            let _ = task.await;
        }
        if let Some(handle) = self.handle.take() {
            disconnect(&handle).await;
            info!(local = %self.local_addr, "SSH tunnel closed");
        }
        Ok(())
    }
}

impl Drop for SshTunnelSession {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            warn!(local = %self.local_addr, "SSH tunnel dropped without close");
            task.abort();
        }
        // The request was cancelled before close ran; disconnect in the background
        if let Some(handle) = self.handle.take() {
            let spawned = spawn_detached(async move { disconnect(&handle).await });
            if !spawned {
                debug!(local = %self.local_addr, "No runtime left to disconnect SSH session");
            }
        }
    }
}

/// Run `task` on the current runtime if there is one.
fn spawn_detached<F>(task: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
            true
        }
        Err(_) => false,
    }
}
