// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The server side: accept loop, per-connection workers, and the
//! connection state machine.
//!
//! One accepted TCP connection maps to one task running a single
//! [`Session`] event loop; workers share nothing but the read-only host key
//! and the app registry.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::Future;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::apps::AppRegistry;
use crate::auth::{AcceptAll, AuthPolicy};
use crate::keys::HostKeyStore;
use crate::sshbuffer::{SSHBuffer, SshId};
use crate::{ChannelId, Disconnect, Error, Limits};

mod channel;
mod connection;
mod encrypted;

pub use connection::Session;

#[derive(Clone)]
/// Configuration of a server.
pub struct Config {
    /// The server ID string sent at the beginning of the protocol.
    pub server_id: SshId,
    /// The persistent host identity.
    pub host_key: HostKeyStore,
    /// The apps sessions are dispatched to.
    pub registry: AppRegistry,
    /// Decides which authentication requests succeed.
    pub auth: Arc<dyn AuthPolicy>,
    /// The bytes and time limits before a server-initiated key re-exchange.
    pub limits: Limits,
    /// The initial window size advertised on channel confirmation.
    pub window_size: u32,
    /// The maximal size of a single packet we advertise.
    pub maximum_packet_size: u32,
    /// Internal event buffer size.
    pub event_buffer_size: usize,
    /// Time after which an idle connection is disconnected.
    pub inactivity_timeout: Option<std::time::Duration>,
    /// Grace period between SIGTERM and SIGKILL at teardown.
    pub kill_grace: std::time::Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_id", &self.server_id)
            .field("window_size", &self.window_size)
            .field("maximum_packet_size", &self.maximum_packet_size)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server_id: SshId::Standard(format!("SSH-2.0-Whisp_{}", env!("CARGO_PKG_VERSION"))),
            // Ephemeral unless the embedder loads a persistent one.
            host_key: HostKeyStore::from_seed(rand::random()),
            registry: AppRegistry::new(),
            auth: Arc::new(AcceptAll),
            limits: Limits::default(),
            window_size: 2097152,
            maximum_packet_size: 32768,
            event_buffer_size: 10,
            inactivity_timeout: Some(std::time::Duration::from_secs(60)),
            kill_grace: std::time::Duration::from_millis(500),
        }
    }
}

/// Messages feeding a session's event loop: PTY output and child exits
/// from the channel tasks, plus embedder requests through a [`Handle`].
#[derive(Debug)]
pub(crate) enum Msg {
    /// Bytes read from a channel's PTY master.
    Data { id: ChannelId, data: Vec<u8> },
    /// The channel's PTY master hit EOF (the slave side is gone).
    PtyEof { id: ChannelId },
    /// The channel's child exited with this status.
    Exit { id: ChannelId, status: u32 },
    /// Tear the connection down.
    Disconnect {
        reason: Disconnect,
        description: String,
    },
}

#[derive(Clone)]
/// Handle to a running session, used to reach it from outside the
/// request/response cycle.
pub struct Handle {
    pub(crate) sender: tokio::sync::mpsc::Sender<Msg>,
}

impl Handle {
    /// Ask the worker to disconnect the client and exit its loop.
    pub async fn disconnect(&self, reason: Disconnect, description: String) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description,
            })
            .await
            .map_err(|_| Error::SendError)
    }
}

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Run a server on every connection accepted from `addrs`.
pub async fn run_on_address<A: ToSocketAddrs + Send>(
    config: Arc<Config>,
    addrs: A,
) -> Result<(), std::io::Error> {
    let socket = TcpListener::bind(addrs).await?;
    run_on_socket(config, &socket).await
}

/// Run a server on a specified `tokio::net::TcpListener`. Useful when
/// dropping privileges immediately after socket binding, for example.
pub async fn run_on_socket(
    config: Arc<Config>,
    socket: &TcpListener,
) -> Result<(), std::io::Error> {
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not be larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }

    loop {
        match socket.accept().await {
            Ok((socket, peer)) => {
                let config = config.clone();
                let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
                info!("[{id}] connection from {peer}");
                tokio::spawn(async move {
                    let session = match run_stream(config, socket, Some(peer), id).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!("[{id}] connection setup failed: {e}");
                            return;
                        }
                    };
                    match session.await {
                        Ok(_) => debug!("[{id}] connection closed"),
                        Err(e) => debug!("[{id}] connection closed with error: {e}"),
                    }
                });
            }
            Err(e) => {
                debug!("accept failed: {e}");
                break;
            }
        }
    }

    Ok(())
}

/// An active session returned by [`run_stream`].
///
/// Implements [`Future`] and needs to be awaited to let the session run.
pub struct RunningSession {
    handle: Handle,
    join: JoinHandle<Result<(), Error>>,
}

impl RunningSession {
    /// Returns a new handle for the session.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Future for RunningSession {
    type Output = Result<(), Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::IO(std::io::Error::other(e))),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Run a single connection to completion: version exchange, then the
/// packet loop.
pub async fn run_stream<R>(
    config: Arc<Config>,
    mut stream: R,
    peer_addr: Option<SocketAddr>,
    connection_id: u64,
) -> Result<RunningSession, Error>
where
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Writing SSH id.
    let mut write_buffer = SSHBuffer::new();
    write_buffer.send_ssh_id(&config.as_ref().server_id);
    stream.write_all(&write_buffer.buffer[..]).await?;

    let client_id = if let Some(t) = config.inactivity_timeout {
        tokio::time::timeout(t, read_ssh_id(&mut stream))
            .await
            .map_err(|_| Error::InactivityTimeout)??
    } else {
        read_ssh_id(&mut stream).await?
    };
    debug!(
        "[{connection_id}] client version: {:?}",
        String::from_utf8_lossy(&client_id)
    );

    let (sender, receiver) = tokio::sync::mpsc::channel(config.event_buffer_size);
    let handle = Handle { sender };
    let session = Session::new(
        config,
        &client_id,
        peer_addr,
        connection_id,
        handle.clone(),
        receiver,
    );
    let join = tokio::spawn(session.run(stream));

    Ok(RunningSession { handle, join })
}

/// Read the client identification line: bytes up to LF, CR trimmed. Lines
/// not starting with `SSH-` would be protocol chatter the other side is
/// not allowed to send before its version; reject them.
async fn read_ssh_id<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Disconnect);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        // https://tools.ietf.org/html/rfc4253#section-4.2
        if line.len() > 255 {
            return Err(Error::Version);
        }
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    if !line.starts_with(b"SSH-2.0-") && !line.starts_with(b"SSH-1.99-") {
        return Err(Error::Version);
    }
    Ok(line)
}
