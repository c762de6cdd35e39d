//! Accepting side of the transport.
//!
//! [`Server::bind`] listens on TCP or a unix socket and spawns one
//! [`Connection`] per accepted stream. Inbound requests and events are handed
//! to the [`RequestHandler`]; two-way requests are answered with an encoded
//! [`RpcResult`] or an error status carrying a message.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConnectionConfig, ServerConfig, TransportOptions};
use crate::connection::{Connection, ConnectionInfo};
use crate::context::TransportContext;
use crate::frame::{Body, Status};
use crate::payload::RpcResult;
use crate::serialization::{ObjectInput, SerializationError, SerializationRegistry};
use crate::transport::{BoxedStream, ChannelSecurity};

/// An inbound request or event.
#[derive(Debug)]
pub struct Request {
    pub request_id: u64,
    pub serialization_id: u8,
    /// The peer waits for a response.
    pub two_way: bool,
    pub is_event: bool,
    /// Name of the connection the request arrived on.
    pub connection: String,
    pub body: Body,
}

impl Request {
    /// Reader over the body in the request's serialization.
    pub fn reader(
        &self,
        registry: &SerializationRegistry,
    ) -> Result<Box<dyn ObjectInput>, SerializationError> {
        let backend = registry.get(self.serialization_id)?;
        Ok(backend.deserialize(self.body.as_bytes().clone()))
    }
}

/// Failure reported back to the caller with a non-ok status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status:?}: {message}")]
pub struct HandlerError {
    pub status: Status,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(Status::ServerError, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }
}

impl From<SerializationError> for HandlerError {
    fn from(err: SerializationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

/// Application entry point for inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// The return value is discarded for one-way requests and events.
    async fn handle(&self, request: Request) -> Result<RpcResult, HandlerError>;
}

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    async fn accept(&self, options: &TransportOptions) -> io::Result<(BoxedStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(options.tcp_nodelay)?;
                Ok((Box::new(stream) as BoxedStream, addr.to_string()))
            }
            Self::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((
                    Box::new(stream) as BoxedStream,
                    format!("unix:{}", path.display()),
                ))
            }
        }
    }
}

/// A listening server.
pub struct Server {
    local_addr: String,
    unix_path: Option<PathBuf>,
    connections: Arc<DashMap<Uuid, Connection>>,
    shutdown: CancellationToken,
}

/// Everything an accept loop hands to new connections.
#[derive(Clone)]
struct Acceptor {
    listener: Arc<Listener>,
    options: TransportOptions,
    connection: ConnectionConfig,
    context: Arc<TransportContext>,
    handler: Arc<dyn RequestHandler>,
    security: Option<Arc<dyn ChannelSecurity>>,
    connections: Arc<DashMap<Uuid, Connection>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the configured address and start accepting.
    pub async fn bind(
        config: &ServerConfig,
        options: TransportOptions,
        connection: ConnectionConfig,
        context: Arc<TransportContext>,
        handler: Arc<dyn RequestHandler>,
    ) -> io::Result<Self> {
        Self::bind_secured(config, options, connection, context, handler, None).await
    }

    /// Like [`Server::bind`], wrapping every accepted stream with `security`.
    pub async fn bind_secured(
        config: &ServerConfig,
        options: TransportOptions,
        connection: ConnectionConfig,
        context: Arc<TransportContext>,
        handler: Arc<dyn RequestHandler>,
        security: Option<Arc<dyn ChannelSecurity>>,
    ) -> io::Result<Self> {
        let (listener, local_addr) = match &config.unix_path {
            Some(path) => {
                let listener = bind_unix(path)?;
                (
                    Listener::Unix {
                        listener,
                        path: path.clone(),
                    },
                    format!("unix:{}", path.display()),
                )
            }
            None => {
                let socket = if config.bind.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(options.reuse_address)?;
                socket.bind(config.bind)?;
                let listener = socket.listen(config.backlog)?;
                let local_addr = listener.local_addr()?.to_string();
                (Listener::Tcp(listener), local_addr)
            }
        };

        let boss_threads = config.boss_threads.max(1);
        tracing::info!(
            addr = %local_addr,
            backlog = config.backlog,
            boss_threads,
            "Server listening"
        );

        let connections = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let acceptor = Acceptor {
            listener: Arc::new(listener),
            options,
            connection,
            context,
            handler,
            security,
            connections: Arc::clone(&connections),
            shutdown: shutdown.clone(),
        };
        for index in 1..boss_threads {
            tokio::spawn(acceptor.clone().run(index));
        }
        tokio::spawn(acceptor.run(0));

        Ok(Self {
            local_addr,
            unix_path: config.unix_path.clone(),
            connections,
            shutdown,
        })
    }

    /// Bound address, `unix:<path>` for unix sockets.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let ids: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close("server shutting down");
            }
        }
        if let Some(path) = &self.unix_path
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
        tracing::info!(addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish()
    }
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

impl Acceptor {
    async fn run(self, index: usize) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept(&self.options) => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(e) => {
                    tracing::warn!(acceptor = index, error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
        tracing::debug!(acceptor = index, "Accept loop stopped");
    }

    fn on_accept(&self, stream: BoxedStream, peer: String) {
        tracing::debug!(peer = %peer, "Accepted connection");
        let context = Arc::clone(&self.context);
        let handler = Arc::clone(&self.handler);
        let security = self.security.clone();
        let config = self.connection.clone();
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let (stream, peer) = match security {
                Some(security) => match security.wrap_server(stream).await {
                    Ok(secured) => {
                        let identity = security.peer_identity(&secured);
                        (secured.stream, identity.unwrap_or(peer))
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Secure handshake failed");
                        return;
                    }
                },
                None => (stream, peer),
            };
            if shutdown.is_cancelled() {
                return;
            }

            let connection = Connection::spawn(
                stream,
                ConnectionInfo::server(peer),
                config,
                context,
                Some(handler),
            );
            let id = connection.id();
            connections.insert(id, connection.clone());
            connection.closed().await;
            connections.remove(&id);
        });
    }
}
