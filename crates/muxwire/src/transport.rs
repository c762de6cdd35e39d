//! Byte-stream transports under the protocol.
//!
//! - **Tcp**: `host:port`, resolved on every connect
//! - **Unix**: filesystem socket path
//!
//! [`EndpointFactory`] is the pool's default [`ConnectionFactory`]: connect,
//! apply socket options, optionally secure the stream, then spawn a
//! [`Connection`] over it.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, UnixStream};

use crate::config::{ConnectionConfig, TransportOptions};
use crate::connection::{Connection, ConnectionInfo};
use crate::context::TransportContext;
use crate::error::{TransportError, TransportResult};
use crate::pool::ConnectionFactory;

/// Any duplex byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// `unix:<path>`, `tcp://host:port` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::connect_failed(s, "empty unix socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(addr.to_string()))
            }
            _ => Err(TransportError::connect_failed(s, "expected host:port")),
        }
    }
}

/// A stream after the security handshake.
pub struct SecureStream {
    pub stream: BoxedStream,
    /// Authenticated identity of the remote side, if the handshake proved one.
    pub peer_identity: Option<String>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("peer_identity", &self.peer_identity)
            .finish_non_exhaustive()
    }
}

/// Hook for wrapping streams in a secure channel (TLS or similar).
#[async_trait]
pub trait ChannelSecurity: Send + Sync {
    async fn wrap_client(&self, stream: BoxedStream, endpoint: &Endpoint)
    -> io::Result<SecureStream>;

    async fn wrap_server(&self, stream: BoxedStream) -> io::Result<SecureStream>;

    /// Label used for the peer in logs and errors.
    fn peer_identity(&self, stream: &SecureStream) -> Option<String> {
        stream.peer_identity.clone()
    }
}

/// Open a stream to `endpoint` within `connect_timeout`.
///
/// Returns the stream and a peer label for diagnostics.
pub async fn connect(
    endpoint: &Endpoint,
    options: &TransportOptions,
    connect_timeout: Duration,
) -> io::Result<(BoxedStream, String)> {
    let connecting = async {
        match endpoint {
            Endpoint::Tcp(addr) => connect_tcp(addr, options).await,
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok((Box::new(stream) as BoxedStream, endpoint.to_string()))
            }
        }
    };
    match tokio::time::timeout(connect_timeout, connecting).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {}ms", connect_timeout.as_millis()),
        )),
    }
}

async fn connect_tcp(addr: &str, options: &TransportOptions) -> io::Result<(BoxedStream, String)> {
    let mut last_err = None;
    for resolved in tokio::net::lookup_host(addr).await? {
        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(options.keepalive.is_some())?;
        match socket.connect(resolved).await {
            Ok(stream) => {
                stream.set_nodelay(options.tcp_nodelay)?;
                tracing::trace!(addr = %resolved, "Connected");
                return Ok((Box::new(stream) as BoxedStream, resolved.to_string()));
            }
            Err(e) => {
                tracing::debug!(addr = %resolved, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{addr} resolved to no addresses"),
        )
    }))
}

/// Creates client connections to one endpoint.
pub struct EndpointFactory {
    endpoint: Endpoint,
    options: TransportOptions,
    connection: ConnectionConfig,
    context: Arc<TransportContext>,
    security: Option<Arc<dyn ChannelSecurity>>,
}

impl EndpointFactory {
    pub fn new(
        endpoint: Endpoint,
        options: TransportOptions,
        connection: ConnectionConfig,
        context: Arc<TransportContext>,
    ) -> Self {
        Self {
            endpoint,
            options,
            connection,
            context,
            security: None,
        }
    }

    pub fn with_security(mut self, security: Arc<dyn ChannelSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ConnectionFactory for EndpointFactory {
    async fn create(&self, generation: u64) -> TransportResult<Connection> {
        let label = self.endpoint.to_string();
        let (stream, peer) = connect(&self.endpoint, &self.options, self.connection.connect_timeout)
            .await
            .map_err(|e| TransportError::connect_failed(label.clone(), e))?;

        let (stream, peer) = match &self.security {
            Some(security) => {
                let secured = security
                    .wrap_client(stream, &self.endpoint)
                    .await
                    .map_err(|e| TransportError::connect_failed(label.clone(), format!("handshake: {e}")))?;
                let identity = security.peer_identity(&secured);
                (secured.stream, identity.unwrap_or(peer))
            }
            None => (stream, peer),
        };

        Ok(Connection::spawn(
            stream,
            ConnectionInfo::client(peer).with_generation(generation),
            self.connection.clone(),
            Arc::clone(&self.context),
            None,
        ))
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
