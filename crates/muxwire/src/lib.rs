//! muxwire: multiplexed RPC transport core.
//!
//! Length-prefixed binary frames over TCP or unix sockets, many concurrent
//! requests per connection, deadline tracking on a shared timing wheel,
//! heartbeat liveness and response decoding off the I/O tasks.

mod context;
mod dispatcher;
mod heartbeat;
mod timer;

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod logging;
pub mod payload;
pub mod pool;
pub mod serialization;
pub mod server;
pub mod transport;

pub use client::Client;
pub use config::{
    ConnectionConfig, DispatchConfig, PoolConfig, ServerConfig, TransportConfig, TransportOptions,
};
pub use connection::{Connection, ConnectionInfo, Role};
pub use context::TransportContext;
pub use correlation::{
    Completion, RawResponse, Resolution, Response, ResponseListener, ResponseTiming,
};
pub use dispatcher::{DispatchStats, Dispatcher, decode_result};
pub use error::{TransportError, TransportResult};
pub use frame::{Body, BodyArena, CodecError, Frame, FrameCodec, FrameTiming, Status};
pub use heartbeat::{HeartbeatState, IdleDecision};
pub use payload::{Outcome, RpcResult};
pub use pool::{AcquireOptions, ConnectionFactory, ConnectionPool, PooledConnection};
pub use serialization::{
    ObjectInput, ObjectOutput, RemoteError, Serialization, SerializationError,
    SerializationRegistry,
};
pub use server::{HandlerError, Request, RequestHandler, Server};
pub use timer::{TimeoutTarget, TimerToken, TimingWheel};
pub use transport::{
    BoxedStream, ChannelSecurity, Endpoint, EndpointFactory, SecureStream, connect,
};
