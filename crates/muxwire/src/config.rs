//! Transport configuration.
//!
//! Every struct has working defaults and `with_*` builders. [`TransportConfig::from_env`]
//! overlays `MUXWIRE_*` environment variables on top of the defaults; values
//! that fail to parse are logged and ignored.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::{DEFAULT_PAYLOAD_LIMIT, MAX_SERIALIZATION_ID};
use crate::heartbeat::DEFAULT_MAX_UNANSWERED;
use crate::serialization::{JSON_ID, MSGPACK_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Wait for a release instead of failing when every connection is busy.
    pub block_when_exhausted: bool,
    /// Let a last-attempt caller wait for a creation already in progress.
    pub wait_for_in_flight_create: bool,
    pub in_flight_wait: Duration,
    /// Extra creation attempts after the first failure.
    pub max_create_retries: u32,
    pub retry_delay: Duration,
    /// Create one connection when the pool is built.
    pub eager_init: bool,
    /// Concurrent leases one connection accepts before it counts as busy.
    pub max_leases_per_connection: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            block_when_exhausted: true,
            wait_for_in_flight_create: true,
            in_flight_wait: Duration::from_secs(1),
            max_create_retries: 2,
            retry_delay: Duration::from_millis(100),
            eager_init: false,
            max_leases_per_connection: 64,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn with_block_when_exhausted(mut self, block: bool) -> Self {
        self.block_when_exhausted = block;
        self
    }

    pub fn with_wait_for_in_flight_create(mut self, wait: bool, up_to: Duration) -> Self {
        self.wait_for_in_flight_create = wait;
        self.in_flight_wait = up_to;
        self
    }

    pub fn with_create_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.max_create_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_eager_init(mut self, eager: bool) -> Self {
        self.eager_init = eager;
        self
    }

    pub fn with_max_leases_per_connection(mut self, n: usize) -> Self {
        self.max_leases_per_connection = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Read-idle interval that triggers a heartbeat. `None` disables heartbeats.
    pub idle_interval: Option<Duration>,
    pub max_unanswered: u32,
    /// Serialization used for outbound requests and heartbeats.
    pub serialization_id: u8,
    pub payload_limit: usize,
    /// Frames queued for the writer task before senders wait.
    pub outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(3),
            idle_interval: Some(Duration::from_secs(60)),
            max_unanswered: DEFAULT_MAX_UNANSWERED,
            serialization_id: MSGPACK_ID,
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            outbound_queue: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Option<Duration>) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_max_unanswered(mut self, n: u32) -> Self {
        self.max_unanswered = n;
        self
    }

    pub fn with_serialization(mut self, id: u8) -> Self {
        self.serialization_id = id;
        self
    }

    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    pub fn with_outbound_queue(mut self, n: usize) -> Self {
        self.outbound_queue = n;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Decode responses on worker threads. When off, decoding runs inline.
    pub offload: bool,
    pub workers: usize,
    /// Queue bound, independent of the worker count.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offload: true,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 1024,
        }
    }
}

impl DispatchConfig {
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }
}

/// Socket-level options applied to every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub tcp_nodelay: bool,
    pub keepalive: Option<Duration>,
    pub reuse_address: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            reuse_address: true,
        }
    }
}

impl TransportOptions {
    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Listen on a unix socket instead of TCP.
    pub unix_path: Option<PathBuf>,
    pub backlog: u32,
    /// Worker threads of the runtime built by [`ServerConfig::build_runtime`].
    pub io_threads: usize,
    /// Accept loops sharing the listener.
    pub boss_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 20880)),
            unix_path: None,
            backlog: 1024,
            io_threads: std::thread::available_parallelism()
                .map(|n| n.get() + 1)
                .unwrap_or(4),
            boss_threads: 1,
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_unix_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_path = Some(path.into());
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_io_threads(mut self, n: usize) -> Self {
        self.io_threads = n;
        self
    }

    pub fn with_boss_threads(mut self, n: usize) -> Self {
        self.boss_threads = n;
        self
    }

    /// Multi-thread runtime sized for this server's I/O.
    pub fn build_runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.io_threads.max(1))
            .thread_name("muxwire-io")
            .enable_all()
            .build()
    }
}

/// Everything a client or server needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
    pub dispatch: DispatchConfig,
    pub options: TransportOptions,
    pub server: ServerConfig,
}

impl TransportConfig {
    /// Defaults overlaid with `MUXWIRE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Overlay { lookup: &lookup };
        let mut config = Self::default();

        let pool = &mut config.pool;
        env.set("MUXWIRE_POOL_MAX_SIZE", &mut pool.max_size);
        env.set_bool(
            "MUXWIRE_POOL_BLOCK_WHEN_EXHAUSTED",
            &mut pool.block_when_exhausted,
        );
        env.set_bool(
            "MUXWIRE_POOL_WAIT_IN_FLIGHT",
            &mut pool.wait_for_in_flight_create,
        );
        env.set_millis("MUXWIRE_POOL_IN_FLIGHT_WAIT_MS", &mut pool.in_flight_wait);
        env.set("MUXWIRE_POOL_CREATE_RETRIES", &mut pool.max_create_retries);
        env.set_millis("MUXWIRE_POOL_RETRY_DELAY_MS", &mut pool.retry_delay);
        env.set_bool("MUXWIRE_POOL_EAGER_INIT", &mut pool.eager_init);
        env.set(
            "MUXWIRE_POOL_MAX_LEASES",
            &mut pool.max_leases_per_connection,
        );
        env.set_millis("MUXWIRE_POOL_ACQUIRE_TIMEOUT_MS", &mut pool.acquire_timeout);

        let conn = &mut config.connection;
        env.set_millis("MUXWIRE_REQUEST_TIMEOUT_MS", &mut conn.request_timeout);
        env.set_millis("MUXWIRE_CONNECT_TIMEOUT_MS", &mut conn.connect_timeout);
        if let Some(ms) = env.parse::<u64>("MUXWIRE_IDLE_INTERVAL_MS") {
            conn.idle_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        env.set("MUXWIRE_HEARTBEAT_MAX_UNANSWERED", &mut conn.max_unanswered);
        if let Some(name) = (env.lookup)("MUXWIRE_SERIALIZATION") {
            match serialization_id(&name) {
                Some(id) => conn.serialization_id = id,
                None => tracing::warn!(value = %name, "Unknown MUXWIRE_SERIALIZATION, ignoring"),
            }
        }
        env.set("MUXWIRE_PAYLOAD_LIMIT", &mut conn.payload_limit);
        env.set("MUXWIRE_OUTBOUND_QUEUE", &mut conn.outbound_queue);

        let dispatch = &mut config.dispatch;
        env.set_bool("MUXWIRE_DISPATCH_OFFLOAD", &mut dispatch.offload);
        env.set("MUXWIRE_DISPATCH_WORKERS", &mut dispatch.workers);
        env.set("MUXWIRE_DISPATCH_QUEUE", &mut dispatch.queue_capacity);

        let options = &mut config.options;
        env.set_bool("MUXWIRE_TCP_NODELAY", &mut options.tcp_nodelay);
        if let Some(secs) = env.parse::<u64>("MUXWIRE_KEEPALIVE_SECS") {
            options.keepalive = (secs > 0).then(|| Duration::from_secs(secs));
        }

        let server = &mut config.server;
        env.set("MUXWIRE_BIND", &mut server.bind);
        if let Some(path) = (env.lookup)("MUXWIRE_UNIX_SOCKET").filter(|p| !p.is_empty()) {
            server.unix_path = Some(PathBuf::from(path));
        }
        env.set("MUXWIRE_BACKLOG", &mut server.backlog);
        env.set("MUXWIRE_IO_THREADS", &mut server.io_threads);
        env.set("MUXWIRE_BOSS_THREADS", &mut server.boss_threads);

        config
    }
}

/// Serialization id for a configured name (`json`, `msgpack`) or a numeric id.
pub fn serialization_id(name: &str) -> Option<u8> {
    match name.trim().to_ascii_lowercase().as_str() {
        "json" => Some(JSON_ID),
        "msgpack" | "messagepack" => Some(MSGPACK_ID),
        other => other.parse().ok().filter(|id| *id <= MAX_SERIALIZATION_ID),
    }
}

struct Overlay<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Overlay<'_, F> {
    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
                None
            }
        }
    }

    fn set<T: FromStr>(&self, key: &str, target: &mut T) {
        if let Some(value) = self.parse(key) {
            *target = value;
        }
    }

    fn set_bool(&self, key: &str, target: &mut bool) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => tracing::warn!(key, value = %raw, "Ignoring unparseable flag"),
        }
    }

    fn set_millis(&self, key: &str, target: &mut Duration) {
        if let Some(ms) = self.parse::<u64>(key) {
            *target = Duration::from_millis(ms);
        }
    }
}
