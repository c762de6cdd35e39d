//! Bounded pool of multiplexed connections.
//!
//! Every live connection owns one permit of a [`Semaphore`] sized to
//! `max_size`, so the bound holds even while creations are in flight. Closed
//! connections are pruned and their permit returned.
//!
//! Selection order on [`ConnectionPool::acquire`]:
//! 1. an idle open connection (no leases)
//! 2. a new connection, if a permit is free
//! 3. the least-leased open connection below `max_leases_per_connection`
//!
//! When all three fail the caller waits (blocking policy or last-attempt wait
//! for an in-flight creation) or gets [`TransportError::PoolExhausted`].

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};

/// Creates connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, generation: u64) -> TransportResult<Connection>;

    /// Target label used in errors.
    fn describe(&self) -> String;
}

/// Per-call acquisition options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Overrides the pool's `acquire_timeout`.
    pub timeout: Option<Duration>,
    /// The caller has no further retries left.
    pub last_attempt: bool,
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn last_attempt(mut self) -> Self {
        self.last_attempt = true;
        self
    }
}

struct Slot {
    connection: Connection,
    _permit: OwnedSemaphorePermit,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    slots: StdMutex<Vec<Slot>>,
    capacity: Arc<Semaphore>,
    creating: AtomicUsize,
    generation: AtomicU64,
    changed: Notify,
    closed: AtomicBool,
}

/// Cloneable handle on a pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// A leased connection. The lease is returned on drop.
pub struct PooledConnection {
    connection: Connection,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    fn new(connection: Connection, pool: &Arc<PoolInner>) -> Self {
        connection.add_lease();
        Self {
            connection,
            pool: Arc::downgrade(pool),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.connection.drop_lease();
        if let Some(pool) = self.pool.upgrade() {
            pool.changed.notify_waiters();
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection")
            .field(&self.connection)
            .finish()
    }
}

/// Decrements the in-flight creation count even if the acquiring future is
/// dropped mid-create.
struct CreatingGuard<'a> {
    inner: &'a PoolInner,
}

impl<'a> CreatingGuard<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        inner.creating.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        self.inner.creating.fetch_sub(1, Ordering::AcqRel);
        self.inner.changed.notify_waiters();
    }
}

impl PoolInner {
    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pool mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Drop closed connections, returning their permits.
    fn prune(slots: &mut Vec<Slot>) -> usize {
        let before = slots.len();
        slots.retain(|slot| !slot.connection.is_closed());
        let pruned = before - slots.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = slots.len(), "Pruned closed connections");
        }
        pruned
    }

    fn pick_idle(slots: &[Slot]) -> Option<Connection> {
        slots
            .iter()
            .find(|slot| !slot.connection.is_closed() && slot.connection.leases() == 0)
            .map(|slot| slot.connection.clone())
    }

    fn pick_least_leased(slots: &[Slot], max_leases: usize) -> Option<Connection> {
        slots
            .iter()
            .filter(|slot| !slot.connection.is_closed())
            .map(|slot| (slot.connection.leases(), &slot.connection))
            .filter(|(leases, _)| *leases < max_leases)
            .min_by_key(|(leases, _)| *leases)
            .map(|(_, connection)| connection.clone())
    }

    async fn create_with_retries(&self) -> TransportResult<Connection> {
        let attempts = self.config.max_create_retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            match self.factory.create(generation).await {
                Ok(connection) => {
                    tracing::debug!(
                        connection = %connection.name(),
                        generation,
                        attempt,
                        "Pool created connection"
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    tracing::warn!(
                        target_endpoint = %self.factory.describe(),
                        attempt,
                        attempts,
                        error = %e,
                        "Connection creation failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        let cause = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        Err(TransportError::connect_failed(
            self.factory.describe(),
            format!("{attempts} attempts failed, last error: {cause}"),
        ))
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let slots = match self.slots.get_mut() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slots.is_empty() {
            return;
        }
        tracing::debug!(connections = slots.len(), "Pool dropped, closing connections");
        for slot in slots.drain(..) {
            slot.connection.close("connection pool dropped");
        }
    }
}

impl ConnectionPool {
    /// Build a pool. With `eager_init` one connection is created up front and
    /// its failure is returned.
    pub async fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> TransportResult<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                capacity: Arc::new(Semaphore::new(config.max_size)),
                config,
                factory,
                slots: StdMutex::new(Vec::new()),
                creating: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                changed: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        };

        if pool.inner.config.eager_init {
            let permit = Arc::clone(&pool.inner.capacity)
                .try_acquire_owned()
                .map_err(|_| TransportError::PoolExhausted {
                    max_size: pool.inner.config.max_size,
                })?;
            let connection = {
                let _creating = CreatingGuard::new(&pool.inner);
                pool.inner.create_with_retries().await?
            };
            pool.adopt(connection, permit)?;
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection.
    pub async fn acquire(&self, options: AcquireOptions) -> TransportResult<PooledConnection> {
        let inner = &self.inner;
        let timeout = options.timeout.unwrap_or(inner.config.acquire_timeout);
        let deadline = Instant::now() + timeout;
        let mut in_flight_deadline = None;

        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(TransportError::PoolClosed);
            }

            let notified = inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = inner.lock_slots();
                PoolInner::prune(&mut slots);
                if let Some(connection) = PoolInner::pick_idle(&slots) {
                    return Ok(PooledConnection::new(connection, inner));
                }
            }

            if let Ok(permit) = Arc::clone(&inner.capacity).try_acquire_owned() {
                let creating = CreatingGuard::new(inner);
                let connection = inner.create_with_retries().await?;
                let lease = PooledConnection::new(connection.clone(), inner);
                self.adopt(connection, permit)?;
                drop(creating);
                return Ok(lease);
            }

            {
                let slots = inner.lock_slots();
                if let Some(connection) = PoolInner::pick_least_leased(
                    &slots,
                    inner.config.max_leases_per_connection,
                ) {
                    return Ok(PooledConnection::new(connection, inner));
                }
            }

            let wait_until = if inner.config.block_when_exhausted {
                deadline
            } else if options.last_attempt
                && inner.config.wait_for_in_flight_create
                && inner.creating.load(Ordering::Acquire) > 0
            {
                *in_flight_deadline
                    .get_or_insert_with(|| Instant::now() + inner.config.in_flight_wait)
            } else {
                return Err(self.exhausted());
            };

            tracing::trace!(
                live = self.live(),
                creating = inner.creating.load(Ordering::Acquire),
                "Pool exhausted, waiting"
            );
            if tokio::time::timeout_at(wait_until, notified).await.is_err() {
                return Err(self.exhausted());
            }
        }
    }

    /// Return a lease early. Dropping it has the same effect.
    pub fn release(&self, lease: PooledConnection) {
        drop(lease);
    }

    /// Whether `acquire` could succeed right now without waiting.
    pub fn can_acquire(&self) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.inner.capacity.available_permits() > 0 {
            return true;
        }
        let slots = self.inner.lock_slots();
        PoolInner::pick_least_leased(&slots, self.inner.config.max_leases_per_connection)
            .is_some()
    }

    /// Open connections in the pool.
    pub fn live(&self) -> usize {
        self.inner
            .lock_slots()
            .iter()
            .filter(|slot| !slot.connection.is_closed())
            .count()
    }

    /// Outstanding leases across all connections.
    pub fn leased(&self) -> usize {
        self.inner
            .lock_slots()
            .iter()
            .map(|slot| slot.connection.leases())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every connection, resolving their pending requests first.
    pub fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Slot> = std::mem::take(&mut *self.inner.lock_slots());
        tracing::debug!(connections = drained.len(), "Closing pool");
        for slot in &drained {
            slot.connection.close("connection pool closed");
        }
        drop(drained);
        self.inner.changed.notify_waiters();
    }

    /// Add a freshly created connection. A pool closed while it was being
    /// created closes it instead.
    fn adopt(
        &self,
        connection: Connection,
        permit: OwnedSemaphorePermit,
    ) -> TransportResult<()> {
        let watched = connection.clone();
        {
            // `close_all` sets the flag before taking the slots, so checking
            // it under the lock never strands a connection.
            let mut slots = self.inner.lock_slots();
            if self.inner.closed.load(Ordering::Acquire) {
                drop(slots);
                connection.close("connection pool closed");
                return Err(TransportError::PoolClosed);
            }
            slots.push(Slot {
                connection,
                _permit: permit,
            });
        }
        self.inner.changed.notify_waiters();

        let pool = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(pool) = pool.upgrade() {
                tracing::debug!(connection = %watched.name(), "Pooled connection closed");
                PoolInner::prune(&mut pool.lock_slots());
                pool.changed.notify_waiters();
            }
        });
        Ok(())
    }

    fn exhausted(&self) -> TransportError {
        TransportError::PoolExhausted {
            max_size: self.inner.config.max_size,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.factory.describe())
            .field("max_size", &self.inner.config.max_size)
            .field("live", &self.live())
            .field("closed", &self.is_closed())
            .finish()
    }
}
