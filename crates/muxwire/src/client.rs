//! Client façade over a connection pool.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::TransportConfig;
use crate::context::TransportContext;
use crate::correlation::{RawResponse, Response, ResponseListener};
use crate::error::{TransportError, TransportResult};
use crate::frame::Body;
use crate::pool::{AcquireOptions, ConnectionPool, PooledConnection};
use crate::transport::{ChannelSecurity, Endpoint, EndpointFactory};

/// Issues requests to one endpoint over pooled, multiplexed connections.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    pool: ConnectionPool,
    context: Arc<TransportContext>,
    config: TransportConfig,
}

impl Client {
    /// Connect with a fresh [`TransportContext`] built from `config`.
    pub async fn connect(endpoint: Endpoint, config: TransportConfig) -> TransportResult<Self> {
        let context = TransportContext::new(&config.dispatch)?;
        Self::connect_with(endpoint, config, context, None).await
    }

    /// Connect sharing `context` with other clients or servers.
    pub async fn connect_with(
        endpoint: Endpoint,
        config: TransportConfig,
        context: Arc<TransportContext>,
        security: Option<Arc<dyn ChannelSecurity>>,
    ) -> TransportResult<Self> {
        let mut factory = EndpointFactory::new(
            endpoint.clone(),
            config.options.clone(),
            config.connection.clone(),
            Arc::clone(&context),
        );
        if let Some(security) = security {
            factory = factory.with_security(security);
        }
        let pool = ConnectionPool::new(config.pool.clone(), Arc::new(factory)).await?;
        tracing::debug!(endpoint = %endpoint, max_size = config.pool.max_size, "Client ready");
        Ok(Self {
            endpoint,
            pool,
            context,
            config,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.context
    }

    /// Encode `value` in the configured serialization.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> TransportResult<Body> {
        let body = self
            .context
            .registry()
            .encode(self.config.connection.serialization_id, |out| {
                out.write_object(value)
            })?;
        Ok(body)
    }

    /// Two-way request with a serializable argument.
    pub async fn request<T: Serialize + ?Sized>(&self, value: &T) -> TransportResult<Response> {
        let body = self.encode(value)?;
        self.request_body(body, None).await
    }

    /// Two-way request with a pre-encoded body.
    pub async fn request_body(
        &self,
        body: Body,
        timeout: Option<Duration>,
    ) -> TransportResult<Response> {
        let lease = self.lease().await?;
        lease.request(body, timeout).await
    }

    /// Two-way request; the caller decodes the returned body.
    pub async fn request_raw(
        &self,
        body: Body,
        timeout: Option<Duration>,
    ) -> TransportResult<RawResponse> {
        let lease = self.lease().await?;
        lease.request_raw(body, timeout).await
    }

    /// Two-way request resolved through `listener`. Returns the request id
    /// once the request is submitted.
    pub async fn request_with_listener(
        &self,
        body: Body,
        listener: Arc<dyn ResponseListener>,
        timeout: Option<Duration>,
    ) -> TransportResult<u64> {
        let lease = self.lease().await?;
        Ok(lease.request_with_listener(body, listener, timeout).await)
    }

    /// One-way request with a serializable argument.
    pub async fn send_oneway<T: Serialize + ?Sized>(&self, value: &T) -> TransportResult<()> {
        let body = self.encode(value)?;
        let lease = self.lease().await?;
        lease.send_oneway(body).await
    }

    /// Close every pooled connection, failing in-flight requests.
    pub fn close(&self) {
        tracing::debug!(endpoint = %self.endpoint, "Closing client");
        self.pool.close_all();
    }

    /// One retry as a last attempt, which may wait for an in-flight creation.
    async fn lease(&self) -> TransportResult<PooledConnection> {
        match self.pool.acquire(AcquireOptions::default()).await {
            Err(TransportError::PoolExhausted { .. }) => {
                self.pool
                    .acquire(AcquireOptions::default().last_attempt())
                    .await
            }
            other => other,
        }
    }
}
