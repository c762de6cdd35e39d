//! One multiplexed protocol connection.
//!
//! A connection owns a reader task and a writer task over a split byte
//! stream. Many requests share it concurrently; each is tracked in the
//! connection's [`PendingTable`] under a connection-unique id.
//!
//! The reader resets the heartbeat counter on every inbound frame, answers
//! heartbeat requests, correlates responses and routes inbound requests to the
//! [`RequestHandler`]. When the stream stays read-idle for the configured
//! interval it probes the peer, and closes the connection once too many probes
//! go unanswered.
//!
//! Teardown always drains: every pending request is resolved before the tasks
//! stop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::context::TransportContext;
use crate::correlation::{
    Completion, PendingRequest, PendingTable, RawResponse, Resolution, Response, ResponseListener,
    WriteState,
};
use crate::error::{TransportError, TransportResult};
use crate::frame::{Body, CodecError, Frame, FrameCodec, Status};
use crate::heartbeat::{self, HeartbeatState, IdleDecision};
use crate::server::{HandlerError, Request, RequestHandler};
use crate::timer::TimeoutTarget;

/// How long the writer may spend flushing on the way out.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Identity of a connection being spawned.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: String,
    pub role: Role,
    /// Pool generation the connection was created in.
    pub generation: u64,
}

impl ConnectionInfo {
    pub fn client(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            role: Role::Client,
            generation: 0,
        }
    }

    pub fn server(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            role: Role::Server,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

/// What the writer reports back after a frame hits the transport.
enum WriteAck {
    /// Nobody waits.
    None,
    Request {
        request_id: u64,
        state: Arc<WriteState>,
    },
    Probe,
    Notify(oneshot::Sender<Result<(), String>>),
}

struct Outbound {
    frame: Frame,
    ack: WriteAck,
}

struct Shared {
    id: Uuid,
    name: String,
    info: ConnectionInfo,
    config: ConnectionConfig,
    pending: Arc<PendingTable>,
    heartbeat: HeartbeatState,
    next_id: AtomicU64,
    leases: AtomicUsize,
    closed: AtomicBool,
    close_reason: OnceLock<TransportError>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Outbound>,
    context: Arc<TransportContext>,
}

/// Cloneable handle on a live connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

enum ReadEvent {
    Frame(Frame),
    Idle,
    Eof,
    Failed(CodecError),
}

impl Connection {
    /// Start the reader and writer tasks over `io`.
    pub fn spawn<T>(
        io: T,
        info: ConnectionInfo,
        config: ConnectionConfig,
        context: Arc<TransportContext>,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = Uuid::new_v4();
        let name = format!("{}-{}", info.role, &id.simple().to_string()[..8]);
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let codec = || {
            FrameCodec::new(
                Arc::clone(context.registry()),
                Arc::clone(context.arena()),
                config.payload_limit,
            )
        };
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(read_half, codec());
        let writer = FramedWrite::new(write_half, codec());

        let shared = Arc::new(Shared {
            id,
            pending: PendingTable::new(name.clone(), info.peer.clone()),
            name,
            info,
            config,
            heartbeat: HeartbeatState::new(),
            next_id: AtomicU64::new(1),
            leases: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            outbound: tx,
            context,
        });

        tracing::debug!(
            connection = %shared.name,
            peer = %shared.info.peer,
            generation = shared.info.generation,
            "Connection opened"
        );
        tokio::spawn(read_loop(Arc::clone(&shared), reader, handler));
        tokio::spawn(write_loop(Arc::clone(&shared), writer, rx));

        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn peer(&self) -> &str {
        &self.shared.info.peer
    }

    pub fn role(&self) -> Role {
        self.shared.info.role
    }

    pub fn generation(&self) -> u64 {
        self.shared.info.generation
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.shared.context
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.shared.pending.contains(request_id)
    }

    pub fn heartbeat_unanswered(&self) -> u32 {
        self.shared.heartbeat.unanswered()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<&TransportError> {
        self.shared.close_reason.get()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Close the connection, resolving every pending request first.
    pub fn close(&self, reason: impl Into<String>) {
        let error = TransportError::inactive(self.shared.name.clone(), reason);
        self.shared
            .shutdown(error, Resolution::ConnectionInactive);
    }

    pub(crate) fn leases(&self) -> usize {
        self.shared.leases.load(Ordering::Acquire)
    }

    pub(crate) fn add_lease(&self) {
        self.shared.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_lease(&self) {
        let _ = self
            .shared
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Submit a two-way request resolved through `completion`.
    ///
    /// Returns the request id. Failures, including a closed connection, are
    /// delivered through the completion.
    pub async fn submit(
        &self,
        body: Body,
        completion: Completion,
        timeout: Option<Duration>,
    ) -> u64 {
        let shared = &self.shared;
        let request_id = shared.next_request_id();
        let timeout = timeout.unwrap_or(shared.config.request_timeout);

        if self.is_closed() {
            completion.fail(shared.inactive_error());
            return request_id;
        }

        let request = PendingRequest::new(request_id, completion, timeout);
        let state = Arc::clone(&request.write_state);
        shared.pending.insert(request);

        // A concurrent shutdown either sees this entry or we see its flag.
        if self.is_closed() {
            if let Some(request) = shared.pending.take(request_id) {
                request.fail(Resolution::ConnectionInactive, shared.inactive_error());
            }
            return request_id;
        }

        let wheel = shared.context.wheel();
        let target = Arc::downgrade(&shared.pending);
        let target: Weak<dyn TimeoutTarget> = target;
        let token = wheel.schedule(target, request_id, timeout);
        if !shared.pending.set_timer(request_id, token) {
            wheel.cancel(token);
        }

        tracing::trace!(connection = %shared.name, request_id, "Submitting request");
        let frame = Frame::request(request_id, shared.config.serialization_id, body);
        let outbound = Outbound {
            frame,
            ack: WriteAck::Request { request_id, state },
        };
        if shared.outbound.send(outbound).await.is_err() {
            shared.pending.fail_write(request_id, "connection writer stopped");
        }
        request_id
    }

    /// Two-way request decoded off the I/O path.
    pub async fn request(&self, body: Body, timeout: Option<Duration>) -> TransportResult<Response> {
        let (tx, rx) = oneshot::channel();
        self.submit(body, Completion::Decoded(tx), timeout).await;
        rx.await
            .map_err(|_| TransportError::Internal("completion dropped".to_string()))?
    }

    /// Two-way request whose body the caller decodes.
    pub async fn request_raw(
        &self,
        body: Body,
        timeout: Option<Duration>,
    ) -> TransportResult<RawResponse> {
        let (tx, rx) = oneshot::channel();
        self.submit(body, Completion::Raw(tx), timeout).await;
        rx.await
            .map_err(|_| TransportError::Internal("completion dropped".to_string()))?
    }

    /// Two-way request resolved through `listener`.
    pub async fn request_with_listener(
        &self,
        body: Body,
        listener: Arc<dyn ResponseListener>,
        timeout: Option<Duration>,
    ) -> u64 {
        self.submit(body, Completion::Listener(listener), timeout)
            .await
    }

    /// One-way request. Resolves once the frame reached the transport.
    pub async fn send_oneway(&self, body: Body) -> TransportResult<()> {
        let shared = &self.shared;
        let frame = Frame::oneway(
            shared.next_request_id(),
            shared.config.serialization_id,
            body,
        );
        self.send_acked(frame).await
    }

    /// Event notification. Resolves once the frame reached the transport.
    pub async fn send_event(&self, body: Body) -> TransportResult<()> {
        let shared = &self.shared;
        let frame = Frame::event(
            shared.next_request_id(),
            shared.config.serialization_id,
            body,
        );
        self.send_acked(frame).await
    }

    async fn send_acked(&self, frame: Frame) -> TransportResult<()> {
        if self.is_closed() {
            return Err(self.shared.inactive_error());
        }
        let (tx, rx) = oneshot::channel();
        let outbound = Outbound {
            frame,
            ack: WriteAck::Notify(tx),
        };
        if self.shared.outbound.send(outbound).await.is_err() {
            return Err(self.shared.inactive_error());
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::connect_failed(
                self.shared.info.peer.clone(),
                reason,
            )),
            Err(_) => Err(self.shared.inactive_error()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("peer", &self.shared.info.peer)
            .field("generation", &self.shared.info.generation)
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn inactive_error(&self) -> TransportError {
        self.close_reason
            .get()
            .cloned()
            .unwrap_or_else(|| TransportError::inactive(self.name.clone(), "connection closed"))
    }

    /// Mark closed, drain pending requests, then stop both tasks.
    fn shutdown(&self, reason: TransportError, resolution: Resolution) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_reason.set(reason.clone());
        tracing::debug!(
            connection = %self.name,
            peer = %self.info.peer,
            reason = %reason,
            "Connection closing"
        );
        self.pending.fail_all(resolution, &reason);
        self.cancel.cancel();
    }

    /// Queue a frame without waiting for space. Used from the reader task.
    fn try_enqueue(&self, frame: Frame, ack: WriteAck) -> bool {
        match self.outbound.try_send(Outbound { frame, ack }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection = %self.name, "Outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn on_idle(&self) -> Option<TransportError> {
        match self.heartbeat.on_idle(self.config.max_unanswered) {
            IdleDecision::Close { unanswered } => {
                tracing::warn!(
                    connection = %self.name,
                    unanswered,
                    "Heartbeat unanswered, closing"
                );
                Some(TransportError::inactive(
                    self.name.clone(),
                    format!("{unanswered} heartbeats unanswered"),
                ))
            }
            IdleDecision::Probe => {
                let request_id = self.next_request_id();
                match heartbeat::probe(
                    self.context.registry(),
                    request_id,
                    self.config.serialization_id,
                ) {
                    Ok(frame) => {
                        tracing::trace!(connection = %self.name, request_id, "Sending heartbeat");
                        if self.try_enqueue(frame, WriteAck::Probe) {
                            None
                        } else {
                            // A peer that stopped reading backs the queue up.
                            Some(TransportError::inactive(
                                self.name.clone(),
                                "heartbeat write failed: outbound queue full",
                            ))
                        }
                    }
                    Err(e) => Some(TransportError::inactive(
                        self.name.clone(),
                        format!("cannot build heartbeat: {e}"),
                    )),
                }
            }
        }
    }

    fn on_frame(self: &Arc<Self>, frame: Frame, handler: &Option<Arc<dyn RequestHandler>>) {
        if frame.is_heartbeat {
            if frame.is_request {
                match heartbeat::answer(self.context.registry(), &frame) {
                    Ok(reply) => {
                        self.try_enqueue(reply, WriteAck::None);
                    }
                    Err(e) => tracing::warn!(
                        connection = %self.name,
                        error = %e,
                        "Cannot answer heartbeat"
                    ),
                }
            } else {
                tracing::trace!(connection = %self.name, request_id = frame.request_id, "Heartbeat answered");
            }
            return;
        }

        if frame.is_request {
            self.on_request(frame, handler);
            return;
        }

        let request_id = frame.request_id;
        let Some(request) = self.pending.take(request_id) else {
            tracing::debug!(
                connection = %self.name,
                request_id,
                "Response for unknown or resolved request, dropping"
            );
            return;
        };
        if let Some(token) = request.timer {
            self.context.wheel().cancel(token);
        }
        request.write_state.mark_written();
        tracing::trace!(connection = %self.name, request_id, resolution = ?Resolution::Success, "Response correlated");
        self.context.dispatcher().submit(frame, request.completion);
    }

    fn on_request(self: &Arc<Self>, frame: Frame, handler: &Option<Arc<dyn RequestHandler>>) {
        let Some(handler) = handler.clone() else {
            tracing::warn!(
                connection = %self.name,
                request_id = frame.request_id,
                kind = frame.kind(),
                "Inbound request without a handler"
            );
            if frame.two_way {
                let reply = self.error_response(
                    &frame,
                    HandlerError::server("no request handler on this endpoint"),
                );
                self.try_enqueue(reply, WriteAck::None);
            }
            return;
        };

        if !self.context.registry().contains(frame.serialization_id) {
            if frame.two_way {
                let reply = self.error_response(
                    &frame,
                    HandlerError::bad_request(format!(
                        "unsupported serialization id {}",
                        frame.serialization_id
                    )),
                );
                self.try_enqueue(reply, WriteAck::None);
            }
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = frame.request_id;
            let serialization_id = frame.serialization_id;
            let two_way = frame.two_way;
            let request = Request {
                request_id,
                serialization_id,
                is_event: frame.is_event,
                two_way,
                connection: shared.name.clone(),
                body: frame.into_body(),
            };
            let outcome = handler.handle(request).await;
            if !two_way {
                if let Err(e) = outcome {
                    tracing::warn!(connection = %shared.name, request_id, error = %e, "One-way request failed");
                }
                return;
            }

            let reply = match outcome {
                Ok(result) => match result.to_body(shared.context.registry(), serialization_id) {
                    Ok(body) => Frame::response(request_id, serialization_id, Status::Ok, body),
                    Err(e) => shared.error_frame(
                        request_id,
                        serialization_id,
                        HandlerError::new(Status::BadResponse, e.to_string()),
                    ),
                },
                Err(e) => shared.error_frame(request_id, serialization_id, e),
            };
            let _ = shared
                .outbound
                .send(Outbound {
                    frame: reply,
                    ack: WriteAck::None,
                })
                .await;
        });
    }

    fn error_response(&self, request: &Frame, error: HandlerError) -> Frame {
        self.error_frame(request.request_id, request.serialization_id, error)
    }

    fn error_frame(&self, request_id: u64, serialization_id: u8, error: HandlerError) -> Frame {
        let registry = self.context.registry();
        let serialization_id = if registry.contains(serialization_id) {
            serialization_id
        } else {
            self.config.serialization_id
        };
        let body = registry
            .encode(serialization_id, |out| out.write_utf(&error.message))
            .unwrap_or_else(|_| Body::empty());
        Frame::response(request_id, serialization_id, error.status, body)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let error = self.inactive_error();
            self.pending
                .fail_all(Resolution::ConnectionInactive, &error);
        }
    }
}

async fn next_event<R>(
    framed: &mut FramedRead<R, FrameCodec>,
    idle: Option<Duration>,
) -> ReadEvent
where
    R: AsyncRead + Unpin,
{
    let next = match idle {
        Some(interval) => match tokio::time::timeout(interval, framed.next()).await {
            Ok(next) => next,
            Err(_) => return ReadEvent::Idle,
        },
        None => framed.next().await,
    };
    match next {
        Some(Ok(frame)) => ReadEvent::Frame(frame),
        Some(Err(e)) => ReadEvent::Failed(e),
        None => ReadEvent::Eof,
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut framed: FramedRead<R, FrameCodec>,
    handler: Option<Arc<dyn RequestHandler>>,
) where
    R: AsyncRead + Unpin,
{
    let idle = shared.config.idle_interval;
    let (reason, resolution) = loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break (None, Resolution::ConnectionInactive),
            event = next_event(&mut framed, idle) => event,
        };

        match event {
            ReadEvent::Frame(frame) => {
                shared.heartbeat.observe_inbound();
                shared.on_frame(frame, &handler);
            }
            ReadEvent::Idle => {
                if let Some(reason) = shared.on_idle() {
                    break (Some(reason), Resolution::ConnectionInactive);
                }
            }
            ReadEvent::Eof => {
                let reason = TransportError::inactive(shared.name.clone(), "closed by peer");
                break (Some(reason), Resolution::ConnectionInactive);
            }
            ReadEvent::Failed(e) => {
                let resolution = match e {
                    CodecError::Io(_) => Resolution::ConnectionInactive,
                    _ => Resolution::ProtocolError,
                };
                tracing::warn!(connection = %shared.name, error = %e, "Read failed");
                break (
                    Some(TransportError::from_codec(&shared.name, &e)),
                    resolution,
                );
            }
        }
    };

    if let Some(reason) = reason {
        shared.shutdown(reason, resolution);
    }
    tracing::trace!(connection = %shared.name, "Reader stopped");
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut framed: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let Outbound { frame, ack } = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let request_id = frame.request_id;
        let kind = frame.kind();
        // A peer that stopped reading must not pin the writer past shutdown.
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = framed.send(frame) => result,
        };

        let failure = match &result {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(
                    connection = %shared.name,
                    request_id,
                    kind,
                    error = %e,
                    "Write failed"
                );
                Some(e.to_string())
            }
        };

        match (ack, failure.as_deref()) {
            (WriteAck::None, _) => {}
            (WriteAck::Request { state, .. }, None) => state.mark_written(),
            (WriteAck::Request { request_id, .. }, Some(reason)) => {
                shared.pending.fail_write(request_id, reason);
            }
            (WriteAck::Probe, None) => {
                let unanswered = shared.heartbeat.probe_written();
                tracing::trace!(connection = %shared.name, unanswered, "Heartbeat written");
            }
            (WriteAck::Probe, Some(reason)) => {
                let error =
                    TransportError::inactive(shared.name.clone(), format!("heartbeat write failed: {reason}"));
                shared.shutdown(error, Resolution::ConnectionInactive);
            }
            (WriteAck::Notify(tx), failure) => {
                let _ = tx.send(failure.map_or(Ok(()), |r| Err(r.to_string())));
            }
        }

        if let Err(CodecError::Io(e)) = result {
            let error = TransportError::inactive(shared.name.clone(), format!("write failed: {e}"));
            shared.shutdown(error, Resolution::ConnectionInactive);
            break;
        }
    }

    let _ = tokio::time::timeout(WRITER_CLOSE_GRACE, framed.close()).await;
    tracing::trace!(connection = %shared.name, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::payload::RpcResult;
    use crate::serialization::{JSON_ID, MSGPACK_ID};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    fn context() -> Arc<TransportContext> {
        TransportContext::new(&DispatchConfig::default().with_workers(2)).unwrap()
    }

    fn client_config() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_serialization(JSON_ID)
            .with_request_timeout(Duration::from_millis(50))
            .with_idle_interval(None)
    }

    /// A client connection and the raw frame stream of its peer.
    fn scripted(
        config: ConnectionConfig,
    ) -> (
        Connection,
        Framed<DuplexStream, FrameCodec>,
        Arc<TransportContext>,
    ) {
        let ctx = context();
        let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
        let conn = Connection::spawn(
            client_io,
            ConnectionInfo::client("peer:1"),
            config,
            Arc::clone(&ctx),
            None,
        );
        let peer = Framed::new(
            peer_io,
            FrameCodec::new(
                Arc::clone(ctx.registry()),
                Arc::clone(ctx.arena()),
                crate::frame::DEFAULT_PAYLOAD_LIMIT,
            ),
        );
        (conn, peer, ctx)
    }

    fn ok_reply(ctx: &TransportContext, request_id: u64, value: serde_json::Value) -> Frame {
        let body = RpcResult::value(value).to_body(ctx.registry(), JSON_ID).unwrap();
        Frame::response(request_id, JSON_ID, Status::Ok, body)
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_deadline_succeeds() {
        let (conn, mut peer, ctx) = scripted(client_config());

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::detached(&b"\"ping\"\n"[..]), None).await }
        });

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.kind(), "request");
        assert_eq!(frame.body.as_ref(), b"\"ping\"\n");
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.send(ok_reply(&ctx, frame.request_id, json!("pong")))
            .await
            .unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.request_id, frame.request_id);
        assert_eq!(response.result.into_result().unwrap(), json!("pong"));
        assert!(response.timing.first_byte_at.is_some());
        assert!(!conn.is_pending(frame.request_id));

        // The deadline passing later changes nothing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_a_response_timeout() {
        let (conn, mut peer, _ctx) = scripted(client_config());

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), None).await }
        });
        let frame = peer.next().await.unwrap().unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(
            matches!(err, TransportError::ResponseTimeout { request_id, timeout_ms: 50, .. } if request_id == frame.request_id),
            "{err:?}"
        );
        assert!(!conn.is_pending(frame.request_id));

        // A late response is dropped without effect.
        peer.send(Frame::response(
            frame.request_id,
            JSON_ID,
            Status::Ok,
            Body::empty(),
        ))
        .await
        .unwrap();
        tokio::task::yield_now().await;
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_leaves_other_deadlines_working() {
        let (conn, mut peer, _ctx) = scripted(client_config());

        let years = Duration::from_secs(3 * 365 * 24 * 60 * 60);
        let _long = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), Some(years)).await }
        });
        let _ = peer.next().await.unwrap().unwrap();

        let short = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), Some(Duration::from_millis(50))).await }
        });
        let frame = peer.next().await.unwrap().unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), short)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err, TransportError::ResponseTimeout { request_id, .. } if request_id == frame.request_id),
            "{err:?}"
        );
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_going_away_fails_pending_requests() {
        let (conn, mut peer, _ctx) = scripted(client_config());

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), None).await }
        });
        let _frame = peer.next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(peer);

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ChannelInactive { .. }), "{err:?}");
        conn.closed().await;
        assert!(conn.is_closed());
        assert_eq!(conn.pending_count(), 0);

        let err = conn.request(Body::empty(), None).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelInactive { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_protocol_is_reported_distinctly() {
        let ctx = context();
        let (client_io, mut peer_io) = tokio::io::duplex(1024);
        let conn = Connection::spawn(
            client_io,
            ConnectionInfo::client("http:80"),
            client_config().with_request_timeout(Duration::from_secs(5)),
            ctx,
            None,
        );
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), None).await }
        });
        tokio::task::yield_now().await;
        peer_io.write_all(b"HTTP/1.1 400 Bad Request\r\n").await.unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::UnknownProtocol(_)), "{err:?}");
        conn.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn responses_correlate_out_of_order() {
        let (conn, mut peer, ctx) = scripted(client_config().with_request_timeout(Duration::from_secs(1)));

        let mut requests = Vec::new();
        for i in 0..3 {
            let conn = conn.clone();
            requests.push(tokio::spawn(async move {
                let body = Body::detached(format!("{i}\n"));
                conn.request(body, None).await
            }));
        }
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(peer.next().await.unwrap().unwrap());
        }
        for frame in frames.iter().rev() {
            let echoed: serde_json::Value = serde_json::from_slice(frame.body.as_ref()).unwrap();
            peer.send(ok_reply(&ctx, frame.request_id, echoed)).await.unwrap();
        }
        for (i, request) in requests.into_iter().enumerate() {
            let response = request.await.unwrap().unwrap();
            assert_eq!(response.result.into_result().unwrap(), json!(i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeats_close_the_connection() {
        let config = client_config()
            .with_idle_interval(Some(Duration::from_millis(100)))
            .with_max_unanswered(2)
            .with_request_timeout(Duration::from_secs(10));
        let (conn, mut peer, _ctx) = scripted(config);

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), None).await }
        });
        let request = peer.next().await.unwrap().unwrap();
        assert_eq!(request.kind(), "request");

        for expected in 1..=2 {
            let probe = peer.next().await.unwrap().unwrap();
            assert_eq!(probe.kind(), "heartbeat-request");
            assert_eq!(probe.body.as_ref(), b"null\n");
            tokio::task::yield_now().await;
            assert_eq!(conn.heartbeat_unanswered(), expected);
        }

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ChannelInactive { .. }), "{err:?}");
        assert!(peer.next().await.is_none(), "no third probe, stream closed");
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_resets_heartbeat_count() {
        let config = client_config().with_idle_interval(Some(Duration::from_millis(100)));
        let (conn, mut peer, ctx) = scripted(config);

        let probe = peer.next().await.unwrap().unwrap();
        assert_eq!(probe.kind(), "heartbeat-request");
        tokio::task::yield_now().await;
        assert_eq!(conn.heartbeat_unanswered(), 1);

        let null = ctx.registry().null_payload(JSON_ID).unwrap();
        peer.send(Frame::heartbeat_response(probe.request_id, JSON_ID, null))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.heartbeat_unanswered(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_that_cannot_be_queued_closes_the_connection() {
        let ctx = context();
        // The peer never reads, so the pipe fills and the writer stalls.
        let (client_io, _peer_io) = tokio::io::duplex(64);
        let config = client_config()
            .with_idle_interval(Some(Duration::from_millis(100)))
            .with_outbound_queue(1);
        let conn = Connection::spawn(
            client_io,
            ConnectionInfo::client("stalled"),
            config,
            ctx,
            None,
        );

        let mut sends = Vec::new();
        for _ in 0..2 {
            let conn = conn.clone();
            sends.push(tokio::spawn(async move {
                conn.send_oneway(Body::detached(vec![b'x'; 1024])).await
            }));
        }

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert_eq!(conn.heartbeat_unanswered(), 0);
        let reason = conn.close_reason().unwrap().to_string();
        assert!(reason.contains("outbound queue full"), "{reason}");
        for send in sends {
            let err = send.await.unwrap().unwrap_err();
            assert!(matches!(err, TransportError::ChannelInactive { .. }), "{err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_requests_are_answered() {
        let (conn, mut peer, ctx) = scripted(client_config());
        let null = ctx.registry().null_payload(MSGPACK_ID).unwrap();
        peer.send(Frame::heartbeat_request(77, MSGPACK_ID, null))
            .await
            .unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.kind(), "heartbeat-response");
        assert_eq!(reply.request_id, 77);
        assert_eq!(reply.serialization_id, MSGPACK_ID);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_fails_only_itself() {
        let config = client_config()
            .with_payload_limit(16)
            .with_request_timeout(Duration::from_secs(1));
        let (conn, mut peer, ctx) = scripted(config);

        let err = conn
            .request(Body::detached(vec![b'x'; 64]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }), "{err:?}");
        assert!(!conn.is_closed());

        let ok = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::detached(&b"1\n"[..]), None).await }
        });
        let frame = peer.next().await.unwrap().unwrap();
        peer.send(ok_reply(&ctx, frame.request_id, json!(1))).await.unwrap();
        assert!(ok.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_drains_before_teardown() {
        let (conn, mut peer, _ctx) = scripted(client_config().with_request_timeout(Duration::from_secs(1)));
        let arena_before = conn.context().arena().live();

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Body::empty(), None).await }
        });
        let frame = peer.next().await.unwrap().unwrap();
        conn.close("shutting down");

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            TransportError::inactive(conn.name().to_string(), "shutting down")
        );
        assert!(peer.next().await.is_none());
        drop(frame);
        assert_eq!(conn.context().arena().live(), arena_before);
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Result<RpcResult, HandlerError> {
            if request.is_event {
                return Ok(RpcResult::null());
            }
            let text = std::str::from_utf8(request.body.as_ref())
                .map_err(|e| HandlerError::bad_request(e.to_string()))?
                .trim()
                .to_string();
            if text == "\"fail\"" {
                return Err(HandlerError::server("handler refused"));
            }
            Ok(RpcResult::value(json!({ "echo": text })))
        }
    }

    #[tokio::test]
    async fn client_and_server_connections_talk() {
        let ctx = context();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig::default()
            .with_serialization(JSON_ID)
            .with_request_timeout(Duration::from_secs(5));
        let client = Connection::spawn(
            a,
            ConnectionInfo::client("server"),
            config.clone(),
            Arc::clone(&ctx),
            None,
        );
        let _server = Connection::spawn(
            b,
            ConnectionInfo::server("client"),
            config,
            Arc::clone(&ctx),
            Some(Arc::new(Echo)),
        );

        let response = client
            .request(Body::detached(&b"\"hi\"\n"[..]), None)
            .await
            .unwrap();
        assert_eq!(
            response.result.into_result().unwrap(),
            json!({"echo": "\"hi\""})
        );

        let err = client
            .request(Body::detached(&b"\"fail\"\n"[..]), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Remote {
                status: Status::ServerError,
                message: "handler refused".to_string()
            }
        );

        client.send_oneway(Body::detached(&b"1\n"[..])).await.unwrap();
        client.send_event(Body::detached(&b"\"evt\"\n"[..])).await.unwrap();

        let raw = client
            .request_raw(Body::detached(&b"2\n"[..]), None)
            .await
            .unwrap();
        assert_eq!(raw.status, Status::Ok);
        let decoded = raw.decode(ctx.registry()).unwrap();
        assert_eq!(decoded.result.into_result().unwrap(), json!({"echo": "2"}));
    }
}
