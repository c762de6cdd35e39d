//! Request/response correlation.
//!
//! Every outstanding two-way request lives in its connection's
//! [`PendingTable`] from submission until exactly one resolution. Removal from
//! the table is the linearization point: whichever path (response, deadline,
//! write failure, connection teardown) removes the entry owns its single-use
//! [`Completion`] and is the only one that resolves it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{TransportError, TransportResult};
use crate::frame::{Body, FrameTiming, Status};
use crate::payload::RpcResult;
use crate::timer::{MAX_DELAY, TimeoutTarget, TimerToken};

/// Latency breakdown of one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseTiming {
    pub first_byte_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub deserialize_begin: Option<Instant>,
    pub deserialize_cost: Option<Duration>,
}

impl ResponseTiming {
    pub fn from_frame(timing: Option<FrameTiming>) -> Self {
        Self {
            first_byte_at: timing.map(|t| t.first_byte_at),
            completed_at: timing.map(|t| t.completed_at),
            ..Self::default()
        }
    }
}

/// A decoded ok response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: u64,
    pub result: RpcResult,
    pub timing: ResponseTiming,
}

/// An undecoded response; the receiver owns the body.
#[derive(Debug)]
pub struct RawResponse {
    pub request_id: u64,
    pub status: Status,
    pub serialization_id: u8,
    pub body: Body,
    pub timing: ResponseTiming,
}

/// Callback-style completion.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, response: Response);
    fn on_error(&self, error: TransportError);
}

/// How a request's outcome reaches its caller.
pub enum Completion {
    /// Decoded by the dispatcher, delivered through a oneshot.
    Decoded(oneshot::Sender<TransportResult<Response>>),
    /// Delivered undecoded; the caller decodes on its own task.
    Raw(oneshot::Sender<TransportResult<RawResponse>>),
    /// Delivered to a listener on whichever thread resolves it.
    Listener(Arc<dyn ResponseListener>),
}

impl Completion {
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    pub fn fail(self, error: TransportError) {
        match self {
            Self::Decoded(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Raw(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Listener(listener) => listener.on_error(error),
        }
    }

    /// Deliver a decoded response. A raw completion receives the error
    /// instead, since its body is already gone.
    pub fn succeed(self, response: Response) {
        match self {
            Self::Decoded(tx) => {
                let _ = tx.send(Ok(response));
            }
            Self::Listener(listener) => listener.on_response(response),
            Self::Raw(tx) => {
                let _ = tx.send(Err(TransportError::Internal(
                    "raw completion handed a decoded response".to_string(),
                )));
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Decoded(_) => "Decoded",
            Self::Raw(_) => "Raw",
            Self::Listener(_) => "Listener",
        };
        f.write_str(kind)
    }
}

/// Why a pending request left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Success,
    WriteFailed,
    SendTimeout,
    ResponseTimeout,
    ConnectionInactive,
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    AwaitingWrite,
    Written,
    WriteFailed,
}

const AWAITING: u8 = 0;
const WRITTEN: u8 = 1;
const FAILED: u8 = 2;

/// Outcome of the request's write, shared between the writer and the table.
#[derive(Debug, Default)]
pub struct WriteState {
    phase: AtomicU8,
    failure: OnceLock<String>,
}

impl WriteState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_written(&self) {
        let _ = self
            .phase
            .compare_exchange(AWAITING, WRITTEN, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        let _ = self.failure.set(reason.into());
        self.phase.store(FAILED, Ordering::Release);
    }

    pub fn phase(&self) -> WritePhase {
        match self.phase.load(Ordering::Acquire) {
            WRITTEN => WritePhase::Written,
            FAILED => WritePhase::WriteFailed,
            _ => WritePhase::AwaitingWrite,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }
}

/// One outstanding two-way request.
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: u64,
    pub completion: Completion,
    pub timeout: Duration,
    pub deadline: Instant,
    pub write_state: Arc<WriteState>,
    pub timer: Option<TimerToken>,
}

impl PendingRequest {
    pub fn new(request_id: u64, completion: Completion, timeout: Duration) -> Self {
        Self {
            request_id,
            completion,
            timeout,
            deadline: Instant::now() + timeout.min(MAX_DELAY),
            write_state: WriteState::new(),
            timer: None,
        }
    }

    pub fn fail(self, resolution: Resolution, error: TransportError) {
        tracing::debug!(
            request_id = self.request_id,
            ?resolution,
            error = %error,
            "Request resolved with error"
        );
        self.completion.fail(error);
    }
}

/// Pending requests of one connection.
#[derive(Debug)]
pub struct PendingTable {
    connection: String,
    peer: String,
    entries: DashMap<u64, PendingRequest>,
}

impl PendingTable {
    pub fn new(connection: impl Into<String>, peer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            connection: connection.into(),
            peer: peer.into(),
            entries: DashMap::new(),
        })
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn insert(&self, request: PendingRequest) {
        let request_id = request.request_id;
        if let Some(previous) = self.entries.insert(request_id, request) {
            tracing::error!(
                connection = %self.connection,
                request_id,
                "Request id reused while pending"
            );
            previous.fail(
                Resolution::ProtocolError,
                TransportError::Internal(format!("request id {request_id} reused")),
            );
        }
    }

    /// Attach the deadline token. Returns false if the request already left
    /// the table, in which case the caller should cancel the token.
    pub fn set_timer(&self, request_id: u64, token: TimerToken) -> bool {
        match self.entries.get_mut(&request_id) {
            Some(mut entry) => {
                entry.timer = Some(token);
                true
            }
            None => false,
        }
    }

    /// Remove a request. At most one caller gets `Some` for a given id.
    pub fn take(&self, request_id: u64) -> Option<PendingRequest> {
        self.entries.remove(&request_id).map(|(_, request)| request)
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<PendingRequest> {
        let ids: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    /// Resolve every entry with `error`.
    pub fn fail_all(&self, resolution: Resolution, error: &TransportError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for request in drained {
            request.fail(resolution, error.clone());
        }
        if count > 0 {
            tracing::debug!(
                connection = %self.connection,
                count,
                ?resolution,
                "Drained pending requests"
            );
        }
        count
    }

    /// Fail one request whose write did not succeed.
    pub fn fail_write(&self, request_id: u64, reason: &str) -> bool {
        let Some(request) = self.take(request_id) else {
            return false;
        };
        request.write_state.mark_failed(reason);
        let error = TransportError::connect_failed(
            self.peer.clone(),
            format!("write of request {request_id} failed: {reason}"),
        );
        request.fail(Resolution::WriteFailed, error);
        true
    }

    fn timeout_error(&self, request: &PendingRequest) -> (Resolution, TransportError) {
        let timeout_ms = request.timeout.as_millis() as u64;
        match request.write_state.phase() {
            WritePhase::WriteFailed => (
                Resolution::WriteFailed,
                TransportError::connect_failed(
                    self.peer.clone(),
                    request.write_state.failure().unwrap_or("write failed"),
                ),
            ),
            WritePhase::AwaitingWrite => (
                Resolution::SendTimeout,
                TransportError::RequestTimeout {
                    connection: self.connection.clone(),
                    request_id: request.request_id,
                    timeout_ms,
                },
            ),
            WritePhase::Written => (
                Resolution::ResponseTimeout,
                TransportError::ResponseTimeout {
                    connection: self.connection.clone(),
                    request_id: request.request_id,
                    timeout_ms,
                },
            ),
        }
    }
}

impl TimeoutTarget for PendingTable {
    fn expire(&self, request_id: u64) {
        let Some(request) = self.take(request_id) else {
            return;
        };
        let (resolution, error) = self.timeout_error(&request);
        tracing::warn!(
            connection = %self.connection,
            request_id,
            ?resolution,
            "Request timed out"
        );
        request.fail(resolution, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn decoded(id: u64) -> (PendingRequest, oneshot::Receiver<TransportResult<Response>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest::new(id, Completion::Decoded(tx), Duration::from_millis(50)),
            rx,
        )
    }

    #[test]
    fn take_is_at_most_once() {
        let table = PendingTable::new("conn-1", "127.0.0.1:1");
        let (request, _rx) = decoded(42);
        table.insert(request);

        assert!(table.take(42).is_some());
        assert!(table.take(42).is_none());
        table.expire(42);
        assert!(table.is_empty());
    }

    #[test]
    fn expiry_distinguishes_send_and_response_timeouts() {
        let table = PendingTable::new("conn-1", "peer");

        let (request, mut unsent) = decoded(1);
        table.insert(request);
        table.expire(1);
        assert!(matches!(
            unsent.try_recv().unwrap(),
            Err(TransportError::RequestTimeout { request_id: 1, .. })
        ));

        let (request, mut sent) = decoded(2);
        request.write_state.mark_written();
        table.insert(request);
        table.expire(2);
        let err = sent.try_recv().unwrap().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"no response for request 2 on conn-1 within 50ms");
    }

    #[test]
    fn write_failure_fails_only_that_request() {
        let table = PendingTable::new("conn-1", "peer");
        let (first, mut first_rx) = decoded(1);
        let (second, mut second_rx) = decoded(2);
        table.insert(first);
        table.insert(second);

        assert!(table.fail_write(1, "broken pipe"));
        assert!(matches!(
            first_rx.try_recv().unwrap(),
            Err(TransportError::ConnectFailed { .. })
        ));
        assert!(second_rx.try_recv().is_err(), "second is still pending");
        assert!(table.contains(2));

        // A late write failure for a resolved id does nothing.
        assert!(!table.fail_write(1, "again"));
    }

    #[test]
    fn late_write_failure_is_reported_on_expiry() {
        let table = PendingTable::new("conn-1", "peer");
        let (request, mut rx) = decoded(5);
        let state = Arc::clone(&request.write_state);
        table.insert(request);
        state.mark_failed("reset by peer");
        // Failure wins over a later success notification.
        state.mark_written();
        assert_eq!(state.phase(), WritePhase::WriteFailed);

        table.expire(5);
        match rx.try_recv().unwrap() {
            Err(TransportError::ConnectFailed { reason, .. }) => {
                assert_eq!(reason, "reset by peer")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[derive(Default)]
    struct Collect {
        errors: Mutex<Vec<TransportError>>,
    }

    impl ResponseListener for Collect {
        fn on_response(&self, _response: Response) {
            panic!("no response expected");
        }

        fn on_error(&self, error: TransportError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    #[test]
    fn fail_all_resolves_every_strategy() {
        let table = PendingTable::new("conn-1", "peer");
        let listener = Arc::new(Collect::default());
        let (decoded_req, mut decoded_rx) = decoded(1);
        let (raw_tx, mut raw_rx) = oneshot::channel();
        table.insert(decoded_req);
        table.insert(PendingRequest::new(
            2,
            Completion::Raw(raw_tx),
            Duration::from_secs(1),
        ));
        table.insert(PendingRequest::new(
            3,
            Completion::Listener(listener.clone()),
            Duration::from_secs(1),
        ));

        let error = TransportError::inactive("conn-1", "closed");
        assert_eq!(table.fail_all(Resolution::ConnectionInactive, &error), 3);
        assert!(table.is_empty());
        assert_eq!(decoded_rx.try_recv().unwrap().unwrap_err(), error);
        assert_eq!(raw_rx.try_recv().unwrap().unwrap_err(), error);
        assert_eq!(listener.errors.lock().unwrap().as_slice(), &[error]);
    }

    #[test]
    fn reused_id_fails_the_previous_request() {
        let table = PendingTable::new("conn-1", "peer");
        let (first, mut first_rx) = decoded(9);
        let (second, _second_rx) = decoded(9);
        table.insert(first);
        table.insert(second);
        assert!(matches!(
            first_rx.try_recv().unwrap(),
            Err(TransportError::Internal(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[derive(Default)]
    struct Tally {
        responses: std::sync::atomic::AtomicUsize,
        errors: std::sync::atomic::AtomicUsize,
    }

    impl ResponseListener for Tally {
        fn on_response(&self, _response: Response) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _error: TransportError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn response_racing_expiry_resolves_once() {
        const IDS: u64 = 16;

        for _ in 0..200 {
            let table = PendingTable::new("conn-1", "peer");
            let listeners: Vec<Arc<Tally>> = (0..IDS).map(|_| Arc::default()).collect();
            for (id, listener) in (1..=IDS).zip(&listeners) {
                table.insert(PendingRequest::new(
                    id,
                    Completion::Listener(listener.clone()),
                    Duration::from_millis(1),
                ));
            }

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let responder = std::thread::spawn({
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                move || {
                    barrier.wait();
                    for id in 1..=IDS {
                        if let Some(request) = table.take(id) {
                            request.completion.succeed(Response {
                                request_id: id,
                                result: RpcResult::null(),
                                timing: ResponseTiming::default(),
                            });
                        }
                    }
                }
            });
            let expirer = std::thread::spawn({
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                move || {
                    barrier.wait();
                    for id in (1..=IDS).rev() {
                        table.expire(id);
                    }
                }
            });
            responder.join().unwrap();
            expirer.join().unwrap();

            assert!(table.is_empty());
            for listener in &listeners {
                let responses = listener.responses.load(Ordering::SeqCst);
                let errors = listener.errors.load(Ordering::SeqCst);
                assert_eq!(responses + errors, 1, "{responses} responses, {errors} errors");
            }
        }
    }
}
