//! Response deserialization off the I/O path.
//!
//! Decoding a response body can be expensive, so the connection reader hands
//! decoded-completion responses to a fixed pool of named worker threads
//! through a bounded queue. When offload is disabled, the queue is full or the
//! workers are gone, the response is decoded inline on the caller instead.
//! Raw completions are never decoded here: the body moves to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::DispatchConfig;
use crate::correlation::{Completion, RawResponse, Response, ResponseTiming};
use crate::error::{TransportError, TransportResult};
use crate::frame::{Body, Frame, Status};
use crate::payload::RpcResult;
use crate::serialization::SerializationRegistry;

struct Job {
    frame: Frame,
    completion: Completion,
}

/// Counters for offloaded and inline decodes.
#[derive(Debug, Default)]
pub struct DispatchStats {
    offloaded: AtomicU64,
    inline: AtomicU64,
}

impl DispatchStats {
    pub fn offloaded(&self) -> u64 {
        self.offloaded.load(Ordering::Relaxed)
    }

    pub fn inline(&self) -> u64 {
        self.inline.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    registry: Arc<SerializationRegistry>,
    queue: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        config: &DispatchConfig,
        registry: Arc<SerializationRegistry>,
    ) -> TransportResult<Self> {
        if !config.offload || config.workers == 0 {
            return Ok(Self {
                registry,
                queue: None,
                workers: Vec::new(),
                stats: DispatchStats::default(),
            });
        }

        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(StdMutex::new(rx));
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = Arc::clone(&rx);
            let registry = Arc::clone(&registry);
            let handle = std::thread::Builder::new()
                .name(format!("muxwire-decode-{i}"))
                .spawn(move || worker_loop(&rx, &registry))?;
            workers.push(handle);
        }
        tracing::debug!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Dispatcher started"
        );

        Ok(Self {
            registry,
            queue: Some(tx),
            workers,
            stats: DispatchStats::default(),
        })
    }

    pub fn registry(&self) -> &Arc<SerializationRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Resolve `completion` with the response `frame`.
    pub fn submit(&self, frame: Frame, completion: Completion) {
        let completion = match completion {
            Completion::Raw(tx) => {
                let _ = tx.send(Ok(into_raw(frame)));
                return;
            }
            other => other,
        };

        let job = Job { frame, completion };
        let job = match &self.queue {
            Some(queue) => match queue.try_send(job) {
                Ok(()) => {
                    self.stats.offloaded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(job)) => {
                    tracing::debug!(
                        request_id = job.frame.request_id,
                        "Decode queue full, decoding inline"
                    );
                    job
                }
                Err(TrySendError::Closed(job)) => {
                    tracing::warn!(
                        request_id = job.frame.request_id,
                        "Decode workers gone, decoding inline"
                    );
                    job
                }
            },
            None => job,
        };

        self.stats.inline.fetch_add(1, Ordering::Relaxed);
        decode_into(&self.registry, job.frame, job.completion);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Workers exit once the queue closes and drains.
        self.queue.take();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("offload", &self.queue.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

fn worker_loop(rx: &StdMutex<mpsc::Receiver<Job>>, registry: &SerializationRegistry) {
    loop {
        let job = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!("Decode queue mutex poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            guard.blocking_recv()
        };
        match job {
            Some(job) => decode_into(registry, job.frame, job.completion),
            None => break,
        }
    }
    tracing::trace!("Decode worker exiting");
}

fn into_raw(frame: Frame) -> RawResponse {
    let Frame {
        request_id,
        serialization_id,
        status,
        body,
        timing,
        ..
    } = frame;
    RawResponse {
        request_id,
        status,
        serialization_id,
        body,
        timing: ResponseTiming::from_frame(timing),
    }
}

fn decode_into(registry: &SerializationRegistry, frame: Frame, completion: Completion) {
    let request_id = frame.request_id;
    let begin = Instant::now();
    let mut timing = ResponseTiming::from_frame(frame.timing);
    timing.deserialize_begin = Some(begin);

    let decoded = decode_result(
        registry,
        frame.status,
        frame.serialization_id,
        frame.into_body(),
    );
    timing.deserialize_cost = Some(begin.elapsed());

    match decoded {
        Ok(result) => completion.succeed(Response {
            request_id,
            result,
            timing,
        }),
        Err(error) => {
            tracing::debug!(request_id, error = %error, "Response resolved with error");
            completion.fail(error);
        }
    }
}

/// Turn a response body into its result or the error its status names.
/// Consumes the body on every path.
pub fn decode_result(
    registry: &SerializationRegistry,
    status: Status,
    serialization_id: u8,
    body: Body,
) -> TransportResult<RpcResult> {
    match status {
        Status::Ok => RpcResult::from_body(registry, serialization_id, body).map_err(|e| {
            tracing::warn!(error = %e, "Failed to decode response body");
            TransportError::from(e)
        }),
        Status::Unknown(byte) => {
            body.release();
            Err(TransportError::UnknownResponseStatus {
                status: byte,
                message: "unrecognised status byte".to_string(),
            })
        }
        status => Err(TransportError::Remote {
            status,
            message: error_message(registry, serialization_id, body),
        }),
    }
}

fn error_message(registry: &SerializationRegistry, serialization_id: u8, body: Body) -> String {
    let Ok(backend) = registry.get(serialization_id) else {
        return format!("undecodable error body (serialization {serialization_id})");
    };
    let mut input = backend.deserialize(body.into_bytes());
    input
        .read_utf()
        .unwrap_or_else(|e| format!("undecodable error body: {e}"))
}

impl RawResponse {
    /// Decode on the caller's task.
    pub fn decode(self, registry: &SerializationRegistry) -> TransportResult<Response> {
        let begin = Instant::now();
        let mut timing = self.timing;
        timing.deserialize_begin = Some(begin);
        let result = decode_result(registry, self.status, self.serialization_id, self.body)?;
        timing.deserialize_cost = Some(begin.elapsed());
        Ok(Response {
            request_id: self.request_id,
            result,
            timing,
        })
    }
}
