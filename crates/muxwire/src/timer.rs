//! Shared timing wheel for request deadlines.
//!
//! One task owns a [`DelayQueue`] (a hierarchical wheel with millisecond
//! resolution) and serves every connection of a context. Scheduling and
//! cancellation are fire-and-forget messages to that task, so both are O(1)
//! for the caller and never block.

use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};

/// Something that owns deadlines, typically a connection's pending table.
pub trait TimeoutTarget: Send + Sync {
    /// The deadline for `request_id` passed. Must be a no-op if the request
    /// was already resolved.
    fn expire(&self, request_id: u64);
}

/// Longest deadline the wheel arms. `DelayQueue` panics past roughly two
/// years, so later deadlines are clamped to this.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Handle for cancelling a scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

enum Command {
    Schedule {
        token: u64,
        target: Weak<dyn TimeoutTarget>,
        request_id: u64,
        after: Duration,
    },
    Cancel(u64),
}

struct Armed {
    key: delay_queue::Key,
    target: Weak<dyn TimeoutTarget>,
    request_id: u64,
}

pub struct TimingWheel {
    commands: mpsc::UnboundedSender<Command>,
    next_token: AtomicU64,
    shutdown: CancellationToken,
}

impl TimingWheel {
    /// Spawn the wheel task on the current runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run(rx, shutdown.clone()));
        Self {
            commands: tx,
            next_token: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Call `target.expire(request_id)` once `after` has elapsed.
    ///
    /// The wheel holds only a weak reference; a target dropped before the
    /// deadline is skipped. Delays beyond [`MAX_DELAY`] are clamped.
    pub fn schedule(
        &self,
        target: Weak<dyn TimeoutTarget>,
        request_id: u64,
        after: Duration,
    ) -> TimerToken {
        let after = if after > MAX_DELAY {
            tracing::debug!(
                request_id,
                requested_ms = after.as_millis() as u64,
                "Clamping deadline"
            );
            MAX_DELAY
        } else {
            after
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let sent = self.commands.send(Command::Schedule {
            token,
            target,
            request_id,
            after,
        });
        if sent.is_err() {
            tracing::warn!(request_id, "Timing wheel stopped; deadline not armed");
        }
        TimerToken(token)
    }

    /// Disarm a deadline. Cancelling one that already fired is a no-op.
    pub fn cancel(&self, token: TimerToken) {
        let _ = self.commands.send(Command::Cancel(token.0));
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
    let mut queue: DelayQueue<u64> = DelayQueue::new();
    let mut armed: HashMap<u64, Armed> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            command = commands.recv() => match command {
                Some(Command::Schedule { token, target, request_id, after }) => {
                    let key = queue.insert(token, after);
                    armed.insert(token, Armed { key, target, request_id });
                }
                Some(Command::Cancel(token)) => {
                    if let Some(entry) = armed.remove(&token) {
                        queue.remove(&entry.key);
                    }
                }
                None => break,
            },

            Some(expired) = queue.next(), if !queue.is_empty() => {
                let token = expired.into_inner();
                let Some(entry) = armed.remove(&token) else {
                    continue;
                };
                match entry.target.upgrade() {
                    Some(target) => {
                        tracing::trace!(request_id = entry.request_id, "Deadline fired");
                        target.expire(entry.request_id);
                    }
                    None => {
                        tracing::trace!(request_id = entry.request_id, "Deadline target gone");
                    }
                }
            }
        }
    }

    tracing::debug!(armed = armed.len(), "Timing wheel stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    impl TimeoutTarget for Recorder {
        fn expire(&self, request_id: u64) {
            self.0.lock().unwrap().push(request_id);
        }
    }

    impl Recorder {
        fn fired(&self) -> Vec<u64> {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_delay() {
        let wheel = TimingWheel::start();
        let target = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn TimeoutTarget> = weak;
        wheel.schedule(weak, 7, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert!(target.fired().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(target.fired(), vec![7]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(target.fired(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadlines_never_fire() {
        let wheel = TimingWheel::start();
        let target = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn TimeoutTarget> = weak;
        let first = wheel.schedule(weak.clone(), 1, Duration::from_millis(20));
        wheel.schedule(weak, 2, Duration::from_millis(30));
        wheel.cancel(first);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(target.fired(), vec![2]);

        // Late cancel of a fired deadline is harmless.
        wheel.cancel(first);
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_targets_are_skipped() {
        let wheel = TimingWheel::start();
        let target = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn TimeoutTarget> = weak;
        wheel.schedule(weak.clone(), 3, Duration::from_millis(10));
        drop(target);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_fire_in_order() {
        let wheel = TimingWheel::start();
        let target = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn TimeoutTarget> = weak;
        for (id, ms) in [(1, 30), (2, 10), (3, 20)] {
            wheel.schedule(weak.clone(), id, Duration::from_millis(ms));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.fired(), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_are_clamped_and_keep_the_wheel_alive() {
        let wheel = TimingWheel::start();
        let target = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn TimeoutTarget> = weak;
        wheel.schedule(weak.clone(), 1, Duration::from_secs(3 * 365 * 24 * 60 * 60));
        wheel.schedule(weak.clone(), 2, Duration::MAX);
        wheel.schedule(weak, 3, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(target.fired(), vec![3]);
        assert!(!wheel.commands.is_closed());
    }
}
