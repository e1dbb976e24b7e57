//! Scheduling primitives (C4): a sequential batch executor and an
//! increasing-rate retry loop, both built on plain `tokio::spawn` + sleep
//! loops in the same style as `homeroute::supervisor::spawn_supervised`'s
//! retry/backoff loop, generalized from "respawn on failure" to "repeat on
//! a schedule".

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Per-key batch locks, keyed by the caller-chosen batch key (typically a
/// service instance name). Entries are held by `Weak` so a key with no
/// in-flight batch is garbage-collected rather than growing the map forever.
static KEY_LOCKS: OnceLock<StdMutex<HashMap<String, Weak<Mutex<()>>>>> = OnceLock::new();

fn key_lock(key: &str) -> Arc<Mutex<()>> {
    let mut registry = KEY_LOCKS.get_or_init(|| StdMutex::new(HashMap::new())).lock().unwrap();
    if let Some(existing) = registry.get(key).and_then(Weak::upgrade) {
        return existing;
    }
    let lock = Arc::new(Mutex::new(()));
    registry.insert(key.to_string(), Arc::downgrade(&lock));
    lock
}

/// Runs `task(0..n)` sequentially, `interval` apart, and exposes two
/// observation points: the first completed step, and every step completing.
pub struct BatchHandle {
    first_rx: Mutex<Option<oneshot::Receiver<()>>>,
    all_rx: Mutex<Option<oneshot::Receiver<()>>>,
    cancelled: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl BatchHandle {
    /// Resolves once the first iteration has completed (or immediately if
    /// it already has, or the batch was cancelled before running).
    pub async fn await_first(&self) {
        let rx = self.first_rx.lock().await.take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Resolves once every iteration has completed.
    pub async fn await_all(&self) {
        let rx = self.all_rx.lock().await.take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Stops the batch before its next iteration; in-flight work is not
    /// interrupted but no further iterations run.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.join.abort();
    }
}

/// Before a batch under `key` starts, any prior batch registered under the
/// same key must finish: the spawned task first takes the key's lock and
/// holds it for the batch's whole run, so a second call under the same key
/// queues behind the first rather than interleaving with it. Distinct keys
/// run independently.
pub fn schedule_batch<F, Fut>(key: impl Into<String>, mut task: F, n: usize, interval: Duration) -> BatchHandle
where
    F: FnMut(usize) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (first_tx, first_rx) = oneshot::channel();
    let (all_tx, all_rx) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancelled.clone();
    let lock = key_lock(&key.into());

    let join = tokio::spawn(async move {
        let _guard = lock.lock().await;
        let mut first_tx = Some(first_tx);
        for i in 0..n {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            task(i).await;
            if let Some(tx) = first_tx.take() {
                let _ = tx.send(());
            }
            if i + 1 < n {
                tokio::time::sleep(interval).await;
            }
        }
        let _ = all_tx.send(());
    });

    BatchHandle {
        first_rx: Mutex::new(Some(first_rx)),
        all_rx: Mutex::new(Some(all_rx)),
        cancelled,
        join,
    }
}

/// A task repeated forever with a backoff that doubles (by `factor`) up to
/// `max_delay`, restartable to `base_delay` via `reset()`. Used for the
/// registration-type and service query cadence.
pub struct IncreasingRateHandle {
    reset_tx: mpsc::UnboundedSender<()>,
    join: JoinHandle<()>,
}

impl IncreasingRateHandle {
    pub fn reset(&self) {
        let _ = self.reset_tx.send(());
    }

    pub fn cancel(&self) {
        self.join.abort();
    }
}

pub fn schedule_increasingly<F, Fut>(
    mut task: F,
    initial_delay: Duration,
    base_delay: Duration,
    factor: u32,
    max_delay: Duration,
) -> IncreasingRateHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();

    let join = tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut delay = base_delay;
        loop {
            task().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = delay.saturating_mul(factor).min(max_delay);
                }
                Some(_) = reset_rx.recv() => {
                    delay = base_delay;
                }
            }
        }
    });

    IncreasingRateHandle { reset_tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn batch_runs_n_times_with_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = schedule_batch(
            "batch_runs_n_times_with_interval",
            move |_i| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
            3,
            Duration::from_millis(100),
        );

        handle.await_first().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.await_all().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_cancel_stops_remaining_iterations() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = schedule_batch(
            "batch_cancel_stops_remaining_iterations",
            move |_i| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
            5,
            Duration::from_secs(10),
        );
        handle.await_first().await;
        handle.cancel_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_under_same_key_is_serialized() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let first = schedule_batch(
            "batch_under_same_key_is_serialized",
            move |i| {
                let o1 = o1.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    o1.lock().await.push(("first", i));
                }
            },
            2,
            Duration::from_millis(10),
        );
        let o2 = order.clone();
        let second = schedule_batch(
            "batch_under_same_key_is_serialized",
            move |i| {
                let o2 = o2.clone();
                async move {
                    o2.lock().await.push(("second", i));
                }
            },
            1,
            Duration::from_millis(10),
        );

        second.await_all().await;
        first.await_all().await;

        let recorded = order.lock().await.clone();
        // The second batch's sole iteration must not record before the
        // first batch (registered first under the same key) has finished.
        assert_eq!(recorded, vec![("first", 0), ("first", 1), ("second", 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn increasing_rate_doubles_and_caps() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = schedule_increasingly(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::from_millis(0),
            Duration::from_millis(100),
            2,
            Duration::from_millis(300),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn increasing_rate_reset_returns_to_base_delay() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = schedule_increasingly(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::from_millis(0),
            Duration::from_millis(100),
            2,
            Duration::from_millis(1000),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.reset();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        handle.cancel();
    }
}
