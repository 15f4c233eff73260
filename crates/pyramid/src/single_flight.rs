//! Per-key build coalescing.
//!
//! When several callers need the same key at once, only one of them (the
//! leader) runs the work; the others subscribe and receive a clone of the
//! leader's result, success or failure.
//!
//! ```text
//! caller A ─┐
//!           │                     leader
//! caller B ─┼──► SingleFlight ──► runs work once
//!           │        │                 │
//! caller C ─┘        ▼                 ▼
//!              [B, C subscribe]◄── broadcast result
//! ```
//!
//! If the leader's future is dropped before finishing, its channel closes and
//! the waiters race to register again; one of them becomes the new leader.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Coalesces concurrent work per key.
pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<V>>>,
    total: AtomicU64,
    coalesced: AtomicU64,
    leaders: AtomicU64,
    handoffs: AtomicU64,
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SingleFlightStats {
    /// Calls to `run`.
    pub total: u64,
    /// Calls that waited on another caller's work.
    pub coalesced: u64,
    /// Times the work was actually started.
    pub leaders: u64,
    /// Waiters that took over after a leader was dropped.
    pub handoffs: u64,
}

impl SingleFlightStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.coalesced as f64 / self.total as f64
        }
    }
}

enum Registration<'a, K: Eq + Hash + Clone, V: Clone> {
    Leader(LeaderGuard<'a, K, V>),
    Waiter(broadcast::Receiver<V>),
}

/// Held by the leader; removes the in-flight entry on drop so waiters are
/// released even if the leader never completes.
struct LeaderGuard<'a, K: Eq + Hash + Clone, V: Clone> {
    flight: &'a SingleFlight<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LeaderGuard<'_, K, V> {
    fn complete(mut self, value: V) -> V {
        if let Some(key) = self.key.take() {
            let tx = self.flight.in_flight.lock().remove(&key);
            if let Some(tx) = tx {
                // No receivers is fine.
                let _ = tx.send(value.clone());
            }
        }
        value
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flight.in_flight.lock().remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
        }
    }

    fn register(&self, key: &K) -> Registration<'_, K, V> {
        let mut in_flight = self.in_flight.lock();
        if let Some(tx) = in_flight.get(key) {
            return Registration::Waiter(tx.subscribe());
        }
        // One result is ever sent per channel.
        let (tx, _rx) = broadcast::channel(1);
        in_flight.insert(key.clone(), tx);
        Registration::Leader(LeaderGuard {
            flight: self,
            key: Some(key.clone()),
        })
    }

    /// Run `work` for `key` unless it is already running, in which case wait
    /// for and return that run's result.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut waited = false;

        loop {
            match self.register(&key) {
                Registration::Leader(guard) => {
                    self.leaders.fetch_add(1, Ordering::Relaxed);
                    if waited {
                        self.handoffs.fetch_add(1, Ordering::Relaxed);
                        debug!(key = ?key, "Taking over build from dropped leader");
                    }
                    let value = work().await;
                    return guard.complete(value);
                }
                Registration::Waiter(mut rx) => {
                    if !waited {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        debug!(key = ?key, "Coalescing with in-flight build");
                    }
                    waited = true;
                    match rx.recv().await {
                        Ok(value) => return value,
                        // Leader dropped without a result; try to lead.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Number of keys currently being built.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn stats(&self) -> SingleFlightStats {
        SingleFlightStats {
            total: self.total.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            leaders: self.leaders.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(7, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let stats = flight.stats();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.leaders, 1);
        assert_eq!(stats.coalesced, 9);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let flight: Arc<SingleFlight<u32, Result<u32, String>>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err("boom".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = flight.run(1, || async { Ok(5) }).await;

        assert_eq!(waiter, Err("boom".to_string()));
        assert_eq!(leader.await.unwrap(), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_leader_hands_over() {
        let flight: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(3, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run(3, || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        assert_eq!(waiter.await.unwrap(), 2);
        assert_eq!(flight.stats().handoffs, 1);
    }

    #[test]
    fn test_sequential_runs_are_independent() {
        let flight: SingleFlight<&'static str, u32> = SingleFlight::new();
        tokio_test::block_on(async {
            assert_eq!(flight.run("a", || async { 1 }).await, 1);
            assert_eq!(flight.run("a", || async { 2 }).await, 2);
        });
        assert_eq!(flight.stats().coalesced, 0);
        assert!(!flight.is_in_flight(&"a"));
    }
}
