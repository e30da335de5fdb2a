//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader: its future is wrapped in
//! [`Shared`] and parked in the in-flight map. Callers arriving while it
//! runs await the same shared future and receive a clone of its output.
//! The entry is removed when the leader finishes or is dropped; if the
//! leader is cancelled, followers still drive the shared future to
//! completion.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Entry<T> {
    generation: u64,
    flight: Flight<T>,
}

type FlightMap<K, T> = Arc<Mutex<HashMap<K, Entry<T>>>>;

fn lock<K, T>(map: &FlightMap<K, T>) -> MutexGuard<'_, HashMap<K, Entry<T>>> {
    // A panic while holding the lock cannot leave the map half-updated.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Coalesces concurrent work per key.
pub struct SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    inflight: FlightMap<K, T>,
    next_generation: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's entry on completion or cancellation, unless a newer
/// flight has already replaced it.
struct LeaderGuard<K, T>
where
    K: Eq + Hash,
{
    inflight: FlightMap<K, T>,
    key: K,
    generation: u64,
}

impl<K, T> Drop for LeaderGuard<K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut map = lock(&self.inflight);
        if map
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            map.remove(&self.key);
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Run `make()` unless a flight for `key` is already running, in which
    /// case wait for that one. Returns the output and whether this caller
    /// led the flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight, guard) = {
            let mut map = lock(&self.inflight);
            match map.get(&key) {
                Some(entry) => (entry.flight.clone(), None),
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let flight = make().boxed().shared();
                    map.insert(
                        key.clone(),
                        Entry {
                            generation,
                            flight: flight.clone(),
                        },
                    );
                    let guard = LeaderGuard {
                        inflight: self.inflight.clone(),
                        key,
                        generation,
                    };
                    (flight, Some(guard))
                }
            }
        };

        let output = flight.await;
        let led = guard.is_some();
        drop(guard);
        (output, led)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let flights = flights.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    flights
                        .run("AAPL:daily".to_string(), || async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            calls.fetch_add(1, Ordering::SeqCst) + 1
                        })
                        .await
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            let (value, led) = task.await.unwrap();
            assert_eq!(value, 1);
            leaders += usize::from(led);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();
        let (a, led_a) = flights.run("k", || async { 1 }).await;
        let (b, led_b) = flights.run("k", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
        assert!(led_a && led_b);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let flights: SingleFlight<&'static str, &'static str> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run("a", || async { "a" }),
            flights.run("b", || async { "b" })
        );
        assert_eq!(a, ("a", true));
        assert_eq!(b, ("b", true));
    }

    #[tokio::test]
    async fn test_cancelled_leader_clears_entry() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        0
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flights.in_flight(), 1);

        leader.abort();
        let _ = leader.await;
        assert_eq!(flights.in_flight(), 0);

        let (value, led) = flights.run("k", || async { 7 }).await;
        assert_eq!((value, led), (7, true));
    }
}
