//! Generic asynchronous key→value lookup cache.
//!
//! Metadata sources (the container runtime's HTTP API, the cgroup
//! filesystem) can be slow or temporarily unreachable, while the event
//! pipeline must never stall. [`AsyncKeyValueSource`] decouples the two: a
//! caller asks for a key and either gets a cached value synchronously or
//! registers a callback and moves on, while a dedicated worker thread
//! performs the slow fetch out of band.
//!
//! # Guarantees
//!
//! - **Single flight**: at most one resolution runs per key at a time, and
//!   a key that is pending or already resolved is never enqueued again.
//! - **Exactly-once delivery**: every registered callback is invoked exactly
//!   once, in registration order, with the stored value. Callbacks run
//!   outside the cache lock.
//! - **Bounded waiting**: [`AsyncKeyValueSource::lookup`] never blocks
//!   longer than the configured `max_wait`; with `max_wait` of zero a
//!   not-yet-cached key always returns "pending".
//! - **TTL retention**: completed values are served synchronously to late
//!   callers until `ttl` elapses; expired entries are discarded lazily on
//!   the next access and the key is fetched again.
//!
//! Stopping the source (explicitly or on drop) wakes the worker, delivers
//! the failure value (`V::default()`) to every still-registered callback,
//! and joins the thread. A resolution already in flight is left to finish;
//! its result is stored but has no callbacks left to notify.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Produces the value for a key on the source's worker thread.
///
/// A resolver must never panic per contract; if it does anyway, the panic
/// is caught, logged, and the failure value is stored in its place.
pub trait ValueResolver<K, V>: Send {
    fn resolve(&mut self, key: &K) -> V;
}

impl<K, V, F> ValueResolver<K, V> for F
where
    F: FnMut(&K) -> V + Send,
{
    fn resolve(&mut self, key: &K) -> V {
        self(key)
    }
}

type Callback<K, V> = Box<dyn FnOnce(&K, &V) + Send>;

enum Entry<K, V> {
    /// Enqueued or currently being resolved; callbacks wait here.
    Pending { callbacks: Vec<Callback<K, V>> },
    /// Resolved; retained until the ttl elapses.
    Ready { value: V, stored_at: Instant },
}

struct State<K, V> {
    entries: HashMap<K, Entry<K, V>>,
    queue: VecDeque<K>,
    stopped: bool,
}

struct Shared<K, V> {
    state: Mutex<State<K, V>>,
    /// Signals the worker that a key was enqueued or the source stopped.
    queue_cv: Condvar,
    /// Signals waiting producers that a value was stored.
    value_cv: Condvar,
    ttl: Duration,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, State<K, V>> {
        self.state.lock().expect("lookup cache lock poisoned")
    }

    /// Clones the value for `key` if it is ready and not yet expired.
    fn fresh_value(&self, state: &State<K, V>, key: &K) -> Option<V> {
        match state.entries.get(key) {
            Some(Entry::Ready { value, stored_at }) if stored_at.elapsed() <= self.ttl => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

/// A deduplicating, worker-thread-backed lookup cache.
///
/// `K` is the lookup key, `V` the resolved value; `V::default()` doubles as
/// the failure value delivered when the source is stopped before a pending
/// key resolves.
pub struct AsyncKeyValueSource<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    shared: Arc<Shared<K, V>>,
    max_wait: Duration,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<K, V> AsyncKeyValueSource<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    /// Creates the source and starts its worker thread.
    ///
    /// `max_wait` bounds how long a `lookup` caller may block waiting for an
    /// in-flight resolution; `ttl` bounds how long a completed value is
    /// retained for synchronous hits.
    pub fn new<R>(max_wait: Duration, ttl: Duration, resolver: R) -> Self
    where
        R: ValueResolver<K, V> + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                queue: VecDeque::new(),
                stopped: false,
            }),
            queue_cv: Condvar::new(),
            value_cv: Condvar::new(),
            ttl,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("metadata-lookup".to_owned())
            .spawn(move || run_worker(worker_shared, resolver))
            .expect("failed to spawn lookup worker thread");

        Self {
            shared,
            max_wait,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Looks up `key`, returning the value synchronously when it is cached
    /// and fresh.
    ///
    /// Otherwise the key is enqueued for the worker (unless a resolution is
    /// already pending) and `callback` is registered to receive the value
    /// once it is stored. With a non-zero `max_wait` the call first waits up
    /// to that long for an in-flight resolution to finish; on success the
    /// value is returned directly and the callback is dropped unused.
    ///
    /// After [`stop`](Self::stop), the callback is invoked immediately with
    /// the failure value.
    pub fn lookup<F>(&self, key: K, callback: F) -> Option<V>
    where
        F: FnOnce(&K, &V) + Send + 'static,
    {
        let mut state = self.shared.lock();

        if state.stopped {
            drop(state);
            let failure = V::default();
            callback(&key, &failure);
            return None;
        }

        if let Some(value) = self.shared.fresh_value(&state, &key) {
            return Some(value);
        }

        {
            let state = &mut *state;
            match state.entries.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => {
                    if let Entry::Ready { .. } = occupied.get() {
                        // expired; discard and fetch again
                        occupied.insert(Entry::Pending {
                            callbacks: Vec::new(),
                        });
                        state.queue.push_back(key.clone());
                        self.shared.queue_cv.notify_one();
                    }
                }
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Entry::Pending {
                        callbacks: Vec::new(),
                    });
                    state.queue.push_back(key.clone());
                    self.shared.queue_cv.notify_one();
                }
            }
        }

        if !self.max_wait.is_zero() {
            let deadline = Instant::now() + self.max_wait;
            loop {
                if let Some(value) = self.shared.fresh_value(&state, &key) {
                    return Some(value);
                }
                if state.stopped {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .shared
                    .value_cv
                    .wait_timeout(state, deadline - now)
                    .expect("lookup cache lock poisoned");
                state = guard;
            }
        }

        match state.entries.get_mut(&key) {
            Some(Entry::Pending { callbacks }) => {
                callbacks.push(Box::new(callback));
                None
            }
            Some(Entry::Ready { value, .. }) => Some(value.clone()),
            None => {
                // drained by a concurrent stop()
                drop(state);
                let failure = V::default();
                callback(&key, &failure);
                None
            }
        }
    }

    /// Stops the worker and joins it. Idempotent; also invoked on drop.
    ///
    /// Every callback still registered for a pending key is delivered the
    /// failure value before the worker is joined.
    pub fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .expect("worker handle lock poisoned")
            .take();

        let drained: Vec<(K, Vec<Callback<K, V>>)> = {
            let mut state = self.shared.lock();
            if state.stopped {
                Vec::new()
            } else {
                state.stopped = true;
                state.queue.clear();
                let keys: Vec<K> = state
                    .entries
                    .iter()
                    .filter(|(_, entry)| matches!(entry, Entry::Pending { .. }))
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.into_iter()
                    .filter_map(|key| match state.entries.remove(&key) {
                        Some(Entry::Pending { callbacks }) => Some((key, callbacks)),
                        _ => None,
                    })
                    .collect()
            }
        };

        self.shared.queue_cv.notify_all();
        self.shared.value_cv.notify_all();

        let failure = V::default();
        for (key, callbacks) in drained {
            for callback in callbacks {
                callback(&key, &failure);
            }
        }

        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("lookup worker thread panicked during shutdown");
            }
        }
    }
}

impl<K, V> Drop for AsyncKeyValueSource<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: dequeue, resolve, store, repeat until stopped.
fn run_worker<K, V, R>(shared: Arc<Shared<K, V>>, mut resolver: R)
where
    K: Eq + Hash + Clone,
    V: Clone + Default,
    R: ValueResolver<K, V>,
{
    while let Some(key) = dequeue_next_key(&shared) {
        let value = match std::panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(&key))) {
            Ok(value) => value,
            Err(_) => {
                log::error!("value resolver panicked, storing failure result");
                V::default()
            }
        };
        store_value(&shared, key, value);
    }
}

/// Blocks until a key is available or the source stops.
fn dequeue_next_key<K, V>(shared: &Shared<K, V>) -> Option<K>
where
    K: Eq + Hash,
    V: Clone,
{
    let mut state = shared.lock();
    loop {
        if state.stopped {
            return None;
        }
        if let Some(key) = state.queue.pop_front() {
            return Some(key);
        }
        state = shared
            .queue_cv
            .wait(state)
            .expect("lookup cache lock poisoned");
    }
}

/// Installs `value` for `key` and delivers it to every callback registered
/// so far. The callback list is snapshotted under the lock and invoked
/// after releasing it.
fn store_value<K, V>(shared: &Shared<K, V>, key: K, value: V)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let callbacks = {
        let mut state = shared.lock();

        // sweep values nobody collected in time
        let ttl = shared.ttl;
        state.entries.retain(|_, entry| match entry {
            Entry::Ready { stored_at, .. } => stored_at.elapsed() <= ttl,
            Entry::Pending { .. } => true,
        });

        let previous = state.entries.insert(
            key.clone(),
            Entry::Ready {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
        match previous {
            Some(Entry::Pending { callbacks }) => callbacks,
            _ => Vec::new(),
        }
    };

    shared.value_cv.notify_all();

    for callback in callbacks {
        callback(&key, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    const TTL: Duration = Duration::from_secs(10);
    const NO_WAIT: Duration = Duration::ZERO;

    fn echo_resolver() -> impl FnMut(&String) -> String + Send {
        |key: &String| format!("value-for-{key}")
    }

    #[test]
    fn test_fresh_lookup_returns_pending_and_delivers_callback() {
        let source = AsyncKeyValueSource::new(NO_WAIT, TTL, echo_resolver());
        let (tx, rx) = mpsc::channel();

        let immediate = source.lookup("k1".to_owned(), move |key, value: &String| {
            tx.send((key.clone(), value.clone())).unwrap();
        });
        assert!(immediate.is_none());

        let (key, value) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(key, "k1");
        assert_eq!(value, "value-for-k1");
    }

    #[test]
    fn test_completed_value_served_synchronously_within_ttl() {
        let source = AsyncKeyValueSource::new(NO_WAIT, TTL, echo_resolver());
        let (tx, rx) = mpsc::channel();

        source.lookup("k1".to_owned(), move |_, value: &String| {
            tx.send(value.clone()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let hit = source.lookup("k1".to_owned(), |_, _: &String| {
            panic!("callback must not fire on a synchronous hit");
        });
        assert_eq!(hit.as_deref(), Some("value-for-k1"));
    }

    #[test]
    fn test_expired_value_is_discarded_and_refetched() {
        let resolved = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resolved);
        let source = AsyncKeyValueSource::new(
            NO_WAIT,
            Duration::from_millis(20),
            move |key: &String| {
                counter.fetch_add(1, Ordering::SeqCst);
                format!("value-for-{key}")
            },
        );

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        source.lookup("k1".to_owned(), move |_, v: &String| {
            tx2.send(v.clone()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        thread::sleep(Duration::from_millis(60));

        let hit = source.lookup("k1".to_owned(), move |_, v: &String| {
            tx.send(v.clone()).unwrap();
        });
        assert!(hit.is_none());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(resolved.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_lookups_resolve_once_and_deliver_in_order() {
        let resolved = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resolved);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let source = AsyncKeyValueSource::new(NO_WAIT, TTL, move |key: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
            gate_rx.recv().unwrap();
            format!("value-for-{key}")
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..4 {
            let order = Arc::clone(&order);
            let done_tx = done_tx.clone();
            let immediate = source.lookup("k1".to_owned(), move |_, value: &String| {
                order.lock().unwrap().push((i, value.clone()));
                done_tx.send(()).unwrap();
            });
            assert!(immediate.is_none());
        }

        gate_tx.send(()).unwrap();
        for _ in 0..4 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        let order = order.lock().unwrap();
        let expected: Vec<(usize, String)> = (0..4)
            .map(|i| (i, "value-for-k1".to_owned()))
            .collect();
        assert_eq!(*order, expected);
    }

    #[test]
    fn test_max_wait_returns_value_without_callback() {
        let source =
            AsyncKeyValueSource::new(Duration::from_secs(5), TTL, echo_resolver());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let value = source.lookup("k1".to_owned(), move |_, _: &String| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(value.as_deref(), Some("value-for-k1"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_drains_pending_callbacks_with_failure_value() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let source = Arc::new(AsyncKeyValueSource::new(
            NO_WAIT,
            TTL,
            move |key: &String| {
                gate_rx.recv().unwrap();
                format!("value-for-{key}")
            },
        ));

        let (tx, rx) = mpsc::channel();
        // k1 occupies the worker, k2 stays queued
        let tx1 = tx.clone();
        source.lookup("k1".to_owned(), move |_, v: &String| {
            tx1.send(v.clone()).unwrap();
        });
        let tx2 = tx.clone();
        source.lookup("k2".to_owned(), move |_, v: &String| {
            tx2.send(v.clone()).unwrap();
        });

        let stopper = {
            let source = Arc::clone(&source);
            thread::spawn(move || source.stop())
        };

        // both callbacks receive the failure value (String::default)
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "");

        // the worker may already be gone if stop() won the race to k1
        let _ = gate_tx.send(());
        stopper.join().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let source = AsyncKeyValueSource::new(NO_WAIT, TTL, echo_resolver());
        source.stop();
        source.stop();
    }

    #[test]
    fn test_panicking_resolver_stores_failure_value() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let source = AsyncKeyValueSource::new(NO_WAIT, TTL, move |_key: &String| -> String {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("resolver blew up");
        });

        let (tx, rx) = mpsc::channel();
        source.lookup("k1".to_owned(), move |_, value: &String| {
            tx.send(value.clone()).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // worker survives and keeps serving other keys
        let (tx, rx) = mpsc::channel();
        source.lookup("k2".to_owned(), move |_, value: &String| {
            tx.send(value.clone()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "");
    }
}
