use crate::error::CoreError;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Map whose entries expire `ttl` after insertion. When `max_entries` is
/// exceeded the oldest entry is evicted. Insertion order is expiry order,
/// so expired entries are always found at the front of `order`.
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    next_seq: u64,
    entries: HashMap<K, TtlEntry<V>>,
    order: VecDeque<(K, u64)>,
}

struct TtlEntry<V> {
    value: V,
    at: Instant,
    seq: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            next_seq: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.clone(),
            TtlEntry {
                value,
                at: Instant::now(),
                seq,
            },
        );
        self.order.push_back((key, seq));
        self.evict();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&mut self) -> usize {
        self.evict();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Pops expired, overflowing and superseded slots off the front.
    fn evict(&mut self) {
        while let Some((key, seq)) = self.order.front() {
            let current = self.entries.get(key).filter(|entry| entry.seq == *seq);
            let keep = match current {
                Some(entry) => {
                    entry.at.elapsed() < self.ttl && self.entries.len() <= self.max_entries
                }
                None => false,
            };
            if keep {
                break;
            }
            let live = current.is_some();
            if let Some((key, _)) = self.order.pop_front() {
                if live {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

type FlightResult<V> = Option<Result<V, CoreError>>;
type FlightMap<K, V> = Arc<StdMutex<HashMap<K, watch::Receiver<FlightResult<V>>>>>;

/// In-flight request map: the first caller for a key becomes the leader and
/// every concurrent caller for the same key waits for the leader's result.
pub struct SingleFlight<K, V> {
    inflight: FlightMap<K, V>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

pub struct Claims<K: Eq + Hash + Clone, V: Clone> {
    pub leading: Vec<FlightGuard<K, V>>,
    pub waiting: Vec<(K, FlightWaiter<V>)>,
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `keys` into the ones this caller must fetch and the ones
    /// another caller is already fetching.
    pub fn claim(&self, keys: impl IntoIterator<Item = K>) -> Claims<K, V> {
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let mut claims = Claims {
            leading: Vec::new(),
            waiting: Vec::new(),
        };
        for key in keys {
            if let Some(rx) = map.get(&key) {
                claims.waiting.push((key, FlightWaiter { rx: rx.clone() }));
                continue;
            }
            let (tx, rx) = watch::channel(None);
            map.insert(key.clone(), rx);
            claims.leading.push(FlightGuard {
                key,
                tx: Some(tx),
                inflight: self.inflight.clone(),
            });
        }
        claims
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Held by the leader of one key. Dropping it without `complete` wakes the
/// followers with `Cancelled`.
pub struct FlightGuard<K: Eq + Hash + Clone, V: Clone> {
    key: K,
    tx: Option<watch::Sender<FlightResult<V>>>,
    inflight: FlightMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> FlightGuard<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn complete(mut self, result: Result<V, CoreError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<V, CoreError>) {
        if let Some(tx) = self.tx.take() {
            if let Ok(mut map) = self.inflight.lock() {
                map.remove(&self.key);
            }
            let _ = tx.send(Some(result));
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        self.finish(Err(CoreError::Cancelled));
    }
}

pub struct FlightWaiter<V> {
    rx: watch::Receiver<FlightResult<V>>,
}

impl<V: Clone> FlightWaiter<V> {
    pub async fn wait(mut self) -> Result<V, CoreError> {
        let value = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        value.unwrap_or(Err(CoreError::Cancelled))
    }
}
