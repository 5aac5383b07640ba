//! Generic reference-counted cache, shared by the page cache, DM, and VM. A
//! `parking_lot`-guarded map of resident entries plus a loader/write-back
//! callback pair, tracking one in-flight load per key and an optional
//! capacity bound.
//!
//! Load-in-progress coordination uses a condition variable rather than a
//! cooperative polling loop.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, Result};

/// Resolves and writes back cache values for a `RefCache`.
///
/// `get_for_cache` is called with no lock held, at most once per key at a
/// time. `release_for_cache` is called when a key's ref-count drops to zero
/// (or during `close`), and is the write-back hook.
pub trait CacheLoader<K, V>: Send + Sync {
    fn get_for_cache(&self, key: K) -> Result<V>;
    fn release_for_cache(&self, key: K, value: Arc<V>);
}

struct Resident<V> {
    value: Arc<V>,
    refs: usize,
}

struct State<K, V> {
    entries: HashMap<K, Resident<V>>,
    loading: HashSet<K>,
}

pub struct RefCache<K, V, L: CacheLoader<K, V>> {
    capacity: usize,
    state: Mutex<State<K, V>>,
    cond: Condvar,
    loader: L,
}

impl<K, V, L> RefCache<K, V, L>
where
    K: Eq + Hash + Copy + Send + 'static,
    V: Send + Sync + 'static,
    L: CacheLoader<K, V>,
{
    pub fn new(capacity: usize, loader: L) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                entries: HashMap::new(),
                loading: HashSet::new(),
            }),
            cond: Condvar::new(),
            loader,
        }
    }

    /// Acquires the resource for `key`, incrementing its ref-count.
    pub fn acquire(&self, key: K) -> Result<Arc<V>> {
        loop {
            let mut state = self.state.lock();
            if let Some(resident) = state.entries.get_mut(&key) {
                resident.refs += 1;
                return Ok(Arc::clone(&resident.value));
            }
            if state.loading.contains(&key) {
                self.cond.wait(&mut state);
                continue;
            }
            if self.capacity > 0 && state.entries.len() >= self.capacity {
                return Err(EngineError::CacheFull);
            }
            state.loading.insert(key);
            drop(state);

            let loaded = self.loader.get_for_cache(key);

            let mut state = self.state.lock();
            state.loading.remove(&key);
            match loaded {
                Ok(value) => {
                    let arc = Arc::new(value);
                    state.entries.insert(
                        key,
                        Resident {
                            value: Arc::clone(&arc),
                            refs: 1,
                        },
                    );
                    self.cond.notify_all();
                    return Ok(arc);
                }
                Err(e) => {
                    self.cond.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Releases one reference to `key`. At zero, evicts and writes back.
    pub fn release(&self, key: K) {
        let mut state = self.state.lock();
        let evict = match state.entries.get_mut(&key) {
            Some(resident) => {
                resident.refs -= 1;
                resident.refs == 0
            }
            None => false,
        };
        if evict {
            let resident = state.entries.remove(&key).unwrap();
            drop(state);
            self.loader.release_for_cache(key, resident.value);
        }
    }

    /// Drops a key out of the map regardless of ref-count, without writing
    /// back, so the next `acquire` reloads it through the loader. Any caller
    /// already holding an `Arc` from before the invalidation keeps using it
    /// until they release it.
    pub fn invalidate(&self, key: K) {
        self.state.lock().entries.remove(&key);
    }

    /// Forces write-back of every resident entry, regardless of ref-count.
    pub fn close(&self) {
        let mut state = self.state.lock();
        let keys: Vec<K> = state.entries.keys().copied().collect();
        for key in keys {
            if let Some(resident) = state.entries.remove(&key) {
                self.loader.release_for_cache(key, resident.value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
