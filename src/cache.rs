use crate::db::Successor;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Orders with their own cache tier.
const TIERS: usize = 3;

type CacheKey = (i64, Vec<String>);

/// Bounded LRU of transition lookups, one tier per order.
///
/// Entries are dropped explicitly with [`TransitionCache::invalidate_chat`]
/// whenever a chat's counters change. A chat with loads in flight carries an
/// epoch so a lookup that raced with an invalidation never stores its stale
/// rows. The epoch is forgotten once the last load finishes.
#[derive(Clone)]
pub struct TransitionCache {
    inner: Arc<Mutex<CacheState>>,
}

struct CacheState {
    tiers: Vec<LruCache<CacheKey, Arc<Vec<Successor>>>>,
    in_flight: HashMap<i64, InFlight>,
}

#[derive(Default)]
struct InFlight {
    loads: usize,
    epoch: u64,
}

impl CacheState {
    fn begin_load(&mut self, chat_id: i64) -> u64 {
        let entry = self.in_flight.entry(chat_id).or_default();
        entry.loads += 1;
        entry.epoch
    }

    /// Returns true when the chat was invalidated since `epoch` was taken.
    fn finish_load(&mut self, chat_id: i64, epoch: u64) -> bool {
        let Some(entry) = self.in_flight.get_mut(&chat_id) else {
            return true;
        };
        let stale = entry.epoch != epoch;
        entry.loads = entry.loads.saturating_sub(1);
        if entry.loads == 0 {
            self.in_flight.remove(&chat_id);
        }
        stale
    }
}

impl TransitionCache {
    /// `capacity` is per order tier.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                tiers: (0..TIERS).map(|_| LruCache::new(cap)).collect(),
                in_flight: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tier(order: usize) -> Option<usize> {
        (1..=TIERS).contains(&order).then(|| order - 1)
    }

    pub fn get(&self, order: usize, chat_id: i64, prefix: &[String]) -> Option<Arc<Vec<Successor>>> {
        let tier = Self::tier(order)?;
        let mut state = self.state();
        state.tiers[tier].get(&(chat_id, prefix.to_vec())).cloned()
    }

    /// Returns the cached successors or loads them, caching the result unless
    /// the chat was invalidated while loading.
    pub fn get_or_load<E, F>(
        &self,
        order: usize,
        chat_id: i64,
        prefix: &[String],
        load: F,
    ) -> Result<Arc<Vec<Successor>>, E>
    where
        F: FnOnce() -> Result<Vec<Successor>, E>,
    {
        let Some(tier) = Self::tier(order) else {
            return load().map(Arc::new);
        };
        let key = (chat_id, prefix.to_vec());
        let epoch = {
            let mut state = self.state();
            if let Some(hit) = state.tiers[tier].get(&key) {
                return Ok(hit.clone());
            }
            state.begin_load(chat_id)
        };

        let loaded = load();

        let mut state = self.state();
        let stale = state.finish_load(chat_id, epoch);
        let rows = Arc::new(loaded?);
        if !stale {
            state.tiers[tier].put(key, rows.clone());
        }
        Ok(rows)
    }

    /// Drops every entry of the chat across all tiers. Returns how many were removed.
    pub fn invalidate_chat(&self, chat_id: i64) -> usize {
        let mut state = self.state();
        if let Some(entry) = state.in_flight.get_mut(&chat_id) {
            entry.epoch += 1;
        }

        let mut removed = 0;
        for tier in state.tiers.iter_mut() {
            let stale: Vec<CacheKey> = tier
                .iter()
                .filter(|(key, _)| key.0 == chat_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                tier.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state().tiers.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
