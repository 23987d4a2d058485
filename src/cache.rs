use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::value::Value as Json;

use crate::config::{callback_wrapper, CallbackWrapper};

/// Configuration for callback caching behaviour.
#[derive(Debug, Clone)]
pub struct CallbackCacheConfig {
    /// Time-to-live for cached entries.
    pub ttl: Duration,
    /// Maximum number of entries, 0 for unbounded.
    pub max_entries: usize,
    /// Whether to cache callbacks that returned null. Usually off, since
    /// void callbacks exist for their side effects.
    pub cache_void_callbacks: bool,
}

impl Default for CallbackCacheConfig {
    fn default() -> CallbackCacheConfig {
        CallbackCacheConfig {
            ttl: Duration::from_secs(5),
            max_entries: 10_000,
            cache_void_callbacks: false,
        }
    }
}

/// Decides whether a callback's results may be cached at all.
pub type CachePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct CacheNode {
    key: String,
    value: Json,
    expiry: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked recency list over a slab, front = most recently used.
/// Slab indices stay stable across unrelated insertions and removals,
/// which is what the companion key map points at.
#[derive(Default)]
struct LruList {
    nodes: Vec<Option<CacheNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruList {
    fn node(&self, index: usize) -> Option<&CacheNode> {
        self.nodes.get(index).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut CacheNode> {
        self.nodes.get_mut(index).and_then(|n| n.as_mut())
    }

    fn push_front(&mut self, key: String, value: Json, expiry: Instant) -> usize {
        let node = CacheNode {
            key,
            value,
            expiry,
            prev: None,
            next: self.head,
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if let Some(old_head) = self.head {
            if let Some(n) = self.node_mut(old_head) {
                n.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        index
    }

    fn unlink(&mut self, index: usize) -> Option<CacheNode> {
        let node = self.nodes.get_mut(index).and_then(|n| n.take())?;
        match node.prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.free.push(index);
        Some(node)
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        if let Some(node) = self.unlink(index) {
            let new_index = self.push_front(node.key, node.value, node.expiry);
            debug_assert_eq!(new_index, index);
        }
    }

    fn pop_back(&mut self) -> Option<CacheNode> {
        let tail = self.tail?;
        self.unlink(tail)
    }

    fn back(&self) -> Option<&CacheNode> {
        self.tail.and_then(|i| self.node(i))
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, usize>,
    list: LruList,
}

/// Thread-safe LRU + TTL memoisation for user-callback results, keyed by
/// function name and serialised arguments. Installed through the callback
/// wrapper hook; hits run under the shared read lock, writes take the
/// exclusive lock, statistics are lock-free.
pub struct CallbackCache {
    inner: RwLock<CacheInner>,
    predicate: RwLock<Option<CachePredicate>>,
    config: CallbackCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Default for CallbackCache {
    fn default() -> CallbackCache {
        CallbackCache::new(CallbackCacheConfig::default())
    }
}

impl CallbackCache {
    pub fn new(config: CallbackCacheConfig) -> CallbackCache {
        CallbackCache {
            inner: RwLock::new(CacheInner::default()),
            predicate: RwLock::new(None),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CallbackCacheConfig {
        &self.config
    }

    /// Restricts caching to callbacks the predicate accepts.
    pub fn set_cache_predicate(&self, predicate: CachePredicate) {
        *write_lock(&self.predicate) = Some(predicate);
    }

    fn should_cache(&self, name: &str) -> bool {
        match read_lock(&self.predicate).as_ref() {
            Some(p) => p(name),
            None => true,
        }
    }

    /// `name + ":" + csv(compact-json(arg))`; null arguments serialise as
    /// the literal token `null` via their canonical form.
    fn make_key(name: &str, args: &[&Json]) -> String {
        let mut key = String::with_capacity(name.len() + 1 + args.len() * 16);
        key.push_str(name);
        key.push(':');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(&arg.to_string());
        }
        key
    }

    /// Read-locked lookup. A hit must still be within its TTL; a hit does
    /// not reorder the recency list (only `put` does).
    pub fn try_get(&self, name: &str, args: &[&Json]) -> Option<Json> {
        let key = Self::make_key(name, args);
        let now = Instant::now();
        {
            let inner = read_lock(&self.inner);
            if let Some(&index) = inner.map.get(&key) {
                if let Some(node) = inner.list.node(index) {
                    if node.expiry > now {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(node.value.clone());
                    }
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-locked insert/update. Sweeps expired entries off the back,
    /// then evicts over-capacity entries, then inserts at the front.
    pub fn put(&self, name: &str, args: &[&Json], value: &Json) {
        if !self.config.cache_void_callbacks && value.is_null() {
            return;
        }

        let key = Self::make_key(name, args);
        let now = Instant::now();
        let expiry = now + self.config.ttl;

        let mut inner = write_lock(&self.inner);

        loop {
            let back_expired = match inner.list.back() {
                Some(back) => back.expiry <= now,
                None => false,
            };
            if !back_expired {
                break;
            }
            if let Some(node) = inner.list.pop_back() {
                inner.map.remove(&node.key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(&index) = inner.map.get(&key) {
            if let Some(node) = inner.list.node_mut(index) {
                node.value = value.clone();
                node.expiry = expiry;
            }
            inner.list.move_to_front(index);
            return;
        }

        if self.config.max_entries > 0 {
            while inner.map.len() >= self.config.max_entries {
                match inner.list.pop_back() {
                    Some(node) => {
                        inner.map.remove(&node.key);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        let index = inner.list.push_front(key.clone(), value.clone(), expiry);
        inner.map.insert(key, index);
    }

    /// Removes every entry for `name`, regardless of arguments. Returns
    /// the number of entries removed.
    pub fn invalidate(&self, name: &str) -> usize {
        let prefix = format!("{}:", name);
        let mut inner = write_lock(&self.inner);
        let indices: Vec<usize> = inner
            .map
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, &index)| index)
            .collect();
        let mut removed = 0;
        for index in indices {
            if let Some(node) = inner.list.unlink(index) {
                inner.map.remove(&node.key);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = write_lock(&self.inner);
        inner.map.clear();
        inner.list.clear();
    }

    pub fn len(&self) -> usize {
        read_lock(&self.inner).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// hits / (hits + misses), 0.0 when nothing was recorded yet.
    pub fn hit_rate(&self) -> f64 {
        let h = self.hits();
        let m = self.misses();
        let total = h + m;
        if total > 0 {
            h as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// A wrapper that consults the cache and falls through to the real
    /// callback on a miss.
    pub fn caching_wrapper(self: &Arc<Self>) -> CallbackWrapper {
        let cache = Arc::clone(self);
        callback_wrapper(move |name, args, thunk| {
            if !cache.should_cache(name) {
                return thunk();
            }
            if let Some(value) = cache.try_get(name, args) {
                return Ok(value);
            }
            let value = thunk()?;
            cache.put(name, args, &value);
            Ok(value)
        })
    }

    /// Like [`CallbackCache::caching_wrapper`], but the miss path runs
    /// through `inner` so caching can chain with other instrumentation.
    pub fn caching_wrapper_with_inner(self: &Arc<Self>, inner: CallbackWrapper) -> CallbackWrapper {
        let cache = Arc::clone(self);
        callback_wrapper(move |name, args, thunk| {
            if !cache.should_cache(name) {
                return inner(name, args, thunk);
            }
            if let Some(value) = cache.try_get(name, args) {
                return Ok(value);
            }
            let value = inner(name, args, thunk)?;
            cache.put(name, args, &value);
            Ok(value)
        })
    }

    #[cfg(test)]
    fn check_consistency(&self) {
        let inner = read_lock(&self.inner);
        let mut seen = 0;
        let mut cursor = inner.list.head;
        let mut prev = None;
        while let Some(index) = cursor {
            let node = inner.list.node(index).expect("linked node exists");
            assert_eq!(node.prev, prev);
            assert_eq!(inner.map.get(&node.key), Some(&index));
            prev = Some(index);
            cursor = node.next;
            seen += 1;
        }
        assert_eq!(seen, inner.map.len());
        assert_eq!(inner.list.tail, prev);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    fn cache(ttl_ms: u64, max_entries: usize) -> Arc<CallbackCache> {
        Arc::new(CallbackCache::new(CallbackCacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            max_entries,
            cache_void_callbacks: false,
        }))
    }

    #[test]
    fn test_put_then_get() {
        let c = cache(1000, 10);
        let args = [&json!(1), &json!("a")];
        assert!(c.try_get("f", &args).is_none());
        c.put("f", &args, &json!(42));
        assert_eq!(c.try_get("f", &args), Some(json!(42)));
        assert_eq!(c.hits(), 1);
        assert_eq!(c.misses(), 1);
        c.check_consistency();
    }

    #[test]
    fn test_null_args_key() {
        let c = cache(1000, 10);
        let null = json!(null);
        let args = [&null];
        c.put("f", &args, &json!(1));
        assert_eq!(c.try_get("f", &args), Some(json!(1)));
    }

    #[test]
    fn test_void_results_not_cached() {
        let c = cache(1000, 10);
        c.put("f", &[], &json!(null));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(30, 10);
        c.put("f", &[], &json!(1));
        assert_eq!(c.try_get("f", &[]), Some(json!(1)));
        sleep(Duration::from_millis(60));
        assert!(c.try_get("f", &[]).is_none());
        assert_eq!(c.misses(), 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let c = cache(10_000, 2);
        let one = json!(1);
        let two = json!(2);
        let three = json!(3);
        c.put("f", &[&one], &json!("a"));
        c.put("f", &[&two], &json!("b"));
        // touch the older entry so the newer one becomes LRU
        c.put("f", &[&one], &json!("a2"));
        c.put("f", &[&three], &json!("c"));

        assert_eq!(c.len(), 2);
        assert_eq!(c.try_get("f", &[&one]), Some(json!("a2")));
        assert!(c.try_get("f", &[&two]).is_none());
        assert_eq!(c.try_get("f", &[&three]), Some(json!("c")));
        assert_eq!(c.evictions(), 1);
        c.check_consistency();
    }

    #[test]
    fn test_unbounded_when_zero() {
        let c = cache(10_000, 0);
        for i in 0..100 {
            let arg = json!(i);
            c.put("f", &[&arg], &json!(i));
        }
        assert_eq!(c.len(), 100);
        c.check_consistency();
    }

    #[test]
    fn test_invalidate_by_name() {
        let c = cache(10_000, 0);
        let one = json!(1);
        c.put("f", &[&one], &json!(1));
        c.put("f", &[], &json!(2));
        c.put("g", &[&one], &json!(3));
        assert_eq!(c.invalidate("f"), 2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.try_get("g", &[&one]), Some(json!(3)));
        c.check_consistency();
    }

    #[test]
    fn test_clear_and_stats() {
        let c = cache(10_000, 0);
        c.put("f", &[], &json!(1));
        c.try_get("f", &[]);
        c.try_get("g", &[]);
        assert!((c.hit_rate() - 0.5).abs() < 1e-9);
        c.clear();
        assert_eq!(c.len(), 0);
        c.reset_stats();
        assert_eq!(c.hit_rate(), 0.0);
    }

    #[test]
    fn test_caching_wrapper_invokes_once() {
        use std::sync::atomic::AtomicUsize;
        let c = cache(10_000, 0);
        let wrapper = c.caching_wrapper();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = wrapper(
                "f",
                &[],
                Box::new(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("v"))
                }),
            )
            .expect("wrapped call");
            assert_eq!(value, json!("v"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.hits(), 2);
        assert_eq!(c.misses(), 1);
    }

    #[test]
    fn test_predicate_bypasses_cache() {
        use std::sync::atomic::AtomicUsize;
        let c = cache(10_000, 0);
        c.set_cache_predicate(Arc::new(|name| name != "volatile"));
        let wrapper = c.caching_wrapper();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            wrapper(
                "volatile",
                &[],
                Box::new(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                }),
            )
            .expect("wrapped call");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(c.len(), 0);
    }
}
