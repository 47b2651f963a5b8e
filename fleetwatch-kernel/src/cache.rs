/**
 * CACHE - Read-through TTL devant le store, pour la couche de requêtes
 *
 * - une instance injectée (créée au démarrage, vidée à l'arrêt), pas de singleton
 * - lectures concurrentes via RwLock, une entrée est toujours remplacée en entier
 * - expiration quand l'âge dépasse le TTL, invalidation par clé ou par préfixe
 * - compteurs hits / misses atomiques
 */

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Entry<V> {
    value: Arc<V>,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    /// hits / (hits + misses), 0 quand rien n'a été lu
    pub hit_rate: f64,
}

pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Incrémenté à chaque invalidation, lu avant un fetch read-through
    generation: AtomicU64,
}

impl<V> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // expirée : on la retire si personne ne l'a remplacée entre-temps
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            debug!(key, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) -> Arc<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) -> Arc<V> {
        let value = Arc::new(value);
        self.entries.write().insert(
            key.into(),
            Entry {
                value: value.clone(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        value
    }

    /// Lecture via le cache, `fetch` n'est appelé qu'en cas de miss
    ///
    /// Une erreur de `fetch` n'est jamais mise en cache. Une invalidation survenue
    /// pendant le fetch l'emporte : la valeur est renvoyée sans être stockée.
    pub fn get_or_fetch<E>(
        &self,
        key: &str,
        fetch: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let value = Arc::new(fetch()?);

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(key, "invalidated during fetch, not cached");
            return Ok(value);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                inserted_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.remove(key).is_some()
    }

    /// Retire toutes les clés commençant par `prefix`, retourne le nombre retiré
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(prefix, removed, "cache prefix invalidated");
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.entries.read().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("latest", 42);

        advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get("latest").as_deref(), Some(&42));

        advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("latest"), None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 0));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl() {
        let cache = TtlCache::new(Duration::from_secs(900));
        cache.insert_with_ttl("short", "a", Duration::from_secs(5));
        cache.insert("long", "b");

        advance(Duration::from_secs(10)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn test_prefix_invalidation_only_touches_matching_keys() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("host:alpha:users", 1);
        cache.insert("host:alpha:history:0:10", 2);
        cache.insert("host:alphabet:users", 3);
        cache.insert("host:beta:users", 4);
        cache.insert("latest", 5);

        assert_eq!(cache.invalidate_prefix("host:alpha:"), 2);
        assert!(cache.get("host:alpha:users").is_none());
        assert_eq!(cache.get("host:alphabet:users").as_deref(), Some(&3));
        assert_eq!(cache.get("host:beta:users").as_deref(), Some(&4));
        assert_eq!(cache.get("latest").as_deref(), Some(&5));
    }

    #[test]
    fn test_read_through_fetches_once() {
        let cache: TtlCache<Vec<u32>> = TtlCache::new(Duration::from_secs(60));
        let mut fetches = 0;

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("liveness", || {
                    fetches += 1;
                    Ok::<_, String>(vec![1, 2, 3])
                })
                .unwrap();
            assert_eq!(value.len(), 3);
        }
        assert_eq!(fetches, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_fetch_errors_are_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        let err = cache.get_or_fetch("k", || Err("store down"));
        assert_eq!(err, Err("store down"));
        assert_eq!(cache.stats().entries, 0);

        let ok = cache.get_or_fetch("k", || Ok::<_, &str>(7)).unwrap();
        assert_eq!(*ok, 7);
    }

    #[test]
    fn test_replacement_is_wholesale() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let old = cache.insert("latest", vec!["a"]);
        cache.insert("latest", vec!["b", "c"]);

        assert_eq!(*old, vec!["a"]);
        assert_eq!(*cache.get("latest").unwrap(), vec!["b", "c"]);
        assert!(cache.invalidate("latest"));
        assert!(!cache.invalidate("latest"));
    }

    #[test]
    fn test_invalidation_during_fetch_wins() {
        let cache: TtlCache<&str> = TtlCache::new(Duration::from_secs(900));

        let value = cache
            .get_or_fetch("latest", || {
                // écriture committée et invalidation pendant la lecture du store
                cache.invalidate("latest");
                Ok::<_, String>("stale")
            })
            .unwrap();
        assert_eq!(*value, "stale");
        assert!(cache.get("latest").is_none());

        let fresh = cache.get_or_fetch("latest", || Ok::<_, String>("fresh")).unwrap();
        assert_eq!(*fresh, "fresh");
        assert_eq!(cache.get("latest").as_deref(), Some(&"fresh"));
    }
}
