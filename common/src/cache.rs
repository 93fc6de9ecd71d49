use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};

/// Matches the vendor's request quota window.
pub const CACHE_LIFE: Duration = Duration::from_secs(180);

/// Closed set of cacheable thermostat reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Runtime,
    Sensors,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Sensors => "sensors",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn is_current(&self, now: Instant, life: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < life
    }
}

#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    life: Duration,
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new(CACHE_LIFE)
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(life: Duration) -> Self {
        Self {
            life,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_current(now, self.life))
            .map(|entry| &entry.value)
    }

    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
