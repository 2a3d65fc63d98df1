//! # Statistics
//!
//! blockwarden does not push metrics anywhere. Each component registers its
//! counters and gauges in a [StatRegistry] handed to it at construction time,
//! and the embedding application polls the registry and exports the values to
//! whatever observability system it uses.
//!
//! - [ReadableStat]: anything whose current value reads as an `i64`.
//! - [Counter]: monotonically increasing `u64`.
//! - [Gauge]: a value that is set, or moved up and down.
//! - [stat_name!]: builds `"component/name"` stat names at compile time.
//!
//! Per-tenant values cannot be registered under static names. They live in
//! the component's own stats struct, see
//! [`crate::blocks_cleaner_stats::CleanerStats::tenant`].
//!
//! ```
//! use std::sync::Arc;
//! use blockwarden::stats::StatRegistry;
//!
//! let registry = Arc::new(StatRegistry::new());
//! for name in registry.names() {
//!     let value = registry.lookup(name).map(|s| s.get());
//!     println!("{name}: {value:?}");
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use parking_lot::Mutex;
use tracing::warn;

pub trait ReadableStat: Send + Sync + std::fmt::Debug {
    fn get(&self) -> i64;
}

#[derive(Default)]
pub struct StatRegistry {
    stats: Mutex<BTreeMap<&'static str, Arc<dyn ReadableStat>>>,
}

impl StatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stat registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ReadableStat>> {
        self.stats.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stats.lock().keys().copied().collect()
    }

    /// Registers a stat. A second registration under the same name is ignored.
    pub(crate) fn register(&self, name: &'static str, stat: Arc<dyn ReadableStat>) {
        let mut guard = self.stats.lock();
        if guard.contains_key(name) {
            warn!(
                "registry already contains stat with name: {}. will not register again",
                name
            );
            return;
        }
        guard.insert(name, stat);
    }
}

#[derive(Clone, Default)]
pub struct Counter {
    value: Arc<Atomic<u64>>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value.load(Ordering::Relaxed))
    }
}

impl ReadableStat for Counter {
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed) as i64
    }
}

impl Counter {
    pub fn inc(&self) -> u64 {
        self.add(1)
    }

    pub fn add(&self, value: u64) -> u64 {
        self.value.fetch_add(value, Ordering::Relaxed)
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Gauge<T: std::fmt::Debug + NoUninit> {
    value: Arc<Atomic<T>>,
}

impl<T: std::fmt::Debug + NoUninit> std::fmt::Debug for Gauge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value.load(Ordering::Relaxed))
    }
}

impl<T: Default + NoUninit + std::fmt::Debug> Default for Gauge<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Atomic::<T>::default()),
        }
    }
}

impl<T: NoUninit + std::fmt::Debug> Gauge<T> {
    pub fn set(&self, value: T) -> T {
        self.value.swap(value, Ordering::Relaxed)
    }

    pub fn value(&self) -> T {
        self.value.load(Ordering::Relaxed)
    }
}

impl Gauge<i64> {
    pub fn add(&self, value: i64) -> i64 {
        self.value.fetch_add(value, Ordering::Relaxed)
    }

    pub fn sub(&self, value: i64) -> i64 {
        self.value.fetch_sub(value, Ordering::Relaxed)
    }
}

impl ReadableStat for Gauge<i64> {
    fn get(&self) -> i64 {
        self.value()
    }
}

impl ReadableStat for Gauge<u64> {
    fn get(&self) -> i64 {
        self.value() as i64
    }
}

impl ReadableStat for Gauge<bool> {
    fn get(&self) -> i64 {
        self.value() as i64
    }
}

#[macro_export]
macro_rules! stat_name {
    ($prefix:expr, $suffix:expr) => {
        concat!($prefix, "/", $suffix)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_name_joins_prefix_and_suffix() {
        assert_eq!(crate::stat_name!("cleaner", "runs_started"), "cleaner/runs_started");
    }

    #[test]
    fn test_lookup_registered_stats() {
        let registry = StatRegistry::new();
        let counter = Arc::new(Counter::default());
        counter.add(3);
        registry.register("a", counter.clone());
        let gauge = Arc::new(Gauge::<i64>::default());
        gauge.set(-2);
        registry.register("b", gauge);

        assert_eq!(registry.lookup("a").unwrap().get(), 3);
        assert_eq!(registry.lookup("b").unwrap().get(), -2);
        assert!(registry.lookup("c").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);

        counter.inc();
        assert_eq!(registry.lookup("a").unwrap().get(), 4);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = StatRegistry::new();
        let first = Arc::new(Gauge::<u64>::default());
        first.set(1);
        let second = Arc::new(Gauge::<u64>::default());
        second.set(2);
        registry.register("g", first);
        registry.register("g", second);
        assert_eq!(registry.lookup("g").unwrap().get(), 1);
    }

    #[test]
    fn test_gauge_add_sub() {
        let gauge = Gauge::<i64>::default();
        gauge.add(5);
        gauge.sub(7);
        assert_eq!(gauge.value(), -2);
    }
}
