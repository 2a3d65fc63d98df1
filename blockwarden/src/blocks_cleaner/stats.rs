use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stats::{Counter, Gauge, StatRegistry};

macro_rules! cleaner_stat_name {
    ($suffix:expr) => {
        crate::stat_name!("blocks_cleaner", $suffix)
    };
}

pub const RUNS_STARTED: &str = cleaner_stat_name!("runs_started");
pub const RUNS_COMPLETED: &str = cleaner_stat_name!("runs_completed");
pub const RUNS_FAILED: &str = cleaner_stat_name!("runs_failed");
pub const LAST_RUN_SUCCESSFUL_TIMESTAMP: &str = cleaner_stat_name!("last_run_successful_timestamp");
pub const BLOCKS_CLEANED: &str = cleaner_stat_name!("blocks_cleaned");
pub const BLOCKS_FAILED: &str = cleaner_stat_name!("blocks_failed");
pub const BLOCKS_MARKED_FOR_DELETION: &str = cleaner_stat_name!("blocks_marked_for_deletion");
pub const OWNED_TENANTS: &str = cleaner_stat_name!("owned_tenants");

/// Block counts of one tenant as of its last cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantBlockStats {
    pub blocks: u64,
    pub blocks_by_compaction_level: BTreeMap<u32, u64>,
    pub blocks_marked_for_deletion: u64,
    pub partial_blocks: u64,
    /// Unix seconds. Zero when the tenant's index is being deleted.
    pub index_last_updated: i64,
}

/// Stats for the blocks cleaner.
pub struct CleanerStats {
    pub runs_started: Arc<Counter>,
    pub runs_completed: Arc<Counter>,
    pub runs_failed: Arc<Counter>,
    pub last_run_successful_timestamp: Arc<Gauge<i64>>,
    pub blocks_cleaned: Arc<Counter>,
    pub blocks_failed: Arc<Counter>,
    pub blocks_marked_for_deletion: Arc<Counter>,
    pub owned_tenants: Arc<Gauge<i64>>,
    tenants: Mutex<BTreeMap<String, TenantBlockStats>>,
}

impl CleanerStats {
    pub fn new(registry: Arc<StatRegistry>) -> Self {
        let stats = Self {
            runs_started: Arc::new(Counter::default()),
            runs_completed: Arc::new(Counter::default()),
            runs_failed: Arc::new(Counter::default()),
            last_run_successful_timestamp: Arc::new(Gauge::default()),
            blocks_cleaned: Arc::new(Counter::default()),
            blocks_failed: Arc::new(Counter::default()),
            blocks_marked_for_deletion: Arc::new(Counter::default()),
            owned_tenants: Arc::new(Gauge::default()),
            tenants: Mutex::new(BTreeMap::new()),
        };
        registry.register(RUNS_STARTED, stats.runs_started.clone());
        registry.register(RUNS_COMPLETED, stats.runs_completed.clone());
        registry.register(RUNS_FAILED, stats.runs_failed.clone());
        registry.register(
            LAST_RUN_SUCCESSFUL_TIMESTAMP,
            stats.last_run_successful_timestamp.clone(),
        );
        registry.register(BLOCKS_CLEANED, stats.blocks_cleaned.clone());
        registry.register(BLOCKS_FAILED, stats.blocks_failed.clone());
        registry.register(
            BLOCKS_MARKED_FOR_DELETION,
            stats.blocks_marked_for_deletion.clone(),
        );
        registry.register(OWNED_TENANTS, stats.owned_tenants.clone());
        stats
    }

    /// Per-tenant block counts, if this instance cleaned `tenant` up.
    pub fn tenant(&self, tenant: &str) -> Option<TenantBlockStats> {
        self.tenants.lock().get(tenant).cloned()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.tenants.lock().keys().cloned().collect()
    }

    pub(crate) fn set_tenant(&self, tenant: &str, stats: TenantBlockStats) {
        self.tenants.lock().insert(tenant.to_string(), stats);
    }

    pub(crate) fn remove_tenant(&self, tenant: &str) {
        self.tenants.lock().remove(tenant);
    }

    /// Drops the stats of tenants not in `owned`. Their new owner reports them.
    pub(crate) fn retain_tenants(&self, owned: &HashSet<String>) {
        self.tenants.lock().retain(|tenant, _| owned.contains(tenant));
        self.owned_tenants.set(owned.len() as i64);
    }
}
