//! Decides which instance works on which tenant and job.
//!
//! Every compactor in a tenant's subring plans all the tenant's jobs, but each
//! job is executed by the single instance owning the job's sharding key. The
//! blocks cleaner of a tenant is the single instance owning the tenant id.

use std::sync::Arc;

use crate::config::TenantConfigProvider;
use crate::error::Error;
use crate::hash::HashVersion;
use crate::job::Job;
use crate::ring::{ReadRing, RingOp};
use crate::tenants::AllowedTenants;

pub trait ShardingStrategy: Send + Sync {
    /// True if this instance takes part in compacting `tenant`.
    fn compactor_owns_tenant(&self, tenant: &str) -> Result<bool, Error>;

    /// True if this instance is the one cleaning up `tenant`.
    fn blocks_cleaner_owns_tenant(&self, tenant: &str) -> Result<bool, Error>;

    /// True if this instance executes `job`. Checked again right before the
    /// job runs since the ring may have changed since planning.
    fn owns_job(&self, job: &Job) -> Result<bool, Error>;
}

pub struct SplitAndMergeShardingStrategy {
    allowed_tenants: AllowedTenants,
    ring: Arc<dyn ReadRing>,
    instance_id: String,
    instance_addr: String,
    limits: Arc<dyn TenantConfigProvider>,
    hash: HashVersion,
}

impl SplitAndMergeShardingStrategy {
    pub fn new(
        allowed_tenants: AllowedTenants,
        ring: Arc<dyn ReadRing>,
        instance_id: &str,
        instance_addr: &str,
        limits: Arc<dyn TenantConfigProvider>,
    ) -> Self {
        Self {
            allowed_tenants,
            ring,
            instance_id: instance_id.to_string(),
            instance_addr: instance_addr.to_string(),
            limits,
            hash: HashVersion::V1,
        }
    }

    fn subring(&self, tenant: &str) -> Arc<dyn ReadRing> {
        self.ring
            .shuffle_shard(tenant, self.limits.tenant_shard_size(tenant))
    }

    fn owns_key(&self, ring: &dyn ReadRing, key: &str) -> Result<bool, Error> {
        let owner = ring.owner(self.hash.ownership_key(key), RingOp::ActiveWorkers)?;
        Ok(owner.addr == self.instance_addr)
    }
}

impl ShardingStrategy for SplitAndMergeShardingStrategy {
    fn compactor_owns_tenant(&self, tenant: &str) -> Result<bool, Error> {
        if !self.allowed_tenants.is_allowed(tenant) {
            return Ok(false);
        }
        Ok(self.subring(tenant).has_instance(&self.instance_id))
    }

    fn blocks_cleaner_owns_tenant(&self, tenant: &str) -> Result<bool, Error> {
        if !self.allowed_tenants.is_allowed(tenant) {
            return Ok(false);
        }
        self.owns_key(self.subring(tenant).as_ref(), tenant)
    }

    fn owns_job(&self, job: &Job) -> Result<bool, Error> {
        if !self.compactor_owns_tenant(job.tenant())? {
            return Ok(false);
        }
        self.owns_key(self.subring(job.tenant()).as_ref(), job.sharding_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limits, TenantLimits, TenantOverrides};
    use crate::ring::{InstanceDesc, InstanceState, TokenRing};
    use std::collections::BTreeMap;

    fn instances(n: usize) -> Vec<InstanceDesc> {
        (0..n)
            .map(|i| InstanceDesc::active(&format!("compactor-{}", i), &format!("10.0.0.{}:9095", i)))
            .collect()
    }

    fn strategies(
        ring: Arc<dyn ReadRing>,
        limits: TenantLimits,
        allowed: AllowedTenants,
        n: usize,
    ) -> Vec<SplitAndMergeShardingStrategy> {
        let limits: Arc<dyn TenantConfigProvider> = Arc::new(limits);
        instances(n)
            .iter()
            .map(|desc| {
                SplitAndMergeShardingStrategy::new(
                    allowed.clone(),
                    ring.clone(),
                    &desc.id,
                    &desc.addr,
                    limits.clone(),
                )
            })
            .collect()
    }

    fn job(tenant: &str, sharding_key: &str) -> Job {
        Job::new(
            tenant,
            "0@1-merge--0-7200000",
            BTreeMap::new(),
            0,
            false,
            0,
            0,
            sharding_key,
        )
    }

    #[test]
    fn test_single_owner_per_job_and_tenant() {
        let ring: Arc<dyn ReadRing> = Arc::new(TokenRing::new(instances(5), 64));
        let strategies = strategies(ring, TenantLimits::default(), AllowedTenants::default(), 5);

        for i in 0..50 {
            let tenant = format!("tenant-{}", i);
            let job = job(&tenant, &format!("{}-merge-0-7200000-{}", tenant, i % 3));

            let job_owners = strategies.iter().filter(|s| s.owns_job(&job).unwrap()).count();
            assert_eq!(job_owners, 1);

            let cleaners = strategies
                .iter()
                .filter(|s| s.blocks_cleaner_owns_tenant(&tenant).unwrap())
                .count();
            assert_eq!(cleaners, 1);

            assert!(strategies
                .iter()
                .all(|s| s.compactor_owns_tenant(&tenant).unwrap()));
        }
    }

    #[test]
    fn test_tenant_shard_size_limits_participants() {
        let ring: Arc<dyn ReadRing> = Arc::new(TokenRing::new(instances(6), 64));
        let mut limits = TenantLimits::default();
        limits.overrides.insert(
            "small".to_string(),
            TenantOverrides {
                tenant_shard_size: Some(2),
                ..Default::default()
            },
        );
        let strategies = strategies(ring, limits, AllowedTenants::default(), 6);

        let participants: Vec<&SplitAndMergeShardingStrategy> = strategies
            .iter()
            .filter(|s| s.compactor_owns_tenant("small").unwrap())
            .collect();
        assert_eq!(participants.len(), 2);

        // job and cleanup owners are always within the subring
        let job = job("small", "small-merge-0-7200000-");
        for s in &strategies {
            if s.owns_job(&job).unwrap() || s.blocks_cleaner_owns_tenant("small").unwrap() {
                assert!(s.compactor_owns_tenant("small").unwrap());
            }
        }
    }

    #[test]
    fn test_disallowed_tenant_is_never_owned() {
        let ring: Arc<dyn ReadRing> = Arc::new(TokenRing::new(instances(1), 16));
        let allowed = AllowedTenants::new(&[], &["blocked".to_string()]);
        let strategies = strategies(ring, TenantLimits::default(), allowed, 1);
        let only = &strategies[0];

        assert!(!only.compactor_owns_tenant("blocked").unwrap());
        assert!(!only.blocks_cleaner_owns_tenant("blocked").unwrap());
        assert!(!only.owns_job(&job("blocked", "k")).unwrap());
        assert!(only.blocks_cleaner_owns_tenant("other").unwrap());
    }

    #[test]
    fn test_ownership_error_when_no_active_instance() {
        let mut instances = instances(2);
        for desc in &mut instances {
            desc.state = InstanceState::Leaving;
        }
        let ring: Arc<dyn ReadRing> = Arc::new(TokenRing::new(instances, 16));
        let limits: Arc<dyn TenantConfigProvider> = Arc::new(TenantLimits {
            defaults: Limits::default(),
            overrides: BTreeMap::new(),
        });
        let strategy = SplitAndMergeShardingStrategy::new(
            AllowedTenants::default(),
            ring,
            "compactor-0",
            "10.0.0.0:9095",
            limits,
        );
        assert!(strategy.blocks_cleaner_owns_tenant("tenant").is_err());
        assert!(strategy.owns_job(&job("tenant", "k")).is_err());
    }
}
