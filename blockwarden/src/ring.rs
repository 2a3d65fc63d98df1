//! Read-only view of the membership ring.
//!
//! The decision engine never talks to the membership protocol. It only asks
//! "which instance owns this hashed key" through [ReadRing]. [TokenRing] is an
//! in-memory implementation built from a static member list, suitable for a
//! fixed deployment and for tests.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BlockwardenError, Error};
use crate::hash::fnv1a_32;

/// Lifecycle state of a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    Joining,
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub state: InstanceState,
}

impl InstanceDesc {
    pub fn active(id: &str, addr: &str) -> Self {
        Self {
            id: id.to_string(),
            addr: addr.to_string(),
            state: InstanceState::Active,
        }
    }
}

/// Operation a ring lookup is made for. It decides which member states may own
/// a key.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOp {
    /// Compaction and cleanup work. Only active members qualify.
    ActiveWorkers,
}

impl RingOp {
    fn accepts(&self, state: InstanceState) -> bool {
        match self {
            RingOp::ActiveWorkers => state == InstanceState::Active,
        }
    }
}

pub trait ReadRing: Debug + Send + Sync {
    /// Returns the single instance owning `key` for `op`.
    fn owner(&self, key: u32, op: RingOp) -> Result<InstanceDesc, Error>;

    /// Returns the subring of `size` instances assigned to `identifier`.
    /// A size of zero, or one not smaller than the ring, returns the full ring.
    fn shuffle_shard(&self, identifier: &str, size: usize) -> Arc<dyn ReadRing>;

    fn has_instance(&self, instance_id: &str) -> bool;

    fn instances_count(&self) -> usize;
}

/// A consistent-hash ring with deterministic tokens.
///
/// Each instance owns `tokens_per_instance` tokens, the FNV-1a hashes of
/// `"{id}-{n}"`. A key belongs to the first token at or after its hash,
/// wrapping around, skipping instances whose state the lookup does not accept.
#[derive(Debug, Clone)]
pub struct TokenRing {
    instances: BTreeMap<String, InstanceDesc>,
    tokens: Vec<(u32, String)>,
    tokens_per_instance: usize,
}

impl TokenRing {
    pub const DEFAULT_TOKENS_PER_INSTANCE: usize = 128;

    pub fn new(instances: Vec<InstanceDesc>, tokens_per_instance: usize) -> Self {
        let instances: BTreeMap<String, InstanceDesc> = instances
            .into_iter()
            .map(|desc| (desc.id.clone(), desc))
            .collect();
        let mut tokens: Vec<(u32, String)> = instances
            .keys()
            .flat_map(|id| {
                (0..tokens_per_instance)
                    .map(move |n| (fnv1a_32(format!("{}-{}", id, n).as_bytes()), id.clone()))
            })
            .collect();
        tokens.sort();
        Self {
            instances,
            tokens,
            tokens_per_instance,
        }
    }

    /// A ring made of this single active instance.
    pub fn single(id: &str, addr: &str) -> Self {
        Self::new(
            vec![InstanceDesc::active(id, addr)],
            Self::DEFAULT_TOKENS_PER_INSTANCE,
        )
    }
}

impl ReadRing for TokenRing {
    fn owner(&self, key: u32, op: RingOp) -> Result<InstanceDesc, Error> {
        if self.tokens.is_empty() {
            return Err(BlockwardenError::RingUnavailable("empty ring".to_string()).into());
        }
        let start = self.tokens.partition_point(|(token, _)| *token < key);
        let owner = (0..self.tokens.len())
            .map(|offset| &self.tokens[(start + offset) % self.tokens.len()].1)
            .filter_map(|id| self.instances.get(id))
            .find(|desc| op.accepts(desc.state));
        owner.cloned().ok_or_else(|| {
            BlockwardenError::RingUnavailable(format!(
                "no instance available for {:?}. instances={}",
                op,
                self.instances.len()
            ))
            .into()
        })
    }

    fn shuffle_shard(&self, identifier: &str, size: usize) -> Arc<dyn ReadRing> {
        if size == 0 || size >= self.instances.len() {
            return Arc::new(self.clone());
        }
        let mut ranked: Vec<(u32, &InstanceDesc)> = self
            .instances
            .values()
            .map(|desc| {
                let rank = fnv1a_32(format!("{}/{}", identifier, desc.id).as_bytes());
                (rank, desc)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        let members = ranked
            .into_iter()
            .take(size)
            .map(|(_, desc)| desc.clone())
            .collect();
        Arc::new(TokenRing::new(members, self.tokens_per_instance))
    }

    fn has_instance(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    fn instances_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hash::HashVersion;

    fn ring(n: usize) -> TokenRing {
        let instances = (0..n)
            .map(|i| InstanceDesc::active(&format!("compactor-{}", i), &format!("10.0.0.{}:9095", i)))
            .collect();
        TokenRing::new(instances, TokenRing::DEFAULT_TOKENS_PER_INSTANCE)
    }

    #[test]
    fn test_owner_is_deterministic() {
        let ring = ring(5);
        let key = HashVersion::V1.ownership_key("tenant-a");
        let first = ring.owner(key, RingOp::ActiveWorkers).unwrap();
        for _ in 0..10 {
            assert_eq!(ring.owner(key, RingOp::ActiveWorkers).unwrap(), first);
        }
    }

    #[test]
    fn test_owner_skips_inactive_instances() {
        let mut instances: Vec<InstanceDesc> = (0..3)
            .map(|i| InstanceDesc::active(&format!("c-{}", i), &format!("addr-{}", i)))
            .collect();
        instances[0].state = InstanceState::Leaving;
        instances[1].state = InstanceState::Joining;
        let ring = TokenRing::new(instances, 16);

        for key in ["a", "b", "c", "d", "e"] {
            let owner = ring
                .owner(HashVersion::V1.ownership_key(key), RingOp::ActiveWorkers)
                .unwrap();
            assert_eq!(owner.id, "c-2");
        }
    }

    #[test]
    fn test_owner_fails_without_active_instances() {
        let empty = TokenRing::new(vec![], 16);
        let err = empty.owner(42, RingOp::ActiveWorkers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let mut joining = InstanceDesc::active("c-0", "addr-0");
        joining.state = InstanceState::Joining;
        let ring = TokenRing::new(vec![joining], 16);
        assert!(ring.owner(42, RingOp::ActiveWorkers).is_err());
    }

    #[test]
    fn test_shuffle_shard_is_stable_subset() {
        let ring = ring(10);
        let shard = ring.shuffle_shard("tenant-a", 3);
        assert_eq!(shard.instances_count(), 3);

        let again = ring.shuffle_shard("tenant-a", 3);
        for i in 0..10 {
            let id = format!("compactor-{}", i);
            assert_eq!(shard.has_instance(&id), again.has_instance(&id));
        }

        assert_eq!(ring.shuffle_shard("tenant-a", 0).instances_count(), 10);
        assert_eq!(ring.shuffle_shard("tenant-a", 20).instances_count(), 10);
    }

    #[test]
    fn test_every_key_has_exactly_one_owner() {
        let ring = ring(4);
        let mut owners = std::collections::HashMap::new();
        for i in 0..200 {
            let key = HashVersion::V1.ownership_key(&format!("tenant-{}", i));
            let owner = ring.owner(key, RingOp::ActiveWorkers).unwrap();
            *owners.entry(owner.id).or_insert(0) += 1;
        }
        assert_eq!(owners.values().sum::<i32>(), 200);
        // 128 tokens per instance spread keys over every member
        assert_eq!(owners.len(), 4);
    }
}
