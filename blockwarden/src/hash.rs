//! Versioned hash functions.
//!
//! Split group assignment, job ownership and label grouping must produce the same
//! values across releases, otherwise replicas running different versions would
//! disagree on who owns a job or which split group a block lands in. All such
//! hashing goes through [HashVersion].

use std::collections::BTreeMap;

use ulid::Ulid;

const FNV32_OFFSET: u32 = 2_166_136_261;
const FNV32_PRIME: u32 = 16_777_619;
const FNV64_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV64_PRIME: u64 = 1_099_511_628_211;
const LABEL_SEPARATOR: u8 = 0xff;

/// A pinned set of hash functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashVersion {
    /// FNV-1 32-bit over block ids, FNV-1a 32-bit over ownership keys and
    /// FNV-1a 64-bit over label sets.
    #[default]
    V1,
}

impl HashVersion {
    /// Hash of a block id, used to pick its split group.
    pub fn block_id(&self, id: &Ulid) -> u32 {
        match self {
            HashVersion::V1 => fnv1_32(&id.to_bytes()),
        }
    }

    /// Hash of a tenant id or job sharding key, used for ring lookups.
    pub fn ownership_key(&self, key: &str) -> u32 {
        match self {
            HashVersion::V1 => fnv1a_32(key.as_bytes()),
        }
    }

    /// Hash of a label set. Labels are visited in name order.
    pub fn labels(&self, labels: &BTreeMap<String, String>) -> u64 {
        match self {
            HashVersion::V1 => {
                let mut h = FNV64_OFFSET;
                for (name, value) in labels {
                    h = fnv1a_64_extend(h, name.as_bytes());
                    h = fnv1a_64_extend(h, &[LABEL_SEPARATOR]);
                    h = fnv1a_64_extend(h, value.as_bytes());
                    h = fnv1a_64_extend(h, &[LABEL_SEPARATOR]);
                }
                h
            }
        }
    }
}

pub(crate) fn fnv1_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |h, b| {
        h.wrapping_mul(FNV32_PRIME) ^ u32::from(*b)
    })
}

pub(crate) fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |h, b| {
        (h ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

fn fnv1a_64_extend(mut h: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV64_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // Reference vectors from the FNV specification.
    #[rstest]
    #[case(b"", 0x811c9dc5)]
    #[case(b"a", 0x050c5d7e)]
    #[case(b"foobar", 0x31f0b262)]
    fn test_fnv1_32(#[case] input: &[u8], #[case] expected: u32) {
        assert_eq!(fnv1_32(input), expected);
    }

    #[rstest]
    #[case(b"", 0x811c9dc5)]
    #[case(b"a", 0xe40c292c)]
    #[case(b"foobar", 0xbf9cf968)]
    fn test_fnv1a_32(#[case] input: &[u8], #[case] expected: u32) {
        assert_eq!(fnv1a_32(input), expected);
    }

    #[test]
    fn test_block_id_hash_uses_ulid_bytes() {
        let id = Ulid::from_parts(1_700_000_000_000, 42);
        assert_eq!(HashVersion::V1.block_id(&id), fnv1_32(&id.to_bytes()));
    }

    #[test]
    fn test_labels_hash_is_order_independent_and_separated() {
        let a = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let b = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(HashVersion::V1.labels(&a), HashVersion::V1.labels(&b));

        // "ab"="" must not collide with "a"="b"
        let c = BTreeMap::from([("ab".to_string(), String::new())]);
        let d = BTreeMap::from([("a".to_string(), "b".to_string())]);
        assert_ne!(HashVersion::V1.labels(&c), HashVersion::V1.labels(&d));
        assert_eq!(HashVersion::V1.labels(&BTreeMap::new()), FNV64_OFFSET);
    }
}
