// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Consistent hash ring over partition names.

use std::collections::BTreeMap;

pub const DEFAULT_VIRTUAL_NODES: u32 = 200;

/// FNV-1a with a final avalanche mix.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in data {
        hash = (hash ^ byte as u32).wrapping_mul(16_777_619);
    }
    hash = hash.wrapping_add(hash << 13);
    hash ^= hash >> 7;
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 17;
    hash = hash.wrapping_add(hash << 5);
    hash
}

/// Immutable ring built at startup; topology changes rebuild the router.
#[derive(Clone, Debug, Default)]
pub struct ConsistentHashRing {
    virtual_nodes: u32,
    circle: BTreeMap<u32, String>,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            circle: BTreeMap::new(),
        }
    }

    pub fn with_default_replicas() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }

    pub fn add_node(&mut self, name: &str) {
        for i in 0..self.virtual_nodes {
            let mut buf = Vec::with_capacity(name.len() + 4);
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&i.to_le_bytes());
            let point = fnv1a(&buf);
            if self.circle.insert(point, name.to_owned()).is_some() {
                tracing::warn!(node = name, index = i, "hash ring point collision");
            }
        }
    }

    pub fn remove_node(&mut self, name: &str) {
        self.circle.retain(|_, v| v != name);
    }

    pub fn is_empty(&self) -> bool {
        self.circle.is_empty()
    }

    fn pick_point(&self, point: u32) -> Option<&str> {
        self.circle
            .range(point..)
            .next()
            .or_else(|| self.circle.iter().next())
            .map(|(_, name)| name.as_str())
    }

    /// Select the partition for a numeric group id.
    pub fn pick_gid(&self, gid: u64) -> Option<&str> {
        self.pick_point(fnv1a(&gid.to_le_bytes()))
    }

    /// Select the partition for a string hash key.
    pub fn pick_key(&self, key: &str) -> Option<&str> {
        self.pick_point(fnv1a(key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn ring_of(names: &[&str]) -> ConsistentHashRing {
        let mut ring = ConsistentHashRing::with_default_replicas();
        for name in names {
            ring.add_node(name);
        }
        ring
    }

    #[test]
    fn pick_is_deterministic() {
        let ring = ring_of(&["p0", "p1", "p2"]);
        for gid in 0..1000u64 {
            assert_eq!(ring.pick_gid(gid), ring.pick_gid(gid));
        }
        assert_eq!(ring.pick_key("some-key"), ring.pick_key("some-key"));
    }

    #[test]
    fn keys_spread_over_all_partitions() {
        let ring = ring_of(&["p0", "p1", "p2", "p3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for gid in 0..10_000u64 {
            *counts.entry(ring.pick_gid(gid).unwrap().to_owned()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for (name, count) in counts {
            // even-ish split: every partition sees a real share
            assert!(count > 1_000, "partition {name} only got {count} keys");
        }
    }

    #[test]
    fn removing_one_partition_remaps_only_its_keys() {
        let full = ring_of(&["p0", "p1", "p2", "p3"]);
        let mut reduced = full.clone();
        reduced.remove_node("p3");

        let mut moved = 0;
        let total = 10_000u64;
        for gid in 0..total {
            let before = full.pick_gid(gid).unwrap();
            let after = reduced.pick_gid(gid).unwrap();
            if before != "p3" {
                // keys not on the removed partition must stay put
                assert_eq!(before, after);
            } else {
                moved += 1;
            }
        }
        // roughly 1/4 of the keys lived on p3
        assert!(moved < total / 2, "moved {moved} of {total}");
    }

    #[test]
    fn empty_ring_picks_nothing() {
        let ring = ConsistentHashRing::with_default_replicas();
        assert!(ring.pick_gid(1).is_none());
        assert!(ring.pick_key("k").is_none());
    }
}
