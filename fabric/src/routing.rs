//! Routing groups: consistent-hashing continuums over weighted member sets.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// The persisted shape of a routing group: service name to weight.
pub type GroupDefinition = BTreeMap<String, u32>;

/// The collection the group store keeps its definitions under.
pub const GROUPS_COLLECTION: &str = "groups";

/// The tags a routing group must carry to be picked up.
pub const GROUP_TAGS: &[&str] = &["group", "active"];

/// The authoritative store of routing group definitions.
#[async_trait]
pub trait GroupStore: Send + Sync + 'static {
    /// List the names in `collection` carrying all of `tags`.
    async fn find(&self, collection: &str, tags: &[&str]) -> anyhow::Result<Vec<String>>;

    /// Read one group definition.
    async fn read(&self, collection: &str, name: &str) -> anyhow::Result<GroupDefinition>;
}

/// The number of ring points contributed per unit of member weight.
const POINTS_PER_WEIGHT: u64 = 10;

/// A consistent-hashing continuum over a routing group's members.
///
/// Continuums are immutable once constructed; a refresh builds a new one
/// and swaps the whole table entry.
#[derive(Clone, Debug)]
pub struct Continuum {
    name: String,
    members: Vec<String>,
    /// `(point, member index)`, sorted by point.
    ring: Vec<(u64, usize)>,
}

impl Continuum {
    /// Build a continuum for the named group. Returns `None` for an empty
    /// definition, which cannot route anything.
    pub fn new(name: impl Into<String>, definition: &GroupDefinition) -> Option<Self> {
        if definition.is_empty() {
            return None;
        }
        let name = name.into();
        let members: Vec<String> = definition.keys().cloned().collect();
        let mut ring = Vec::new();
        for (index, (member, weight)) in definition.iter().enumerate() {
            let points = u64::from(std::cmp::max(*weight, 1)) * POINTS_PER_WEIGHT;
            for replica in 0..points {
                ring.push((hash(format!("{}#{}", member, replica).as_bytes()), index));
            }
        }
        ring.sort_unstable();
        ring.dedup_by_key(|(point, _)| *point);
        tracing::debug!(group = %name, members = members.len(), points = ring.len(), "continuum constructed");
        Some(Self { name, members, ring })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unkeyed lookup: the ring's canonical representative. Every call
    /// returns the same member.
    pub fn get(&self) -> &str {
        let (_, index) = self.ring[0];
        &self.members[index]
    }

    /// Keyed lookup: the member owning the first ring point at or after the
    /// seed's hash, wrapping around the ring.
    pub fn get_seeded(&self, seed: &str) -> &str {
        let point = hash(seed.as_bytes());
        let at = self.ring.partition_point(|(p, _)| *p < point) % self.ring.len();
        let (_, index) = self.ring[at];
        &self.members[index]
    }
}

/// FNV-1a. The ring hash must be stable across processes so every node in
/// the cluster maps a seed to the same member.
fn hash(bytes: &[u8]) -> u64 {
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        state ^= u64::from(*byte);
        state = state.wrapping_mul(0x0000_0100_0000_01b3);
    }
    state
}
