//! Shard Catalog
//!
//! Classifies the shards of a stream into open and closed, and maintains the
//! ordered open-shard view of the keyspace that the topology engine works on.
//! Shard data is stateless: every set is rebuilt from a fresh control-plane
//! listing, never mutated across stream mutations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ScalingError, ScalingResult};
use crate::hash_math::{KeyspacePct, MAX_HASH_KEY, MIN_HASH_KEY};

/// One shard as returned by a control-plane listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRecord {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub adjacent_parent_shard_id: Option<String>,
    pub start_hash: u128,
    pub end_hash: u128,
}

/// An open shard enriched with its keyspace share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: String,
    #[serde(with = "serde_hash_key")]
    pub start_hash: u128,
    #[serde(with = "serde_hash_key")]
    pub end_hash: u128,
    /// Share of the keyspace this shard covers, at comparison scale
    pub pct_width: f64,
}

impl ShardInfo {
    pub fn new(shard_id: String, start_hash: u128, end_hash: u128) -> Self {
        let pct = KeyspacePct::of_range(start_hash, end_hash);
        ShardInfo {
            shard_id,
            start_hash,
            end_hash,
            pct_width: pct.as_f64(),
        }
    }

    pub fn from_record(record: &ShardRecord) -> Self {
        ShardInfo::new(record.shard_id.clone(), record.start_hash, record.end_hash)
    }

    /// Keyspace share at fixed comparison scale
    pub fn pct(&self) -> KeyspacePct {
        KeyspacePct::of_range(self.start_hash, self.end_hash)
    }

    /// True when `other` starts exactly one hash unit above this shard's end
    pub fn is_adjacent_below(&self, other: &ShardInfo) -> bool {
        self.end_hash != MAX_HASH_KEY && other.start_hash == self.end_hash + 1
    }
}

/// Two open shards whose ranges abut by exactly one hash unit, ready to merge
#[derive(Debug, Clone)]
pub struct AdjacentPair {
    pub lower: ShardInfo,
    pub higher: ShardInfo,
}

impl AdjacentPair {
    /// Build a pair, rejecting shards that are not hash-adjacent
    pub fn new(lower: ShardInfo, higher: ShardInfo) -> ScalingResult<Self> {
        if !lower.is_adjacent_below(&higher) {
            return Err(ScalingError::resolution_failure(format!(
                "shards {} and {} are not hash-adjacent and cannot merge",
                lower.shard_id, higher.shard_id
            )));
        }
        Ok(AdjacentPair { lower, higher })
    }

    /// Combined keyspace share of both members
    pub fn pct(&self) -> KeyspacePct {
        KeyspacePct::of_range(self.lower.start_hash, self.higher.end_hash)
    }
}

/// The ordered open-shard view of a stream: disjoint ranges sorted ascending
/// by start hash, together covering the whole keyspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenShardSet {
    shards: Vec<ShardInfo>,
}

impl OpenShardSet {
    pub fn new() -> Self {
        OpenShardSet { shards: Vec::new() }
    }

    /// Classify a full listing into the open set. A shard is open iff no
    /// other listed shard names it as parent or adjacent parent; closed
    /// parents are pruned while walking the listing.
    pub fn from_listing(records: &[ShardRecord]) -> ScalingResult<Self> {
        let mut parents: HashSet<&str> = HashSet::new();
        for record in records {
            if let Some(parent) = &record.parent_shard_id {
                parents.insert(parent.as_str());
            }
            if let Some(adjacent) = &record.adjacent_parent_shard_id {
                parents.insert(adjacent.as_str());
            }
        }

        let mut set = OpenShardSet::new();
        for record in records {
            if !parents.contains(record.shard_id.as_str()) {
                set.insert(ShardInfo::from_record(record))?;
            }
        }
        Ok(set)
    }

    /// Insert a shard, keeping ascending start-hash order and rejecting any
    /// range that overlaps an existing member.
    pub fn insert(&mut self, shard: ShardInfo) -> ScalingResult<()> {
        if shard.start_hash > shard.end_hash {
            return Err(ScalingError::resolution_failure(format!(
                "shard {} has an inverted hash range",
                shard.shard_id
            )));
        }
        let position = self
            .shards
            .partition_point(|s| s.start_hash < shard.start_hash);
        if position > 0 {
            let below = &self.shards[position - 1];
            if below.end_hash >= shard.start_hash {
                return Err(ScalingError::resolution_failure(format!(
                    "shard {} overlaps open shard {}",
                    shard.shard_id, below.shard_id
                )));
            }
        }
        if let Some(above) = self.shards.get(position) {
            if shard.end_hash >= above.start_hash {
                return Err(ScalingError::resolution_failure(format!(
                    "shard {} overlaps open shard {}",
                    shard.shard_id, above.shard_id
                )));
            }
        }
        self.shards.insert(position, shard);
        Ok(())
    }

    /// Verify the set tiles the keyspace: starts at the minimum hash, ends at
    /// the maximum, with each member starting one unit above its predecessor.
    pub fn validate_coverage(&self) -> ScalingResult<()> {
        let first = self.shards.first().ok_or_else(|| {
            ScalingError::resolution_failure("open shard set is empty")
        })?;
        if first.start_hash != MIN_HASH_KEY {
            return Err(ScalingError::resolution_failure(format!(
                "keyspace does not start at zero (first shard {} starts at {})",
                first.shard_id, first.start_hash
            )));
        }
        for pair in self.shards.windows(2) {
            if !pair[0].is_adjacent_below(&pair[1]) {
                return Err(ScalingError::resolution_failure(format!(
                    "gap between shards {} and {}",
                    pair[0].shard_id, pair[1].shard_id
                )));
            }
        }
        if let Some(last) = self.shards.last() {
            if last.end_hash != MAX_HASH_KEY {
                return Err(ScalingError::resolution_failure(format!(
                    "keyspace does not reach the maximum hash (last shard {} ends at {})",
                    last.shard_id, last.end_hash
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn find(&self, shard_id: &str) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    /// The open shard immediately above the given one, if any
    pub fn neighbour_above(&self, shard_id: &str) -> Option<&ShardInfo> {
        let index = self.shards.iter().position(|s| s.shard_id == shard_id)?;
        self.shards.get(index + 1)
    }

    /// The open shard immediately below the given one, if any
    pub fn neighbour_below(&self, shard_id: &str) -> Option<&ShardInfo> {
        let index = self.shards.iter().position(|s| s.shard_id == shard_id)?;
        index.checked_sub(1).and_then(|i| self.shards.get(i))
    }

    /// Working stack for the rebalance pass: sorted descending by start hash
    /// so that pops deliver the keyspace in ascending order.
    pub fn descending_stack(&self) -> Vec<ShardInfo> {
        let mut stack = self.shards.clone();
        stack.sort_by(|a, b| b.start_hash.cmp(&a.start_hash));
        stack
    }

    /// Highest shard id in the set, used as a lower-exclusive listing bound
    /// when reconciling newly created shards after a mutation.
    pub fn highest_shard_id(&self) -> Option<&str> {
        self.shards
            .iter()
            .map(|s| s.shard_id.as_str())
            .max()
    }
}

/// Serialize hash keys as the decimal strings the control plane uses; JSON
/// numbers cannot carry the full 128-bit range.
mod serde_hash_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::hash_math::format_hash_key(*key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        crate::hash_math::parse_hash_key(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        id: &str,
        parent: Option<&str>,
        adjacent: Option<&str>,
        start: u128,
        end: u128,
    ) -> ShardRecord {
        ShardRecord {
            shard_id: id.to_string(),
            parent_shard_id: parent.map(String::from),
            adjacent_parent_shard_id: adjacent.map(String::from),
            start_hash: start,
            end_hash: end,
        }
    }

    #[test]
    fn test_open_classification_prunes_parents() {
        let mid = MAX_HASH_KEY / 2;
        // shard-0 was split into shard-1 and shard-2; only the children are open
        let listing = vec![
            record("shardId-000000000000", None, None, 0, MAX_HASH_KEY),
            record("shardId-000000000001", Some("shardId-000000000000"), None, 0, mid),
            record(
                "shardId-000000000002",
                Some("shardId-000000000000"),
                None,
                mid + 1,
                MAX_HASH_KEY,
            ),
        ];
        let set = OpenShardSet::from_listing(&listing).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.find("shardId-000000000000").is_none());
        set.validate_coverage().unwrap();
    }

    #[test]
    fn test_merged_parents_are_pruned() {
        let third = MAX_HASH_KEY / 3;
        // shard-1 and shard-2 merged into shard-3
        let listing = vec![
            record("shardId-000000000000", None, None, 0, third),
            record("shardId-000000000001", None, None, third + 1, 2 * third),
            record(
                "shardId-000000000002",
                None,
                None,
                2 * third + 1,
                MAX_HASH_KEY,
            ),
            record(
                "shardId-000000000003",
                Some("shardId-000000000001"),
                Some("shardId-000000000002"),
                third + 1,
                MAX_HASH_KEY,
            ),
        ];
        let set = OpenShardSet::from_listing(&listing).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.find("shardId-000000000003").is_some());
        set.validate_coverage().unwrap();
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let mut set = OpenShardSet::new();
        set.insert(ShardInfo::new("a".into(), 0, 100)).unwrap();
        set.insert(ShardInfo::new("b".into(), 101, 200)).unwrap();
        let overlap = ShardInfo::new("c".into(), 50, 150);
        assert!(set.insert(overlap).is_err());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_coverage_detects_gap() {
        let mut set = OpenShardSet::new();
        set.insert(ShardInfo::new("a".into(), 0, 100)).unwrap();
        set.insert(ShardInfo::new("b".into(), 102, MAX_HASH_KEY))
            .unwrap();
        assert!(set.validate_coverage().is_err());
    }

    #[test]
    fn test_adjacent_pair_requires_adjacency() {
        let lower = ShardInfo::new("a".into(), 0, 100);
        let higher = ShardInfo::new("b".into(), 101, 200);
        let detached = ShardInfo::new("c".into(), 300, 400);
        assert!(AdjacentPair::new(lower.clone(), higher).is_ok());
        assert!(AdjacentPair::new(lower, detached).is_err());
    }

    #[test]
    fn test_descending_stack_pops_ascending() {
        let mid = MAX_HASH_KEY / 2;
        let mut set = OpenShardSet::new();
        set.insert(ShardInfo::new("low".into(), 0, mid)).unwrap();
        set.insert(ShardInfo::new("high".into(), mid + 1, MAX_HASH_KEY))
            .unwrap();
        let mut stack = set.descending_stack();
        assert_eq!(stack.pop().unwrap().shard_id, "low");
        assert_eq!(stack.pop().unwrap().shard_id, "high");
    }

    #[test]
    fn test_highest_shard_id() {
        let mut set = OpenShardSet::new();
        set.insert(ShardInfo::new("shardId-000000000007".into(), 0, 10))
            .unwrap();
        set.insert(ShardInfo::new("shardId-000000000011".into(), 11, 20))
            .unwrap();
        assert_eq!(set.highest_shard_id(), Some("shardId-000000000011"));
    }

    #[test]
    fn test_shard_info_serializes_hash_keys_as_strings() {
        let shard = ShardInfo::new("s".into(), 0, MAX_HASH_KEY);
        let json = serde_json::to_value(&shard).unwrap();
        assert_eq!(
            json["end_hash"],
            "340282366920938463463374607431768211455"
        );
        let back: ShardInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, shard);
    }
}
