use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

/// A Raft node's ID.
///
/// Identities are arbitrary UTF-8 strings chosen by the operator, e.g. a
/// hostname. They travel on the wire length-prefixed and must be stable for
/// the lifetime of the node's persistent state.
pub type NodeId = String;

/// The ID of a formed cluster.
///
/// A pristine node has cluster ID `0`. A non-zero value is assigned once when
/// the cluster is initialized and is stamped on every message thereafter;
/// nodes drop messages bearing a foreign cluster ID.
pub type ClusterId = u32;

/// The identity of a Raft log entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// The cluster membership: a mapping from node identity to network address.
pub type Membership = BTreeMap<NodeId, String>;

/// A single-slot cluster configuration change carried by a log entry.
///
/// An `address` of `Some` adds the node to the cluster (or updates its
/// address); `None` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub node_id: NodeId,
    pub address: Option<String>,
}

impl ConfigChange {
    /// Fold this change into a membership map.
    pub fn apply_to(&self, membership: &mut Membership) {
        match &self.address {
            Some(addr) => {
                membership.insert(self.node_id.clone(), addr.clone());
            }
            None => {
                membership.remove(&self.node_id);
            }
        }
    }
}

/// A point on a node's local millisecond clock.
///
/// Timestamps are signed 32-bit counters relative to an arbitrary per-process
/// epoch. They wrap roughly every 49 days and are compared modulo 2^32, which
/// is unambiguous as long as two compared values are within ±24 days of each
/// other. Only the node that generated a timestamp may interpret it; peers
/// treat received timestamps as opaque and echo them back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp(pub i32);

impl Timestamp {
    /// Milliseconds from `other` to `self`, negative if `self` is earlier.
    pub fn since(self, other: Timestamp) -> i32 {
        self.0.wrapping_sub(other.0)
    }

    /// True if `self` is strictly before `other` under wrapping comparison.
    pub fn before(self, other: Timestamp) -> bool {
        self.since(other) < 0
    }

    /// This timestamp shifted forward (or backward, if negative) by `ms`.
    pub fn offset(self, ms: i64) -> Timestamp {
        Timestamp(self.0.wrapping_add(ms as i32))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Source of [`Timestamp`]s for one node.
///
/// Cheap to copy; every copy shares the same epoch, so timestamps produced by
/// any copy are mutually comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { epoch: Instant::now() }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(self.epoch.elapsed().as_millis() as i32)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

/// A trait to build a summary string for tracing, without relying on large
/// `Debug` output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering_survives_wraparound() {
        let near_max = Timestamp(i32::MAX - 10);
        let wrapped = near_max.offset(20);
        assert!(near_max.before(wrapped));
        assert_eq!(wrapped.since(near_max), 20);
        assert_eq!(near_max.since(wrapped), -20);
    }

    #[test]
    fn config_change_add_and_remove() {
        let mut m = Membership::new();
        ConfigChange {
            node_id: "a".into(),
            address: Some("127.0.0.1:7000".into()),
        }
        .apply_to(&mut m);
        assert_eq!(m.get("a").map(String::as_str), Some("127.0.0.1:7000"));

        ConfigChange {
            node_id: "a".into(),
            address: None,
        }
        .apply_to(&mut m);
        assert!(m.is_empty());
    }
}
