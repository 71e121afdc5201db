//! The persistent-store adapter interface and the on-store key layout.
//!
//! The engine stores all of its durable state in one atomic byte-level
//! key/value store supplied by the application: Raft meta state under six
//! fixed one-byte keys, and the replicated state machine under a single
//! one-byte prefix so snapshot and reset operations can be prefix-scoped.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::message::get_membership;
use crate::message::put_membership;
use crate::mvcc::Writes;
use crate::raft_types::ClusterId;
use crate::raft_types::LogId;
use crate::raft_types::Membership;
use crate::raft_types::NodeId;

/// Meta key: the cluster ID (`u32`, big-endian).
pub const META_CLUSTER_ID: &[u8] = &[0x00];
/// Meta key: the node's current term (`u64`, big-endian).
pub const META_CURRENT_TERM: &[u8] = &[0x01];
/// Meta key: the term of the last applied log entry.
pub const META_LAST_APPLIED_TERM: &[u8] = &[0x02];
/// Meta key: the index of the last applied log entry.
pub const META_LAST_APPLIED_INDEX: &[u8] = &[0x03];
/// Meta key: the cluster membership as of the last applied log entry.
pub const META_LAST_APPLIED_CONFIG: &[u8] = &[0x04];
/// Meta key: the identity voted for in the current term; absent when none.
pub const META_VOTED_FOR: &[u8] = &[0x05];

/// The prefix byte under which the replicated state machine lives.
pub const STATE_MACHINE_PREFIX: u8 = 0x80;
/// The first key beyond the state machine's prefix range.
pub const STATE_MACHINE_END: &[u8] = &[STATE_MACHINE_PREFIX + 1];

/// A trait defining the interface to the underlying atomic key/value store.
///
/// Implementations must guarantee that `mutate` with `durable = true` either
/// applies the whole batch durably or leaves prior state intact; this is the
/// engine's single durability primitive for everything except the log files.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Open a read-only snapshot of the current store contents.
    async fn snapshot(&self) -> Result<Box<dyn KvSnapshot>>;

    /// Read one key.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Atomically apply a batch of puts and range removes.
    async fn mutate(&self, writes: Writes, durable: bool) -> Result<()>;

    /// Remove all keys in `[start, end)`; `end = None` is unbounded.
    async fn remove_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()>;
}

/// A point-in-time, read-only view of a [`KvStore`].
///
/// This is a trait object rather than an associated type so transaction
/// handles and snapshot transfers need not be generic over the store.
pub trait KvSnapshot: Send + Sync {
    /// Read one key from the snapshot.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Iterate `(key, value)` pairs in `[start, end)` in ascending key
    /// order; `end = None` is unbounded.
    fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + Send + 'a>;
}

/// The durable meta state read back at startup.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub cluster_id: ClusterId,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub last_applied: LogId,
    pub last_applied_config: Membership,
}

/// Load the meta keys from the store. Missing keys read as zero/empty, which
/// is the state of an unconfigured node.
pub async fn read_stored_state<S: KvStore + ?Sized>(store: &S) -> Result<StoredState> {
    let cluster_id = match store.get(META_CLUSTER_ID).await? {
        Some(raw) if raw.len() >= 4 => {
            let mut buf = raw;
            buf.get_u32()
        }
        _ => 0,
    };
    let current_term = read_u64(store, META_CURRENT_TERM).await?;
    let last_applied = LogId {
        term: read_u64(store, META_LAST_APPLIED_TERM).await?,
        index: read_u64(store, META_LAST_APPLIED_INDEX).await?,
    };
    let voted_for = store
        .get(META_VOTED_FOR)
        .await?
        .map(|raw| String::from_utf8_lossy(&raw).into_owned());
    let last_applied_config = match store.get(META_LAST_APPLIED_CONFIG).await? {
        Some(raw) => {
            let mut buf = raw;
            get_membership(&mut buf).unwrap_or_default()
        }
        None => Membership::new(),
    };
    Ok(StoredState {
        cluster_id,
        current_term,
        voted_for,
        last_applied,
        last_applied_config,
    })
}

async fn read_u64<S: KvStore + ?Sized>(store: &S, key: &[u8]) -> Result<u64> {
    Ok(match store.get(key).await? {
        Some(raw) if raw.len() >= 8 => {
            let mut buf = raw;
            buf.get_u64()
        }
        _ => 0,
    })
}

/// Stage a term advance: the new term and the cleared (or re-assigned) vote
/// are always written in the same batch.
pub fn put_term(writes: &mut Writes, term: u64, voted_for: Option<&str>) {
    writes.put(META_CURRENT_TERM, encode_u64(term));
    put_voted_for(writes, voted_for);
}

pub fn put_voted_for(writes: &mut Writes, voted_for: Option<&str>) {
    match voted_for {
        Some(id) => writes.put(META_VOTED_FOR, Bytes::copy_from_slice(id.as_bytes())),
        None => writes.remove(META_VOTED_FOR),
    }
}

pub fn put_cluster_id(writes: &mut Writes, cluster_id: ClusterId) {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(cluster_id);
    writes.put(META_CLUSTER_ID, buf.freeze());
}

pub fn put_last_applied(writes: &mut Writes, log_id: LogId) {
    writes.put(META_LAST_APPLIED_TERM, encode_u64(log_id.term));
    writes.put(META_LAST_APPLIED_INDEX, encode_u64(log_id.index));
}

pub fn put_last_applied_config(writes: &mut Writes, config: &Membership) {
    let mut buf = BytesMut::new();
    put_membership(&mut buf, config);
    writes.put(META_LAST_APPLIED_CONFIG, buf.freeze());
}

fn encode_u64(val: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(val);
    buf.freeze()
}

/// Map a user-space key into the state-machine prefix range.
pub fn prefixed_key(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 1);
    buf.put_u8(STATE_MACHINE_PREFIX);
    buf.put_slice(key);
    buf.freeze()
}

/// Translate a user-space write batch into raw store keys.
pub fn prefix_writes(user: &Writes) -> Writes {
    let mut raw = Writes::new();
    for (start, end) in user.removes().iter() {
        let raw_start = prefixed_key(start);
        let raw_end = match end {
            Some(end) => prefixed_key(end),
            // Unbounded in user space ends at the prefix boundary.
            None => Bytes::from_static(STATE_MACHINE_END),
        };
        raw.remove_range(&raw_start, Some(&raw_end));
    }
    for (key, value) in user.puts() {
        raw.put(&prefixed_key(key), value.clone());
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_keys_are_distinct_single_bytes() {
        let keys = [
            META_CLUSTER_ID,
            META_CURRENT_TERM,
            META_LAST_APPLIED_TERM,
            META_LAST_APPLIED_INDEX,
            META_LAST_APPLIED_CONFIG,
            META_VOTED_FOR,
        ];
        for (i, a) in keys.iter().enumerate() {
            assert_eq!(a.len(), 1);
            assert!(a[0] < STATE_MACHINE_PREFIX);
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn prefixing_keeps_user_order_and_bounds() {
        let mut user = Writes::new();
        user.put(b"k", Bytes::from_static(b"v"));
        user.remove_range(b"a", None);

        let raw = prefix_writes(&user);
        let puts: Vec<_> = raw.puts().collect();
        assert_eq!(puts[0].0.as_ref(), &[STATE_MACHINE_PREFIX, b'k'][..]);

        let removes: Vec<_> = raw.removes().iter().collect();
        let (start, end) = removes[0];
        assert_eq!(start.as_ref(), &[STATE_MACHINE_PREFIX, b'a'][..]);
        assert_eq!(end.unwrap().as_ref(), STATE_MACHINE_END);
    }

    #[test]
    fn term_batch_clears_vote() {
        let mut writes = Writes::new();
        put_voted_for(&mut writes, Some("alpha"));
        put_term(&mut writes, 3, None);
        // The vote must read as cleared out of the same batch.
        assert_eq!(writes.get(META_VOTED_FOR), Some(None));
    }
}
