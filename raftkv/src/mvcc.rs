//! MVCC building blocks: tracked read ranges and buffered write sets.
//!
//! A transaction records everything it observed as a coalesced set of key
//! ranges ([`KeyRanges`]) and everything it changed as a [`Writes`] overlay.
//! Conflict detection between a transaction and the log entries committed
//! after its base is an intersection test between its reads and each entry's
//! writes.

use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::ProtocolError;
use crate::message::get_lp_bytes;
use crate::message::get_opt;
use crate::message::get_u32;
use crate::message::put_lp_bytes;
use crate::message::put_opt;

/// The smallest key strictly greater than `key`.
fn key_after(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 1);
    buf.put_slice(key);
    buf.put_u8(0);
    buf.freeze()
}

/// An ordered set of disjoint, coalesced `[start, end)` byte ranges.
///
/// An `end` of `None` means the range is unbounded above. Point reads insert
/// the single-key range `[key, key+0x00)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyRanges {
    // start -> end; invariant: disjoint and non-adjacent.
    ranges: BTreeMap<Bytes, Option<Bytes>>,
}

impl KeyRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Iterate the ranges in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, Option<&Bytes>)> {
        self.ranges.iter().map(|(start, end)| (start, end.as_ref()))
    }

    /// Record the single key `key`.
    pub fn add_key(&mut self, key: &[u8]) {
        let end = key_after(key);
        self.add_range(key, Some(&end));
    }

    /// Record the range `[start, end)`; `end = None` is unbounded.
    pub fn add_range(&mut self, start: &[u8], end: Option<&[u8]>) {
        if let Some(end) = end {
            if end <= start {
                return;
            }
        }
        let mut new_start = Bytes::copy_from_slice(start);
        let mut new_end = end.map(Bytes::copy_from_slice);

        // Absorb a predecessor that reaches (or touches) the new start.
        if let Some((pred_start, pred_end)) = self
            .ranges
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .next_back()
            .map(|(s, e)| (s.clone(), e.clone()))
        {
            let reaches = match &pred_end {
                None => true,
                Some(pe) => pe.as_ref() >= start,
            };
            if reaches {
                self.ranges.remove(&pred_start);
                new_start = pred_start;
                new_end = match (new_end, pred_end) {
                    (_, None) | (None, _) => None,
                    (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
                };
            }
        }

        // Absorb successors starting within (or touching) the new range.
        loop {
            let next = self
                .ranges
                .range::<[u8], _>((Bound::Included(new_start.as_ref()), Bound::Unbounded))
                .next()
                .map(|(s, e)| (s.clone(), e.clone()));
            let (succ_start, succ_end) = match next {
                Some(v) => v,
                None => break,
            };
            let touches = match &new_end {
                None => true,
                Some(ne) => succ_start.as_ref() <= ne.as_ref(),
            };
            if !touches {
                break;
            }
            self.ranges.remove(&succ_start);
            new_end = match (new_end, succ_end) {
                (None, _) | (_, None) => None,
                (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
            };
        }

        self.ranges.insert(new_start, new_end);
    }

    /// True if `key` falls within any recorded range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        match self.ranges.range::<[u8], _>((Bound::Unbounded, Bound::Included(key))).next_back() {
            Some((_, None)) => true,
            Some((_, Some(end))) => end.as_ref() > key,
            None => false,
        }
    }

    /// True if `[start, end)` overlaps any recorded range.
    pub fn overlaps(&self, start: &[u8], end: Option<&[u8]>) -> bool {
        if self.contains_key(start) {
            return true;
        }
        // Any recorded range starting inside (start, end)?
        match self
            .ranges
            .range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded))
            .next()
        {
            Some((range_start, _)) => match end {
                None => true,
                Some(end) => range_start.as_ref() < end,
            },
            None => false,
        }
    }

    /// If any key or range of `writes` falls within these ranges, return a
    /// representative conflicting key.
    pub fn intersects_writes(&self, writes: &Writes) -> Option<Bytes> {
        for (key, _) in writes.puts() {
            if self.contains_key(key) {
                return Some(key.clone());
            }
        }
        for (start, end) in writes.removes().iter() {
            if self.overlaps(start, end.map(|e| e.as_ref())) {
                return Some(start.clone());
            }
        }
        None
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ranges.len() as u32);
        for (start, end) in &self.ranges {
            put_lp_bytes(buf, start);
            put_opt(buf, end.is_some());
            if let Some(end) = end {
                put_lp_bytes(buf, end);
            }
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let count = get_u32(buf)?;
        let mut ranges = KeyRanges::new();
        for _ in 0..count {
            let start = get_lp_bytes(buf)?;
            let end = if get_opt(buf)? { Some(get_lp_bytes(buf)?) } else { None };
            ranges.add_range(&start, end.as_deref());
        }
        Ok(ranges)
    }

    /// Serialize to a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        Self::decode(&mut buf)
    }
}

/// A buffered set of mutations: point puts layered over range removes.
///
/// Within one `Writes`, a put always wins over a remove covering the same
/// key, matching the order-insensitive read semantics of the overlay: a key
/// present in `puts` reads as its value even when a removed range covers it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Writes {
    puts: BTreeMap<Bytes, Bytes>,
    removes: KeyRanges,
}

impl Writes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }

    pub fn puts(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.puts.iter()
    }

    pub fn removes(&self) -> &KeyRanges {
        &self.removes
    }

    pub fn put(&mut self, key: &[u8], value: Bytes) {
        self.puts.insert(Bytes::copy_from_slice(key), value);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.puts.remove(key);
        self.removes.add_key(key);
    }

    pub fn remove_range(&mut self, start: &[u8], end: Option<&[u8]>) {
        if let Some(end) = end {
            if end <= start {
                return;
            }
        }
        let doomed: Vec<Bytes> = self
            .puts
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| match end {
                None => true,
                Some(end) => k.as_ref() < end,
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.puts.remove(&key);
        }
        self.removes.add_range(start, end);
    }

    /// What this write set says about `key`: `Some(Some(v))` put,
    /// `Some(None)` removed, `None` untouched.
    pub fn get(&self, key: &[u8]) -> Option<Option<Bytes>> {
        if let Some(value) = self.puts.get(key) {
            return Some(Some(value.clone()));
        }
        if self.removes.contains_key(key) {
            return Some(None);
        }
        None
    }

    /// Fold `other` into `self`, with `other` logically later.
    pub fn absorb(&mut self, other: &Writes) {
        for (start, end) in other.removes.iter() {
            self.remove_range(start, end.map(|e| e.as_ref()));
        }
        for (key, value) in other.puts() {
            self.puts.insert(key.clone(), value.clone());
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.puts.len() as u32);
        for (key, value) in &self.puts {
            put_lp_bytes(buf, key);
            put_lp_bytes(buf, value);
        }
        self.removes.encode(buf);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let count = get_u32(buf)?;
        let mut writes = Writes::new();
        for _ in 0..count {
            let key = get_lp_bytes(buf)?;
            let value = get_lp_bytes(buf)?;
            writes.puts.insert(key, value);
        }
        writes.removes = KeyRanges::decode(buf)?;
        Ok(writes)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        Self::decode(&mut buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn point_reads_coalesce_into_ranges() {
        let mut reads = KeyRanges::new();
        reads.add_key(b"apple");
        reads.add_key(b"banana");
        assert_eq!(reads.len(), 2);
        assert!(reads.contains_key(b"apple"));
        assert!(!reads.contains_key(b"applesauce"));

        reads.add_range(b"a", Some(b"c"));
        assert_eq!(reads.len(), 1);
        assert!(reads.contains_key(b"applesauce"));
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut reads = KeyRanges::new();
        reads.add_range(b"a", Some(b"c"));
        reads.add_range(b"c", Some(b"e"));
        assert_eq!(reads.len(), 1);
        assert!(reads.contains_key(b"d"));
        assert!(!reads.contains_key(b"e"));
    }

    #[test]
    fn unbounded_range_swallows_everything_above() {
        let mut reads = KeyRanges::new();
        reads.add_range(b"x", Some(b"y"));
        reads.add_range(b"m", None);
        assert_eq!(reads.len(), 1);
        assert!(reads.contains_key(b"zzz"));
        assert!(!reads.contains_key(b"a"));
        assert!(reads.overlaps(b"a", None));
        assert!(!reads.overlaps(b"a", Some(b"b")));
    }

    #[test]
    fn conflict_detection_against_writes() {
        let mut reads = KeyRanges::new();
        reads.add_key(b"k");

        let mut writes = Writes::new();
        writes.put(b"other", b("1"));
        assert!(reads.intersects_writes(&writes).is_none());

        writes.put(b"k", b("2"));
        assert_eq!(reads.intersects_writes(&writes), Some(b("k")));

        let mut range_writes = Writes::new();
        range_writes.remove_range(b"a", Some(b"z"));
        assert!(reads.intersects_writes(&range_writes).is_some());
    }

    #[test]
    fn writes_overlay_semantics() {
        let mut writes = Writes::new();
        writes.put(b"a", b("1"));
        writes.remove_range(b"a", Some(b"m"));
        assert_eq!(writes.get(b"a"), Some(None));

        // A put after a covering remove wins.
        writes.put(b"b", b("2"));
        assert_eq!(writes.get(b"b"), Some(Some(b("2"))));
        assert_eq!(writes.get(b"z"), None);
    }

    #[test]
    fn absorb_is_last_writer_wins() {
        let mut first = Writes::new();
        first.put(b"k", b("old"));
        first.put(b"keep", b("kept"));

        let mut second = Writes::new();
        second.remove(b"k");
        second.put(b"new", b("v"));

        first.absorb(&second);
        assert_eq!(first.get(b"k"), Some(None));
        assert_eq!(first.get(b"keep"), Some(Some(b("kept"))));
        assert_eq!(first.get(b"new"), Some(Some(b("v"))));
    }

    #[test]
    fn writes_roundtrip() {
        let mut writes = Writes::new();
        writes.put(b"alpha", b("1"));
        writes.remove_range(b"m", Some(b"p"));
        writes.remove(b"zed");

        let decoded = Writes::from_bytes(writes.to_bytes()).unwrap();
        assert_eq!(decoded, writes);
    }

    #[test]
    fn ranges_roundtrip() {
        let mut reads = KeyRanges::new();
        reads.add_key(b"point");
        reads.add_range(b"a", Some(b"c"));
        reads.add_range(b"x", None);

        let decoded = KeyRanges::from_bytes(reads.to_bytes()).unwrap();
        assert_eq!(decoded, reads);
    }
}
