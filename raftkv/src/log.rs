//! The persistent Raft log: a directory of immutable entry files.
//!
//! Each entry lives in its own file named `log-<19 digit index>-<19 digit
//! term>.bin`, holding the entry's serialized writes plus an optional
//! one-slot configuration change. Files are written to a temporary name,
//! fsynced, atomically renamed into place, and the directory is fsynced
//! before the entry is published in memory. Temporaries use a distinct
//! `.tmp` suffix and are swept on startup.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::error::ProtocolError;
use crate::message::get_lp_str;
use crate::message::get_opt;
use crate::message::put_lp_str;
use crate::message::put_opt;
use crate::mvcc::Writes;
use crate::raft_types::ConfigChange;
use crate::raft_types::LogId;

const LOG_FILE_PREFIX: &str = "log-";
const LOG_FILE_SUFFIX: &str = ".bin";
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// The payload of one log entry: a write batch plus an optional
/// configuration change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryData {
    pub writes: Writes,
    pub config_change: Option<ConfigChange>,
}

impl EntryData {
    /// The empty payload appended by a freshly elected leader.
    pub fn no_op() -> Self {
        EntryData::default()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.writes.encode(&mut buf);
        put_opt(&mut buf, self.config_change.is_some());
        if let Some(change) = &self.config_change {
            put_lp_str(&mut buf, &change.node_id);
            put_opt(&mut buf, change.address.is_some());
            if let Some(addr) = &change.address {
                put_lp_str(&mut buf, addr);
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        let writes = Writes::decode(&mut buf)?;
        let config_change = if get_opt(&mut buf)? {
            let node_id = get_lp_str(&mut buf)?;
            let address = if get_opt(&mut buf)? { Some(get_lp_str(&mut buf)?) } else { None };
            Some(ConfigChange { node_id, address })
        } else {
            None
        };
        Ok(EntryData { writes, config_change })
    }
}

/// One immutable, published log entry.
#[derive(Debug)]
pub struct LogEntry {
    pub log_id: LogId,
    pub data: EntryData,
    /// The exact file bytes, retained for replication without re-encoding.
    pub encoded: Bytes,
    pub file: PathBuf,
    pub created_at: Instant,
}

impl LogEntry {
    pub fn byte_size(&self) -> u64 {
        self.encoded.len() as u64
    }
}

struct Inner {
    /// The identity of the last entry applied to the state machine; all
    /// retained entries come after it.
    floor: LogId,
    /// Retained entries, contiguous from `floor.index + 1`.
    entries: Vec<Arc<LogEntry>>,
}

/// The on-disk log plus its in-memory tail.
///
/// Mutating operations run on the core task; replication streams read
/// entries concurrently, so the tail sits behind a lock that is never held
/// across I/O.
pub struct LogStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
    temp_seq: AtomicU64,
}

impl LogStore {
    /// Open the log directory and recover its entries.
    ///
    /// Any leftover temporary files are removed. Entries are discarded when
    /// their index is at or below `last_applied.index`, when their term
    /// regresses from an earlier entry's, or when they leave a gap after
    /// `last_applied.index + 1`; discarded files are deleted.
    pub async fn open(dir: PathBuf, last_applied: LogId) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("log directory {} does not exist", dir.display()));
        }

        let mut found: Vec<(LogId, PathBuf)> = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await.context("reading log directory")?;
        while let Some(dirent) = listing.next_entry().await? {
            let path = dirent.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.ends_with(TEMP_FILE_SUFFIX) {
                tracing::debug!(file = %path.display(), "removing leftover temporary file");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            match parse_file_name(&name) {
                Some(log_id) => found.push((log_id, path)),
                None => {
                    tracing::warn!(file = %path.display(), "ignoring unrecognized file in log directory");
                }
            }
        }
        found.sort_by_key(|(id, _)| id.index);

        let mut entries: Vec<Arc<LogEntry>> = Vec::new();
        let mut discard: Vec<PathBuf> = Vec::new();
        let mut max_term = last_applied.term;
        for (log_id, path) in found {
            let expected_next = entries.last().map(|e| e.log_id.index).unwrap_or(last_applied.index) + 1;
            let keep = log_id.index > last_applied.index && log_id.term >= max_term && log_id.index == expected_next;
            if !keep {
                tracing::debug!(entry = %log_id, "discarding stale log entry on recovery");
                discard.push(path);
                continue;
            }
            let raw = tokio::fs::read(&path).await.with_context(|| format!("reading {}", path.display()))?;
            let encoded = Bytes::from(raw);
            let data = EntryData::decode(encoded.clone())
                .map_err(|err| anyhow!("corrupt log entry {}: {}", path.display(), err))?;
            max_term = log_id.term;
            entries.push(Arc::new(LogEntry {
                log_id,
                data,
                encoded,
                file: path,
                created_at: Instant::now(),
            }));
        }
        for path in discard {
            let _ = tokio::fs::remove_file(&path).await;
        }
        sync_dir(&dir)?;

        tracing::debug!(
            dir = %dir.display(),
            floor = %last_applied,
            recovered = entries.len(),
            "log store opened"
        );
        Ok(LogStore {
            dir,
            inner: RwLock::new(Inner {
                floor: last_applied,
                entries,
            }),
            temp_seq: AtomicU64::new(1),
        })
    }

    /// Durably write and publish a new entry at the next index.
    pub async fn append(&self, log_id: LogId, data: EntryData) -> Result<Arc<LogEntry>> {
        {
            let inner = self.inner.read().unwrap();
            let next = inner.last_log_id().index + 1;
            if log_id.index != next {
                return Err(anyhow!("append of entry {} out of order, expected index {}", log_id, next));
            }
        }

        let encoded = data.encode();
        let final_path = self.dir.join(file_name(log_id));
        let temp_path = self.temp_path();

        let write_res = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &final_path).await?;
            sync_dir(&self.dir)?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if let Err(err) = write_res {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("appending log entry {}", log_id));
        }

        let entry = Arc::new(LogEntry {
            log_id,
            data,
            encoded,
            file: final_path,
            created_at: Instant::now(),
        });
        self.inner.write().unwrap().entries.push(entry.clone());
        Ok(entry)
    }

    /// Remove all entries with `index >= from_index` from disk and memory.
    pub async fn truncate_from(&self, from_index: u64) -> Result<()> {
        let doomed: Vec<Arc<LogEntry>> = {
            let mut inner = self.inner.write().unwrap();
            let keep = inner.entries.iter().take_while(|e| e.log_id.index < from_index).count();
            inner.entries.split_off(keep)
        };
        for entry in &doomed {
            tokio::fs::remove_file(&entry.file)
                .await
                .with_context(|| format!("deleting log entry {}", entry.log_id))?;
        }
        if !doomed.is_empty() {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Drop entries up to and including `through`, which have been applied
    /// to the state machine, and advance the floor.
    pub async fn discard_applied(&self, through: LogId) -> Result<()> {
        let doomed: Vec<Arc<LogEntry>> = {
            let mut inner = self.inner.write().unwrap();
            let count = inner.entries.iter().take_while(|e| e.log_id.index <= through.index).count();
            let doomed = inner.entries.drain(..count).collect();
            inner.floor = through;
            doomed
        };
        for entry in &doomed {
            let _ = tokio::fs::remove_file(&entry.file).await;
        }
        if !doomed.is_empty() {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Delete every entry and reset the floor; used after a snapshot
    /// install replaces the state machine wholesale.
    pub async fn reset(&self, floor: LogId) -> Result<()> {
        let doomed: Vec<Arc<LogEntry>> = {
            let mut inner = self.inner.write().unwrap();
            inner.floor = floor;
            inner.entries.drain(..).collect()
        };
        for entry in &doomed {
            let _ = tokio::fs::remove_file(&entry.file).await;
        }
        sync_dir(&self.dir)?;
        Ok(())
    }

    /// The identity of the newest entry, or the floor when the tail is
    /// empty.
    pub fn last_log_id(&self) -> LogId {
        self.inner.read().unwrap().last_log_id()
    }

    /// The identity of the last applied entry.
    pub fn floor(&self) -> LogId {
        self.inner.read().unwrap().floor
    }

    /// The retained entry at `index`, if any.
    pub fn entry(&self, index: u64) -> Option<Arc<LogEntry>> {
        let inner = self.inner.read().unwrap();
        let first = inner.floor.index + 1;
        if index < first {
            return None;
        }
        inner.entries.get((index - first) as usize).cloned()
    }

    /// The term at `index`, when known: either the floor itself or a
    /// retained entry.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        if index == inner.floor.index {
            return Some(inner.floor.term);
        }
        let first = inner.floor.index + 1;
        if index < first {
            return None;
        }
        inner.entries.get((index - first) as usize).map(|e| e.log_id.term)
    }

    /// A snapshot of the whole retained tail, oldest first.
    pub fn tail(&self) -> Vec<Arc<LogEntry>> {
        self.inner.read().unwrap().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes retained by the in-memory tail.
    pub fn retained_bytes(&self) -> u64 {
        self.inner.read().unwrap().entries.iter().map(|e| e.byte_size()).sum()
    }

    /// Age of the oldest retained entry.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner.read().unwrap().entries.first().map(|e| e.created_at.elapsed())
    }

    /// Durably stage transaction mutation bytes in a uniquely named
    /// temporary file, returning its path. The caller removes the file when
    /// the transaction settles.
    pub async fn write_temp(&self, data: &[u8]) -> Result<PathBuf> {
        let path = self.temp_path();
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(path)
    }

    /// Read back mutation bytes staged by [`LogStore::write_temp`].
    pub async fn read_temp(&self, path: &Path) -> Result<Bytes> {
        let raw = tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?;
        Ok(Bytes::from(raw))
    }

    /// Remove a temporary file created by [`LogStore::write_temp`].
    pub async fn remove_temp(&self, path: &Path) {
        let _ = tokio::fs::remove_file(path).await;
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("pending-{:016x}{}", seq, TEMP_FILE_SUFFIX))
    }
}

impl Inner {
    fn last_log_id(&self) -> LogId {
        self.entries.last().map(|e| e.log_id).unwrap_or(self.floor)
    }
}

fn file_name(log_id: LogId) -> String {
    format!("{}{:019}-{:019}{}", LOG_FILE_PREFIX, log_id.index, log_id.term, LOG_FILE_SUFFIX)
}

fn parse_file_name(name: &str) -> Option<LogId> {
    let body = name.strip_prefix(LOG_FILE_PREFIX)?.strip_suffix(LOG_FILE_SUFFIX)?;
    let mut parts = body.splitn(2, '-');
    let index: u64 = parts.next()?.parse().ok()?;
    let term: u64 = parts.next()?.parse().ok()?;
    if index == 0 || term == 0 {
        return None;
    }
    Some(LogId { term, index })
}

/// Flush directory metadata so a rename or unlink survives a crash.
fn sync_dir(dir: &Path) -> Result<()> {
    let handle = std::fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;

    fn entry_data(key: &[u8], value: &[u8]) -> EntryData {
        let mut writes = Writes::new();
        writes.put(key, Bytes::copy_from_slice(value));
        EntryData {
            writes,
            config_change: None,
        }
    }

    #[test]
    fn file_names_roundtrip() {
        let id = LogId { term: 3, index: 42 };
        let name = file_name(id);
        assert_eq!(name, format!("log-{:019}-{:019}.bin", 42, 3));
        assert_eq!(parse_file_name(&name), Some(id));
        assert_eq!(parse_file_name("log-junk.bin"), None);
        assert_eq!(parse_file_name("other.bin"), None);
    }

    #[test]
    fn entry_data_roundtrip() {
        let data = EntryData {
            writes: {
                let mut w = Writes::new();
                w.put(b"k", Bytes::from_static(b"v"));
                w.remove_range(b"a", Some(b"b"));
                w
            },
            config_change: Some(ConfigChange {
                node_id: "gamma".into(),
                address: Some("127.0.0.1:7003".into()),
            }),
        };
        assert_eq!(EntryData::decode(data.encode()).unwrap(), data);

        let removal = EntryData {
            writes: Writes::new(),
            config_change: Some(ConfigChange {
                node_id: "gamma".into(),
                address: None,
            }),
        };
        assert_eq!(EntryData::decode(removal.encode()).unwrap(), removal);
    }

    #[tokio::test]
    async fn append_and_reload() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();

        log.append(LogId { term: 1, index: 1 }, entry_data(b"a", b"1")).await.unwrap();
        log.append(LogId { term: 1, index: 2 }, entry_data(b"b", b"2")).await.unwrap();
        assert_eq!(log.last_log_id(), LogId { term: 1, index: 2 });
        assert_eq!(log.len(), 2);

        drop(log);
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_log_id(), LogId { term: 1, index: 2 });
        let entry = log.entry(2).unwrap();
        assert_eq!(entry.data.writes.get(b"b"), Some(Some(Bytes::from_static(b"2"))));
    }

    #[tokio::test]
    async fn out_of_order_append_rejected() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        assert!(log.append(LogId { term: 1, index: 5 }, EntryData::no_op()).await.is_err());
    }

    #[tokio::test]
    async fn truncate_deletes_suffix() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        for i in 1..=4 {
            log.append(LogId { term: 1, index: i }, entry_data(b"k", b"v")).await.unwrap();
        }
        log.truncate_from(3).await.unwrap();
        assert_eq!(log.last_log_id(), LogId { term: 1, index: 2 });
        assert!(log.entry(3).is_none());

        drop(log);
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        assert_eq!(log.last_log_id(), LogId { term: 1, index: 2 });
    }

    #[tokio::test]
    async fn temp_staging_roundtrip() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();

        let mut writes = Writes::new();
        writes.put(b"k", Bytes::from_static(b"v"));
        let staged = writes.to_bytes();

        let path = log.write_temp(&staged).await.unwrap();
        assert_eq!(log.read_temp(&path).await.unwrap(), staged);

        log.remove_temp(&path).await;
        assert!(log.read_temp(&path).await.is_err());
    }

    #[tokio::test]
    async fn discard_applied_advances_floor() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        for i in 1..=3 {
            log.append(LogId { term: 1, index: i }, entry_data(b"k", b"v")).await.unwrap();
        }
        log.discard_applied(LogId { term: 1, index: 2 }).await.unwrap();
        assert_eq!(log.floor(), LogId { term: 1, index: 2 });
        assert_eq!(log.len(), 1);
        assert_eq!(log.term_at(2), Some(1));
        assert!(log.entry(2).is_none());
        assert!(log.entry(3).is_some());
    }

    #[tokio::test]
    async fn recovery_discards_applied_gapped_and_stale_entries() {
        let dir = tempdir().unwrap();
        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        for i in 1..=5 {
            log.append(LogId { term: 2, index: i }, entry_data(b"k", b"v")).await.unwrap();
        }
        drop(log);

        // Entry 4 vanishes, producing a gap that orphans entry 5; entries at
        // or below the applied floor are dropped as well.
        std::fs::remove_file(dir.path().join(file_name(LogId { term: 2, index: 4 }))).unwrap();
        std::fs::write(dir.path().join("pending-00ff.tmp"), b"junk").unwrap();

        let log = LogStore::open(dir.path().to_path_buf(), LogId { term: 2, index: 2 }).await.unwrap();
        assert_eq!(log.floor(), LogId { term: 2, index: 2 });
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_log_id(), LogId { term: 2, index: 3 });
        assert!(!dir.path().join("pending-00ff.tmp").exists());
        assert!(!dir.path().join(file_name(LogId { term: 2, index: 5 })).exists());
    }

    #[tokio::test]
    async fn recovery_discards_term_regressions() {
        let dir = tempdir().unwrap();
        {
            let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
            log.append(LogId { term: 3, index: 1 }, entry_data(b"k", b"v")).await.unwrap();
        }
        // Hand-craft a regressed-term file at the next index.
        std::fs::write(
            dir.path().join(file_name(LogId { term: 2, index: 2 })),
            entry_data(b"x", b"y").encode(),
        )
        .unwrap();

        let log = LogStore::open(dir.path().to_path_buf(), LogId::default()).await.unwrap();
        assert_eq!(log.last_log_id(), LogId { term: 3, index: 1 });
    }
}
