//! Wire messages exchanged between cluster peers, and their framing.
//!
//! Every message is a single length-prefixed binary frame sharing a common
//! header: `type(1) | clusterId(4) | senderId | recipientId | term`, with
//! node identities encoded as length-prefixed UTF-8. [`MessageCodec`]
//! implements `tokio_util::codec::{Encoder, Decoder}` over this format so a
//! transport can wrap a TCP stream with `FramedRead`/`FramedWrite`.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::error::ProtocolError;
use crate::raft_types::ClusterId;
use crate::raft_types::Membership;
use crate::raft_types::MessageSummary;
use crate::raft_types::NodeId;
use crate::raft_types::Timestamp;

/// The maximum admitted frame size, in bytes.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// The maximum serialized size of a transaction's read set, in bytes.
///
/// A commit whose encoded reads exceed this limit fails with a
/// transaction-fatal error rather than being sent.
pub const MAX_READS_SIZE: usize = 16 * 1024 * 1024;

const TYPE_APPEND_REQUEST: u8 = 0x01;
const TYPE_APPEND_RESPONSE: u8 = 0x02;
const TYPE_COMMIT_REQUEST: u8 = 0x03;
const TYPE_COMMIT_RESPONSE: u8 = 0x04;
const TYPE_REQUEST_VOTE: u8 = 0x05;
const TYPE_GRANT_VOTE: u8 = 0x06;
const TYPE_INSTALL_SNAPSHOT: u8 = 0x07;
const TYPE_PING_REQUEST: u8 = 0x08;
const TYPE_PING_RESPONSE: u8 = 0x09;

/// The header fields common to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// The ID of the cluster the sender belongs to. Never zero on the wire.
    pub cluster_id: ClusterId,
    /// The sending node's identity.
    pub sender: NodeId,
    /// The intended recipient's identity.
    pub recipient: NodeId,
    /// The sender's current term.
    pub term: u64,
}

/// Sent by the leader to replicate one log entry, or as a heartbeat/probe
/// when `entry` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub header: Header,
    /// The leader's clock at send time; echoed back verbatim for lease
    /// accounting.
    pub leader_timestamp: Timestamp,
    /// The leader's current lease expiration, when it has one.
    pub leader_lease_timeout: Option<Timestamp>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The term of the entry immediately preceding `entry`.
    pub prev_log_term: u64,
    /// The index of the entry immediately preceding `entry`.
    pub prev_log_index: u64,
    /// At most one entry, positioned at `prev_log_index + 1`.
    pub entry: Option<AppendEntry>,
}

/// The payload slot of an [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntry {
    /// The term under which the entry was created.
    pub term: u64,
    /// The serialized entry data, or `None` when the recipient originated
    /// the mutations and holds them locally (the skip-data optimization;
    /// the sender consumes the skip flag, so any retransmission carries the
    /// data).
    pub data: Option<Bytes>,
}

/// The follower's reply to an [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    pub header: Header,
    /// The `leader_timestamp` of the request, echoed unchanged.
    pub leader_timestamp: Timestamp,
    /// Whether the prev coordinates matched and any carried entry was
    /// appended.
    pub success: bool,
    /// The highest index known to match the leader's log.
    pub match_index: u64,
    /// The responder's last log index.
    pub last_log_index: u64,
}

/// A follower's request that the leader commit a transaction on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub header: Header,
    /// The originating node's transaction ID; echoed in the response.
    pub tx_id: u64,
    pub base_term: u64,
    pub base_index: u64,
    /// The transaction's serialized read ranges.
    pub reads: Bytes,
    /// The transaction's serialized mutations; absent for read-only
    /// transactions.
    pub mutations: Option<Bytes>,
}

/// The leader's reply to a [`CommitRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    pub header: Header,
    pub tx_id: u64,
    pub result: CommitResult,
}

/// The outcome carried by a [`CommitResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Success {
        commit_term: u64,
        commit_index: u64,
        /// When present, the commit must additionally wait until the
        /// leader's advertised lease covers this timestamp.
        min_lease_timeout: Option<Timestamp>,
    },
    Failure {
        message: String,
    },
}

/// Sent by candidates to gather votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub header: Header,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

/// A granted vote; carries no fields beyond the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantVote {
    pub header: Header,
}

/// One chunk of a streamed state-machine snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub header: Header,
    pub snapshot_term: u64,
    pub snapshot_index: u64,
    /// The index of the first key/value pair in `data`. Zero restarts any
    /// in-progress install on the receiver.
    pub pair_index: u64,
    /// The cluster membership covered by the snapshot; present iff
    /// `pair_index == 0`.
    pub config: Option<Membership>,
    pub last_chunk: bool,
    /// Length-prefixed `(key, value)` pairs in ascending key order.
    pub data: Bytes,
}

/// A reachability probe, and its echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub header: Header,
    /// The probing node's clock; echoed back verbatim.
    pub timestamp: Timestamp,
}

/// Any message of the cluster protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Append(AppendRequest),
    AppendReply(AppendResponse),
    Commit(CommitRequest),
    CommitReply(CommitResponse),
    Vote(RequestVote),
    Grant(GrantVote),
    Snapshot(InstallSnapshot),
    Ping(Ping),
    Pong(Ping),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::Append(m) => &m.header,
            Message::AppendReply(m) => &m.header,
            Message::Commit(m) => &m.header,
            Message::CommitReply(m) => &m.header,
            Message::Vote(m) => &m.header,
            Message::Grant(m) => &m.header,
            Message::Snapshot(m) => &m.header,
            Message::Ping(m) => &m.header,
            Message::Pong(m) => &m.header,
        }
    }

    /// True for message kinds that only a leader sends.
    pub fn is_leader_message(&self) -> bool {
        matches!(self, Message::Append(_) | Message::Snapshot(_))
    }

    /// Serialize this message into a frame body (without the length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Message::Append(m) => {
                put_header(&mut buf, TYPE_APPEND_REQUEST, &m.header);
                buf.put_i32(m.leader_timestamp.0);
                put_opt(&mut buf, m.leader_lease_timeout.is_some());
                if let Some(lease) = m.leader_lease_timeout {
                    buf.put_i32(lease.0);
                }
                buf.put_u64(m.leader_commit);
                buf.put_u64(m.prev_log_term);
                buf.put_u64(m.prev_log_index);
                put_opt(&mut buf, m.entry.is_some());
                if let Some(entry) = &m.entry {
                    buf.put_u64(entry.term);
                    put_opt(&mut buf, entry.data.is_some());
                    if let Some(data) = &entry.data {
                        put_lp_bytes(&mut buf, data);
                    }
                }
            }
            Message::AppendReply(m) => {
                put_header(&mut buf, TYPE_APPEND_RESPONSE, &m.header);
                buf.put_i32(m.leader_timestamp.0);
                put_opt(&mut buf, m.success);
                buf.put_u64(m.match_index);
                buf.put_u64(m.last_log_index);
            }
            Message::Commit(m) => {
                put_header(&mut buf, TYPE_COMMIT_REQUEST, &m.header);
                buf.put_u64(m.tx_id);
                buf.put_u64(m.base_term);
                buf.put_u64(m.base_index);
                put_lp_bytes(&mut buf, &m.reads);
                put_opt(&mut buf, m.mutations.is_some());
                if let Some(mutations) = &m.mutations {
                    put_lp_bytes(&mut buf, mutations);
                }
            }
            Message::CommitReply(m) => {
                put_header(&mut buf, TYPE_COMMIT_RESPONSE, &m.header);
                buf.put_u64(m.tx_id);
                match &m.result {
                    CommitResult::Success {
                        commit_term,
                        commit_index,
                        min_lease_timeout,
                    } => {
                        put_opt(&mut buf, true);
                        buf.put_u64(*commit_term);
                        buf.put_u64(*commit_index);
                        put_opt(&mut buf, min_lease_timeout.is_some());
                        if let Some(lease) = min_lease_timeout {
                            buf.put_i32(lease.0);
                        }
                    }
                    CommitResult::Failure { message } => {
                        put_opt(&mut buf, false);
                        put_lp_bytes(&mut buf, message.as_bytes());
                    }
                }
            }
            Message::Vote(m) => {
                put_header(&mut buf, TYPE_REQUEST_VOTE, &m.header);
                buf.put_u64(m.last_log_term);
                buf.put_u64(m.last_log_index);
            }
            Message::Grant(m) => {
                put_header(&mut buf, TYPE_GRANT_VOTE, &m.header);
            }
            Message::Snapshot(m) => {
                put_header(&mut buf, TYPE_INSTALL_SNAPSHOT, &m.header);
                buf.put_u64(m.snapshot_term);
                buf.put_u64(m.snapshot_index);
                buf.put_u64(m.pair_index);
                put_opt(&mut buf, m.config.is_some());
                if let Some(config) = &m.config {
                    put_membership(&mut buf, config);
                }
                put_opt(&mut buf, m.last_chunk);
                put_lp_bytes(&mut buf, &m.data);
            }
            Message::Ping(m) => {
                put_header(&mut buf, TYPE_PING_REQUEST, &m.header);
                buf.put_i32(m.timestamp.0);
            }
            Message::Pong(m) => {
                put_header(&mut buf, TYPE_PING_RESPONSE, &m.header);
                buf.put_i32(m.timestamp.0);
            }
        }
        buf.freeze()
    }

    /// Deserialize a message from a complete frame body.
    pub fn decode(mut buf: Bytes) -> Result<Message, ProtocolError> {
        let msg_type = get_u8(&mut buf)?;
        let header = get_header(&mut buf)?;
        let msg = match msg_type {
            TYPE_APPEND_REQUEST => {
                let leader_timestamp = Timestamp(get_i32(&mut buf)?);
                let leader_lease_timeout = if get_opt(&mut buf)? {
                    Some(Timestamp(get_i32(&mut buf)?))
                } else {
                    None
                };
                let leader_commit = get_u64(&mut buf)?;
                let prev_log_term = get_u64(&mut buf)?;
                let prev_log_index = get_u64(&mut buf)?;
                let entry = if get_opt(&mut buf)? {
                    let term = get_u64(&mut buf)?;
                    let data = if get_opt(&mut buf)? {
                        Some(get_lp_bytes(&mut buf)?)
                    } else {
                        None
                    };
                    Some(AppendEntry { term, data })
                } else {
                    None
                };
                Message::Append(AppendRequest {
                    header,
                    leader_timestamp,
                    leader_lease_timeout,
                    leader_commit,
                    prev_log_term,
                    prev_log_index,
                    entry,
                })
            }
            TYPE_APPEND_RESPONSE => Message::AppendReply(AppendResponse {
                header,
                leader_timestamp: Timestamp(get_i32(&mut buf)?),
                success: get_opt(&mut buf)?,
                match_index: get_u64(&mut buf)?,
                last_log_index: get_u64(&mut buf)?,
            }),
            TYPE_COMMIT_REQUEST => {
                let tx_id = get_u64(&mut buf)?;
                let base_term = get_u64(&mut buf)?;
                let base_index = get_u64(&mut buf)?;
                let reads = get_lp_bytes(&mut buf)?;
                let mutations = if get_opt(&mut buf)? {
                    Some(get_lp_bytes(&mut buf)?)
                } else {
                    None
                };
                Message::Commit(CommitRequest {
                    header,
                    tx_id,
                    base_term,
                    base_index,
                    reads,
                    mutations,
                })
            }
            TYPE_COMMIT_RESPONSE => {
                let tx_id = get_u64(&mut buf)?;
                let result = if get_opt(&mut buf)? {
                    let commit_term = get_u64(&mut buf)?;
                    let commit_index = get_u64(&mut buf)?;
                    let min_lease_timeout = if get_opt(&mut buf)? {
                        Some(Timestamp(get_i32(&mut buf)?))
                    } else {
                        None
                    };
                    CommitResult::Success {
                        commit_term,
                        commit_index,
                        min_lease_timeout,
                    }
                } else {
                    let message = String::from_utf8(get_lp_bytes(&mut buf)?.to_vec())?;
                    CommitResult::Failure { message }
                };
                Message::CommitReply(CommitResponse { header, tx_id, result })
            }
            TYPE_REQUEST_VOTE => Message::Vote(RequestVote {
                header,
                last_log_term: get_u64(&mut buf)?,
                last_log_index: get_u64(&mut buf)?,
            }),
            TYPE_GRANT_VOTE => Message::Grant(GrantVote { header }),
            TYPE_INSTALL_SNAPSHOT => {
                let snapshot_term = get_u64(&mut buf)?;
                let snapshot_index = get_u64(&mut buf)?;
                let pair_index = get_u64(&mut buf)?;
                let config = if get_opt(&mut buf)? {
                    Some(get_membership(&mut buf)?)
                } else {
                    None
                };
                if config.is_some() != (pair_index == 0) {
                    return Err(ProtocolError::Malformed("snapshot config present iff pair index is zero"));
                }
                let last_chunk = get_opt(&mut buf)?;
                let data = get_lp_bytes(&mut buf)?;
                Message::Snapshot(InstallSnapshot {
                    header,
                    snapshot_term,
                    snapshot_index,
                    pair_index,
                    config,
                    last_chunk,
                    data,
                })
            }
            TYPE_PING_REQUEST => Message::Ping(Ping {
                header,
                timestamp: Timestamp(get_i32(&mut buf)?),
            }),
            TYPE_PING_RESPONSE => Message::Pong(Ping {
                header,
                timestamp: Timestamp(get_i32(&mut buf)?),
            }),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(msg)
    }
}

impl MessageSummary for Message {
    fn summary(&self) -> String {
        let h = self.header();
        let prefix = format!("cluster={:08x}, from={}, term={}", h.cluster_id, h.sender, h.term);
        match self {
            Message::Append(m) => format!(
                "AppendRequest[{}, prev={}-{}, commit={}, entry={}]",
                prefix,
                m.prev_log_term,
                m.prev_log_index,
                m.leader_commit,
                match &m.entry {
                    Some(e) if e.data.is_some() => "data",
                    Some(_) => "skip-data",
                    None => "probe",
                }
            ),
            Message::AppendReply(m) => format!(
                "AppendResponse[{}, success={}, match={}, last={}]",
                prefix, m.success, m.match_index, m.last_log_index
            ),
            Message::Commit(m) => format!(
                "CommitRequest[{}, tx={}, base={}-{}, read_only={}]",
                prefix,
                m.tx_id,
                m.base_term,
                m.base_index,
                m.mutations.is_none()
            ),
            Message::CommitReply(m) => format!(
                "CommitResponse[{}, tx={}, {}]",
                prefix,
                m.tx_id,
                match &m.result {
                    CommitResult::Success {
                        commit_term,
                        commit_index,
                        ..
                    } => format!("commit={}-{}", commit_term, commit_index),
                    CommitResult::Failure { message } => format!("failure: {}", message),
                }
            ),
            Message::Vote(m) => format!("RequestVote[{}, last={}-{}]", prefix, m.last_log_term, m.last_log_index),
            Message::Grant(_) => format!("GrantVote[{}]", prefix),
            Message::Snapshot(m) => format!(
                "InstallSnapshot[{}, snapshot={}-{}, pair={}, last={}, len={}]",
                prefix,
                m.snapshot_term,
                m.snapshot_index,
                m.pair_index,
                m.last_chunk,
                m.data.len()
            ),
            Message::Ping(m) => format!("PingRequest[{}, {}]", prefix, m.timestamp),
            Message::Pong(m) => format!("PingResponse[{}, {}]", prefix, m.timestamp),
        }
    }
}

/// A `tokio_util` codec carrying [`Message`] frames over a byte stream.
///
/// The frame format is a `u32` big-endian body length followed by the body.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = msg.encode();
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversize {
                len: body.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversize {
                len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(len).freeze();
        Ok(Some(Message::decode(body)?))
    }
}

// Wire primitives, shared with the log and MVCC encodings.

pub(crate) fn put_lp_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub(crate) fn get_lp_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn put_opt(buf: &mut BytesMut, present: bool) {
    buf.put_u8(present as u8);
}

pub(crate) fn get_opt(buf: &mut Bytes) -> Result<bool, ProtocolError> {
    Ok(get_u8(buf)? != 0)
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_i32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u64())
}

pub(crate) fn put_lp_str(buf: &mut BytesMut, s: &str) {
    put_lp_bytes(buf, s.as_bytes());
}

pub(crate) fn get_lp_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = get_lp_bytes(buf)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub(crate) fn put_membership(buf: &mut BytesMut, membership: &Membership) {
    buf.put_u32(membership.len() as u32);
    for (id, addr) in membership {
        put_lp_str(buf, id);
        put_lp_str(buf, addr);
    }
}

pub(crate) fn get_membership(buf: &mut Bytes) -> Result<Membership, ProtocolError> {
    let count = get_u32(buf)?;
    let mut membership = Membership::new();
    for _ in 0..count {
        let id = get_lp_str(buf)?;
        let addr = get_lp_str(buf)?;
        membership.insert(id, addr);
    }
    Ok(membership)
}

fn put_header(buf: &mut BytesMut, msg_type: u8, header: &Header) {
    buf.put_u8(msg_type);
    buf.put_u32(header.cluster_id);
    put_lp_str(buf, &header.sender);
    put_lp_str(buf, &header.recipient);
    buf.put_u64(header.term);
}

fn get_header(buf: &mut Bytes) -> Result<Header, ProtocolError> {
    let cluster_id = get_u32(buf)?;
    let sender = get_lp_str(buf)?;
    let recipient = get_lp_str(buf)?;
    let term = get_u64(buf)?;
    Ok(Header {
        cluster_id,
        sender,
        recipient,
        term,
    })
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn header() -> Header {
        Header {
            cluster_id: 0xdead_beef,
            sender: "alpha".into(),
            recipient: "beta".into(),
            term: 7,
        }
    }

    fn roundtrip(msg: Message) {
        let body = msg.encode();
        let decoded = Message::decode(body).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn append_request_roundtrip() {
        roundtrip(Message::Append(AppendRequest {
            header: header(),
            leader_timestamp: Timestamp(1234),
            leader_lease_timeout: Some(Timestamp(-44)),
            leader_commit: 9,
            prev_log_term: 6,
            prev_log_index: 10,
            entry: Some(AppendEntry {
                term: 7,
                data: Some(Bytes::from_static(b"payload")),
            }),
        }));
    }

    #[test]
    fn append_probe_roundtrip() {
        roundtrip(Message::Append(AppendRequest {
            header: header(),
            leader_timestamp: Timestamp(0),
            leader_lease_timeout: None,
            leader_commit: 0,
            prev_log_term: 0,
            prev_log_index: 0,
            entry: None,
        }));
    }

    #[test]
    fn skip_data_entry_roundtrip() {
        roundtrip(Message::Append(AppendRequest {
            header: header(),
            leader_timestamp: Timestamp(55),
            leader_lease_timeout: None,
            leader_commit: 3,
            prev_log_term: 7,
            prev_log_index: 11,
            entry: Some(AppendEntry { term: 7, data: None }),
        }));
    }

    #[test]
    fn append_response_roundtrip() {
        roundtrip(Message::AppendReply(AppendResponse {
            header: header(),
            leader_timestamp: Timestamp(1234),
            success: true,
            match_index: 11,
            last_log_index: 12,
        }));
    }

    #[test]
    fn commit_messages_roundtrip() {
        roundtrip(Message::Commit(CommitRequest {
            header: header(),
            tx_id: 42,
            base_term: 6,
            base_index: 10,
            reads: Bytes::from_static(b"reads"),
            mutations: Some(Bytes::from_static(b"mutations")),
        }));
        roundtrip(Message::CommitReply(CommitResponse {
            header: header(),
            tx_id: 42,
            result: CommitResult::Success {
                commit_term: 7,
                commit_index: 11,
                min_lease_timeout: Some(Timestamp(99)),
            },
        }));
        roundtrip(Message::CommitReply(CommitResponse {
            header: header(),
            tx_id: 42,
            result: CommitResult::Failure {
                message: "read/write conflict at index 11".into(),
            },
        }));
    }

    #[test]
    fn vote_messages_roundtrip() {
        roundtrip(Message::Vote(RequestVote {
            header: header(),
            last_log_term: 6,
            last_log_index: 10,
        }));
        roundtrip(Message::Grant(GrantVote { header: header() }));
    }

    #[test]
    fn snapshot_roundtrip() {
        roundtrip(Message::Snapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 6,
            snapshot_index: 1000,
            pair_index: 0,
            config: Some(btreemap! {
                "alpha".to_string() => "127.0.0.1:7001".to_string(),
                "beta".to_string() => "127.0.0.1:7002".to_string(),
            }),
            last_chunk: false,
            data: Bytes::from_static(b"pairs"),
        }));
        roundtrip(Message::Snapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 6,
            snapshot_index: 1000,
            pair_index: 17,
            config: None,
            last_chunk: true,
            data: Bytes::from_static(b"pairs"),
        }));
    }

    #[test]
    fn ping_roundtrip() {
        roundtrip(Message::Ping(Ping {
            header: header(),
            timestamp: Timestamp(-1),
        }));
        roundtrip(Message::Pong(Ping {
            header: header(),
            timestamp: Timestamp(i32::MAX),
        }));
    }

    #[test]
    fn snapshot_config_only_on_first_chunk() {
        let msg = Message::Snapshot(InstallSnapshot {
            header: header(),
            snapshot_term: 6,
            snapshot_index: 1000,
            pair_index: 5,
            config: Some(Membership::new()),
            last_chunk: false,
            data: Bytes::new(),
        });
        assert!(Message::decode(msg.encode()).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        assert!(matches!(
            Message::decode(buf.freeze()),
            Err(ProtocolError::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let msg = Message::Grant(GrantVote { header: header() });
        let body = msg.encode();
        let cut = body.slice(0..body.len() - 2);
        assert!(matches!(Message::decode(cut), Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn codec_roundtrip_over_framed_stream() {
        use futures::SinkExt;
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;
        use tokio_util::codec::FramedWrite;

        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, MessageCodec::default());
        let mut reader = FramedRead::new(server, MessageCodec::default());

        let msg = Message::Vote(RequestVote {
            header: header(),
            last_log_term: 3,
            last_log_index: 9,
        });
        writer.send(msg.clone()).await.unwrap();
        let decoded = reader.next().await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn codec_roundtrip_through_buffer() {
        let mut codec = MessageCodec::default();
        let msg = Message::Ping(Ping {
            header: header(),
            timestamp: Timestamp(5),
        });
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        // A partial frame yields None and leaves the buffer intact.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }
}
