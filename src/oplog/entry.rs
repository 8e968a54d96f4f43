use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use mongodb::bson::{Bson, Document, Timestamp};

use crate::error::{ApplyError, Result};

/// The single oplog format version this engine understands.
pub const OPLOG_VERSION: i64 = 2;

const UNINITIALIZED_TERM: i64 = -1;

/// Position in the replicated log: a timestamp plus an election term, with a
/// strict total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTime {
    pub timestamp: Timestamp,
    pub term: i64,
}

impl OpTime {
    pub const NULL: OpTime = OpTime {
        timestamp: Timestamp {
            time: 0,
            increment: 0,
        },
        term: UNINITIALIZED_TERM,
    };

    pub fn new(timestamp: Timestamp, term: i64) -> Self {
        Self { timestamp, term }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Read the `ts`/`t` fields of an oplog entry. A missing term means the
    /// entry predates terms.
    pub fn parse_from_entry(doc: &Document) -> Result<OpTime> {
        let timestamp = doc.get_timestamp("ts").map_err(|e| {
            ApplyError::BadValue(format!("oplog entry missing valid ts field: {e}"))
        })?;
        let term = doc.get_i64("t").unwrap_or(UNINITIALIZED_TERM);
        Ok(OpTime { timestamp, term })
    }

    fn sort_key(&self) -> (u32, u32, i64) {
        (self.timestamp.time, self.timestamp.increment, self.term)
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::NULL
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ts: ({}, {}), t: {} }}",
            self.timestamp.time, self.timestamp.increment, self.term
        )
    }
}

/// Kind of a replicated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
    /// Preserved so the dispatcher can report the original value.
    Other(String),
}

impl OpType {
    pub fn parse(s: &str) -> OpType {
        match s {
            "i" => OpType::Insert,
            "u" => OpType::Update,
            "d" => OpType::Delete,
            "c" => OpType::Command,
            "n" => OpType::Noop,
            other => OpType::Other(other.to_string()),
        }
    }

    pub fn is_crud(&self) -> bool {
        matches!(self, OpType::Insert | OpType::Update | OpType::Delete)
    }
}

/// Encoded size of a document in bytes.
pub fn doc_byte_size(doc: &Document) -> usize {
    let mut buf = Vec::new();
    // Serialization of an already-parsed document cannot fail.
    doc.to_writer(&mut buf).map(|_| buf.len()).unwrap_or(0)
}

fn bson_to_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Parsed view over one raw oplog document.
///
/// Parsed once on enqueue; owned by the enclosing batch for the full
/// duration of parallel apply.
#[derive(Debug)]
pub struct OplogEntry {
    pub raw: Document,
    pub ns: String,
    pub op_type: OpType,
    pub ts: Timestamp,
    pub version: i64,
    pub o: Document,
    pub o2: Option<Document>,
    bytes: usize,
    // Written by the partitioner, read by apply workers; the join between
    // the oplog-write phase and the apply phase orders the two.
    for_capped_collection: AtomicBool,
}

impl OplogEntry {
    pub fn parse(raw: Document) -> Self {
        let ns = raw.get_str("ns").unwrap_or("").to_string();
        let op_type = OpType::parse(raw.get_str("op").unwrap_or(""));
        let ts = raw.get_timestamp("ts").unwrap_or(Timestamp {
            time: 0,
            increment: 0,
        });
        // A missing version field means version 1.
        let version = match raw.get("v") {
            None => 1,
            Some(v) => bson_to_i64(v).unwrap_or(0),
        };
        let o = raw.get_document("o").cloned().unwrap_or_default();
        let o2 = raw.get_document("o2").ok().cloned();
        let bytes = doc_byte_size(&raw);

        Self {
            raw,
            ns,
            op_type,
            ts,
            version,
            o,
            o2,
            bytes,
            for_capped_collection: AtomicBool::new(false),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// An empty raw document marks the upstream queue as drained.
    pub fn is_sentinel(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn is_crud(&self) -> bool {
        self.op_type.is_crud()
    }

    pub fn op_time(&self) -> Result<OpTime> {
        OpTime::parse_from_entry(&self.raw)
    }

    /// Document id used for writer-slot hashing: updates carry it in `o2`,
    /// everything else in `o`.
    pub fn id_for_partition(&self) -> Option<&Bson> {
        match self.op_type {
            OpType::Update => self.o2.as_ref().and_then(|o2| o2.get("_id")),
            _ => self.o.get("_id"),
        }
    }

    pub fn mark_for_capped_collection(&self) {
        self.for_capped_collection
            .store(true, AtomicOrdering::Release);
    }

    pub fn is_for_capped_collection(&self) -> bool {
        self.for_capped_collection.load(AtomicOrdering::Acquire)
    }
}
