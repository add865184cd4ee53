//! Operation records and raw oplog entries.
//!
//! An [`Op`] is one emitted event: an insert, update, delete, or a
//! `drop`/`dropDatabase` command, tagged with the namespace it touched and
//! the oplog timestamp it carried. Ops come from two sources: the tailed
//! oplog ([`OpSource::Oplog`]) and bulk collection scans
//! ([`OpSource::Direct`]).
//!
//! [`OplogEntry`] is the raw wire shape of one oplog document. Field names
//! follow the server (`ts`, `op`, `ns`, `o`, `o2`) so the type deserializes
//! straight off a cursor.
//!
//! # Examples
//!
//! ```rust
//! use bson::{doc, Timestamp};
//! use optail::op::{Op, Operation, OpSource};
//!
//! let op = Op {
//!     id: Some(bson::Bson::Int32(1)),
//!     operation: Operation::Insert,
//!     namespace: "shop.orders".to_string(),
//!     data: Some(doc! { "_id": 1, "total": 95 }),
//!     doc: None,
//!     timestamp: Timestamp { time: 100, increment: 1 },
//!     source: OpSource::Oplog,
//! };
//!
//! assert!(op.is_insert());
//! assert_eq!(op.get_database(), "shop");
//! assert_eq!(op.get_collection(), "orders");
//! ```

use bson::{Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::TailError;
use crate::options::Options;

/// Predicate over ops, used for the emission, namespace, and direct-read
/// filters.
pub type OpFilter = Arc<dyn Fn(&Op) -> bool + Send + Sync>;

/// Decodes a raw document from `namespace` into a caller-defined value.
///
/// The returned [`Bson`] becomes [`Op::doc`]; when it is a document it is
/// also mirrored into [`Op::data`]. Errors are reported on the error
/// channel as [`TailError::Unmarshal`] and the document is skipped.
pub type DataDecoder = Arc<dyn Fn(&str, &Document) -> Result<Bson, String> + Send + Sync>;

/// The kind of operation an [`Op`] describes.
///
/// Codes match the oplog `op` field: `"i"`, `"u"`, `"d"`, `"c"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Command,
}

impl Operation {
    /// Maps an oplog op code to an operation, ignoring codes the engine
    /// does not emit (`"n"` noops and friends).
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Insert),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "c" => Some(Self::Command),
            _ => None,
        }
    }

    /// The oplog op code for this operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Command => "c",
        }
    }
}

/// Where an op was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    /// Read from the replication oplog.
    Oplog,
    /// Synthesized by a bulk read of an existing collection.
    Direct,
}

impl OpSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oplog => "oplog",
            Self::Direct => "direct",
        }
    }
}

/// One emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    /// Document identifier. Set for inserts, updates, and deletes; may be
    /// `None` for commands.
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<Bson>,

    /// What happened.
    pub operation: Operation,

    /// `"<database>.<collection>"` the op applies to.
    pub namespace: String,

    /// Post-image, update descriptor, or command document.
    ///
    /// `None` for updates still waiting on buffer enrichment and for
    /// deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,

    /// The decoded caller-typed value. Equals `data` (wrapped) when the
    /// decoder produced a document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Bson>,

    /// Oplog timestamp: `(seconds << 32) | ordinal`. Direct reads carry
    /// the wall-clock seconds with ordinal 0.
    pub timestamp: Timestamp,

    /// Which subsystem produced the op.
    pub source: OpSource,
}

impl Op {
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.operation == Operation::Insert
    }

    #[must_use]
    pub fn is_update(&self) -> bool {
        self.operation == Operation::Update
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    #[must_use]
    pub fn is_command(&self) -> bool {
        self.operation == Operation::Command
    }

    #[must_use]
    pub fn is_source_oplog(&self) -> bool {
        self.source == OpSource::Oplog
    }

    #[must_use]
    pub fn is_source_direct(&self) -> bool {
        self.source == OpSource::Direct
    }

    /// True for the two command forms the engine emits: `drop` and
    /// `dropDatabase`.
    #[must_use]
    pub fn is_drop(&self) -> bool {
        self.is_drop_database().is_some() || self.is_drop_collection().is_some()
    }

    /// The dropped collection name, when this op is a `drop` command.
    #[must_use]
    pub fn is_drop_collection(&self) -> Option<&str> {
        if !self.is_command() {
            return None;
        }
        match self.data.as_ref()?.get("drop") {
            Some(Bson::String(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// The dropped database name, when this op is a `dropDatabase` command.
    #[must_use]
    pub fn is_drop_database(&self) -> Option<String> {
        if !self.is_command() {
            return None;
        }
        if self.data.as_ref()?.contains_key("dropDatabase") {
            Some(self.get_database().to_string())
        } else {
            None
        }
    }

    /// Splits the namespace at its first `.` into at most two parts.
    #[must_use]
    pub fn parse_namespace(&self) -> (&str, &str) {
        match self.namespace.split_once('.') {
            Some((db, coll)) => (db, coll),
            None => (self.namespace.as_str(), ""),
        }
    }

    /// The database part of the namespace.
    #[must_use]
    pub fn get_database(&self) -> &str {
        self.parse_namespace().0
    }

    /// The collection the op applies to.
    ///
    /// For a `drop` command this is the dropped collection; for
    /// `dropDatabase` it is `""`.
    #[must_use]
    pub fn get_collection(&self) -> String {
        if self.is_drop_database().is_some() {
            String::new()
        } else if let Some(coll) = self.is_drop_collection() {
            coll.to_string()
        } else {
            self.parse_namespace().1.to_string()
        }
    }

    /// Attaches decoded data: `doc` always, `data` when it is a document.
    pub(crate) fn process_data(&mut self, data: Bson) {
        if let Bson::Document(map) = &data {
            self.data = Some(map.clone());
        }
        self.doc = Some(data);
    }

    pub(crate) fn matches_filter(&self, options: &Options) -> bool {
        options.filter.as_ref().map_or(true, |f| f(self))
    }

    pub(crate) fn matches_ns_filter(&self, options: &Options) -> bool {
        options.namespace_filter.as_ref().map_or(true, |f| f(self))
    }

    pub(crate) fn matches_direct_filter(&self, options: &Options) -> bool {
        options.direct_read_filter.as_ref().map_or(true, |f| f(self))
    }

    /// Builds an op from a raw oplog entry.
    ///
    /// Returns `Ok(None)` when the entry is excluded: an op code the
    /// engine does not emit, a namespace-filter rejection, or a command
    /// other than `drop`/`dropDatabase`. Decoder failures surface as
    /// [`TailError::Unmarshal`]; the entry is not emitted.
    pub fn parse_log_entry(entry: &OplogEntry, options: &Options) -> Result<Option<Op>, TailError> {
        let Some(operation) = Operation::from_code(&entry.op) else {
            return Ok(None);
        };
        let mut op = Op {
            id: None,
            operation,
            namespace: entry.ns.clone(),
            data: None,
            doc: None,
            timestamp: entry.ts,
            source: OpSource::Oplog,
        };
        // The command document is attached before the namespace filter so
        // filters can inspect it.
        if op.is_command() {
            if let Some(cmd) = &entry.o {
                op.process_data(Bson::Document(cmd.clone()));
            }
        }
        if !op.matches_ns_filter(options) {
            return Ok(None);
        }
        if op.is_command() {
            return Ok(op.is_drop().then_some(op));
        }

        let id_source = if op.is_update() {
            entry.o2.as_ref()
        } else {
            entry.o.as_ref()
        };
        op.id = id_source.and_then(|d| d.get("_id").cloned());

        if op.is_insert() {
            if let Some(raw) = &entry.o {
                let value = (options.unmarshal)(&op.namespace, raw).map_err(|message| {
                    TailError::Unmarshal {
                        namespace: op.namespace.clone(),
                        message,
                    }
                })?;
                op.process_data(value);
            }
        } else if op.is_update() {
            if let Some(change) = &entry.o {
                // A change document without $set/$unset is a full
                // replacement; its post-image is already in the entry.
                if options.update_data_as_delta || update_is_replace(change) {
                    let value = (options.unmarshal)(&op.namespace, change).map_err(|message| {
                        TailError::Unmarshal {
                            namespace: op.namespace.clone(),
                            message,
                        }
                    })?;
                    op.process_data(value);
                }
            }
        }
        Ok(Some(op))
    }
}

/// True when an update's change document is a full replacement rather than
/// a `$set`/`$unset` delta.
#[must_use]
pub fn update_is_replace(change: &Document) -> bool {
    !change.contains_key("$set") && !change.contains_key("$unset")
}

/// One raw oplog document as stored in `local.oplog.*`.
///
/// See the server's `oplog_entry.idl` for the full field set; only the
/// fields the engine reads are modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    /// When the entry was created.
    pub ts: Timestamp,
    /// Operation hash (absent on recent servers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    /// Protocol version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<i64>,
    /// Operation code: `c`, `i`, `u`, `d`, `n`.
    pub op: String,
    /// Namespace the operation applies to.
    pub ns: String,
    /// The operation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o: Option<Document>,
    /// Selector for updates (`{_id: ...}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
}

/// A namespace parsed into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    /// Parses `"db.collection"`, erroring when no `.` separator exists.
    pub fn parse(ns: &str) -> Result<Self, TailError> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                database: db.to_string(),
                collection: coll.to_string(),
            }),
            _ => Err(TailError::NamespaceParse {
                namespace: ns.to_string(),
            }),
        }
    }

    /// The joined `"db.collection"` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Combines filters; an op passes only when every filter accepts it.
#[must_use]
pub fn chain_filters(filters: Vec<OpFilter>) -> OpFilter {
    Arc::new(move |op| filters.iter().all(|f| f(op)))
}

/// Packs a timestamp into its `(seconds << 32) | ordinal` form.
#[must_use]
pub fn timestamp_to_u64(ts: Timestamp) -> u64 {
    (u64::from(ts.time) << 32) | u64::from(ts.increment)
}

/// Unpacks a `(seconds << 32) | ordinal` value.
#[must_use]
pub fn timestamp_from_u64(value: u64) -> Timestamp {
    Timestamp {
        time: (value >> 32) as u32,
        increment: (value & 0xffff_ffff) as u32,
    }
}
