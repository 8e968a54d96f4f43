pub mod sqlite;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document, Timestamp};

use crate::error::Result;
use crate::oplog::OpTime;

/// Key under which a document is stored; numeric ids collapse to one
/// representation so equal ids of different BSON widths match.
pub fn document_id_key(id: &Bson) -> String {
    match id {
        Bson::Int32(v) => format!("n:{v}"),
        Bson::Int64(v) => format!("n:{v}"),
        Bson::Double(v) if v.fract() == 0.0 => format!("n:{}", *v as i64),
        other => format!("{other:?}"),
    }
}

/// Per-operation context flags handed to the storage layer.
///
/// Replication re-applies writes that were already validated and logged on
/// the primary, so apply paths run with replicated writes and document
/// validation turned off.
#[derive(Debug, Clone)]
pub struct OpCtx {
    pub batch_writer: bool,
    pub replicated_writes: bool,
    pub document_validation: bool,
}

impl Default for OpCtx {
    fn default() -> Self {
        Self {
            batch_writer: false,
            replicated_writes: true,
            document_validation: true,
        }
    }
}

impl OpCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for the oplog write-out tasks.
    pub fn batch_writer() -> Self {
        Self {
            batch_writer: true,
            replicated_writes: false,
            document_validation: true,
        }
    }

    /// Context for the apply worker tasks.
    pub fn batch_apply() -> Self {
        Self {
            batch_writer: true,
            replicated_writes: false,
            document_validation: false,
        }
    }
}

/// Properties of a collection that decide how its ops may be partitioned.
#[derive(Debug, Clone, Default)]
pub struct CollectionProperties {
    pub is_capped: bool,
    /// Name of a non-simple default collation, when one is set. Id hashing
    /// is not collation-aware, so any value here restricts parallelism.
    pub collation: Option<String>,
}

/// Capability set of the storage engine, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct EngineCapabilities {
    /// Per-document concurrency; safe for id-hashed parallel apply and for
    /// out-of-order oplog inserts.
    pub supports_doc_locking: bool,
    /// Engine journals writes; enables the durable progress marker.
    pub is_durable: bool,
    /// Legacy engines want a page-prefetch pass before each batch.
    pub needs_prefetch: bool,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            supports_doc_locking: true,
            is_durable: true,
            needs_prefetch: false,
        }
    }
}

/// Storage surface consumed by the apply pipeline. Implementations must
/// treat `create_database` / `create_collection` as idempotent.
#[async_trait]
pub trait StorageInterface: Send + Sync {
    /// Bulk-insert raw documents into `ns`, preserving slice order.
    async fn insert_documents(&self, ctx: &OpCtx, ns: &str, docs: &[&Document]) -> Result<()>;

    async fn insert_document(&self, ctx: &OpCtx, ns: &str, doc: &Document) -> Result<()>;

    /// Crash-recovery hint: oplog entries at or after `ts` may be partial.
    /// A null timestamp clears the marker.
    async fn set_oplog_delete_from_point(&self, ts: Timestamp) -> Result<()>;

    async fn set_min_valid_to_at_least(&self, op_time: OpTime) -> Result<()>;

    async fn get_min_valid(&self) -> Result<OpTime>;

    async fn set_applied_through(&self, op_time: OpTime) -> Result<()>;

    async fn set_global_timestamp(&self, ts: Timestamp) -> Result<()>;

    async fn get_oplog_max_size(&self, ns: &str) -> Result<usize>;

    /// None when the collection does not exist.
    async fn get_collection_properties(&self, ns: &str) -> Result<Option<CollectionProperties>>;

    async fn database_exists(&self, db: &str) -> Result<bool>;

    async fn create_database(&self, db: &str) -> Result<()>;

    async fn collection_exists(&self, ns: &str) -> Result<bool>;

    async fn create_collection(&self, ns: &str) -> Result<()>;

    /// Apply one CRUD or noop oplog entry. Grouped inserts arrive with an
    /// array in the `o` field.
    async fn apply_operation(
        &self,
        ctx: &OpCtx,
        op: &Document,
        convert_update_to_upsert: bool,
    ) -> Result<()>;

    /// Apply one command entry. Must not create databases implicitly.
    async fn apply_command(&self, ctx: &OpCtx, op: &Document) -> Result<()>;

    /// Block until the journal has flushed everything applied so far.
    async fn wait_until_durable(&self) -> Result<()>;

    /// Warm pages for one op ahead of apply. Only called on engines that
    /// report `needs_prefetch`.
    async fn prefetch(&self, _ns: &str, _op: &Document) -> Result<()> {
        Ok(())
    }
}
