use std::path::Path;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document, Timestamp};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{ApplyError, Result};
use crate::oplog::{split_namespace, OpTime, OpType};
use crate::storage::{document_id_key, CollectionProperties, OpCtx, StorageInterface};

const MIN_VALID_KEY: &str = "min_valid";
const APPLIED_THROUGH_KEY: &str = "applied_through";
const DELETE_FROM_POINT_KEY: &str = "oplog_delete_from_point";
const GLOBAL_TIMESTAMP_KEY: &str = "global_timestamp";

fn map_sqlx(e: sqlx::Error) -> ApplyError {
    let message = e.to_string();
    // SQLITE_BUSY surfaces as a lock failure; the dispatcher's retry loop
    // handles it the same way as any other write conflict.
    if message.contains("database is locked") || message.contains("database table is locked") {
        ApplyError::WriteConflict
    } else {
        ApplyError::Storage(message)
    }
}

fn encode_doc(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)
        .map_err(|e| ApplyError::Storage(format!("cannot encode document: {e}")))?;
    Ok(buf)
}

fn decode_doc(bytes: &[u8]) -> Result<Document> {
    Document::from_reader(bytes)
        .map_err(|e| ApplyError::Storage(format!("cannot decode document: {e}")))
}

fn encode_op_time(op_time: OpTime) -> String {
    format!(
        "{}:{}:{}",
        op_time.timestamp.time, op_time.timestamp.increment, op_time.term
    )
}

fn decode_op_time(value: &str) -> OpTime {
    let mut parts = value.splitn(3, ':');
    let time = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let increment = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let term = parts.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
    OpTime::new(Timestamp { time, increment }, term)
}

/// Reference [`StorageInterface`] backed by a single SQLite file: document
/// rows keyed by `(ns, _id)`, a collection catalog, the local oplog, and a
/// key/value table for the replication progress markers.
pub struct SqliteStorage {
    pool: SqlitePool,
    oplog_max_size: usize,
}

impl SqliteStorage {
    pub async fn open(path: &Path) -> Result<Self> {
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&connection_string)
            .await
            .map_err(map_sqlx)?;

        let storage = Self {
            pool,
            oplog_max_size: 1 << 30,
        };
        storage.init().await?;
        info!("opened sqlite storage at {}", path.display());
        Ok(storage)
    }

    async fn init(&self) -> Result<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            "CREATE TABLE IF NOT EXISTS databases (name TEXT PRIMARY KEY)",
            "CREATE TABLE IF NOT EXISTS collections (
                ns TEXT PRIMARY KEY,
                capped INTEGER NOT NULL DEFAULT 0,
                collation TEXT
            )",
            "CREATE TABLE IF NOT EXISTS docs (
                ns TEXT NOT NULL,
                id TEXT NOT NULL,
                doc BLOB NOT NULL,
                PRIMARY KEY (ns, id)
            )",
            "CREATE TABLE IF NOT EXISTS oplog (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_time INTEGER NOT NULL,
                ts_inc INTEGER NOT NULL,
                raw BLOB NOT NULL
            )",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    pub async fn oplog_entry_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM oplog")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    pub async fn get_doc(&self, ns: &str, id: &Bson) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT doc FROM docs WHERE ns = ? AND id = ?")
            .bind(ns)
            .bind(document_id_key(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("doc");
                Ok(Some(decode_doc(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub async fn doc_count(&self, ns: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM docs WHERE ns = ?")
            .bind(ns)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn upsert_doc(&self, ns: &str, id: &Bson, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO docs (ns, id, doc) VALUES (?, ?, ?)
             ON CONFLICT(ns, id) DO UPDATE SET doc = excluded.doc",
        )
        .bind(ns)
        .bind(document_id_key(id))
        .bind(encode_doc(doc)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_one(&self, ns: &str, doc: &Document) -> Result<()> {
        let id = doc
            .get("_id")
            .ok_or_else(|| ApplyError::Storage("document missing _id".to_string()))?;
        self.upsert_doc(ns, id, doc).await
    }
}

#[async_trait]
impl StorageInterface for SqliteStorage {
    async fn insert_documents(&self, _ctx: &OpCtx, ns: &str, docs: &[&Document]) -> Result<()> {
        let (db, coll) = split_namespace(ns);
        let is_oplog = db == "local" && coll.starts_with("oplog");

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for doc in docs {
            if is_oplog {
                let ts = doc.get_timestamp("ts").unwrap_or(Timestamp {
                    time: 0,
                    increment: 0,
                });
                sqlx::query("INSERT INTO oplog (ts_time, ts_inc, raw) VALUES (?, ?, ?)")
                    .bind(ts.time as i64)
                    .bind(ts.increment as i64)
                    .bind(encode_doc(doc)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            } else {
                let id = doc
                    .get("_id")
                    .ok_or_else(|| ApplyError::Storage("document missing _id".to_string()))?;
                sqlx::query(
                    "INSERT INTO docs (ns, id, doc) VALUES (?, ?, ?)
                     ON CONFLICT(ns, id) DO UPDATE SET doc = excluded.doc",
                )
                .bind(ns)
                .bind(document_id_key(id))
                .bind(encode_doc(doc)?)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_document(&self, _ctx: &OpCtx, ns: &str, doc: &Document) -> Result<()> {
        self.insert_one(ns, doc).await
    }

    async fn set_oplog_delete_from_point(&self, ts: Timestamp) -> Result<()> {
        self.set_meta(
            DELETE_FROM_POINT_KEY,
            &format!("{}:{}", ts.time, ts.increment),
        )
        .await
    }

    async fn set_min_valid_to_at_least(&self, op_time: OpTime) -> Result<()> {
        let current = self.get_min_valid().await?;
        if op_time > current {
            self.set_meta(MIN_VALID_KEY, &encode_op_time(op_time)).await?;
        }
        Ok(())
    }

    async fn get_min_valid(&self) -> Result<OpTime> {
        Ok(self
            .get_meta(MIN_VALID_KEY)
            .await?
            .map(|value| decode_op_time(&value))
            .unwrap_or(OpTime::NULL))
    }

    async fn set_applied_through(&self, op_time: OpTime) -> Result<()> {
        self.set_meta(APPLIED_THROUGH_KEY, &encode_op_time(op_time))
            .await
    }

    async fn set_global_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.set_meta(
            GLOBAL_TIMESTAMP_KEY,
            &format!("{}:{}", ts.time, ts.increment),
        )
        .await
    }

    async fn get_oplog_max_size(&self, _ns: &str) -> Result<usize> {
        Ok(self.oplog_max_size)
    }

    async fn get_collection_properties(&self, ns: &str) -> Result<Option<CollectionProperties>> {
        let row = sqlx::query("SELECT capped, collation FROM collections WHERE ns = ?")
            .bind(ns)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|row| CollectionProperties {
            is_capped: row.get::<i64, _>("capped") != 0,
            collation: row.get("collation"),
        }))
    }

    async fn database_exists(&self, db: &str) -> Result<bool> {
        let row = sqlx::query("SELECT name FROM databases WHERE name = ?")
            .bind(db)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO databases (name) VALUES (?)")
            .bind(db)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn collection_exists(&self, ns: &str) -> Result<bool> {
        Ok(self.get_collection_properties(ns).await?.is_some())
    }

    async fn create_collection(&self, ns: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (ns) VALUES (?)")
            .bind(ns)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn apply_operation(
        &self,
        _ctx: &OpCtx,
        op: &Document,
        convert_update_to_upsert: bool,
    ) -> Result<()> {
        let ns = op.get_str("ns").unwrap_or("");
        let op_type = OpType::parse(op.get_str("op").unwrap_or(""));

        match op_type {
            OpType::Insert => match op.get("o") {
                Some(Bson::Array(docs)) => {
                    let mut owned = Vec::with_capacity(docs.len());
                    for doc in docs {
                        owned.push(doc.as_document().cloned().ok_or_else(|| {
                            ApplyError::Storage(
                                "grouped insert entry is not a document".to_string(),
                            )
                        })?);
                    }
                    let refs: Vec<&Document> = owned.iter().collect();
                    self.insert_documents(_ctx, ns, &refs).await
                }
                Some(Bson::Document(doc)) => self.insert_one(ns, doc).await,
                _ => Err(ApplyError::Storage("insert without o document".to_string())),
            },
            OpType::Update => {
                if !self.collection_exists(ns).await? {
                    return Err(ApplyError::NamespaceNotFound(ns.to_string()));
                }
                let id = op
                    .get_document("o2")
                    .ok()
                    .and_then(|o2| o2.get("_id").cloned())
                    .ok_or_else(|| ApplyError::Storage("update without o2._id".to_string()))?;
                let o = op
                    .get_document("o")
                    .map_err(|_| ApplyError::Storage("update without o".to_string()))?;

                let existing = self.get_doc(ns, &id).await?;
                if existing.is_none() && !convert_update_to_upsert {
                    return Err(ApplyError::Storage(format!(
                        "update target document missing in {ns}"
                    )));
                }
                let mut replacement = o.clone();
                if !replacement.contains_key("_id") {
                    replacement.insert("_id", id.clone());
                }
                self.upsert_doc(ns, &id, &replacement).await
            }
            OpType::Delete => {
                if !self.collection_exists(ns).await? {
                    return Err(ApplyError::NamespaceNotFound(ns.to_string()));
                }
                let id = op
                    .get_document("o")
                    .ok()
                    .and_then(|o| o.get("_id").cloned())
                    .ok_or_else(|| ApplyError::Storage("delete without _id".to_string()))?;
                sqlx::query("DELETE FROM docs WHERE ns = ? AND id = ?")
                    .bind(ns)
                    .bind(document_id_key(&id))
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
                Ok(())
            }
            OpType::Noop => Ok(()),
            _ => Err(ApplyError::BadValue(format!(
                "bad op in apply_operation: {op:?}"
            ))),
        }
    }

    async fn apply_command(&self, _ctx: &OpCtx, op: &Document) -> Result<()> {
        let ns = op.get_str("ns").unwrap_or("");
        let (db, _) = split_namespace(ns);
        let command = op
            .get_document("o")
            .map_err(|_| ApplyError::BadValue("command entry without o document".to_string()))?;

        if let Ok(name) = command.get_str("create") {
            return self.create_collection(&format!("{db}.{name}")).await;
        }
        if let Ok(name) = command.get_str("drop") {
            let full = format!("{db}.{name}");
            sqlx::query("DELETE FROM collections WHERE ns = ?")
                .bind(&full)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            sqlx::query("DELETE FROM docs WHERE ns = ?")
                .bind(&full)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            return Ok(());
        }
        Err(ApplyError::BadValue(format!(
            "unsupported command: {command:?}"
        )))
    }

    async fn wait_until_durable(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        debug!("sqlite checkpoint complete");
        Ok(())
    }
}
