use std::time::Duration;

use mongodb::bson::Document;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::apply::locks::{LockManager, LockMode};
use crate::error::{ApplyError, Result};
use crate::metrics::ApplyMetrics;
use crate::oplog::{is_system_indexes, split_namespace, OpType};
use crate::storage::{OpCtx, StorageInterface};

async fn write_conflict_backoff(op_name: &str, ns: &str, attempts: u32) {
    debug!("write conflict in {op_name} on {ns}, attempt {attempts}; retrying");
    sleep(Duration::from_millis(attempts.min(10) as u64)).await;
    tokio::task::yield_now().await;
}

/// Apply one oplog entry under the lock scope its kind requires.
///
/// Commands take the global write lock; noops and index builds take the
/// database exclusively; CRUD ops take intent locks, escalating to
/// exclusive when the database or collection must be created first. Every
/// scoped block re-runs from scratch on a write conflict, with all locks
/// released in between.
pub async fn sync_apply(
    storage: &dyn StorageInterface,
    locks: &LockManager,
    metrics: &ApplyMetrics,
    ctx: &OpCtx,
    op: &Document,
    convert_update_to_upsert: bool,
) -> Result<()> {
    let ns = op.get_str("ns").unwrap_or("");
    let op_type = OpType::parse(op.get_str("op").unwrap_or(""));
    let is_noop = op_type == OpType::Noop;

    if ns.is_empty() || ns.starts_with('.') {
        // Usually a no-op; either way there is nothing useful to apply.
        if !is_noop {
            error!("skipping bad op in oplog: {op:?}");
        }
        return Ok(());
    }

    let mut apply_ctx = ctx.clone();
    apply_ctx.replicated_writes = false;
    apply_ctx.document_validation = false;

    if op_type == OpType::Command {
        let mut attempts = 0;
        loop {
            // A command may need the global write lock, so conservatively
            // grab it here. Suboptimal.
            let _global = locks.lock_global_exclusive().await;

            // Commands use their own apply path so a missing database is
            // never created implicitly.
            let result = storage.apply_command(&apply_ctx, op).await;
            match result {
                Err(e) if e.is_write_conflict() => {
                    drop(_global);
                    attempts += 1;
                    write_conflict_backoff("apply_command", ns, attempts).await;
                }
                result => {
                    metrics.inc_ops_applied(1);
                    return result;
                }
            }
        }
    }

    let (db_name, _) = split_namespace(ns);

    if is_noop || (op_type == OpType::Insert && is_system_indexes(ns)) {
        let mut attempts = 0;
        loop {
            let _db = locks.lock_db(db_name, LockMode::Exclusive).await;
            if !storage.database_exists(db_name).await? {
                storage.create_database(db_name).await?;
            }

            match storage
                .apply_operation(&apply_ctx, op, convert_update_to_upsert)
                .await
            {
                Err(e) if e.is_write_conflict() => {
                    drop(_db);
                    attempts += 1;
                    write_conflict_backoff("apply_index_or_noop", ns, attempts).await;
                }
                result => {
                    if result.is_ok() {
                        metrics.inc_ops_applied(1);
                    }
                    return result;
                }
            }
        }
    }

    if op_type.is_crud() {
        let mut attempts = 0;
        loop {
            // Intent locks for the common case; escalate to exclusive when
            // the database or collection has to be created first.
            let escalate = !storage.database_exists(db_name).await?
                || !storage.collection_exists(ns).await?;
            let mode = if escalate {
                LockMode::Exclusive
            } else {
                LockMode::Intent
            };
            let _lock = locks.lock_collection(ns, mode).await;
            if escalate {
                storage.create_database(db_name).await?;
                // Only inserts create the target collection implicitly;
                // updates and deletes against a missing collection surface
                // NamespaceNotFound from the apply path.
                if op_type == OpType::Insert {
                    storage.create_collection(ns).await?;
                }
            }

            match storage
                .apply_operation(&apply_ctx, op, convert_update_to_upsert)
                .await
            {
                Err(e) if e.is_write_conflict() => {
                    drop(_lock);
                    attempts += 1;
                    write_conflict_backoff("apply_crud", ns, attempts).await;
                }
                result => {
                    if result.is_ok() {
                        metrics.inc_ops_applied(1);
                    }
                    return result;
                }
            }
        }
    }

    let message = format!("bad op type in oplog entry: {op:?}");
    error!("{message}");
    Err(ApplyError::BadValue(message))
}
