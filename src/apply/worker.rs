use std::sync::Arc;

use mongodb::bson::{Bson, Document};
use tracing::error;

use crate::applier::Applier;
use crate::error::Result;
use crate::oplog::entry::doc_byte_size;
use crate::oplog::{OpQueue, OplogEntry, OpType};
use crate::storage::OpCtx;

/// Upper bound on the number of inserts coalesced into one grouped insert,
/// including the leader.
const INSERT_GROUP_MAX_OPS: usize = 64;

/// Build one grouped-insert entry from a run of inserts: every top-level
/// field of the leader except `o`, with `o` replaced by the array of each
/// op's `o`.
fn build_grouped_insert(entries: &[OplogEntry], group: &[usize]) -> Document {
    let leader = &entries[group[0]];
    let mut grouped = Document::new();
    for (key, value) in leader.raw.iter() {
        if key != "o" {
            grouped.insert(key.clone(), value.clone());
        }
    }
    grouped.insert(
        "o",
        Bson::Array(
            group
                .iter()
                .map(|&index| Bson::Document(entries[index].o.clone()))
                .collect(),
        ),
    );
    grouped
}

/// Steady-state per-slot apply: stable-sort by namespace, coalesce adjacent
/// same-namespace inserts into grouped inserts, fall back to one-by-one
/// apply when a group fails, and abort the batch on any op error.
pub async fn apply_worker_slot(
    applier: Arc<Applier>,
    batch: Arc<OpQueue>,
    mut slot: Vec<usize>,
) -> Result<()> {
    let ctx = OpCtx::batch_apply();
    let entries = batch.entries();

    if slot.len() > 1 {
        // Stable: relative order within a namespace is load-bearing.
        slot.sort_by(|&a, &b| entries[a].ns.cmp(&entries[b].ns));
    }

    let convert_updates_to_upserts = true;
    let max_group_bytes = applier.config().insert_vector_max_bytes;

    // Cursor that forbids grouping before it, so a failed group is not
    // retried quadratically while its members are applied one by one.
    let mut do_not_group_before = 0usize;

    let mut position = 0usize;
    while position < slot.len() {
        let entry = &entries[slot[position]];

        if entry.op_type == OpType::Insert
            && !entry.is_for_capped_collection()
            && position >= do_not_group_before
        {
            // Scan forward for groupable inserts: same namespace, within
            // the payload budget and the group size cap.
            let mut group_end = position + 1;
            let mut payload_bytes = 0usize;
            while group_end < slot.len() && (group_end - position) < INSERT_GROUP_MAX_OPS {
                let next = &entries[slot[group_end]];
                if next.op_type != OpType::Insert || next.ns != entry.ns {
                    break;
                }
                payload_bytes += doc_byte_size(&next.o);
                if payload_bytes > max_group_bytes {
                    break;
                }
                group_end += 1;
            }

            if group_end - position >= 2 {
                let grouped = build_grouped_insert(entries, &slot[position..group_end]);
                match applier
                    .sync_apply(&ctx, &grouped, convert_updates_to_upserts)
                    .await
                {
                    Ok(()) => {
                        position = group_end;
                        continue;
                    }
                    Err(e) => {
                        error!(
                            "error applying inserts in bulk: {e}; trying first insert as a lone insert"
                        );
                        do_not_group_before = group_end;
                    }
                }
            }
        }

        if let Err(e) = applier
            .sync_apply(&ctx, &entry.raw, convert_updates_to_upserts)
            .await
        {
            error!("error applying operation ({:?}): {e}", entry.raw);
            return Err(e);
        }
        position += 1;
    }

    Ok(())
}

/// Initial-sync per-slot apply: no grouping; a failed op triggers a
/// missing-document fetch from the sync source and one re-apply, and a
/// closed set of benign errors is tolerated on CRUD ops.
pub async fn apply_worker_slot_initial_sync(
    applier: Arc<Applier>,
    batch: Arc<OpQueue>,
    slot: Vec<usize>,
) -> Result<()> {
    let ctx = OpCtx::batch_apply();
    let convert_updates_to_upserts = false;

    for &index in &slot {
        let entry = &batch.entries()[index];
        match applier
            .sync_apply(&ctx, &entry.raw, convert_updates_to_upserts)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_benign_for_initial_sync() && entry.is_crud() => {
                // The owning namespace will be cloned or dropped before
                // initial sync completes.
                continue;
            }
            Err(_) => {
                if applier.should_retry(&ctx, entry).await? {
                    if let Err(e) = applier
                        .sync_apply(&ctx, &entry.raw, convert_updates_to_upserts)
                        .await
                    {
                        error!("error applying operation ({:?}): {e}", entry.raw);
                        return Err(e);
                    }
                }
                // A document that is missing on the source as well was
                // presumably deleted later in the oplog; skip the op.
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, Timestamp};

    use super::*;
    use crate::testing::{test_applier, ApplyCallKind, MemStorage, ScriptedReaderFactory};

    fn raw_insert(ns: &str, id: i32, payload: &str) -> Document {
        doc! {
            "ts": Timestamp { time: id as u32 + 1, increment: 0 },
            "t": 1_i64,
            "v": 2_i64,
            "op": "i",
            "ns": ns,
            "o": { "_id": id, "x": payload },
        }
    }

    fn insert_batch(ns: &str, n: i32) -> Arc<OpQueue> {
        let mut batch = OpQueue::new();
        for id in 0..n {
            batch.push(raw_insert(ns, id, &"p".repeat(90)));
        }
        Arc::new(batch)
    }

    #[tokio::test]
    async fn adjacent_inserts_apply_as_one_group() {
        let storage = Arc::new(MemStorage::new());
        let applier = test_applier(Arc::clone(&storage));
        let batch = insert_batch("db.c", 10);

        apply_worker_slot(applier, Arc::clone(&batch), (0..10).collect())
            .await
            .unwrap();

        let calls = storage.apply_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, ApplyCallKind::GroupedInsert(10));
        assert_eq!(storage.doc_count("db.c"), 10);
    }

    #[tokio::test]
    async fn group_failure_falls_back_to_single_ops() {
        let storage = Arc::new(MemStorage::new());
        storage.fail_grouped_inserts(true);
        let applier = test_applier(Arc::clone(&storage));
        let batch = insert_batch("db.c", 10);

        apply_worker_slot(applier, Arc::clone(&batch), (0..10).collect())
            .await
            .unwrap();

        let calls = storage.apply_calls();
        // One failed grouped attempt, then every op alone; no further
        // grouping inside the failed window.
        assert_eq!(calls.len(), 11);
        assert_eq!(calls[0].kind, ApplyCallKind::GroupedInsert(10));
        for call in &calls[1..] {
            assert_eq!(call.kind, ApplyCallKind::Single);
        }
        assert_eq!(storage.doc_count("db.c"), 10);
    }

    #[tokio::test]
    async fn group_respects_byte_budget() {
        let storage = Arc::new(MemStorage::new());
        // ~100-byte payloads against a 300-byte budget split the run.
        let mut config = crate::config::ApplierConfig::default();
        config.insert_vector_max_bytes = 300;
        let applier = crate::testing::test_applier_with(
            Arc::clone(&storage),
            config,
            ScriptedReaderFactory::empty(),
        );
        let batch = insert_batch("db.c", 8);

        apply_worker_slot(applier, Arc::clone(&batch), (0..8).collect())
            .await
            .unwrap();

        let calls = storage.apply_calls();
        assert!(calls.len() > 1);
        for call in &calls {
            if let ApplyCallKind::GroupedInsert(n) = call.kind {
                assert!(n <= 4);
            }
        }
        assert_eq!(storage.doc_count("db.c"), 8);
    }

    #[tokio::test]
    async fn capped_collection_inserts_are_never_grouped() {
        let storage = Arc::new(MemStorage::new());
        let applier = test_applier(Arc::clone(&storage));
        let batch = insert_batch("db.cap", 5);
        for entry in batch.entries() {
            entry.mark_for_capped_collection();
        }

        apply_worker_slot(applier, Arc::clone(&batch), (0..5).collect())
            .await
            .unwrap();

        let calls = storage.apply_calls();
        assert_eq!(calls.len(), 5);
        assert!(calls.iter().all(|c| c.kind == ApplyCallKind::Single));
    }

    #[tokio::test]
    async fn mixed_namespaces_stable_sort_preserves_source_order() {
        let storage = Arc::new(MemStorage::new());
        storage.create_namespace("db.a");
        storage.create_namespace("db.b");
        let applier = test_applier(Arc::clone(&storage));

        let mut batch = OpQueue::new();
        batch.push(doc! {
            "ts": Timestamp { time: 1, increment: 0 }, "v": 2_i64,
            "op": "d", "ns": "db.b", "o": { "_id": 1 },
        });
        batch.push(doc! {
            "ts": Timestamp { time: 2, increment: 0 }, "v": 2_i64,
            "op": "d", "ns": "db.a", "o": { "_id": 2 },
        });
        batch.push(doc! {
            "ts": Timestamp { time: 3, increment: 0 }, "v": 2_i64,
            "op": "d", "ns": "db.b", "o": { "_id": 3 },
        });
        let batch = Arc::new(batch);

        apply_worker_slot(applier, Arc::clone(&batch), vec![0, 1, 2])
            .await
            .unwrap();

        let order: Vec<String> = storage
            .apply_calls()
            .iter()
            .map(|c| c.ns.clone())
            .collect();
        // db.a first after the sort; db.b ops keep their source order.
        assert_eq!(order, vec!["db.a", "db.b", "db.b"]);
        let ids: Vec<i64> = storage.deleted_ids("db.b");
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn initial_sync_fetches_missing_documents() {
        let storage = Arc::new(MemStorage::new());
        storage.create_namespace("db.c");
        let readers = ScriptedReaderFactory::found(doc! { "_id": 7, "x": "source" });
        let applier = crate::testing::test_applier_with(
            Arc::clone(&storage),
            crate::config::ApplierConfig::default(),
            readers,
        );

        let mut batch = OpQueue::new();
        batch.push(doc! {
            "ts": Timestamp { time: 5, increment: 0 }, "v": 2_i64,
            "op": "u", "ns": "db.c",
            "o2": { "_id": 7 },
            "o": { "_id": 7, "x": "updated" },
        });
        let batch = Arc::new(batch);

        apply_worker_slot_initial_sync(applier, Arc::clone(&batch), vec![0])
            .await
            .unwrap();

        let doc = storage.get_doc("db.c", &Bson::Int32(7)).unwrap();
        assert_eq!(doc.get_str("x").unwrap(), "updated");
    }

    #[tokio::test]
    async fn initial_sync_tolerates_crud_on_missing_namespaces() {
        let storage = Arc::new(MemStorage::new());
        // No namespaces exist; the owning collections would be cloned or
        // dropped before initial sync completes. Any reader use would fail
        // the empty scripted factory, so a fetch attempt fails the test.
        let applier = test_applier(Arc::clone(&storage));

        let mut batch = OpQueue::new();
        batch.push(doc! {
            "ts": Timestamp { time: 1, increment: 0 }, "v": 2_i64,
            "op": "u", "ns": "db.gone",
            "o2": { "_id": 1 },
            "o": { "_id": 1, "x": "v" },
        });
        batch.push(doc! {
            "ts": Timestamp { time: 2, increment: 0 }, "v": 2_i64,
            "op": "d", "ns": "db.gone2",
            "o": { "_id": 2 },
        });
        let batch = Arc::new(batch);

        apply_worker_slot_initial_sync(applier, Arc::clone(&batch), vec![0, 1])
            .await
            .unwrap();

        // Both ops reached the apply path and were skipped as benign.
        assert_eq!(storage.apply_calls().len(), 2);
        assert_eq!(storage.doc_count("db.gone"), 0);
        assert_eq!(storage.doc_count("db.gone2"), 0);
    }

    #[tokio::test]
    async fn initial_sync_tolerates_index_builds_over_parallel_arrays() {
        let storage = Arc::new(MemStorage::new());
        storage.fail_index_builds_with_parallel_arrays(true);
        let applier = test_applier(Arc::clone(&storage));

        let mut batch = OpQueue::new();
        batch.push(doc! {
            "ts": Timestamp { time: 1, increment: 0 }, "v": 2_i64,
            "op": "i", "ns": "db.system.indexes",
            "o": { "_id": 1, "ns": "db.c", "key": { "a": 1, "b": 1 }, "name": "a_1_b_1" },
        });
        let batch = Arc::new(batch);

        apply_worker_slot_initial_sync(applier, Arc::clone(&batch), vec![0])
            .await
            .unwrap();
        assert_eq!(storage.doc_count("db.system.indexes"), 0);
    }

    #[tokio::test]
    async fn initial_sync_skips_ops_missing_on_the_source_too() {
        let storage = Arc::new(MemStorage::new());
        storage.create_namespace("db.c");
        let readers = ScriptedReaderFactory::not_found();
        let applier = crate::testing::test_applier_with(
            Arc::clone(&storage),
            crate::config::ApplierConfig::default(),
            readers,
        );

        let mut batch = OpQueue::new();
        batch.push(doc! {
            "ts": Timestamp { time: 5, increment: 0 }, "v": 2_i64,
            "op": "u", "ns": "db.c",
            "o2": { "_id": 7 },
            "o": { "_id": 7, "x": "updated" },
        });
        let batch = Arc::new(batch);

        apply_worker_slot_initial_sync(applier, Arc::clone(&batch), vec![0])
            .await
            .unwrap();
        assert!(storage.get_doc("db.c", &Bson::Int32(7)).is_none());
    }
}
