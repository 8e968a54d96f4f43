use std::sync::Arc;

use mongodb::bson::Document;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::oplog::OpQueue;
use crate::storage::{EngineCapabilities, OpCtx, StorageInterface};

/// Below this many ops per worker, parallel oplog writes don't amortize
/// their per-task overhead.
const MIN_OPLOG_ENTRIES_PER_WORKER: usize = 16;

/// Schedule bulk inserts of the batch's raw entries into the local oplog.
///
/// The batch is split across workers only when it is large enough and the
/// engine supports document-level locking; other engines require oplog
/// entries to arrive in insertion order, so they get a single task.
pub fn schedule_writes_to_oplog(
    batch: &Arc<OpQueue>,
    storage: &Arc<dyn StorageInterface>,
    engine: EngineCapabilities,
    pool_size: usize,
    oplog_ns: &str,
    tasks: &mut JoinSet<Result<()>>,
) {
    let total = batch.count();
    let enough_to_multi_thread = total >= MIN_OPLOG_ENTRIES_PER_WORKER * pool_size;

    let ranges: Vec<(usize, usize)> = if !enough_to_multi_thread || !engine.supports_doc_locking {
        vec![(0, total)]
    } else {
        let per_worker = total / pool_size;
        (0..pool_size)
            .map(|worker| {
                let begin = worker * per_worker;
                let end = if worker == pool_size - 1 {
                    total
                } else {
                    begin + per_worker
                };
                (begin, end)
            })
            .collect()
    };

    for (begin, end) in ranges {
        let batch = Arc::clone(batch);
        let storage = Arc::clone(storage);
        let ns = oplog_ns.to_string();
        tasks.spawn(async move {
            let ctx = OpCtx::batch_writer();
            // Borrow the raw documents straight out of the batch; the batch
            // outlives every scheduled task.
            let docs: Vec<&Document> = batch.entries()[begin..end]
                .iter()
                .map(|entry| &entry.raw)
                .collect();
            storage.insert_documents(&ctx, &ns, &docs).await
        });
    }
}
