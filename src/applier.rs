use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Document, Timestamp};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::apply::batcher::OplogBatcher;
use crate::apply::dispatch;
use crate::apply::finalizer::BatchFinalizer;
use crate::apply::locks::{LockManager, LockMode};
use crate::apply::oplog_writer::schedule_writes_to_oplog;
use crate::apply::partitioner::fill_writer_vectors;
use crate::apply::worker::{apply_worker_slot, apply_worker_slot_initial_sync};
use crate::config::ApplierConfig;
use crate::coordinator::{MemberState, ReplicationCoordinator};
use crate::error::{fatal, ApplyError, Result};
use crate::failpoint::MISSING_DOC_FETCH_PAUSE;
use crate::metrics::ApplyMetrics;
use crate::oplog::{split_namespace, OpQueue, OpTime, OplogEntry, OpType};
use crate::source::{ReaderFactory, UpstreamQueue};
use crate::storage::{EngineCapabilities, OpCtx, StorageInterface};

const MISSING_DOC_FETCH_ATTEMPTS: u32 = 3;

/// Which per-slot worker the batches run through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Steady-state secondary: grouped inserts, updates become upserts.
    Secondary,
    /// Initial sync: no upsert conversion, missing documents are fetched
    /// from the sync source.
    InitialSync,
}

/// The oplog tailing and parallel apply engine of one secondary node.
///
/// Owns the batching, partitioning, parallel apply, and progress
/// publication for batches pulled from an upstream queue; the storage
/// engine and replication coordinator are external collaborators.
pub struct Applier {
    config: ApplierConfig,
    storage: Arc<dyn StorageInterface>,
    engine: EngineCapabilities,
    coordinator: Arc<dyn ReplicationCoordinator>,
    locks: Arc<LockManager>,
    metrics: Arc<ApplyMetrics>,
    readers: Arc<dyn ReaderFactory>,
    mode: ApplyMode,
}

impl Applier {
    pub fn new(
        config: ApplierConfig,
        storage: Arc<dyn StorageInterface>,
        engine: EngineCapabilities,
        coordinator: Arc<dyn ReplicationCoordinator>,
        readers: Arc<dyn ReaderFactory>,
        mode: ApplyMode,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            storage,
            engine,
            coordinator,
            locks: Arc::new(LockManager::new()),
            metrics: Arc::new(ApplyMetrics::new()),
            readers,
            mode,
        }))
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ApplyMetrics {
        &self.metrics
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Apply a single oplog entry under the lock scope its kind requires.
    pub async fn sync_apply(
        &self,
        ctx: &OpCtx,
        op: &Document,
        convert_update_to_upsert: bool,
    ) -> Result<()> {
        dispatch::sync_apply(
            self.storage.as_ref(),
            &self.locks,
            &self.metrics,
            ctx,
            op,
            convert_update_to_upsert,
        )
        .await
    }

    /// Apply one batch: write the raw entries to the local oplog and apply
    /// them through the writer slots, then return the last op-time.
    ///
    /// Worker failures surface here; the caller treats them as fatal.
    pub async fn multi_apply(self: &Arc<Self>, batch: OpQueue) -> Result<OpTime> {
        if batch.is_empty() {
            return Err(ApplyError::EmptyBatch);
        }

        let state = self.coordinator.get_member_state();
        if state.is_primary()
            && !self.coordinator.is_waiting_for_applier_to_drain()
            && !self.coordinator.is_catching_up()
        {
            error!("attempting to replicate ops while primary");
            return Err(ApplyError::CannotApplyOplogWhilePrimary);
        }

        let first_op_time = batch.front().expect("batch is non-empty").op_time()?;
        let last_op_time = batch.back().expect("batch is non-empty").op_time()?;
        let batch = Arc::new(batch);

        if self.engine.needs_prefetch {
            self.prefetch_ops(&batch).await;
        }

        debug!("replication batch size is {}", batch.count());

        // Stop all readers until we're done. This also keeps the storage
        // engine from truncating old oplog entries while we apply.
        let _batch_writer_mode = self.locks.enter_batch_apply().await;

        let pool_size = self.config.writer_thread_count;
        let mut oplog_writers = JoinSet::new();

        self.storage
            .set_oplog_delete_from_point(first_op_time.timestamp)
            .await?;
        schedule_writes_to_oplog(
            &batch,
            &self.storage,
            self.engine,
            pool_size,
            &self.config.oplog_ns,
            &mut oplog_writers,
        );
        // Partitioning runs while the oplog writers are in flight.
        let writer_vectors =
            fill_writer_vectors(&batch, pool_size, self.engine, self.storage.as_ref()).await?;

        while let Some(joined) = oplog_writers.join_next().await {
            joined.map_err(|e| ApplyError::Storage(format!("oplog writer panicked: {e}")))??;
        }

        // All oplog entries for the batch are on disk; recovery no longer
        // needs to discard from the batch start.
        self.storage
            .set_oplog_delete_from_point(Timestamp {
                time: 0,
                increment: 0,
            })
            .await?;
        self.storage.set_min_valid_to_at_least(last_op_time).await?;

        let apply_started = Instant::now();
        let mut workers = JoinSet::new();
        for slot in writer_vectors {
            if slot.is_empty() {
                continue;
            }
            let applier = Arc::clone(self);
            let batch = Arc::clone(&batch);
            match self.mode {
                ApplyMode::Secondary => {
                    workers.spawn(apply_worker_slot(applier, batch, slot));
                }
                ApplyMode::InitialSync => {
                    workers.spawn(apply_worker_slot_initial_sync(applier, batch, slot));
                }
            }
        }

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| ApplyError::Storage(format!("apply worker panicked: {e}")))
                .and_then(|r| r);
            if result.is_err() && outcome.is_ok() {
                outcome = result;
            }
        }
        self.metrics.record_batch(apply_started.elapsed());
        outcome?;

        Ok(last_op_time)
    }

    async fn prefetch_ops(&self, batch: &Arc<OpQueue>) {
        let mut tasks = JoinSet::new();
        for index in 0..batch.count() {
            let storage = Arc::clone(&self.storage);
            let batch = Arc::clone(batch);
            tasks.spawn(async move {
                let entry = &batch.entries()[index];
                if entry.ns.is_empty() {
                    return;
                }
                if let Err(e) = storage.prefetch(&entry.ns, &entry.raw).await {
                    debug!("ignoring prefetch error: {e}");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Steady-state loop: pull batches from the assembler, validate, apply,
    /// and publish progress until the upstream queue shuts down.
    pub async fn run(self: Arc<Self>, upstream: Arc<dyn UpstreamQueue>) {
        let batcher = OplogBatcher::start(
            upstream,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.storage),
            &self.config,
        );
        let finalizer = BatchFinalizer::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.storage),
            self.engine,
        );
        info!("oplog applier started");

        loop {
            self.try_to_go_live().await;

            // Block up to a second so shutdown and state transitions are
            // observed even when no batch is ready.
            let batch = batcher.next_batch(Duration::from_secs(1)).await;
            if batch.is_empty() {
                if batch.must_shutdown() {
                    break;
                }
                continue;
            }

            if batch.front().expect("batch is non-empty").is_sentinel() {
                // The upstream queue has drained; there is nothing to apply.
                if batch.count() != 1 {
                    fatal("drained-sentinel batches must contain exactly one entry");
                }
                if self.coordinator.is_waiting_for_applier_to_drain() {
                    self.coordinator.signal_drain_complete();
                }
                continue;
            }

            let first_op_time = match batch.front().expect("batch is non-empty").op_time() {
                Ok(op_time) => op_time,
                Err(e) => fatal(&format!("cannot parse op-time from oplog entry: {e}")),
            };

            // The oplog must never go back in time or repeat an entry.
            let last_applied = self.coordinator.get_my_last_applied_op_time();
            if first_op_time <= last_applied {
                let err = ApplyError::OplogOutOfOrder(format!(
                    "attempted to apply an oplog entry ({first_op_time}) which is not greater \
                     than our last applied op-time ({last_applied})"
                ));
                fatal(&err.to_string());
            }

            // Don't let an fsync-and-lock observer see intermediate states
            // of batch application.
            let _fsync = self.locks.fsync_guard().await;

            let last_op_time = match self.multi_apply(batch).await {
                Ok(op_time) => op_time,
                Err(e) => fatal(&format!("failed to apply batch: {e}")),
            };

            if let Err(e) = self
                .storage
                .set_global_timestamp(last_op_time.timestamp)
                .await
            {
                fatal(&format!("failed to advance global timestamp: {e}"));
            }
            if let Err(e) = self.storage.set_applied_through(last_op_time).await {
                fatal(&format!("failed to persist applied-through marker: {e}"));
            }
            finalizer.record(last_op_time);
        }

        finalizer.shutdown().await;
        batcher.join().await;
        info!("oplog applier stopped");
    }

    /// Ask the coordinator to transition RECOVERING → SECONDARY once this
    /// node has caught up to minValid. Pure delegation; refusals are
    /// expected and logged at debug level.
    async fn try_to_go_live(&self) {
        let state = self.coordinator.get_member_state();
        if state.is_primary() || state.is_secondary() {
            return;
        }

        let _global = self.locks.lock_global_shared().await;

        if self.coordinator.in_maintenance_mode() {
            debug!("can't go live as maintenance mode is active");
            return;
        }
        if !self.coordinator.get_member_state().is_recovering() {
            debug!("can't go live as state is not recovering");
            return;
        }

        let min_valid = match self.storage.get_min_valid().await {
            Ok(min_valid) => min_valid,
            Err(e) => {
                warn!("failed to read min-valid marker: {e}");
                return;
            }
        };
        if self.coordinator.get_my_last_applied_op_time() < min_valid {
            return;
        }

        if !self.coordinator.set_follower_mode(MemberState::Secondary) {
            warn!(
                "failed to transition into secondary; current state: {:?}",
                self.coordinator.get_member_state()
            );
        }
    }

    /// Initial-sync recovery for a failed op: fetch the document it targets
    /// from the sync source and insert it locally. Returns false when the
    /// source no longer has the document either, in which case the op is
    /// skipped (it was presumably deleted later in the oplog).
    pub async fn should_retry(&self, ctx: &OpCtx, entry: &OplogEntry) -> Result<bool> {
        let (db_name, _) = split_namespace(&entry.ns);

        let mut attempts = 0;
        loop {
            // Preclude other modifications of the database while the
            // missing document is fetched and inserted.
            let _db_lock = self.locks.lock_db(db_name, LockMode::Exclusive).await;
            if !self.storage.database_exists(db_name).await? {
                self.storage.create_database(db_name).await?;
            }

            info!("adding missing document for op on {}", entry.ns);
            let missing = self.fetch_missing_doc(entry).await?;

            let Some(missing_doc) = missing else {
                info!("missing document not found on source; presumably deleted later in oplog");
                info!("o2: {:?}", entry.o2);
                info!("o first field: {:?}", entry.o.keys().next());
                return Ok(false);
            };

            if !self.storage.collection_exists(&entry.ns).await? {
                self.storage.create_collection(&entry.ns).await?;
            }
            match self.storage.insert_document(ctx, &entry.ns, &missing_doc).await {
                Ok(()) => {
                    debug!("inserted missing doc: {missing_doc:?}");
                    return Ok(true);
                }
                Err(e) if e.is_write_conflict() => {
                    drop(_db_lock);
                    attempts += 1;
                    debug!("write conflict inserting missing doc, attempt {attempts}; retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    return Err(ApplyError::Storage(format!(
                        "failed to insert missing doc: {e}"
                    )));
                }
            }
        }
    }

    /// Fetch the document a failed op targets from the configured sync
    /// source: up to three attempts with quadratic backoff, retrying only
    /// on network errors.
    async fn fetch_missing_doc(&self, entry: &OplogEntry) -> Result<Option<Document>> {
        let properties = self
            .storage
            .get_collection_properties(&entry.ns)
            .await?
            .unwrap_or_default();
        if properties.is_capped {
            // Rollover is expected on capped collections; a missing
            // document there is not recoverable and not an error.
            info!("missing doc is okay for capped collection ({})", entry.ns);
            return Ok(None);
        }

        if MISSING_DOC_FETCH_PAUSE.is_active() {
            info!("missing-document fetch paused by fail point; blocking until it is disabled");
            while MISSING_DOC_FETCH_PAUSE.is_active() {
                sleep(Duration::from_secs(1)).await;
            }
        }

        let id = match entry.op_type {
            OpType::Update => entry.o2.as_ref().and_then(|o2| o2.get("_id")),
            _ => entry.o.get("_id"),
        };
        let Some(id) = id.cloned() else {
            return Err(ApplyError::BadValue(format!(
                "cannot fetch missing document without _id field: {:?}",
                entry.raw
            )));
        };

        let host = &self.config.sync_source;
        for attempt in 1..=MISSING_DOC_FETCH_ATTEMPTS {
            if attempt != 1 {
                // Quadratic backoff gives the network a chance to recover.
                sleep(Duration::from_secs((attempt * attempt) as u64)).await;
            }

            let mut reader = self.readers.make_reader();
            match reader.connect(host).await {
                Ok(()) => {}
                Err(e) if e.is_network() => {
                    warn!(
                        "network problem connecting to sync source, attempt {attempt} of \
                         {MISSING_DOC_FETCH_ATTEMPTS}: {e}"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            match reader.find_one(&entry.ns, doc! { "_id": id.clone() }).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_network() => {
                    warn!(
                        "network problem fetching missing document, attempt {attempt} of \
                         {MISSING_DOC_FETCH_ATTEMPTS}: {e}"
                    );
                    continue;
                }
                Err(e) => {
                    error!("assertion fetching missing document: {e}");
                    return Err(e);
                }
            }
        }

        Err(ApplyError::SyncSourceExhausted {
            host: host.clone(),
            attempts: MISSING_DOC_FETCH_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::Timestamp;

    use super::*;
    use crate::testing::{
        test_applier_full, MemCoordinator, MemStorage, ScriptedReaderFactory,
    };

    fn op_time(time: u32) -> OpTime {
        OpTime::new(Timestamp { time, increment: 0 }, 1)
    }

    fn insert_batch(ns: &str, n: u32) -> OpQueue {
        let mut batch = OpQueue::new();
        for i in 0..n {
            batch.push(mongodb::bson::doc! {
                "ts": Timestamp { time: i + 1, increment: 0 },
                "t": 1_i64,
                "v": 2_i64,
                "op": "i",
                "ns": ns,
                "o": { "_id": i as i64 },
            });
        }
        batch
    }

    #[tokio::test]
    async fn multi_apply_rejects_empty_batches() {
        let storage = Arc::new(MemStorage::new());
        let coordinator = Arc::new(MemCoordinator::new());
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            ScriptedReaderFactory::empty(),
            ApplyMode::Secondary,
        );
        let err = applier.multi_apply(OpQueue::new()).await.unwrap_err();
        assert!(matches!(err, ApplyError::EmptyBatch));
    }

    #[tokio::test]
    async fn multi_apply_refuses_to_run_while_primary() {
        let storage = Arc::new(MemStorage::new());
        let coordinator = Arc::new(MemCoordinator::new());
        coordinator.set_member_state(MemberState::Primary);
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            ScriptedReaderFactory::empty(),
            ApplyMode::Secondary,
        );

        let err = applier.multi_apply(insert_batch("db.c", 3)).await.unwrap_err();
        assert!(matches!(err, ApplyError::CannotApplyOplogWhilePrimary));

        // Draining primaries are still allowed to apply.
        coordinator.set_waiting_for_drain(true);
        let last = applier.multi_apply(insert_batch("db.c", 3)).await.unwrap();
        assert_eq!(last, OpTime::new(Timestamp { time: 3, increment: 0 }, 1));
    }

    #[tokio::test]
    async fn multi_apply_orders_markers_around_the_phases() {
        let storage = Arc::new(MemStorage::new());
        let coordinator = Arc::new(MemCoordinator::new());
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            ScriptedReaderFactory::empty(),
            ApplyMode::Secondary,
        );

        let last = applier.multi_apply(insert_batch("db.c", 5)).await.unwrap();
        assert_eq!(last, op_time(5));

        let events = storage.events();
        let delete_set = events
            .iter()
            .position(|e| e.starts_with("delete_from_point:1"))
            .expect("delete-from-point was never set");
        let oplog_write = events
            .iter()
            .position(|e| e.starts_with("oplog_insert"))
            .expect("oplog was never written");
        let delete_cleared = events
            .iter()
            .position(|e| e == "delete_from_point:0")
            .expect("delete-from-point was never cleared");
        let min_valid = events
            .iter()
            .position(|e| e.starts_with("min_valid"))
            .expect("min-valid was never advanced");
        let first_apply = events
            .iter()
            .position(|e| e.starts_with("apply"))
            .expect("nothing was applied");

        assert!(delete_set < oplog_write);
        assert!(oplog_write < delete_cleared);
        assert!(delete_cleared < min_valid);
        assert!(min_valid < first_apply);
        assert_eq!(storage.doc_count("db.c"), 5);
    }

    #[tokio::test]
    async fn should_retry_gives_up_when_source_lacks_the_doc() {
        let storage = Arc::new(MemStorage::new());
        storage.create_namespace("db.c");
        let coordinator = Arc::new(MemCoordinator::new());
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            ScriptedReaderFactory::not_found(),
            ApplyMode::InitialSync,
        );

        let mut batch = insert_batch("db.c", 1);
        let entry = batch.pop().unwrap();
        let retried = applier
            .should_retry(&OpCtx::batch_apply(), &entry)
            .await
            .unwrap();
        assert!(!retried);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_retries_network_errors_then_succeeds() {
        let storage = Arc::new(MemStorage::new());
        storage.create_namespace("db.c");
        let coordinator = Arc::new(MemCoordinator::new());
        let readers = ScriptedReaderFactory::flaky_then_found(
            2,
            mongodb::bson::doc! { "_id": 0_i64, "x": "fetched" },
        );
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            readers,
            ApplyMode::InitialSync,
        );

        let mut batch = insert_batch("db.c", 1);
        let entry = batch.pop().unwrap();
        let retried = tokio::time::timeout(
            Duration::from_secs(30),
            applier.should_retry(&OpCtx::batch_apply(), &entry),
        )
        .await
        .expect("fetch did not finish")
        .unwrap();
        assert!(retried);
        assert!(storage
            .get_doc("db.c", &mongodb::bson::Bson::Int64(0))
            .is_some());
    }

    #[tokio::test]
    async fn capped_targets_skip_the_fetch() {
        let storage = Arc::new(MemStorage::new());
        storage.set_capped("db.cap");
        let coordinator = Arc::new(MemCoordinator::new());
        let applier = test_applier_full(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
            ApplierConfig::default(),
            // Any reader use would panic the scripted factory.
            ScriptedReaderFactory::empty(),
            ApplyMode::InitialSync,
        );

        let mut batch = insert_batch("db.cap", 1);
        let entry = batch.pop().unwrap();
        let retried = applier
            .should_retry(&OpCtx::batch_apply(), &entry)
            .await
            .unwrap();
        assert!(!retried);
    }
}
