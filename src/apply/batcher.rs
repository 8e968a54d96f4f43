use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::Timestamp;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::{batch_limit_operations, ApplierConfig};
use crate::coordinator::ReplicationCoordinator;
use crate::error::{fatal, ApplyError, Result};
use crate::failpoint::BATCHER_PAUSE;
use crate::oplog::entry::doc_byte_size;
use crate::oplog::{is_system_indexes, OpQueue, OpType, OPLOG_VERSION};
use crate::source::UpstreamQueue;
use crate::storage::StorageInterface;

/// Limits applied while assembling one batch. Re-read at the start of every
/// batch so runtime tuning takes effect without a restart.
#[derive(Debug, Clone)]
pub struct BatchLimits {
    pub ops: usize,
    pub bytes: usize,
    /// Entries with a wall-clock time newer than this are withheld.
    pub slave_delay_latest: Option<DateTime<Utc>>,
}

fn timestamp_wall_time(ts: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.time as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Background producer that drains the upstream queue into size- and
/// policy-bounded batches and hands them over through a single-slot
/// rendezvous.
pub struct OplogBatcher {
    rx: Mutex<mpsc::Receiver<OpQueue>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OplogBatcher {
    /// Spawn the assembler task and return the consumer handle.
    pub fn start(
        upstream: Arc<dyn UpstreamQueue>,
        coordinator: Arc<dyn ReplicationCoordinator>,
        storage: Arc<dyn StorageInterface>,
        config: &ApplierConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let batch_limit_bytes = config.batch_limit_bytes;
        let oplog_ns = config.oplog_ns.clone();
        let handle = tokio::spawn(async move {
            assembler_loop(upstream, coordinator, storage, tx, batch_limit_bytes, oplog_ns).await;
        });

        Self {
            rx: Mutex::new(rx),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Wait up to `max_wait` for a batch. An empty queue on timeout lets the
    /// caller re-run its periodic checks; after shutdown the returned queue
    /// carries the shutdown flag.
    pub async fn next_batch(&self, max_wait: Duration) -> OpQueue {
        let mut rx = self.rx.lock().await;
        match timeout(max_wait, rx.recv()).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                let mut batch = OpQueue::new();
                batch.set_must_shutdown();
                batch
            }
            Err(_) => OpQueue::new(),
        }
    }

    /// Join the assembler task. Call after a shutdown batch was observed.
    pub async fn join(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn assembler_loop(
    upstream: Arc<dyn UpstreamQueue>,
    coordinator: Arc<dyn ReplicationCoordinator>,
    storage: Arc<dyn StorageInterface>,
    tx: mpsc::Sender<OpQueue>,
    batch_limit_bytes: usize,
    oplog_ns: String,
) {
    let oplog_max_size = match storage.get_oplog_max_size(&oplog_ns).await {
        Ok(size) => size,
        Err(e) => fatal(&format!("failed to read oplog max size: {e}")),
    };

    // Batches are limited to 10% of the oplog.
    let bytes_limit = cmp::min(oplog_max_size / 10, batch_limit_bytes);
    info!("oplog batcher started, byte limit {bytes_limit}");

    loop {
        let slave_delay = coordinator.slave_delay();
        let limits = BatchLimits {
            ops: batch_limit_operations(),
            bytes: bytes_limit,
            slave_delay_latest: if slave_delay > Duration::ZERO {
                let delay = chrono::Duration::from_std(slave_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                Some(Utc::now() - delay)
            } else {
                None
            },
        };

        let mut ops = OpQueue::new();
        loop {
            match try_pop_and_wait_for_more(upstream.as_ref(), &mut ops, &limits).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => fatal(&format!("cannot assemble oplog batch: {e}")),
            }
        }

        // For pausing replication in tests.
        while BATCHER_PAUSE.is_active() {
            if upstream.in_shutdown() {
                fatal("disable the batcher pause fail point before attempting clean shutdown");
            }
            sleep(Duration::from_millis(10)).await;
        }

        if ops.is_empty() && !ops.must_shutdown() {
            continue; // Don't emit empty batches.
        }

        let shutting_down = ops.must_shutdown();
        // The capacity-1 channel blocks here until the previous batch has
        // been taken.
        if tx.send(ops).await.is_err() {
            return;
        }
        if shutting_down {
            debug!("oplog batcher exiting on shutdown");
            return;
        }
    }
}

/// Move at most one entry from the upstream queue into `ops`.
///
/// Returns `Ok(true)` when the batch should be ended, `Ok(false)` to keep
/// appending. Waits up to a second when nothing is buffered so shutdown and
/// reconfiguration are observed periodically.
pub(crate) async fn try_pop_and_wait_for_more(
    upstream: &dyn UpstreamQueue,
    ops: &mut OpQueue,
    limits: &BatchLimits,
) -> Result<bool> {
    let Some(raw) = upstream.peek().await else {
        if ops.is_empty() {
            if upstream.in_shutdown() {
                ops.set_must_shutdown();
            } else {
                // The next real op should start a fresh timed batch.
                upstream.wait_for_more().await;
            }
        }
        return Ok(true);
    };

    // Don't exceed the byte limit unless the batch is empty: a single
    // oversized op must still be able to pass through. Checked before
    // parsing so rejected entries cost nothing.
    if !ops.is_empty() && ops.byte_size() + doc_byte_size(&raw) > limits.bytes {
        return Ok(true);
    }

    ops.push(raw);
    let entry = ops.back().expect("entry was just pushed");

    if !entry.is_sentinel() && entry.version != OPLOG_VERSION {
        return Err(ApplyError::UnsupportedOplogVersion {
            expected: OPLOG_VERSION,
            found: entry.version,
        });
    }

    if let Some(latest) = limits.slave_delay_latest {
        if timestamp_wall_time(entry.ts) > latest {
            // Too new to apply yet; leave it unconsumed.
            ops.pop();
            if ops.is_empty() {
                // Nothing to do: nap briefly, short enough that shutdown
                // and reconfiguration stay responsive.
                sleep(Duration::from_secs(1)).await;
            }
            return Ok(true);
        }
    }

    // Ops that must stand alone in their batch: the drained sentinel,
    // commands, and index builds (inserts into system.indexes).
    let must_stand_alone = entry.is_sentinel()
        || entry.op_type == OpType::Command
        || (!entry.ns.is_empty() && is_system_indexes(&entry.ns));
    if must_stand_alone {
        if ops.count() == 1 {
            upstream.consume().await;
        } else {
            // Already have ops buffered; leave this one unconsumed so it is
            // seen again next time and processed alone.
            ops.pop();
        }
        return Ok(true);
    }

    upstream.consume().await;
    Ok(ops.count() >= limits.ops)
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, Document};

    use super::*;
    use crate::testing::MemUpstream;

    fn insert_doc(ns: &str, id: i32, time: u32) -> Document {
        doc! {
            "ts": Timestamp { time, increment: 0 },
            "t": 1_i64,
            "v": 2_i64,
            "op": "i",
            "ns": ns,
            "o": { "_id": id },
        }
    }

    fn command_doc(time: u32) -> Document {
        doc! {
            "ts": Timestamp { time, increment: 0 },
            "t": 1_i64,
            "v": 2_i64,
            "op": "c",
            "ns": "a.$cmd",
            "o": { "create": "y" },
        }
    }

    fn no_delay(ops: usize, bytes: usize) -> BatchLimits {
        BatchLimits {
            ops,
            bytes,
            slave_delay_latest: None,
        }
    }

    async fn assemble(upstream: &MemUpstream, limits: &BatchLimits) -> OpQueue {
        let mut ops = OpQueue::new();
        loop {
            if try_pop_and_wait_for_more(upstream, &mut ops, limits)
                .await
                .unwrap()
            {
                return ops;
            }
        }
    }

    #[tokio::test]
    async fn commands_are_isolated_in_their_own_batch() {
        let upstream = MemUpstream::new();
        upstream.push(insert_doc("a.x", 1, 1)).await;
        upstream.push(command_doc(2)).await;
        upstream.push(insert_doc("a.x", 2, 3)).await;
        upstream.set_shutdown();

        let limits = no_delay(1000, usize::MAX);

        let first = assemble(&upstream, &limits).await;
        assert_eq!(first.count(), 1);
        assert_eq!(first.front().unwrap().op_type, OpType::Insert);

        let second = assemble(&upstream, &limits).await;
        assert_eq!(second.count(), 1);
        assert_eq!(second.front().unwrap().op_type, OpType::Command);

        let third = assemble(&upstream, &limits).await;
        assert_eq!(third.count(), 1);
        assert_eq!(third.front().unwrap().op_type, OpType::Insert);
    }

    #[tokio::test]
    async fn index_builds_are_isolated() {
        let upstream = MemUpstream::new();
        upstream.push(insert_doc("a.x", 1, 1)).await;
        upstream.push(insert_doc("a.system.indexes", 2, 2)).await;
        upstream.set_shutdown();

        let limits = no_delay(1000, usize::MAX);

        let first = assemble(&upstream, &limits).await;
        assert_eq!(first.count(), 1);
        assert_eq!(first.front().unwrap().ns, "a.x");

        let second = assemble(&upstream, &limits).await;
        assert_eq!(second.count(), 1);
        assert_eq!(second.front().unwrap().ns, "a.system.indexes");
    }

    #[tokio::test]
    async fn count_limit_ends_the_batch() {
        let upstream = MemUpstream::new();
        for i in 0..5 {
            upstream.push(insert_doc("a.x", i, i as u32 + 1)).await;
        }
        upstream.set_shutdown();

        let limits = no_delay(3, usize::MAX);
        let batch = assemble(&upstream, &limits).await;
        assert_eq!(batch.count(), 3);

        let batch = assemble(&upstream, &limits).await;
        assert_eq!(batch.count(), 2);
    }

    #[tokio::test]
    async fn byte_limit_allows_single_op_overrun() {
        let upstream = MemUpstream::new();
        upstream.push(insert_doc("a.x", 1, 1)).await;
        upstream.push(insert_doc("a.x", 2, 2)).await;
        upstream.set_shutdown();

        // Smaller than any single op: each batch holds exactly one.
        let limits = no_delay(1000, 1);
        let batch = assemble(&upstream, &limits).await;
        assert_eq!(batch.count(), 1);
        assert!(batch.byte_size() > limits.bytes);

        let batch = assemble(&upstream, &limits).await;
        assert_eq!(batch.count(), 1);
    }

    #[tokio::test]
    async fn slave_delay_withholds_new_entries() {
        let upstream = MemUpstream::new();
        let now = Utc::now().timestamp() as u32;
        upstream.push(insert_doc("a.x", 1, now)).await;

        let limits = BatchLimits {
            ops: 1000,
            bytes: usize::MAX,
            // Ten seconds of slave delay against an entry stamped now.
            slave_delay_latest: Some(Utc::now() - chrono::Duration::seconds(10)),
        };

        let started = tokio::time::Instant::now();
        let mut ops = OpQueue::new();
        let ended = try_pop_and_wait_for_more(&upstream, &mut ops, &limits)
            .await
            .unwrap();
        assert!(ended);
        assert!(ops.is_empty());
        // The entry stays unconsumed for a later batch.
        assert!(upstream.peek().await.is_some());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn unsupported_version_is_an_error() {
        let upstream = MemUpstream::new();
        upstream
            .push(doc! {
                "ts": Timestamp { time: 1, increment: 0 },
                "v": 99_i64,
                "op": "i",
                "ns": "a.x",
                "o": { "_id": 1 },
            })
            .await;

        let mut ops = OpQueue::new();
        let err = try_pop_and_wait_for_more(&upstream, &mut ops, &no_delay(1000, usize::MAX))
            .await
            .unwrap_err();
        match err {
            ApplyError::UnsupportedOplogVersion { expected, found } => {
                assert_eq!(expected, OPLOG_VERSION);
                assert_eq!(found, 99);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn shutdown_produces_shutdown_batch() {
        let upstream = MemUpstream::new();
        upstream.set_shutdown();

        let mut ops = OpQueue::new();
        let ended = try_pop_and_wait_for_more(&upstream, &mut ops, &no_delay(1000, usize::MAX))
            .await
            .unwrap();
        assert!(ended);
        assert!(ops.must_shutdown());
    }

    #[tokio::test]
    async fn sentinel_is_consumed_alone() {
        let upstream = MemUpstream::new();
        upstream.push(Document::new()).await;
        upstream.set_shutdown();

        let limits = no_delay(1000, usize::MAX);
        let batch = assemble(&upstream, &limits).await;
        assert_eq!(batch.count(), 1);
        assert!(batch.front().unwrap().is_sentinel());
        assert!(upstream.peek().await.is_none());
    }
}
