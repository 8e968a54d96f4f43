use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::coordinator::ReplicationCoordinator;
use crate::oplog::OpTime;
use crate::storage::{EngineCapabilities, StorageInterface};

struct JournalWaiter {
    latest: Arc<Mutex<Option<OpTime>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Publishes replication progress after each applied batch.
///
/// On journaled engines a background waiter additionally publishes the
/// durable op-time after every on-disk flush; on others only the applied
/// marker moves. Both markers are forward-only.
pub struct BatchFinalizer {
    coordinator: Arc<dyn ReplicationCoordinator>,
    waiter: Option<JournalWaiter>,
}

impl BatchFinalizer {
    pub fn new(
        coordinator: Arc<dyn ReplicationCoordinator>,
        storage: Arc<dyn StorageInterface>,
        engine: EngineCapabilities,
    ) -> Self {
        let waiter = engine.is_durable.then(|| {
            let latest: Arc<Mutex<Option<OpTime>>> = Arc::new(Mutex::new(None));
            let notify = Arc::new(Notify::new());
            let cancel = CancellationToken::new();

            let handle = tokio::spawn(waiter_loop(
                Arc::clone(&latest),
                Arc::clone(&notify),
                cancel.clone(),
                Arc::clone(&coordinator),
                storage,
            ));

            JournalWaiter {
                latest,
                notify,
                cancel,
                handle,
            }
        });

        Self {
            coordinator,
            waiter,
        }
    }

    /// Publish `op_time` as last-applied and, on journaled engines, wake the
    /// durability waiter.
    pub fn record(&self, op_time: OpTime) {
        self.coordinator
            .set_my_last_applied_op_time_forward(op_time);

        if let Some(waiter) = &self.waiter {
            *waiter.latest.lock().expect("finalizer mutex poisoned") = Some(op_time);
            waiter.notify.notify_one();
        }
    }

    /// Stop and join the durability waiter, if one is running.
    pub async fn shutdown(self) {
        if let Some(waiter) = self.waiter {
            waiter.cancel.cancel();
            waiter.notify.notify_one();
            let _ = waiter.handle.await;
        }
    }
}

async fn waiter_loop(
    latest: Arc<Mutex<Option<OpTime>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    coordinator: Arc<dyn ReplicationCoordinator>,
    storage: Arc<dyn StorageInterface>,
) {
    debug!("journal finalizer waiter started");
    loop {
        let op_time = loop {
            if cancel.is_cancelled() {
                debug!("journal finalizer waiter exiting");
                return;
            }
            if let Some(op_time) = latest.lock().expect("finalizer mutex poisoned").take() {
                break op_time;
            }
            notify.notified().await;
        };

        if let Err(e) = storage.wait_until_durable().await {
            error!("failed waiting for journal flush: {e}");
            continue;
        }
        coordinator.set_my_last_durable_op_time_forward(op_time);
    }
}
