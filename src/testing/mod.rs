//! In-memory fakes for the applier's external collaborators, shared by the
//! unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mongodb::bson::{Bson, Document, Timestamp};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::applier::{Applier, ApplyMode};
use crate::config::ApplierConfig;
use crate::coordinator::{MemberState, ReplicationCoordinator};
use crate::error::{ApplyError, Result};
use crate::oplog::{is_system_indexes, split_namespace, OpTime, OpType};
use crate::source::{OplogReader, ReaderFactory, UpstreamQueue};
use crate::storage::{document_id_key as id_key, CollectionProperties, OpCtx, StorageInterface};

/// In-memory upstream queue fed by tests.
#[derive(Default)]
pub struct MemUpstream {
    buffer: Mutex<VecDeque<Document>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl MemUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, doc: Document) {
        self.buffer
            .lock()
            .expect("upstream mutex poisoned")
            .push_back(doc);
        self.notify.notify_waiters();
    }

    pub fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl UpstreamQueue for MemUpstream {
    async fn peek(&self) -> Option<Document> {
        self.buffer
            .lock()
            .expect("upstream mutex poisoned")
            .front()
            .cloned()
    }

    async fn consume(&self) {
        self.buffer
            .lock()
            .expect("upstream mutex poisoned")
            .pop_front();
    }

    async fn wait_for_more(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if !self
            .buffer
            .lock()
            .expect("upstream mutex poisoned")
            .is_empty()
        {
            return;
        }
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }

    fn in_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Shape of one recorded `apply_operation` / `apply_command` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyCallKind {
    Single,
    GroupedInsert(usize),
    Command,
}

#[derive(Debug, Clone)]
pub struct ApplyCall {
    pub ns: String,
    pub kind: ApplyCallKind,
    pub replicated_writes: bool,
    pub document_validation: bool,
    pub convert_update_to_upsert: bool,
}


/// In-memory storage engine with call recording and failure injection.
#[derive(Default)]
pub struct MemStorage {
    databases: DashMap<String, ()>,
    catalog: DashMap<String, CollectionProperties>,
    collections: DashMap<String, BTreeMap<String, Document>>,
    oplog: Mutex<Vec<Document>>,
    deleted: DashMap<String, Vec<i64>>,
    events: Mutex<Vec<String>>,
    calls: Mutex<Vec<ApplyCall>>,
    min_valid: Mutex<OpTime>,
    applied_through: Mutex<OpTime>,
    write_conflicts_remaining: AtomicU32,
    fail_grouped: AtomicBool,
    fail_index_builds: AtomicBool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn event(&self, event: String) {
        self.events.lock().expect("events mutex poisoned").push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events mutex poisoned").clone()
    }

    pub fn apply_calls(&self) -> Vec<ApplyCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn oplog_len(&self) -> usize {
        self.oplog.lock().expect("oplog mutex poisoned").len()
    }

    pub fn doc_count(&self, ns: &str) -> usize {
        self.collections.get(ns).map(|c| c.len()).unwrap_or(0)
    }

    pub fn get_doc(&self, ns: &str, id: &Bson) -> Option<Document> {
        self.collections.get(ns)?.get(&id_key(id)).cloned()
    }

    pub fn deleted_ids(&self, ns: &str) -> Vec<i64> {
        self.deleted
            .get(ns)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    pub fn database_exists_sync(&self, db: &str) -> bool {
        self.databases.contains_key(db)
    }

    pub fn collection_exists_sync(&self, ns: &str) -> bool {
        self.catalog.contains_key(ns)
    }

    pub fn min_valid_sync(&self) -> OpTime {
        *self.min_valid.lock().expect("min-valid mutex poisoned")
    }

    pub fn applied_through_sync(&self) -> OpTime {
        *self
            .applied_through
            .lock()
            .expect("applied-through mutex poisoned")
    }

    /// Create the database, collection, and catalog entry for `ns`.
    pub fn create_namespace(&self, ns: &str) {
        let (db, _) = split_namespace(ns);
        self.databases.insert(db.to_string(), ());
        self.catalog
            .insert(ns.to_string(), CollectionProperties::default());
        self.collections.entry(ns.to_string()).or_default();
    }

    pub fn set_capped(&self, ns: &str) {
        self.create_namespace(ns);
        self.catalog.insert(
            ns.to_string(),
            CollectionProperties {
                is_capped: true,
                collation: None,
            },
        );
    }

    pub fn set_collation(&self, ns: &str, collation: &str) {
        self.create_namespace(ns);
        self.catalog.insert(
            ns.to_string(),
            CollectionProperties {
                is_capped: false,
                collation: Some(collation.to_string()),
            },
        );
    }

    /// Make the next `n` apply calls fail with a write conflict.
    pub fn inject_write_conflicts(&self, n: u32) {
        self.write_conflicts_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every grouped insert with a storage error.
    pub fn fail_grouped_inserts(&self, fail: bool) {
        self.fail_grouped.store(fail, Ordering::SeqCst);
    }

    /// Fail every `system.indexes` insert as an index build over parallel
    /// arrays.
    pub fn fail_index_builds_with_parallel_arrays(&self, fail: bool) {
        self.fail_index_builds.store(fail, Ordering::SeqCst);
    }

    fn insert_doc(&self, ns: &str, doc: Document) -> Result<()> {
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| ApplyError::Storage("document missing _id".to_string()))?;
        self.collections
            .entry(ns.to_string())
            .or_default()
            .insert(id_key(&id), doc);
        Ok(())
    }
}

#[async_trait]
impl StorageInterface for MemStorage {
    async fn insert_documents(&self, _ctx: &OpCtx, ns: &str, docs: &[&Document]) -> Result<()> {
        if ns == "local.oplog.rs" {
            self.event(format!("oplog_insert:{}", docs.len()));
            let mut oplog = self.oplog.lock().expect("oplog mutex poisoned");
            for doc in docs {
                oplog.push((*doc).clone());
            }
            return Ok(());
        }
        for doc in docs {
            self.insert_doc(ns, (*doc).clone())?;
        }
        Ok(())
    }

    async fn insert_document(&self, _ctx: &OpCtx, ns: &str, doc: &Document) -> Result<()> {
        self.insert_doc(ns, doc.clone())
    }

    async fn set_oplog_delete_from_point(&self, ts: Timestamp) -> Result<()> {
        self.event(format!("delete_from_point:{}", ts.time));
        Ok(())
    }

    async fn set_min_valid_to_at_least(&self, op_time: OpTime) -> Result<()> {
        self.event(format!("min_valid:{}", op_time.timestamp.time));
        let mut min_valid = self.min_valid.lock().expect("min-valid mutex poisoned");
        if op_time > *min_valid {
            *min_valid = op_time;
        }
        Ok(())
    }

    async fn get_min_valid(&self) -> Result<OpTime> {
        Ok(*self.min_valid.lock().expect("min-valid mutex poisoned"))
    }

    async fn set_applied_through(&self, op_time: OpTime) -> Result<()> {
        self.event(format!("applied_through:{}", op_time.timestamp.time));
        *self
            .applied_through
            .lock()
            .expect("applied-through mutex poisoned") = op_time;
        Ok(())
    }

    async fn set_global_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.event(format!("global_ts:{}", ts.time));
        Ok(())
    }

    async fn get_oplog_max_size(&self, _ns: &str) -> Result<usize> {
        Ok(1 << 30)
    }

    async fn get_collection_properties(&self, ns: &str) -> Result<Option<CollectionProperties>> {
        Ok(self.catalog.get(ns).map(|p| p.value().clone()))
    }

    async fn database_exists(&self, db: &str) -> Result<bool> {
        Ok(self.databases.contains_key(db))
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        self.databases.insert(db.to_string(), ());
        Ok(())
    }

    async fn collection_exists(&self, ns: &str) -> Result<bool> {
        Ok(self.catalog.contains_key(ns))
    }

    async fn create_collection(&self, ns: &str) -> Result<()> {
        self.catalog
            .entry(ns.to_string())
            .or_insert_with(CollectionProperties::default);
        self.collections.entry(ns.to_string()).or_default();
        Ok(())
    }

    async fn apply_operation(
        &self,
        ctx: &OpCtx,
        op: &Document,
        convert_update_to_upsert: bool,
    ) -> Result<()> {
        let ns = op.get_str("ns").unwrap_or("").to_string();
        let op_type = OpType::parse(op.get_str("op").unwrap_or(""));

        let grouped_len = match op.get("o") {
            Some(Bson::Array(docs)) if op_type == OpType::Insert => Some(docs.len()),
            _ => None,
        };
        self.calls.lock().expect("calls mutex poisoned").push(ApplyCall {
            ns: ns.clone(),
            kind: match grouped_len {
                Some(n) => ApplyCallKind::GroupedInsert(n),
                None => ApplyCallKind::Single,
            },
            replicated_writes: ctx.replicated_writes,
            document_validation: ctx.document_validation,
            convert_update_to_upsert,
        });

        // Injected conflicts trip after recording so attempts stay visible.
        if self
            .write_conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ApplyError::WriteConflict);
        }

        self.event(format!("apply:{ns}"));

        match op_type {
            OpType::Insert if is_system_indexes(&ns) && self.fail_index_builds.load(Ordering::SeqCst) => {
                Err(ApplyError::CannotIndexParallelArrays)
            }
            OpType::Insert => match op.get("o") {
                Some(Bson::Array(docs)) => {
                    if self.fail_grouped.load(Ordering::SeqCst) {
                        return Err(ApplyError::Storage("injected bulk failure".to_string()));
                    }
                    for doc in docs {
                        let doc = doc.as_document().ok_or_else(|| {
                            ApplyError::Storage("grouped insert entry is not a document".to_string())
                        })?;
                        self.insert_doc(&ns, doc.clone())?;
                    }
                    Ok(())
                }
                Some(Bson::Document(doc)) => self.insert_doc(&ns, doc.clone()),
                _ => Err(ApplyError::Storage("insert without o document".to_string())),
            },
            OpType::Update => {
                if !self.catalog.contains_key(&ns) {
                    return Err(ApplyError::NamespaceNotFound(ns));
                }
                let o2 = op
                    .get_document("o2")
                    .map_err(|_| ApplyError::Storage("update without o2".to_string()))?;
                let id = o2
                    .get("_id")
                    .cloned()
                    .ok_or_else(|| ApplyError::Storage("update without _id".to_string()))?;
                let o = op
                    .get_document("o")
                    .map_err(|_| ApplyError::Storage("update without o".to_string()))?;

                let mut collection = self.collections.entry(ns.clone()).or_default();
                let key = id_key(&id);
                if collection.contains_key(&key) {
                    let mut replacement = o.clone();
                    if !replacement.contains_key("_id") {
                        replacement.insert("_id", id.clone());
                    }
                    collection.insert(key, replacement);
                    Ok(())
                } else if convert_update_to_upsert {
                    let mut upserted = o.clone();
                    if !upserted.contains_key("_id") {
                        upserted.insert("_id", id.clone());
                    }
                    collection.insert(key, upserted);
                    Ok(())
                } else {
                    Err(ApplyError::Storage(format!(
                        "update target document missing in {ns}"
                    )))
                }
            }
            OpType::Delete => {
                if !self.catalog.contains_key(&ns) {
                    return Err(ApplyError::NamespaceNotFound(ns));
                }
                let id = op
                    .get_document("o")
                    .ok()
                    .and_then(|o| o.get("_id").cloned())
                    .ok_or_else(|| ApplyError::Storage("delete without _id".to_string()))?;
                if let Some(mut collection) = self.collections.get_mut(&ns) {
                    collection.remove(&id_key(&id));
                }
                if let Some(id) = id.as_i32().map(i64::from).or_else(|| id.as_i64()) {
                    self.deleted.entry(ns.clone()).or_default().push(id);
                }
                Ok(())
            }
            OpType::Noop => Ok(()),
            _ => Err(ApplyError::BadValue(format!("bad op in apply_operation: {op:?}"))),
        }
    }

    async fn apply_command(&self, ctx: &OpCtx, op: &Document) -> Result<()> {
        let ns = op.get_str("ns").unwrap_or("").to_string();
        self.calls.lock().expect("calls mutex poisoned").push(ApplyCall {
            ns: ns.clone(),
            kind: ApplyCallKind::Command,
            replicated_writes: ctx.replicated_writes,
            document_validation: ctx.document_validation,
            convert_update_to_upsert: false,
        });
        self.event(format!("command:{ns}"));

        let (db, _) = split_namespace(&ns);
        let command = op.get_document("o").map_err(|_| {
            ApplyError::BadValue("command entry without o document".to_string())
        })?;

        if let Ok(name) = command.get_str("create") {
            // Commands never create the database implicitly.
            let full = format!("{db}.{name}");
            self.catalog
                .entry(full.clone())
                .or_insert_with(CollectionProperties::default);
            self.collections.entry(full).or_default();
            return Ok(());
        }
        if let Ok(name) = command.get_str("drop") {
            let full = format!("{db}.{name}");
            self.catalog.remove(&full);
            self.collections.remove(&full);
            return Ok(());
        }
        Err(ApplyError::BadValue(format!("unsupported command: {command:?}")))
    }

    async fn wait_until_durable(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory replication coordinator with forward-only progress markers.
pub struct MemCoordinator {
    last_applied: Mutex<OpTime>,
    last_durable: Mutex<OpTime>,
    state: Mutex<MemberState>,
    maintenance: AtomicBool,
    waiting_for_drain: AtomicBool,
    catching_up: AtomicBool,
    drain_signaled: AtomicBool,
    slave_delay: Mutex<Duration>,
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self {
            last_applied: Mutex::new(OpTime::NULL),
            last_durable: Mutex::new(OpTime::NULL),
            state: Mutex::new(MemberState::Secondary),
            maintenance: AtomicBool::new(false),
            waiting_for_drain: AtomicBool::new(false),
            catching_up: AtomicBool::new(false),
            drain_signaled: AtomicBool::new(false),
            slave_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MemCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_member_state(&self, state: MemberState) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }

    pub fn set_maintenance_mode(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
    }

    pub fn set_waiting_for_drain(&self, on: bool) {
        self.waiting_for_drain.store(on, Ordering::SeqCst);
    }

    pub fn set_catching_up(&self, on: bool) {
        self.catching_up.store(on, Ordering::SeqCst);
    }

    pub fn set_slave_delay(&self, delay: Duration) {
        *self.slave_delay.lock().expect("delay mutex poisoned") = delay;
    }

    pub fn last_durable(&self) -> OpTime {
        *self.last_durable.lock().expect("durable mutex poisoned")
    }

    pub fn drain_signaled(&self) -> bool {
        self.drain_signaled.load(Ordering::SeqCst)
    }
}

impl ReplicationCoordinator for MemCoordinator {
    fn set_my_last_applied_op_time_forward(&self, op_time: OpTime) {
        let mut last = self.last_applied.lock().expect("applied mutex poisoned");
        if op_time > *last {
            *last = op_time;
        }
    }

    fn set_my_last_durable_op_time_forward(&self, op_time: OpTime) {
        let mut last = self.last_durable.lock().expect("durable mutex poisoned");
        if op_time > *last {
            *last = op_time;
        }
    }

    fn get_my_last_applied_op_time(&self) -> OpTime {
        *self.last_applied.lock().expect("applied mutex poisoned")
    }

    fn get_member_state(&self) -> MemberState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn in_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    fn set_follower_mode(&self, state: MemberState) -> bool {
        *self.state.lock().expect("state mutex poisoned") = state;
        true
    }

    fn is_waiting_for_applier_to_drain(&self) -> bool {
        self.waiting_for_drain.load(Ordering::SeqCst)
    }

    fn signal_drain_complete(&self) {
        self.drain_signaled.store(true, Ordering::SeqCst);
        self.waiting_for_drain.store(false, Ordering::SeqCst);
    }

    fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::SeqCst)
    }

    fn slave_delay(&self) -> Duration {
        *self.slave_delay.lock().expect("delay mutex poisoned")
    }
}

#[derive(Debug, Clone)]
enum ScriptEvent {
    NetworkError,
    Found(Document),
    NotFound,
}

/// Reader factory that replays a scripted sequence of connect/find
/// outcomes, with an optional repeating fallback once the script runs out.
pub struct ScriptedReaderFactory {
    script: Arc<Mutex<VecDeque<ScriptEvent>>>,
    fallback: Option<ScriptEvent>,
}

impl ScriptedReaderFactory {
    /// Every reader use fails: for tests where no fetch should happen.
    pub fn empty() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: None,
        }
    }

    /// Every fetch finds `doc`.
    pub fn found(doc: Document) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Some(ScriptEvent::Found(doc)),
        }
    }

    /// Every fetch reports the document as missing on the source.
    pub fn not_found() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Some(ScriptEvent::NotFound),
        }
    }

    /// `failures` network errors, then every fetch finds `doc`.
    pub fn flaky_then_found(failures: usize, doc: Document) -> Self {
        let script = (0..failures).map(|_| ScriptEvent::NetworkError).collect();
        Self {
            script: Arc::new(Mutex::new(script)),
            fallback: Some(ScriptEvent::Found(doc)),
        }
    }

}

struct ScriptedReader {
    factory_script: Arc<Mutex<VecDeque<ScriptEvent>>>,
    fallback: Option<ScriptEvent>,
    connected: bool,
}

impl ScriptedReader {
    fn next_event(&self) -> Option<ScriptEvent> {
        let scripted = self
            .factory_script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        scripted.or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl OplogReader for ScriptedReader {
    async fn connect(&mut self, _host: &str) -> Result<()> {
        // Only a scripted network error is consumed here; anything else is
        // left queued for find_one.
        let mut script = self.factory_script.lock().expect("script mutex poisoned");
        match script.front() {
            Some(ScriptEvent::NetworkError) => {
                script.pop_front();
                Err(ApplyError::Network("scripted connect failure".to_string()))
            }
            Some(_) => {
                self.connected = true;
                Ok(())
            }
            None => match &self.fallback {
                Some(ScriptEvent::NetworkError) => {
                    Err(ApplyError::Network("scripted connect failure".to_string()))
                }
                Some(_) => {
                    self.connected = true;
                    Ok(())
                }
                None => Err(ApplyError::Network("no scripted responses left".to_string())),
            },
        }
    }

    async fn find_one(&mut self, _ns: &str, _filter: Document) -> Result<Option<Document>> {
        if !self.connected {
            return Err(ApplyError::Network("reader is not connected".to_string()));
        }
        match self.next_event() {
            Some(ScriptEvent::Found(doc)) => Ok(Some(doc)),
            Some(ScriptEvent::NotFound) => Ok(None),
            Some(ScriptEvent::NetworkError) => {
                Err(ApplyError::Network("scripted find failure".to_string()))
            }
            None => Err(ApplyError::Network("no scripted responses left".to_string())),
        }
    }
}

impl ReaderFactory for ScriptedReaderFactory {
    fn make_reader(&self) -> Box<dyn OplogReader> {
        Box::new(ScriptedReader {
            factory_script: Arc::clone(&self.script),
            fallback: self.fallback.clone(),
            connected: false,
        })
    }
}

/// Applier wired to in-memory collaborators, steady-state mode.
pub fn test_applier(storage: Arc<MemStorage>) -> Arc<Applier> {
    test_applier_with(
        storage,
        ApplierConfig::default(),
        ScriptedReaderFactory::empty(),
    )
}

pub fn test_applier_with(
    storage: Arc<MemStorage>,
    config: ApplierConfig,
    readers: ScriptedReaderFactory,
) -> Arc<Applier> {
    test_applier_full(
        storage,
        Arc::new(MemCoordinator::new()),
        config,
        readers,
        ApplyMode::Secondary,
    )
}

pub fn test_applier_full(
    storage: Arc<MemStorage>,
    coordinator: Arc<MemCoordinator>,
    config: ApplierConfig,
    readers: ScriptedReaderFactory,
    mode: ApplyMode,
) -> Arc<Applier> {
    Applier::new(
        config,
        storage as _,
        crate::storage::EngineCapabilities::default(),
        coordinator as _,
        Arc::new(readers) as _,
        mode,
    )
    .expect("test config is valid")
}
