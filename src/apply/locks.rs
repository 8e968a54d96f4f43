use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

/// Lock acquisition mode. Intent modes admit concurrent intent holders on
/// the same resource; exclusive admits exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Intent,
    Exclusive,
}

// Held only for its drop timing.
#[allow(dead_code)]
#[derive(Debug)]
enum ModeGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Holds a database lock plus the global shared lock beneath it.
#[derive(Debug)]
pub struct DbLock {
    _global: OwnedRwLockReadGuard<()>,
    _db: ModeGuard,
}

/// Holds a collection lock plus its database and global locks.
#[derive(Debug)]
pub struct CollectionLock {
    _db: DbLock,
    _coll: ModeGuard,
}

/// Process-wide lock hierarchy: a parallel-batch-writer barrier, an fsync
/// exclusion, the global lock, and per-database / per-collection tables.
/// Acquisition order is always global, then database, then collection.
#[derive(Debug, Default)]
pub struct LockManager {
    batch_writer_mode: Arc<RwLock<()>>,
    fsync: Arc<Mutex<()>>,
    global: Arc<RwLock<()>>,
    databases: DashMap<String, Arc<RwLock<()>>>,
    collections: DashMap<String, Arc<RwLock<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn database_lock(&self, db: &str) -> Arc<RwLock<()>> {
        self.databases
            .entry(db.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    fn collection_lock(&self, ns: &str) -> Arc<RwLock<()>> {
        self.collections
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    async fn acquire(lock: Arc<RwLock<()>>, mode: LockMode) -> ModeGuard {
        match mode {
            LockMode::Intent => ModeGuard::Shared(lock.read_owned().await),
            LockMode::Exclusive => ModeGuard::Exclusive(lock.write_owned().await),
        }
    }

    /// Blocks readers for the duration of a batch apply and keeps the
    /// storage engine from truncating old oplog entries mid-batch.
    pub async fn enter_batch_apply(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.batch_writer_mode).write_owned().await
    }

    /// Reader-side counterpart of [`enter_batch_apply`], for observers that
    /// must not see intermediate batch state.
    pub async fn reader_guard(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.batch_writer_mode).read_owned().await
    }

    /// Excludes an fsync-and-lock observer for the duration of one batch.
    pub async fn fsync_guard(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.fsync).lock_owned().await
    }

    pub async fn lock_global_shared(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.global).read_owned().await
    }

    pub async fn lock_global_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.global).write_owned().await
    }

    pub async fn lock_db(&self, db: &str, mode: LockMode) -> DbLock {
        let global = self.lock_global_shared().await;
        let db = Self::acquire(self.database_lock(db), mode).await;
        DbLock {
            _global: global,
            _db: db,
        }
    }

    pub async fn lock_collection(&self, ns: &str, mode: LockMode) -> CollectionLock {
        let db_name = crate::oplog::split_namespace(ns).0;
        let db = self.lock_db(db_name, mode).await;
        let coll = Self::acquire(self.collection_lock(ns), mode).await;
        CollectionLock {
            _db: db,
            _coll: coll,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn intent_holders_share_a_database() {
        let locks = LockManager::new();
        let _a = locks.lock_db("db", LockMode::Intent).await;
        let b = timeout(Duration::from_millis(50), locks.lock_db("db", LockMode::Intent)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn exclusive_excludes_intent() {
        let locks = LockManager::new();
        let _x = locks.lock_db("db", LockMode::Exclusive).await;
        let blocked =
            timeout(Duration::from_millis(50), locks.lock_db("db", LockMode::Intent)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn batch_apply_blocks_readers() {
        let locks = LockManager::new();
        let barrier = locks.enter_batch_apply().await;
        let blocked = timeout(Duration::from_millis(50), locks.reader_guard()).await;
        assert!(blocked.is_err());
        drop(barrier);
        assert!(timeout(Duration::from_millis(50), locks.reader_guard())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn global_exclusive_excludes_collection_locks() {
        let locks = LockManager::new();
        let _g = locks.lock_global_exclusive().await;
        let blocked = timeout(
            Duration::from_millis(50),
            locks.lock_collection("db.coll", LockMode::Intent),
        )
        .await;
        assert!(blocked.is_err());
    }
}
