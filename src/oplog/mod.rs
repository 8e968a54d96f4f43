pub mod entry;
pub mod queue;

pub use entry::{OpTime, OpType, OplogEntry, OPLOG_VERSION};
pub use queue::OpQueue;

/// Split a `db.coll` namespace into its database and collection parts.
/// The collection part may itself contain dots.
pub fn split_namespace(ns: &str) -> (&str, &str) {
    match ns.split_once('.') {
        Some((db, coll)) => (db, coll),
        None => (ns, ""),
    }
}

/// Index builds are inserts into the `system.indexes` collection.
pub fn is_system_indexes(ns: &str) -> bool {
    split_namespace(ns).1 == "system.indexes"
}
