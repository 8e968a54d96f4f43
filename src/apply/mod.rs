pub mod batcher;
pub mod dispatch;
pub mod finalizer;
pub mod locks;
pub mod oplog_writer;
pub mod partitioner;
pub mod worker;
