use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::Client;
use tracing::debug;

use crate::error::{ApplyError, Result};
use crate::oplog::split_namespace;

/// Upstream producer of raw oplog entries. Called only from the dedicated
/// assembler task; concurrent callers are not supported.
#[async_trait]
pub trait UpstreamQueue: Send + Sync {
    /// Non-blocking look at the next entry, if one is visible.
    async fn peek(&self) -> Option<Document>;

    /// Remove the entry most recently returned by `peek`.
    async fn consume(&self);

    /// Block up to about a second awaiting producer activity. Returns
    /// promptly when shutdown is requested.
    async fn wait_for_more(&self);

    fn in_shutdown(&self) -> bool;
}

/// Read connection used to fetch missing documents from the sync source.
#[async_trait]
pub trait OplogReader: Send {
    async fn connect(&mut self, host: &str) -> Result<()>;

    async fn find_one(&mut self, ns: &str, filter: Document) -> Result<Option<Document>>;
}

/// Produces a fresh reader for each fetch attempt.
pub trait ReaderFactory: Send + Sync {
    fn make_reader(&self) -> Box<dyn OplogReader>;
}

fn classify(e: mongodb::error::Error) -> ApplyError {
    match e.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => ApplyError::Network(e.to_string()),
        _ => ApplyError::Storage(e.to_string()),
    }
}

/// Reader backed by a MongoDB client connection.
#[derive(Default)]
pub struct MongoOplogReader {
    client: Option<Client>,
}

impl MongoOplogReader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OplogReader for MongoOplogReader {
    async fn connect(&mut self, host: &str) -> Result<()> {
        let uri = if host.starts_with("mongodb://") {
            host.to_string()
        } else {
            format!("mongodb://{host}")
        };
        let client = Client::with_uri_str(&uri).await.map_err(classify)?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify)?;

        debug!("connected to sync source {host}");
        self.client = Some(client);
        Ok(())
    }

    async fn find_one(&mut self, ns: &str, filter: Document) -> Result<Option<Document>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ApplyError::Network("reader is not connected".to_string()))?;

        let (db, coll) = split_namespace(ns);
        if coll.is_empty() {
            return Err(ApplyError::BadValue(format!("invalid namespace: {ns}")));
        }

        client
            .database(db)
            .collection::<Document>(coll)
            .find_one(filter)
            .await
            .map_err(classify)
    }
}

/// Factory for [`MongoOplogReader`] connections.
#[derive(Default)]
pub struct MongoReaderFactory;

impl ReaderFactory for MongoReaderFactory {
    fn make_reader(&self) -> Box<dyn OplogReader> {
        Box::new(MongoOplogReader::new())
    }
}
