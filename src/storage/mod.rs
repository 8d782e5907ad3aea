//! Uniform storage contract over PIM item stores.
//!
//! Concrete stores (DAV collections here, on-device databases in host
//! binaries) all expose the same capability set so the sync engines can
//! treat both sides of a run identically.

pub mod caldav;
pub mod carddav;
pub mod iterator;
pub mod registry;

pub use caldav::CalDavStorage;
pub use carddav::CardDavStorage;
pub use iterator::{BATCH_SIZE, ItemStream, StreamStatus};
pub use registry::StorageRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::DavError;
use crate::item::{ItemKind, PimItem};

/// Outcome taxonomy of storage operations.
///
/// Unrecoverable protocol errors collapse into `Fail`; the message keeps
/// the underlying cause for logs. Batch operations are all-or-nothing at
/// this level: on `Fail` the outputs are discarded, though the server may
/// have applied a partial effect and the caller must re-query on retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage operation failed: {0}")]
    Fail(String),
    #[error("operation not supported by this storage")]
    NotSupported,
    #[error("no transfer in progress")]
    NotInProgress,
}

impl From<DavError> for StorageError {
    fn from(err: DavError) -> Self {
        match err {
            DavError::NotSupported => StorageError::NotSupported,
            other => StorageError::Fail(other.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A PIM item store.
///
/// `add_items`/`modify_items` return the server-assigned ids and revisions
/// in input order; `get_items` returns bodies in input order. Streaming
/// readers come from [`item_stream`](Storage::item_stream), which spawns
/// the background producer for DAV-backed stores.
#[async_trait]
pub trait Storage: Send {
    fn kind(&self) -> ItemKind;

    /// Connect and discover the underlying collection.
    async fn init(&mut self) -> StorageResult<()>;

    async fn get_item(&mut self, id: &str) -> StorageResult<PimItem> {
        let items = self.get_items(std::slice::from_ref(&id.to_string())).await?;
        items
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Fail(format!("item {id} not found")))
    }

    async fn get_items(&mut self, ids: &[String]) -> StorageResult<Vec<PimItem>>;

    async fn add_item(&mut self, item: &PimItem) -> StorageResult<(String, String)> {
        let mut out = self.add_items(std::slice::from_ref(item)).await?;
        out.pop()
            .ok_or_else(|| StorageError::Fail("add returned no identity".to_string()))
    }

    /// Returns `(id, revision)` per added item.
    async fn add_items(&mut self, items: &[PimItem]) -> StorageResult<Vec<(String, String)>>;

    async fn modify_item(&mut self, id: &str, item: &PimItem) -> StorageResult<String> {
        let mut out = self
            .modify_items(std::slice::from_ref(&id.to_string()), std::slice::from_ref(item))
            .await?;
        out.pop()
            .ok_or_else(|| StorageError::Fail("modify returned no revision".to_string()))
    }

    /// Returns the new revision per modified item.
    async fn modify_items(&mut self, ids: &[String], items: &[PimItem])
    -> StorageResult<Vec<String>>;

    async fn remove_item(&mut self, id: &str) -> StorageResult<()> {
        self.remove_items(std::slice::from_ref(&id.to_string())).await
    }

    async fn remove_items(&mut self, ids: &[String]) -> StorageResult<()>;

    /// Current id → revision map of the whole collection.
    async fn get_revisions(&mut self) -> StorageResult<HashMap<String, String>>;

    /// Incremental change detection: id → revision of changed items plus
    /// the ids removed since the given token. Stores without server-side
    /// change tracking answer `NotSupported`.
    async fn get_changed_revisions(
        &mut self,
        sync_token: &str,
    ) -> StorageResult<(HashMap<String, String>, Vec<String>)>;

    async fn get_latest_sync_token(&mut self) -> StorageResult<String>;

    /// Open a streaming reader over all items.
    async fn item_stream(&mut self) -> StorageResult<ItemStream>;

    /// Number of items known after `init`/listing.
    fn total_count(&self) -> usize;

    fn suspend(&self) -> StorageResult<()>;
    fn resume(&self) -> StorageResult<()>;
    fn cancel(&self) -> StorageResult<()>;

    /// Fetch-time hint: fields the current sync phase ignores. Stores may
    /// use it to elide payload, the default does nothing.
    fn set_ignored_fields(&mut self, _fields: &[String]) {}
}
