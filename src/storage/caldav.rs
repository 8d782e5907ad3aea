//! DAV-backed calendar storage for events and tasks.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::caldav::CalDavHelper;
use crate::carddav::ItemMetadata;
use crate::error::DavResult;
use crate::item::{ItemKind, PimItem};
use crate::storage::iterator::{BatchFetcher, ItemStream};
use crate::storage::{Storage, StorageError, StorageResult};

/// Calendar collection exposed through the [`Storage`] contract.
pub struct CalDavStorage {
    helper: CalDavHelper,
    stream: Option<ItemStream>,
    ignored_fields: Vec<String>,
}

impl CalDavStorage {
    pub fn new(helper: CalDavHelper) -> Self {
        Self {
            helper,
            stream: None,
            ignored_fields: Vec::new(),
        }
    }

    pub fn helper(&self) -> &CalDavHelper {
        &self.helper
    }

    /// Fields the current sync phase asked to ignore at fetch time.
    pub fn ignored_fields(&self) -> &[String] {
        &self.ignored_fields
    }

    fn parse_fetched(
        kind: ItemKind,
        fetched: Vec<crate::carddav::FetchedItem>,
        batch: &[ItemMetadata],
    ) -> Vec<PimItem> {
        let mut items = Vec::with_capacity(fetched.len());
        for entry in fetched {
            match PimItem::parse_calendar(&entry.data, kind) {
                Ok(mut item) => {
                    let etag = if entry.etag.is_empty() {
                        batch
                            .iter()
                            .find(|m| m.uri == entry.uri)
                            .map(|m| m.etag.clone())
                            .unwrap_or_default()
                    } else {
                        entry.etag
                    };
                    item.set_id(entry.uri, false);
                    item.set_revision(etag);
                    items.push(item);
                }
                Err(err) => {
                    tracing::warn!(uri = entry.uri, "rejecting calendar item: {err}");
                }
            }
        }
        items
    }
}

struct CalendarFetcher {
    helper: CalDavHelper,
}

#[async_trait]
impl BatchFetcher for CalendarFetcher {
    async fn fetch(&mut self, batch: &[ItemMetadata]) -> DavResult<Vec<PimItem>> {
        let hrefs: Vec<String> = batch.iter().map(|m| m.uri.clone()).collect();
        let fetched = self.helper.fetch_items(&hrefs).await?;
        Ok(CalDavStorage::parse_fetched(self.helper.kind(), fetched, batch))
    }
}

#[async_trait]
impl Storage for CalDavStorage {
    fn kind(&self) -> ItemKind {
        self.helper.kind()
    }

    async fn init(&mut self) -> StorageResult<()> {
        self.helper.discover().await?;
        self.helper.query_collection_metadata().await?;
        Ok(())
    }

    async fn get_items(&mut self, ids: &[String]) -> StorageResult<Vec<PimItem>> {
        let fetched = self.helper.fetch_items(ids).await?;
        let metadata: Vec<ItemMetadata> = self.helper.items_metadata().to_vec();
        let items = Self::parse_fetched(self.helper.kind(), fetched, &metadata);
        if items.len() != ids.len() {
            return Err(StorageError::Fail(format!(
                "requested {} calendar items, server returned {}",
                ids.len(),
                items.len()
            )));
        }
        Ok(items)
    }

    async fn add_items(&mut self, items: &[PimItem]) -> StorageResult<Vec<(String, String)>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let identity = self.helper.create_item(item.raw()).await?;
            out.push(identity);
        }
        Ok(out)
    }

    async fn modify_items(
        &mut self,
        ids: &[String],
        items: &[PimItem],
    ) -> StorageResult<Vec<String>> {
        if ids.len() != items.len() {
            return Err(StorageError::Fail(
                "modify batch ids and items differ in length".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(ids.len());
        for (id, item) in ids.iter().zip(items) {
            let etag = (!item.revision().is_empty()).then(|| item.revision().to_string());
            let new_etag = self.helper.modify_item(id, item.raw(), etag.as_deref()).await?;
            out.push(new_etag);
        }
        Ok(out)
    }

    async fn remove_items(&mut self, ids: &[String]) -> StorageResult<()> {
        for id in ids {
            self.helper.remove_item(id, None).await?;
        }
        Ok(())
    }

    async fn get_revisions(&mut self) -> StorageResult<HashMap<String, String>> {
        self.helper.list_items().await?;
        Ok(self
            .helper
            .items_metadata()
            .iter()
            .map(|m| (m.uri.clone(), m.etag.clone()))
            .collect())
    }

    async fn get_changed_revisions(
        &mut self,
        sync_token: &str,
    ) -> StorageResult<(HashMap<String, String>, Vec<String>)> {
        let removed = self.helper.query_changed(sync_token).await?;
        let revisions = self
            .helper
            .items_metadata()
            .iter()
            .map(|m| (m.uri.clone(), m.etag.clone()))
            .collect();
        Ok((revisions, removed))
    }

    async fn get_latest_sync_token(&mut self) -> StorageResult<String> {
        self.helper.query_collection_metadata().await?;
        self.helper
            .sync_token()
            .map(str::to_string)
            .ok_or(StorageError::NotSupported)
    }

    async fn item_stream(&mut self) -> StorageResult<ItemStream> {
        self.helper.list_items().await?;
        let fetcher = CalendarFetcher {
            helper: self.helper.clone(),
        };
        let stream = ItemStream::spawn(self.helper.items_metadata().to_vec(), Box::new(fetcher));
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    fn total_count(&self) -> usize {
        self.helper.total_count()
    }

    fn suspend(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) if !stream.is_finished() => {
                stream.suspend();
                Ok(())
            }
            _ => Err(StorageError::NotInProgress),
        }
    }

    fn resume(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) if !stream.is_finished() => {
                stream.resume();
                Ok(())
            }
            _ => Err(StorageError::NotInProgress),
        }
    }

    fn cancel(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) => {
                stream.cancel();
                Ok(())
            }
            None => Err(StorageError::NotInProgress),
        }
    }

    fn set_ignored_fields(&mut self, fields: &[String]) {
        self.ignored_fields = fields.to_vec();
    }
}
