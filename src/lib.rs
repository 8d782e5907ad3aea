//! PIM data synchronization over CardDAV/CalDAV.
//!
//! This library mirrors address-book contacts (vCard 3.0) and calendar
//! events/tasks (iCalendar 2.0) between a remote DAV collection and a
//! local store. It is built on hyper 1.x, rustls and tokio.
//!
//! # Features
//!
//! - WebDAV discovery (principal → home set → collections) and multistatus
//!   parsing with a namespace-agnostic property model
//! - Change detection via sync-tokens and ETag-conditional writes
//! - Streaming item download: a background producer overlaps multiget
//!   fetches with consumer iteration, with suspend/resume/cancel
//! - Field-level item identity (key vs. conflict checks) driving match
//!   decisions
//! - One-way mirroring and two-way reconciliation with persisted metadata
//!   and conflict duplication
//!
//! # Talking to a server
//!
//! ```no_run
//! use pim_dav_sync::carddav::CardDavHelper;
//! use pim_dav_sync::webdav::{ClientConfig, WebDavClient};
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = WebDavClient::new(
//!         ClientConfig::new("https://dav.example.com/")
//!             .basic_auth("user01", "secret"),
//!     )?;
//!
//!     let mut helper = CardDavHelper::new(client, "https://dav.example.com/");
//!     helper.discover().await?;
//!     helper.query_collection_metadata().await?;
//!     println!(
//!         "addressbook {:?}, sync token {:?}",
//!         helper.display_name(),
//!         helper.sync_token()
//!     );
//!
//!     helper.list_items().await?;
//!     let hrefs: Vec<String> = helper
//!         .items_metadata()
//!         .iter()
//!         .map(|m| m.uri.clone())
//!         .collect();
//!     for item in helper.fetch_items(&hrefs).await? {
//!         println!("{}: {} bytes", item.uri, item.data.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Running a two-way sync
//!
//! ```no_run
//! use std::sync::Arc;
//! use pim_dav_sync::item::{CheckRegistry, ItemKind};
//! use pim_dav_sync::storage::StorageRegistry;
//! use pim_dav_sync::sync::{SyncCallback, SyncOptions, SyncResult, TwoWaySync};
//! use serde_json::json;
//!
//! struct Printer;
//! impl SyncCallback for Printer {
//!     fn sync_finished(&self, result: SyncResult) {
//!         println!("sync finished: {result:?}");
//!     }
//!     fn metadata_updated(&self, json: &str) {
//!         // persist for the next run
//!         std::fs::write("sync-metadata.json", json).ok();
//!     }
//! }
//!
//! # fn main() {
//! let options = SyncOptions {
//!     remote_plugin: "carddav".into(),
//!     remote_plugin_params: json!({
//!         "server_url": "https://dav.example.com/",
//!         "login": "user01",
//!         "password": "secret",
//!     }),
//!     local_plugin: "my-device-store".into(),
//!     callback: Some(Arc::new(Printer)),
//!     metadata: std::fs::read_to_string("sync-metadata.json").unwrap_or_default(),
//!     ..SyncOptions::default()
//! };
//!
//! let registry = StorageRegistry::with_dav_plugins();
//! // registry.register("my-device-store", |params| ...);
//! let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));
//! let engine = TwoWaySync::new(options, registry, checks);
//! engine.synchronize(); // runs on a background worker
//! # }
//! ```

pub mod caldav;
pub mod carddav;
pub mod common;
pub mod error;
pub mod item;
pub mod storage;
pub mod sync;
pub mod webdav;

pub use caldav::CalDavHelper;
pub use carddav::{CardDavHelper, FetchedItem, ItemMetadata};
pub use error::{DavError, DavResult, describe_status};
pub use item::{CheckRegistry, CheckRole, ItemIndex, ItemKind, PimItem};
pub use storage::{
    CalDavStorage, CardDavStorage, ItemStream, Storage, StorageError, StorageRegistry,
    StreamStatus,
};
pub use sync::{
    OneWaySync, SyncCallback, SyncMetadata, SyncOptions, SyncPhase, SyncResult, SyncStats,
    TwoWaySync,
};
pub use webdav::{
    AuthScheme, Authorizer, ClientConfig, DavResponse, Depth, Multistatus, PropStat, WebDavClient,
    parse_multistatus,
};
