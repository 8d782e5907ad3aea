//! CardDAV protocol helper: discovery, change detection and item I/O for
//! one addressbook collection.

use bytes::Bytes;

use crate::common::http::url_host_part;
use crate::error::{DavError, DavResult};
use crate::webdav::client::WebDavClient;
use crate::webdav::types::{Depth, ERROR_UID_CONFLICT, Multistatus, props};
use crate::webdav::xml::{build_multiget_body, build_sync_collection_body, parse_multistatus};

pub const CARDDAV_NAMESPACE: &str = "urn:ietf:params:xml:ns:carddav";
const VCARD_CONTENT_TYPE: &str = "text/vcard; charset=utf-8";

/// `(uri, etag)` pair of one item in the collection listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub uri: String,
    pub etag: String,
}

/// One downloaded item body with the identity it was served under.
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub uri: String,
    pub etag: String,
    pub data: String,
}

/// Discovery ladder shared by the DAV helpers.
///
/// `Start → FindPrincipal → FindHomeSet → FindCollections → Ready`; every
/// transition issues a PROPFIND and requires a 207 answer. A caller that
/// already knows the collection URL short-circuits into `Ready` with a
/// single `Depth: 1` PROPFIND on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Start,
    FindPrincipal,
    FindHomeSet,
    FindCollections,
    Ready,
}

#[derive(Clone)]
pub struct CardDavHelper {
    client: WebDavClient,
    server_url: String,
    principal_url: Option<String>,
    home_set_url: Option<String>,
    addressbook_url: Option<String>,
    display_name: Option<String>,
    ctag: Option<String>,
    sync_token: Option<String>,
    items_metadata: Vec<ItemMetadata>,
    state: DiscoveryState,
}

impl CardDavHelper {
    /// Helper that discovers the default addressbook starting from the
    /// server URL.
    pub fn new(client: WebDavClient, server_url: impl Into<String>) -> Self {
        Self {
            client,
            server_url: server_url.into(),
            principal_url: None,
            home_set_url: None,
            addressbook_url: None,
            display_name: None,
            ctag: None,
            sync_token: None,
            items_metadata: Vec::new(),
            state: DiscoveryState::Start,
        }
    }

    /// Helper bound to a known addressbook collection URL.
    pub fn with_collection(client: WebDavClient, addressbook_url: impl Into<String>) -> Self {
        let addressbook_url = addressbook_url.into();
        let mut helper = Self::new(client, addressbook_url.clone());
        helper.addressbook_url = Some(addressbook_url);
        helper
    }

    pub fn addressbook_url(&self) -> Option<&str> {
        self.addressbook_url.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn ctag(&self) -> Option<&str> {
        self.ctag.as_deref()
    }

    /// Baseline token for incremental change detection, refreshed by
    /// [`query_collection_metadata`](Self::query_collection_metadata) and
    /// [`query_changed`](Self::query_changed).
    pub fn sync_token(&self) -> Option<&str> {
        self.sync_token.as_deref()
    }

    pub fn items_metadata(&self) -> &[ItemMetadata] {
        &self.items_metadata
    }

    pub fn total_count(&self) -> usize {
        self.items_metadata.len()
    }

    pub fn is_ready(&self) -> bool {
        self.state == DiscoveryState::Ready
    }

    /// Run the discovery ladder until the addressbook collection is known.
    pub async fn discover(&mut self) -> DavResult<()> {
        if self.state == DiscoveryState::Ready {
            return Ok(());
        }
        if self.addressbook_url.is_some() {
            self.probe_collection().await?;
            self.state = DiscoveryState::Ready;
            return Ok(());
        }

        self.state = DiscoveryState::FindPrincipal;
        self.find_principal().await?;
        self.state = DiscoveryState::FindHomeSet;
        self.find_home_set().await?;
        self.state = DiscoveryState::FindCollections;
        self.find_addressbooks().await?;
        self.state = DiscoveryState::Ready;
        tracing::debug!(
            addressbook = self.addressbook_url.as_deref().unwrap_or_default(),
            "discovery finished"
        );
        Ok(())
    }

    async fn find_principal(&mut self) -> DavResult<()> {
        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:current-user-principal/></D:prop></D:propfind>"#;
        let status = self
            .propfind_multistatus(&self.server_url.clone(), Depth::Zero, body)
            .await?;

        let principal = status
            .responses
            .iter()
            .find_map(|r| r.prop(props::CURRENT_USER_PRINCIPAL_HREF))
            .ok_or_else(|| DavError::ServerProtocol {
                code: 207,
                description: "no current-user-principal in response".to_string(),
            })?;
        self.principal_url = Some(resolve_href(&self.server_url, principal)?);
        Ok(())
    }

    async fn find_home_set(&mut self) -> DavResult<()> {
        let principal = self.principal_url.clone().expect("principal discovered");
        let body = format!(
            r#"<D:propfind xmlns:D="DAV:" xmlns:C="{CARDDAV_NAMESPACE}"><D:prop><C:addressbook-home-set/></D:prop></D:propfind>"#
        );
        let status = self
            .propfind_multistatus(&principal, Depth::Zero, &body)
            .await?;

        let home_set = status
            .responses
            .iter()
            .find_map(|r| r.prop(props::ADDRESSBOOK_HOME_SET_HREF))
            .ok_or_else(|| DavError::ServerProtocol {
                code: 207,
                description: "no addressbook-home-set in response".to_string(),
            })?;
        self.home_set_url = Some(resolve_href(&principal, home_set)?);
        Ok(())
    }

    async fn find_addressbooks(&mut self) -> DavResult<()> {
        let home_set = self.home_set_url.clone().expect("home set discovered");
        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:displayname/></D:prop></D:propfind>"#;
        let status = self
            .propfind_multistatus(&home_set, Depth::One, body)
            .await?;

        for response in &status.responses {
            if response.has_prop(props::RESOURCE_TYPE_ADDRESSBOOK) {
                self.addressbook_url = Some(resolve_href(&home_set, &response.href)?);
                self.display_name = response.prop(props::DISPLAY_NAME).map(str::to_string);
                return Ok(());
            }
        }
        Err(DavError::ServerProtocol {
            code: 207,
            description: "home set contains no addressbook collection".to_string(),
        })
    }

    /// Single `Depth: 1` PROPFIND used when the collection URL was given
    /// directly, to recover the display name.
    async fn probe_collection(&mut self) -> DavResult<()> {
        let url = self.addressbook_url.clone().expect("collection url set");
        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:displayname/></D:prop></D:propfind>"#;
        let status = self.propfind_multistatus(&url, Depth::One, body).await?;
        self.display_name = status
            .responses
            .iter()
            .find(|r| r.has_prop(props::RESOURCE_TYPE_ADDRESSBOOK))
            .and_then(|r| r.prop(props::DISPLAY_NAME))
            .map(str::to_string);
        Ok(())
    }

    /// `PROPFIND Depth: 0` for `displayname`, `getctag` and `sync-token`.
    /// The returned token becomes the baseline for incremental change
    /// detection.
    pub async fn query_collection_metadata(&mut self) -> DavResult<()> {
        let url = self.collection_url()?;
        let body = r#"<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/"><D:prop><D:displayname/><CS:getctag/><D:sync-token/></D:prop></D:propfind>"#;
        let status = self.propfind_multistatus(&url, Depth::Zero, body).await?;

        if let Some(response) = status.responses.first() {
            if let Some(name) = response.prop(props::DISPLAY_NAME) {
                self.display_name = Some(name.to_string());
            }
            self.ctag = response.prop(props::CTAG).map(str::to_string);
            if let Some(token) = response.prop(props::SYNC_TOKEN) {
                self.sync_token = Some(token.to_string());
            }
        }
        Ok(())
    }

    /// Full listing: `PROPFIND Depth: 1` for `getetag` and `resourcetype`.
    /// Responses with a present-but-empty `resourcetype` are items.
    pub async fn list_items(&mut self) -> DavResult<()> {
        let url = self.collection_url()?;
        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:getetag/><D:resourcetype/></D:prop></D:propfind>"#;
        let status = self.propfind_multistatus(&url, Depth::One, body).await?;

        self.items_metadata.clear();
        for response in &status.responses {
            if response.prop(props::RESOURCE_TYPE) != Some("") {
                continue;
            }
            if let Some(etag) = response.prop(props::ETAG) {
                self.items_metadata.push(ItemMetadata {
                    uri: response.href.clone(),
                    etag: etag.to_string(),
                });
            }
        }
        tracing::debug!(count = self.items_metadata.len(), "listed addressbook items");
        Ok(())
    }

    /// Incremental listing via a `sync-collection` REPORT (RFC 6578).
    ///
    /// Replaces `items_metadata` with the additions/modifications since the
    /// given token and returns the removed hrefs. The token embedded in the
    /// multistatus body becomes the new baseline.
    pub async fn query_changed(&mut self, sync_token: &str) -> DavResult<Vec<String>> {
        if url_host_part(&self.server_url)? == "https://www.googleapis.com" {
            // Google's CardDAV endpoint rejects sync-collection reports.
            return Err(DavError::NotSupported);
        }

        let url = self.collection_url()?;
        let body = build_sync_collection_body(Some(sync_token));
        let response = self.client.report(&url, Depth::Zero, &body).await?;
        let code = response.status().as_u16();
        if code != 207 {
            return Err(DavError::from_status(code));
        }

        let status = parse_multistatus(&String::from_utf8_lossy(response.body()))?;
        self.items_metadata.clear();
        let mut removed = Vec::new();
        for response in &status.responses {
            match response.prop(props::ETAG) {
                Some(etag) => self.items_metadata.push(ItemMetadata {
                    uri: response.href.clone(),
                    etag: etag.to_string(),
                }),
                None => removed.push(response.href.clone()),
            }
        }
        if let Some(token) = status.sync_token {
            self.sync_token = Some(token);
        }
        tracing::debug!(
            changed = self.items_metadata.len(),
            removed = removed.len(),
            "incremental change report"
        );
        Ok(removed)
    }

    /// Batched fetch via `addressbook-multiget`.
    ///
    /// The output is reordered to match the input href order (Google does
    /// not preserve it) and the vCard bodies are cleaned of transport
    /// artifacts.
    pub async fn fetch_items(&self, hrefs: &[String]) -> DavResult<Vec<FetchedItem>> {
        let Some(body) = build_multiget_body(
            "addressbook-multiget",
            CARDDAV_NAMESPACE,
            "address-data",
            hrefs,
        ) else {
            return Ok(Vec::new());
        };

        let url = self.collection_url()?;
        let response = self.client.report(&url, Depth::One, &body).await?;
        let code = response.status().as_u16();
        if code != 207 {
            return Err(DavError::from_status(code));
        }

        let status = parse_multistatus(&String::from_utf8_lossy(response.body()))?;
        let mut by_href: std::collections::HashMap<&str, (&str, &str)> = status
            .responses
            .iter()
            .filter_map(|r| {
                r.prop(props::ADDRESS_DATA)
                    .map(|data| (r.href.as_str(), (r.prop(props::ETAG).unwrap_or(""), data)))
            })
            .collect();

        let mut out = Vec::with_capacity(hrefs.len());
        for href in hrefs {
            if let Some((etag, data)) = by_href.remove(href.as_str()) {
                out.push(FetchedItem {
                    uri: href.clone(),
                    etag: etag.to_string(),
                    data: postprocess_vcard(data),
                });
            } else {
                tracing::debug!(href, "multiget response missing requested href");
            }
        }
        Ok(out)
    }

    /// Create a contact with a `POST` to the collection URL.
    ///
    /// Servers answer 201 with `Location`/`ETag` headers or 207 with a
    /// `getetag` property; Google answers success without headers, in which
    /// case a single-item PROPFIND recovers the pair without leaking any
    /// listing state.
    pub async fn create_item(&mut self, vcard: &str) -> DavResult<(String, String)> {
        let url = self.collection_url()?;
        let response = self
            .client
            .post(&url, Bytes::from(vcard.to_owned()), VCARD_CONTENT_TYPE)
            .await?;
        let code = response.status().as_u16();

        match code {
            201 | 200 | 204 => {
                let uri = WebDavClient::location_from_headers(response.headers())
                    .ok_or_else(|| DavError::ServerProtocol {
                        code,
                        description: "create response lacks a Location header".to_string(),
                    })?;
                match WebDavClient::etag_from_headers(response.headers()) {
                    Some(etag) => Ok((uri, etag)),
                    None => {
                        let snapshot = std::mem::take(&mut self.items_metadata);
                        let result = self.query_item_metadata(&uri).await;
                        self.items_metadata = snapshot;
                        result
                    }
                }
            }
            207 => {
                let status = parse_multistatus(&String::from_utf8_lossy(response.body()))?;
                for response in &status.responses {
                    if let Some(etag) = response.prop(props::ETAG) {
                        return Ok((response.href.clone(), etag.to_string()));
                    }
                    if response.has_error(ERROR_UID_CONFLICT) {
                        return Err(DavError::UidConflict);
                    }
                }
                Err(DavError::ServerProtocol {
                    code,
                    description: "create multistatus carries no etag".to_string(),
                })
            }
            _ => Err(DavError::from_status(code)),
        }
    }

    /// Replace a contact with a `PUT`, guarded by `If-Match` when the old
    /// ETag is supplied. Returns the new ETag.
    pub async fn modify_item(
        &mut self,
        uri: &str,
        vcard: &str,
        etag: Option<&str>,
    ) -> DavResult<String> {
        let response = self
            .client
            .put(uri, Bytes::from(vcard.to_owned()), VCARD_CONTENT_TYPE, etag)
            .await?;
        let code = response.status().as_u16();
        match code {
            200 | 201 | 204 => match WebDavClient::etag_from_headers(response.headers()) {
                Some(etag) => Ok(etag),
                None => Ok(self.query_item_metadata(uri).await?.1),
            },
            412 => Err(DavError::PreconditionFailed),
            _ => Err(DavError::from_status(code)),
        }
    }

    /// Delete a contact, optionally guarded by `If-Match`.
    pub async fn remove_item(&mut self, uri: &str, etag: Option<&str>) -> DavResult<()> {
        let response = self.client.delete(uri, etag).await?;
        let code = response.status().as_u16();
        match code {
            204 => Ok(()),
            _ => Err(DavError::from_status(code)),
        }
    }

    /// Recover `(uri, etag)` of a single item via `PROPFIND Depth: 0`.
    async fn query_item_metadata(&self, uri: &str) -> DavResult<(String, String)> {
        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:getetag/></D:prop></D:propfind>"#;
        let status = self.propfind_multistatus(uri, Depth::Zero, body).await?;
        status
            .responses
            .iter()
            .find_map(|r| {
                r.prop(props::ETAG)
                    .map(|etag| (uri.to_string(), etag.to_string()))
            })
            .ok_or_else(|| DavError::ServerProtocol {
                code: 207,
                description: "item metadata query returned no etag".to_string(),
            })
    }

    async fn propfind_multistatus(
        &self,
        url: &str,
        depth: Depth,
        body: &str,
    ) -> DavResult<Multistatus> {
        let response = self.client.propfind(url, depth, body).await?;
        let code = response.status().as_u16();
        if code != 207 {
            return Err(DavError::from_status(code));
        }
        parse_multistatus(&String::from_utf8_lossy(response.body()))
    }

    fn collection_url(&self) -> DavResult<String> {
        self.addressbook_url
            .clone()
            .ok_or_else(|| DavError::ServerProtocol {
                code: 0,
                description: "addressbook collection not discovered yet".to_string(),
            })
    }
}

/// Resolve a root-relative href against the host part of the URL the
/// response came from.
pub(crate) fn resolve_href(base_url: &str, href: &str) -> DavResult<String> {
    if href.starts_with('/') {
        Ok(format!("{}{}", url_host_part(base_url)?, href))
    } else {
        Ok(href.to_string())
    }
}

/// Clean transport artifacts out of a downloaded vCard: Google escapes
/// `:`, XML entities may survive in NOTE fields, and Google/iCloud group
/// custom-labelled fields under `itemN.` prefixes.
pub(crate) fn postprocess_vcard(data: &str) -> String {
    let data = data.replace("\\:", ":").replace("&lt;", "<").replace("&gt;", ">");
    let mut out = String::with_capacity(data.len());
    for line in data.lines() {
        if line.starts_with("item")
            && let Some(dot) = line.find('.')
            && line[4..dot].chars().all(|c| c.is_ascii_digit())
        {
            out.push_str(&line[dot + 1..]);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}
