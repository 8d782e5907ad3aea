//! CalDAV protocol helper: discovery, change detection and item I/O for
//! one calendar collection holding events or tasks.

use bytes::Bytes;

use crate::carddav::{DiscoveryState, FetchedItem, ItemMetadata, resolve_href};
use crate::error::{DavError, DavResult};
use crate::item::ItemKind;
use crate::item::contact::extract_uid;
use crate::webdav::client::WebDavClient;
use crate::webdav::types::{Depth, ERROR_UID_CONFLICT, Multistatus, props};
use crate::webdav::xml::{build_multiget_body, build_sync_collection_body, parse_multistatus};

pub const CALDAV_NAMESPACE: &str = "urn:ietf:params:xml:ns:caldav";
const ICAL_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

#[derive(Clone)]
pub struct CalDavHelper {
    client: WebDavClient,
    server_url: String,
    kind: ItemKind,
    /// Display name of the calendar to pick during discovery; `None` takes
    /// the first calendar advertising the required component.
    calendar_name: Option<String>,
    principal_url: Option<String>,
    home_set_url: Option<String>,
    calendar_url: Option<String>,
    display_name: Option<String>,
    ctag: Option<String>,
    sync_token: Option<String>,
    items_metadata: Vec<ItemMetadata>,
    state: DiscoveryState,
}

impl CalDavHelper {
    /// Helper that discovers a calendar starting from the server URL.
    ///
    /// `kind` must be [`ItemKind::Event`] or [`ItemKind::Task`]; the chosen
    /// calendar has to advertise the matching component.
    pub fn new(
        client: WebDavClient,
        server_url: impl Into<String>,
        kind: ItemKind,
        calendar_name: Option<String>,
    ) -> DavResult<Self> {
        if kind.component_name().is_none() {
            return Err(DavError::NotSupported);
        }
        Ok(Self {
            client,
            server_url: server_url.into(),
            kind,
            calendar_name,
            principal_url: None,
            home_set_url: None,
            calendar_url: None,
            display_name: None,
            ctag: None,
            sync_token: None,
            items_metadata: Vec::new(),
            state: DiscoveryState::Start,
        })
    }

    /// Helper bound to a known calendar collection URL.
    pub fn with_collection(
        client: WebDavClient,
        calendar_url: impl Into<String>,
        kind: ItemKind,
    ) -> DavResult<Self> {
        let calendar_url = calendar_url.into();
        let mut helper = Self::new(client, calendar_url.clone(), kind, None)?;
        helper.calendar_url = Some(calendar_url);
        Ok(helper)
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn calendar_url(&self) -> Option<&str> {
        self.calendar_url.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn ctag(&self) -> Option<&str> {
        self.ctag.as_deref()
    }

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

    fn required_component(&self) -> &'static str {
        match self.kind {
            ItemKind::Task => props::SUPPORTED_COMPONENT_TODO,
            _ => props::SUPPORTED_COMPONENT_EVENT,
        }
    }

    /// Run the discovery ladder until a calendar advertising the required
    /// component is known.
    pub async fn discover(&mut self) -> DavResult<()> {
        if self.state == DiscoveryState::Ready {
            return Ok(());
        }
        if self.calendar_url.is_some() {
            self.probe_collection().await?;
            self.state = DiscoveryState::Ready;
            return Ok(());
        }

        self.state = DiscoveryState::FindPrincipal;
        self.find_principal().await?;
        self.state = DiscoveryState::FindHomeSet;
        self.find_home_set().await?;
        self.state = DiscoveryState::FindCollections;
        self.find_calendars().await?;
        self.state = DiscoveryState::Ready;
        tracing::debug!(
            calendar = self.calendar_url.as_deref().unwrap_or_default(),
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
            r#"<D:propfind xmlns:D="DAV:" xmlns:C="{CALDAV_NAMESPACE}"><D:prop><C:calendar-home-set/></D:prop></D:propfind>"#
        );
        let status = self
            .propfind_multistatus(&principal, Depth::Zero, &body)
            .await?;

        let home_set = status
            .responses
            .iter()
            .find_map(|r| r.prop(props::CALENDAR_HOME_SET_HREF))
            .ok_or_else(|| DavError::ServerProtocol {
                code: 207,
                description: "no calendar-home-set in response".to_string(),
            })?;
        self.home_set_url = Some(resolve_href(&principal, home_set)?);
        Ok(())
    }

    async fn find_calendars(&mut self) -> DavResult<()> {
        let home_set = self.home_set_url.clone().expect("home set discovered");
        let body = format!(
            r#"<D:propfind xmlns:D="DAV:" xmlns:C="{CALDAV_NAMESPACE}"><D:prop><D:resourcetype/><D:displayname/><C:supported-calendar-component-set/></D:prop></D:propfind>"#
        );
        let status = self
            .propfind_multistatus(&home_set, Depth::One, &body)
            .await?;

        let required = self.required_component();
        let mut name_matched = false;
        for response in &status.responses {
            if !response.has_prop(props::RESOURCE_TYPE_CALENDAR) {
                continue;
            }
            if let Some(wanted) = &self.calendar_name {
                if response.prop(props::DISPLAY_NAME) != Some(wanted.as_str()) {
                    continue;
                }
                name_matched = true;
            }
            if !response.has_prop(required) {
                if name_matched {
                    // The requested calendar cannot hold this item type.
                    return Err(DavError::NotSupported);
                }
                continue;
            }
            self.calendar_url = Some(resolve_href(&home_set, &response.href)?);
            self.display_name = response.prop(props::DISPLAY_NAME).map(str::to_string);
            return Ok(());
        }
        Err(DavError::ServerProtocol {
            code: 207,
            description: "no matching calendar collection found".to_string(),
        })
    }

    /// Single `Depth: 1` PROPFIND on a directly supplied collection URL,
    /// recovering the display name and validating the component set.
    async fn probe_collection(&mut self) -> DavResult<()> {
        let url = self.calendar_url.clone().expect("collection url set");
        let body = format!(
            r#"<D:propfind xmlns:D="DAV:" xmlns:C="{CALDAV_NAMESPACE}"><D:prop><D:resourcetype/><D:displayname/><C:supported-calendar-component-set/></D:prop></D:propfind>"#
        );
        let status = self.propfind_multistatus(&url, Depth::One, &body).await?;

        let calendar = status
            .responses
            .iter()
            .find(|r| r.has_prop(props::RESOURCE_TYPE_CALENDAR))
            .ok_or_else(|| DavError::ServerProtocol {
                code: 207,
                description: "URL does not point at a calendar collection".to_string(),
            })?;
        if !calendar.has_prop(self.required_component()) {
            return Err(DavError::NotSupported);
        }
        self.display_name = calendar.prop(props::DISPLAY_NAME).map(str::to_string);
        Ok(())
    }

    /// `PROPFIND Depth: 0` for `displayname`, `getctag` and `sync-token`.
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
        tracing::debug!(count = self.items_metadata.len(), "listed calendar items");
        Ok(())
    }

    /// Incremental listing via a `sync-collection` REPORT.
    ///
    /// Only hrefs ending in `.ics` are considered: iCloud slips a
    /// calendar-level entry into the report.
    pub async fn query_changed(&mut self, sync_token: &str) -> DavResult<Vec<String>> {
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
            if !response.href.ends_with(".ics") {
                continue;
            }
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
        Ok(removed)
    }

    /// Batched fetch via `calendar-multiget`, reordered to the input href
    /// order.
    pub async fn fetch_items(&self, hrefs: &[String]) -> DavResult<Vec<FetchedItem>> {
        let Some(body) =
            build_multiget_body("calendar-multiget", CALDAV_NAMESPACE, "calendar-data", hrefs)
        else {
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
                r.prop(props::CALENDAR_DATA)
                    .map(|data| (r.href.as_str(), (r.prop(props::ETAG).unwrap_or(""), data)))
            })
            .collect();

        let mut out = Vec::with_capacity(hrefs.len());
        for href in hrefs {
            if let Some((etag, data)) = by_href.remove(href.as_str()) {
                out.push(FetchedItem {
                    uri: href.clone(),
                    etag: etag.to_string(),
                    data: data.to_string(),
                });
            } else {
                tracing::debug!(href, "multiget response missing requested href");
            }
        }
        Ok(out)
    }

    /// Create an event/task by `PUT` to `<collection>/<UID>.ics`.
    ///
    /// The body must carry a UID; creation fails locally with
    /// [`DavError::MissingUid`] otherwise.
    pub async fn create_item(&mut self, ical: &str) -> DavResult<(String, String)> {
        let uid = extract_uid(ical).ok_or(DavError::MissingUid)?;
        let collection = self.collection_url()?;
        let uri = format!("{}/{}.ics", collection.trim_end_matches('/'), uid);

        let response = self
            .client
            .put(&uri, Bytes::from(ical.to_owned()), ICAL_CONTENT_TYPE, None)
            .await?;
        let code = response.status().as_u16();
        match code {
            200 | 201 | 204 => match WebDavClient::etag_from_headers(response.headers()) {
                Some(etag) => Ok((uri, etag)),
                None => {
                    let snapshot = std::mem::take(&mut self.items_metadata);
                    let result = self.query_item_metadata(&uri).await;
                    self.items_metadata = snapshot;
                    result
                }
            },
            207 => {
                let status = parse_multistatus(&String::from_utf8_lossy(response.body()))?;
                for response in &status.responses {
                    if response.has_error(ERROR_UID_CONFLICT) {
                        return Err(DavError::UidConflict);
                    }
                    if let Some(etag) = response.prop(props::ETAG) {
                        return Ok((response.href.clone(), etag.to_string()));
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

    /// Replace an event/task with a `PUT`, guarded by `If-Match` when the
    /// old ETag is supplied. Returns the new ETag.
    pub async fn modify_item(
        &mut self,
        uri: &str,
        ical: &str,
        etag: Option<&str>,
    ) -> DavResult<String> {
        let response = self
            .client
            .put(uri, Bytes::from(ical.to_owned()), ICAL_CONTENT_TYPE, etag)
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

    /// Delete an event/task, optionally guarded by `If-Match`.
    pub async fn remove_item(&mut self, uri: &str, etag: Option<&str>) -> DavResult<()> {
        let response = self.client.delete(uri, etag).await?;
        let code = response.status().as_u16();
        match code {
            204 => Ok(()),
            _ => Err(DavError::from_status(code)),
        }
    }

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
        self.calendar_url
            .clone()
            .ok_or_else(|| DavError::ServerProtocol {
                code: 0,
                description: "calendar collection not discovered yet".to_string(),
            })
    }
}
