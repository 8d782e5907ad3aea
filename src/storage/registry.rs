//! Registry of storage constructors keyed by plugin name.
//!
//! Hosts register factories at startup (or take the DAV defaults) and the
//! sync engines instantiate both sides of a run by name, with nested
//! parameter maps forwarded verbatim.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::caldav::CalDavHelper;
use crate::carddav::CardDavHelper;
use crate::common::http::TlsMode;
use crate::item::ItemKind;
use crate::storage::caldav::CalDavStorage;
use crate::storage::carddav::CardDavStorage;
use crate::storage::{Storage, StorageError, StorageResult};
use crate::webdav::client::{AuthScheme, BearerAuthorizer, ClientConfig, WebDavClient};

pub type StorageFactory = Arc<dyn Fn(&Value) -> StorageResult<Box<dyn Storage>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StorageRegistry {
    factories: Arc<RwLock<HashMap<String, StorageFactory>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `carddav` and `caldav` plugins.
    pub fn with_dav_plugins() -> Self {
        let registry = Self::new();
        registry.register("carddav", |params| {
            let client = client_from_params(params)?;
            let helper = match string_param(params, "addressbook_url") {
                Some(url) => CardDavHelper::with_collection(client, url),
                None => CardDavHelper::new(client, required_param(params, "server_url")?),
            };
            Ok(Box::new(CardDavStorage::new(helper)) as Box<dyn Storage>)
        });
        registry.register("caldav", |params| {
            let client = client_from_params(params)?;
            let kind = match string_param(params, "item_type").as_deref() {
                Some("task") => ItemKind::Task,
                _ => ItemKind::Event,
            };
            let helper = match string_param(params, "calendar_url") {
                Some(url) => CalDavHelper::with_collection(client, url, kind)?,
                None => CalDavHelper::new(
                    client,
                    required_param(params, "server_url")?,
                    kind,
                    string_param(params, "calendar_name"),
                )?,
            };
            Ok(Box::new(CalDavStorage::new(helper)) as Box<dyn Storage>)
        });
        registry
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&Value) -> StorageResult<Box<dyn Storage>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.factories.read().unwrap().contains_key(name)
    }

    pub fn create(&self, name: &str, params: &Value) -> StorageResult<Box<dyn Storage>> {
        let factory = self
            .factories
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::Fail(format!("unknown storage plugin {name}")))?;
        factory(params)
    }
}

fn string_param(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_param(params: &Value, key: &str) -> StorageResult<String> {
    string_param(params, key)
        .ok_or_else(|| StorageError::Fail(format!("parameter '{key}' not provided")))
}

/// Build the request engine from a plugin parameter map.
///
/// Recognized keys: `server_url`/`addressbook_url`/`calendar_url`,
/// `login` + `password` (Basic), `access_token` (bearer, obtained by the
/// host's own OAuth2 flow), `user_agent`, `verify_tls`, `trace`,
/// `timeout_secs`.
fn client_from_params(params: &Value) -> StorageResult<WebDavClient> {
    let base_url = string_param(params, "server_url")
        .or_else(|| string_param(params, "addressbook_url"))
        .or_else(|| string_param(params, "calendar_url"))
        .ok_or_else(|| StorageError::Fail("no server or collection URL provided".to_string()))?;

    let mut config = ClientConfig::new(base_url);

    match (
        string_param(params, "login"),
        string_param(params, "password"),
    ) {
        (Some(login), Some(password)) => {
            config.auth = AuthScheme::Basic {
                username: login,
                password,
            };
        }
        _ => {
            if let Some(token) = string_param(params, "access_token") {
                config.auth = AuthScheme::Authorizer(Arc::new(BearerAuthorizer::new(token)));
            } else if string_param(params, "refresh_token").is_some() {
                // Token refresh lives in the host; the engine only carries
                // a ready access token.
                return Err(StorageError::Fail(
                    "refresh_token given without access_token".to_string(),
                ));
            }
        }
    }

    if let Some(agent) = string_param(params, "user_agent") {
        config.user_agent = agent;
    }
    if params.get("verify_tls").and_then(Value::as_bool) == Some(false) {
        config.tls = TlsMode::DangerNoVerify;
    }
    if params.get("trace").and_then(Value::as_bool) == Some(true) {
        config.trace = true;
    }
    if let Some(secs) = params.get("timeout_secs").and_then(Value::as_u64) {
        config.timeout = Duration::from_secs(secs);
    }

    WebDavClient::new(config).map_err(|err| StorageError::Fail(err.to_string()))
}
