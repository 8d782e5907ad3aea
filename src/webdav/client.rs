use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, Response, Uri, header};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

use crate::common::compression::{add_accept_encoding, decompress_body, detect_encoding};
use crate::common::http::{HyperClient, TlsMode, build_hyper_client};
use crate::error::{DavError, DavResult};
use crate::webdav::types::Depth;

/// Hook that injects an `Authorization` header into outgoing requests.
///
/// This is how OAuth2-style bearer tokens reach the wire: the host owns the
/// token lifecycle (refresh, expiry) and the engine only calls the hook
/// before dispatch. Mutually exclusive with Basic credentials by
/// construction, see [`AuthScheme`].
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &mut HeaderMap) -> DavResult<()>;
}

/// Authorizer carrying a fixed bearer token.
pub struct BearerAuthorizer {
    token: String,
}

impl BearerAuthorizer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authorizer for BearerAuthorizer {
    fn authorize(&self, headers: &mut HeaderMap) -> DavResult<()> {
        let value = header::HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| DavError::Auth)?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

/// Authentication scheme for a client. Basic credentials and an authorizer
/// hook cannot coexist.
#[derive(Clone, Default)]
pub enum AuthScheme {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Authorizer(Arc<dyn Authorizer>),
}

/// Configuration of the request engine.
pub struct ClientConfig {
    pub base_url: String,
    pub auth: AuthScheme,
    pub user_agent: String,
    pub tls: TlsMode,
    pub timeout: Duration,
    /// Log every request and response frame at `trace` level.
    pub trace: bool,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: AuthScheme::None,
            user_agent: concat!("pim-dav-sync/", env!("CARGO_PKG_VERSION")).to_string(),
            tls: TlsMode::Secure,
            timeout: Duration::from_secs(20),
            trace: false,
        }
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = AuthScheme::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.auth = AuthScheme::Authorizer(authorizer);
        self
    }
}

/// WebDAV request engine built on **hyper 1.x** + **rustls**.
///
/// Composes PROPFIND/REPORT/PUT/DELETE requests, drives them through the
/// pooled HTTP client, decompresses aggregated responses and surfaces the
/// status code plus headers to the protocol helpers.
///
/// Cloning `WebDavClient` is cheap and reuses the same connection pool.
#[derive(Clone)]
pub struct WebDavClient {
    base: Uri,
    client: HyperClient,
    auth_header: Option<header::HeaderValue>,
    authorizer: Option<Arc<dyn Authorizer>>,
    user_agent: header::HeaderValue,
    default_timeout: Duration,
    trace: bool,
}

impl WebDavClient {
    /// Create a new client from a [`ClientConfig`].
    ///
    /// The base may be `https://` **or** `http://` (both are supported by
    /// the connector).
    pub fn new(config: ClientConfig) -> DavResult<Self> {
        let client = build_hyper_client(config.tls)?;
        let base: Uri = config.base_url.parse()?;

        let (auth_header, authorizer) = match config.auth {
            AuthScheme::None => (None, None),
            AuthScheme::Basic { username, password } => {
                let token = format!("{}:{}", username, password);
                let val = format!("Basic {}", B64.encode(token));
                (Some(header::HeaderValue::from_str(&val)?), None)
            }
            AuthScheme::Authorizer(hook) => (None, Some(hook)),
        };

        Ok(Self {
            base,
            client,
            auth_header,
            authorizer,
            user_agent: header::HeaderValue::from_str(&config.user_agent)?,
            default_timeout: config.timeout,
            trace: config.trace,
        })
    }

    /// Base URL this client resolves relative paths against.
    pub fn base_url(&self) -> String {
        self.base.to_string()
    }

    pub fn build_uri(&self, path: &str) -> DavResult<Uri> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.parse()?);
        }

        let mut parts = self.base.clone().into_parts();
        let existing_path = parts
            .path_and_query
            .as_ref()
            .map(|pq| pq.path())
            .unwrap_or("/");

        let (path_only, query) = if let Some((p, q)) = path.split_once('?') {
            (p, Some(q))
        } else {
            (path, None)
        };

        let mut combined = if path_only.is_empty() {
            existing_path.to_string()
        } else if path_only.starts_with('/') {
            path_only.to_string()
        } else {
            let mut base = existing_path.trim_end_matches('/').to_string();
            if base.is_empty() {
                base.push('/');
            }
            if !base.ends_with('/') {
                base.push('/');
            }
            base.push_str(path_only);
            base
        };

        if combined.is_empty() {
            combined.push('/');
        }

        let path_and_query = if let Some(q) = query {
            format!("{}?{}", combined, q).parse()?
        } else {
            combined.parse()?
        };

        parts.path_and_query = Some(path_and_query);
        Ok(Uri::from_parts(parts)?)
    }

    /// Generic **aggregated send** with automatic decompression (br/zstd/gzip).
    ///
    /// Returns a `Response<Bytes>` where the body is fully aggregated and
    /// already decompressed. When `follow_redirect` is set, a `301` response
    /// is re-issued against the `Location` URL; chained redirects are
    /// permitted by recursion.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        body_bytes: Option<Bytes>,
        follow_redirect: bool,
    ) -> DavResult<Response<Bytes>> {
        let uri = self.build_uri(path)?;

        if let Some(auth) = &self.auth_header {
            headers.insert(header::AUTHORIZATION, auth.clone());
        } else if let Some(hook) = &self.authorizer {
            hook.authorize(&mut headers)?;
        }
        headers.insert(header::USER_AGENT, self.user_agent.clone());
        add_accept_encoding(&mut headers);

        if body_bytes.is_some() && !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/xml; charset=utf-8"),
            );
        }

        if self.trace {
            let body_text = body_bytes
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_else(|| "".into());
            tracing::trace!(method = %method, uri = %uri, body = %body_text, "request");
        }

        let mut req_builder = Request::builder().method(method.clone()).uri(uri.clone());
        for (k, v) in headers.iter() {
            req_builder = req_builder.header(k, v);
        }
        let req = req_builder.body(http_body_util::Full::new(
            body_bytes.clone().unwrap_or_default(),
        ))?;

        let fut = self.client.request(req);
        let resp = timeout(self.default_timeout, fut)
            .await
            .map_err(|_| DavError::Network("request timed out".into()))??;

        let encoding = detect_encoding(resp.headers());
        let (parts, body) = resp.into_parts();
        let decompressed = decompress_body(body, encoding).await?;
        let resp = Response::from_parts(parts, decompressed);

        if self.trace {
            tracing::trace!(
                status = %resp.status(),
                body = %String::from_utf8_lossy(resp.body()),
                "response"
            );
        }

        if follow_redirect && resp.status() == hyper::StatusCode::MOVED_PERMANENTLY {
            if let Some(location) = resp
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                tracing::debug!(location, "following 301 redirect");
                let location = location.to_string();
                let mut headers = headers;
                headers.remove(header::AUTHORIZATION);
                return Box::pin(self.send(method, &location, headers, body_bytes, true)).await;
            }
        }

        Ok(resp)
    }

    // ----------- HTTP/WebDAV verbs -----------

    /// Send a `PUT` with the given item body, optionally guarded by
    /// `If-Match`.
    ///
    /// The write only succeeds if the current resource ETag matches; a 412
    /// answer surfaces as [`DavError::PreconditionFailed`] in the helpers.
    pub async fn put(
        &self,
        path: &str,
        body: Bytes,
        content_type: &'static str,
        if_match: Option<&str>,
    ) -> DavResult<Response<Bytes>> {
        let mut h = HeaderMap::new();
        h.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(content_type),
        );
        if let Some(etag) = if_match {
            h.insert(header::IF_MATCH, header::HeaderValue::from_str(etag)?);
        }
        self.send(Method::PUT, path, h, Some(body), false).await
    }

    /// Send a `POST` with the given item body (CardDAV collection create).
    pub async fn post(
        &self,
        path: &str,
        body: Bytes,
        content_type: &'static str,
    ) -> DavResult<Response<Bytes>> {
        let mut h = HeaderMap::new();
        h.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(content_type),
        );
        self.send(Method::POST, path, h, Some(body), false).await
    }

    /// Send a `DELETE` request, optionally guarded by `If-Match`.
    pub async fn delete(&self, path: &str, if_match: Option<&str>) -> DavResult<Response<Bytes>> {
        let mut h = HeaderMap::new();
        if let Some(etag) = if_match {
            h.insert(header::IF_MATCH, header::HeaderValue::from_str(etag)?);
        }
        self.send(Method::DELETE, path, h, None, false).await
    }

    /// Send a WebDAV `PROPFIND` with a custom XML body and `Depth` header.
    ///
    /// Discovery steps follow redirects; some servers answer the initial
    /// well-known URL with a 301.
    pub async fn propfind(
        &self,
        path: &str,
        depth: Depth,
        xml_body: &str,
    ) -> DavResult<Response<Bytes>> {
        let mut h = HeaderMap::new();
        h.insert("Depth", header::HeaderValue::from_str(depth.as_str())?);
        self.send(
            Method::from_bytes(b"PROPFIND")?,
            path,
            h,
            Some(Bytes::from(xml_body.to_owned())),
            true,
        )
        .await
    }

    /// Send a `REPORT` (multiget, sync-collection) with a custom XML body
    /// and `Depth`.
    pub async fn report(
        &self,
        path: &str,
        depth: Depth,
        xml_body: &str,
    ) -> DavResult<Response<Bytes>> {
        let mut h = HeaderMap::new();
        h.insert("Depth", header::HeaderValue::from_str(depth.as_str())?);
        self.send(
            Method::from_bytes(b"REPORT")?,
            path,
            h,
            Some(Bytes::from(xml_body.to_owned())),
            false,
        )
        .await
    }

    // ----------- ETag helpers -----------

    /// Extract the `ETag` from a response header map, if present.
    pub fn etag_from_headers(headers: &HeaderMap) -> Option<String> {
        headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Extract the `Location` from a response header map, if present.
    pub fn location_from_headers(headers: &HeaderMap) -> Option<String> {
        headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}
