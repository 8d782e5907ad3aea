//! Error taxonomy shared by the DAV protocol layer and the sync engines.

use thiserror::Error;

/// Errors surfaced by the WebDAV request engine, the protocol helpers and
/// the item parsers.
///
/// Protocol helpers surface these kinds upward unchanged; the storage layer
/// collapses unrecoverable kinds into [`crate::storage::StorageError::Fail`].
#[derive(Debug, Error)]
pub enum DavError {
    /// Transport-level failure (connect, TLS, timeout, broken stream).
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected our credentials (401/403).
    #[error("authentication rejected by server")]
    Auth,

    /// The server answered with a status code the caller cannot act on.
    #[error("server protocol error: {code} {description}")]
    ServerProtocol { code: u16, description: String },

    /// The resource does not exist on the server (404/410).
    #[error("resource not found")]
    NotFound,

    /// A conditional write lost the race (412, `If-Match` mismatch).
    #[error("precondition failed, resource was modified concurrently")]
    PreconditionFailed,

    /// The server reported `no-uid-conflict` for a create.
    #[error("item with the same UID already exists on the server")]
    UidConflict,

    /// A calendar item was submitted for creation without a UID field.
    #[error("item body does not contain a UID")]
    MissingUid,

    /// The multistatus body could not be parsed at all.
    #[error("malformed XML: {0}")]
    MalformedXml(String),

    /// The XML parsed but its root element is not `multistatus`.
    #[error("root element is not multistatus")]
    WrongRoot,

    /// The root element is `multistatus` but not in the `DAV:` namespace.
    #[error("multistatus root is not in the DAV: namespace")]
    MissingDavNamespace,

    /// An item body (vCard/iCalendar) was rejected by the parser.
    #[error("malformed item: {0}")]
    Malformed(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// A synchronization run is already in progress on this engine.
    #[error("synchronization already in progress")]
    AlreadyInProgress,

    /// The storage or helper does not implement the requested operation.
    #[error("operation not supported")]
    NotSupported,
}

pub type DavResult<T> = Result<T, DavError>;

impl DavError {
    /// Map an HTTP status code that is not handled by the calling operation
    /// into the taxonomy.
    pub fn from_status(code: u16) -> DavError {
        match code {
            401 | 403 => DavError::Auth,
            404 | 410 => DavError::NotFound,
            412 => DavError::PreconditionFailed,
            _ => DavError::ServerProtocol {
                code,
                description: describe_status(code).to_string(),
            },
        }
    }
}

/// Human description of the HTTP response codes consumed by the engine.
pub fn describe_status(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        207 => "Multi-Status",
        301 => "Moved Permanently",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        412 => "Precondition Failed",
        _ => "Unrecognized status code",
    }
}

impl From<hyper::http::Error> for DavError {
    fn from(err: hyper::http::Error) -> Self {
        DavError::Network(err.to_string())
    }
}

impl From<hyper::http::uri::InvalidUri> for DavError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        DavError::Network(format!("invalid URI: {err}"))
    }
}

impl From<hyper::http::uri::InvalidUriParts> for DavError {
    fn from(err: hyper::http::uri::InvalidUriParts) -> Self {
        DavError::Network(format!("invalid URI: {err}"))
    }
}

impl From<hyper::http::method::InvalidMethod> for DavError {
    fn from(err: hyper::http::method::InvalidMethod) -> Self {
        DavError::Network(format!("invalid method: {err}"))
    }
}

impl From<hyper::header::InvalidHeaderValue> for DavError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        DavError::Network(format!("invalid header value: {err}"))
    }
}

impl From<hyper_util::client::legacy::Error> for DavError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        DavError::Network(err.to_string())
    }
}

impl From<hyper::Error> for DavError {
    fn from(err: hyper::Error) -> Self {
        DavError::Network(err.to_string())
    }
}

impl From<std::io::Error> for DavError {
    fn from(err: std::io::Error) -> Self {
        DavError::Network(err.to_string())
    }
}

impl From<url::ParseError> for DavError {
    fn from(err: url::ParseError) -> Self {
        DavError::Network(format!("invalid URL: {err}"))
    }
}
