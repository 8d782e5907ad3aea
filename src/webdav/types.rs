use std::collections::BTreeMap;

/// WebDAV Depth
#[derive(Copy, Clone)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}
impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// Well-known flattened property keys produced by the multistatus parser.
///
/// Property names are path-like: nested elements are joined with `:` and
/// `comp` children of `supported-calendar-component-set` collapse to
/// `supported-calendar-component-set:comp:<NAME>`.
pub mod props {
    pub const ETAG: &str = "getetag";
    pub const CTAG: &str = "getctag";
    pub const SYNC_TOKEN: &str = "sync-token";
    pub const DISPLAY_NAME: &str = "displayname";
    pub const RESOURCE_TYPE: &str = "resourcetype";
    pub const RESOURCE_TYPE_ADDRESSBOOK: &str = "resourcetype:addressbook";
    pub const RESOURCE_TYPE_CALENDAR: &str = "resourcetype:calendar";
    pub const CURRENT_USER_PRINCIPAL_HREF: &str = "current-user-principal:href";
    pub const ADDRESSBOOK_HOME_SET_HREF: &str = "addressbook-home-set:href";
    pub const CALENDAR_HOME_SET_HREF: &str = "calendar-home-set:href";
    pub const ADDRESS_DATA: &str = "address-data";
    pub const CALENDAR_DATA: &str = "calendar-data";
    pub const SUPPORTED_COMPONENT_EVENT: &str = "supported-calendar-component-set:comp:VEVENT";
    pub const SUPPORTED_COMPONENT_TODO: &str = "supported-calendar-component-set:comp:VTODO";
}

/// The `no-uid-conflict` error element reported by servers on UID collisions.
pub const ERROR_UID_CONFLICT: &str = "no-uid-conflict";

/// One `propstat` block: a status code plus the flat property map it covers.
#[derive(Debug, Clone, Default)]
pub struct PropStat {
    pub status: u16,
    pub props: BTreeMap<String, String>,
}

/// One `response` element of a multistatus body.
#[derive(Debug, Clone, Default)]
pub struct DavResponse {
    /// Doubly percent-decoded href (iCloud double-encodes).
    pub href: String,
    /// Top-level status of the response, when present (sync-collection
    /// deletions carry e.g. 404 here).
    pub status: Option<u16>,
    /// Local names of error condition elements (`no-uid-conflict`, ...).
    pub errors: Vec<String>,
    pub propstats: Vec<PropStat>,
}

impl DavResponse {
    /// First value stored under `name` across the propstat blocks, in
    /// document order.
    pub fn prop(&self, name: &str) -> Option<&str> {
        self.propstats
            .iter()
            .find_map(|ps| ps.props.get(name).map(String::as_str))
    }

    pub fn has_prop(&self, name: &str) -> bool {
        self.propstats.iter().any(|ps| ps.props.contains_key(name))
    }

    pub fn has_error(&self, name: &str) -> bool {
        self.errors.iter().any(|e| e == name)
    }
}

/// Parsed multistatus body: per-href responses plus the top-level
/// `sync-token` carried by `sync-collection` reports (RFC 6578).
#[derive(Debug, Clone, Default)]
pub struct Multistatus {
    pub responses: Vec<DavResponse>,
    pub sync_token: Option<String>,
}
