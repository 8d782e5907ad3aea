pub mod client;
pub mod types;
pub mod xml;

pub use client::{AuthScheme, Authorizer, BearerAuthorizer, ClientConfig, WebDavClient};
pub use types::{DavResponse, Depth, Multistatus, PropStat};
pub use xml::{build_multiget_body, build_sync_collection_body, escape_xml, parse_multistatus};
