pub mod compression;
pub mod http;

pub use compression::{ContentEncoding, add_accept_encoding, decompress_body, detect_encoding};
pub use http::{HyperClient, TlsMode, build_hyper_client, url_host_part};
