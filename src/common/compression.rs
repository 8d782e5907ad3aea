//! Response decompression for HTTP content encoding.
//!
//! DAV servers routinely compress large multistatus bodies; the request
//! engine advertises `br, zstd, gzip` and transparently decompresses
//! aggregated responses before they reach the XML parser.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZstdDecoder};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::{HeaderMap, header, http};
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::error::DavResult;

/// Supported content encodings for response decompression.
///
/// These values correspond to the `Content-Encoding` header and are used to
/// decide how to wrap the body reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Br,
    Gzip,
    Zstd,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Br => "br",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Zstd => "zstd",
        }
    }
}

/// Detect the response `Content-Encoding` header and map it to [`ContentEncoding`].
///
/// Returns [`ContentEncoding::Identity`] if the header is missing or not recognized.
///
/// # Example
/// ```
/// use pim_dav_sync::common::compression::{detect_encoding, ContentEncoding};
/// use hyper::{header, HeaderMap};
///
/// let mut headers = HeaderMap::new();
/// headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
/// assert_eq!(detect_encoding(&headers), ContentEncoding::Gzip);
/// ```
pub fn detect_encoding(headers: &HeaderMap) -> ContentEncoding {
    if let Some(val) = headers.get(header::CONTENT_ENCODING)
        && let Ok(s) = val.to_str()
    {
        let enc = s
            .split(',')
            .next()
            .map(|t| t.trim().to_ascii_lowercase())
            .unwrap_or_default();
        return match enc.as_str() {
            "br" => ContentEncoding::Br,
            "gzip" => ContentEncoding::Gzip,
            "zstd" | "zst" => ContentEncoding::Zstd,
            _ => ContentEncoding::Identity,
        };
    }
    ContentEncoding::Identity
}

/// Insert an `Accept-Encoding` header (`br, zstd, gzip`) if not already present.
pub fn add_accept_encoding(h: &mut HeaderMap) {
    if !h.contains_key(http::header::ACCEPT_ENCODING) {
        h.insert(
            http::header::ACCEPT_ENCODING,
            http::HeaderValue::from_static("br, zstd, gzip"),
        );
    }
}

/// Decompress an aggregated response body according to the detected encoding.
pub async fn decompress_body(body: Incoming, encoding: ContentEncoding) -> DavResult<Bytes> {
    let stream = BodyStream::new(body)
        .map_ok(|frame| frame.into_data().unwrap_or_default())
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);
    let reader = BufReader::new(reader);
    let mut out = Vec::with_capacity(32 * 1024);

    match encoding {
        ContentEncoding::Identity => {
            let mut r = reader;
            r.read_to_end(&mut out).await?;
        }
        ContentEncoding::Br => {
            let mut dec = BrotliDecoder::new(reader);
            dec.read_to_end(&mut out).await?;
        }
        ContentEncoding::Gzip => {
            let mut dec = GzipDecoder::new(reader);
            dec.read_to_end(&mut out).await?;
        }
        ContentEncoding::Zstd => {
            let mut dec = ZstdDecoder::new(reader);
            dec.read_to_end(&mut out).await?;
        }
    }

    Ok(Bytes::from(out))
}
