//! Multistatus XML parsing and request body builders.
//!
//! The parser flattens nested property elements into path-like keys
//! (`parent:child`), which keeps the response model independent of which
//! namespace prefix a server happens to use.

use quick_xml::NsReader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;

use crate::error::{DavError, DavResult};
use crate::webdav::types::{DavResponse, Multistatus, PropStat};

const DAV_NAMESPACE: &[u8] = b"DAV:";

/// Parse a WebDAV `207 Multi-Status` body.
///
/// Fails with [`DavError::MalformedXml`] on unparseable input,
/// [`DavError::WrongRoot`] when the root element is not `multistatus` and
/// [`DavError::MissingDavNamespace`] when the root is `multistatus` but not
/// bound to the `DAV:` namespace. All other namespaces are accepted
/// transparently; matching is done on local names.
pub fn parse_multistatus(xml: &str) -> DavResult<Multistatus> {
    let mut reader = NsReader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(false);

    let mut buf = Vec::with_capacity(8 * 1024);
    let mut parser = MultistatusParser::default();
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if !saw_root {
                    check_root(&reader, &e)?;
                    saw_root = true;
                } else {
                    parser.on_start(&e, false);
                }
            }
            Ok(Event::Empty(e)) => {
                if !saw_root {
                    check_root(&reader, &e)?;
                    // An empty multistatus element carries no responses.
                    break;
                }
                parser.on_start(&e, true);
                parser.on_end();
            }
            Ok(Event::Text(e)) => {
                if saw_root {
                    let text = decode_text(e.as_ref())?;
                    parser.on_text(&text, false);
                }
            }
            Ok(Event::CData(e)) => {
                if saw_root {
                    let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                    parser.on_text(&text, true);
                }
            }
            Ok(Event::End(_)) => {
                if saw_root {
                    parser.on_end();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DavError::MalformedXml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(DavError::MalformedXml("document has no root element".into()));
    }

    Ok(parser.finish())
}

fn check_root(reader: &NsReader<&[u8]>, e: &BytesStart<'_>) -> DavResult<()> {
    let (ns, local) = reader.resolve_element(e.name());
    if !local.as_ref().eq_ignore_ascii_case(b"multistatus") {
        return Err(DavError::WrongRoot);
    }
    match ns {
        ResolveResult::Bound(ns) if ns.into_inner() == DAV_NAMESPACE => Ok(()),
        _ => Err(DavError::MissingDavNamespace),
    }
}

#[derive(Default)]
struct MultistatusParser {
    /// Local element names below the multistatus root.
    stack: Vec<String>,
    /// Whether the element at the same stack depth produced child elements
    /// or text; childless elements become empty-string properties.
    had_content: Vec<bool>,
    responses: Vec<DavResponse>,
    sync_token: Option<String>,
    current: DavResponse,
    propstat: PropStat,
}

impl MultistatusParser {
    fn finish(self) -> Multistatus {
        Multistatus {
            responses: self.responses,
            sync_token: self.sync_token,
        }
    }

    /// Property path of the innermost element, relative to an enclosing
    /// `response > propstat > prop`.
    fn prop_path(&self) -> Option<&[String]> {
        if self.stack.len() > 3
            && self.stack[0] == "response"
            && self.stack[1] == "propstat"
            && self.stack[2] == "prop"
        {
            Some(&self.stack[3..])
        } else {
            None
        }
    }

    fn in_error(&self) -> bool {
        !self.stack.is_empty()
            && self.stack[0] == "response"
            && self.stack.iter().any(|s| s == "error")
    }

    fn on_start(&mut self, e: &BytesStart<'_>, _empty: bool) {
        let local = local_name(e);
        if let Some(top) = self.had_content.last_mut() {
            *top = true;
        }
        let was_in_error = self.in_error();
        self.stack.push(local.clone());
        self.had_content.push(false);

        match self.stack.as_slice() {
            [first] if first == "response" => {
                self.current = DavResponse::default();
            }
            [first, second] if first == "response" && second == "propstat" => {
                self.propstat = PropStat::default();
            }
            _ => {}
        }

        if was_in_error {
            self.current.errors.push(local.clone());
        }

        // <comp name="X"/> children collapse into the component-set property.
        if local == "comp" {
            let parent_key = match self.prop_path() {
                Some(path) if path.len() >= 2 => Some(path[..path.len() - 1].join(":")),
                _ => None,
            };
            if let (Some(mut key), Some(name)) = (parent_key, comp_name_attr(e)) {
                key.push_str(":comp:");
                key.push_str(&name);
                self.propstat.props.entry(key).or_default();
                if let Some(top) = self.had_content.last_mut() {
                    *top = true;
                }
            }
        }
    }

    fn on_text(&mut self, text: &str, verbatim: bool) {
        if text.trim().is_empty() && !verbatim {
            return;
        }
        if let Some(top) = self.had_content.last_mut() {
            *top = true;
        }

        if let Some(key) = self.prop_path().map(|p| p.join(":")) {
            // calendar-data arrives in chunks (text interleaved with CDATA);
            // keep the exact payload.
            self.propstat.props.entry(key).or_default().push_str(text);
            return;
        }

        let trimmed = text.trim();
        match self.stack.as_slice() {
            [first] if first == "sync-token" => {
                self.sync_token = Some(trimmed.to_string());
            }
            [first, second] if first == "response" && second == "href" => {
                self.current.href = decode_href(trimmed);
            }
            [first, second] if first == "response" && second == "status" => {
                self.current.status = parse_status_line(trimmed);
            }
            [first, second, third]
                if first == "response" && second == "propstat" && third == "status" =>
            {
                self.propstat.status = parse_status_line(trimmed).unwrap_or_default();
            }
            _ => {}
        }
    }

    fn on_end(&mut self) {
        // Childless property elements map to the empty string
        // (resourcetype of a plain item, empty getetag, ...).
        if self.had_content.last() == Some(&false)
            && let Some(key) = self.prop_path().map(|p| p.join(":"))
        {
            self.propstat.props.entry(key).or_default();
        }

        let popped = self.stack.pop();
        self.had_content.pop();

        match popped.as_deref() {
            Some("response") if self.stack.is_empty() => {
                let finished = std::mem::take(&mut self.current);
                self.responses.push(finished);
            }
            Some("propstat") if self.stack.len() == 1 && self.stack[0] == "response" => {
                let finished = std::mem::take(&mut self.propstat);
                self.current.propstats.push(finished);
            }
            _ => {}
        }
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().local_name().as_ref()).to_ascii_lowercase()
}

fn comp_name_attr(e: &BytesStart<'_>) -> Option<String> {
    for attr in e.attributes().with_checks(false).flatten() {
        if attr.key.as_ref().eq_ignore_ascii_case(b"name") {
            return attr
                .unescape_value()
                .ok()
                .map(|v| v.into_owned())
                .filter(|v| !v.is_empty());
        }
    }
    None
}

/// Parse `HTTP/1.1 200 OK` into the numeric code.
fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1).and_then(|c| c.parse().ok())
}

/// Hrefs are decoded twice: iCloud percent-encodes them twice.
pub fn decode_href(raw: &str) -> String {
    let once = percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned();
    percent_encoding::percent_decode_str(&once)
        .decode_utf8_lossy()
        .into_owned()
}

pub fn decode_text(raw: &[u8]) -> DavResult<String> {
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(quick_xml::escape::unescape(s)
            .map_err(|err| DavError::MalformedXml(format!("XML decode error: {err}")))?
            .into_owned()),
        Err(_) => Ok(String::from_utf8_lossy(raw).into_owned()),
    }
}

pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Build a `sync-collection` REPORT body (RFC 6578).
pub fn build_sync_collection_body(sync_token: Option<&str>) -> String {
    let mut body = String::from(r#"<D:sync-collection xmlns:D="DAV:">"#);
    match sync_token {
        Some(token) if !token.is_empty() => {
            body.push_str("<D:sync-token>");
            body.push_str(&escape_xml(token));
            body.push_str("</D:sync-token>");
        }
        _ => body.push_str("<D:sync-token/>"),
    }
    body.push_str("<D:sync-level>1</D:sync-level>");
    body.push_str("<D:prop><D:getetag/></D:prop>");
    body.push_str("</D:sync-collection>");
    body
}

/// Build an `addressbook-multiget`/`calendar-multiget` REPORT body.
///
/// Returns `None` when no non-empty href is supplied.
pub fn build_multiget_body<I, S>(
    root_element: &str,
    namespace: &str,
    data_element: &str,
    hrefs: I,
) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut href_xml = String::new();
    let mut total = 0usize;
    for href in hrefs {
        let href = href.as_ref();
        if href.is_empty() {
            continue;
        }
        total += 1;
        href_xml.push_str("<D:href>");
        href_xml.push_str(&escape_xml(href));
        href_xml.push_str("</D:href>");
    }
    if total == 0 {
        return None;
    }

    let mut body = format!(r#"<C:{root_element} xmlns:D="DAV:" xmlns:C="{namespace}">"#);
    body.push_str("<D:prop><D:getetag/><C:");
    body.push_str(data_element);
    body.push_str("/></D:prop>");
    body.push_str(&href_xml);
    body.push_str("</C:");
    body.push_str(root_element);
    body.push('>');
    Some(body)
}
