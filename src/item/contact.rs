//! vCard 3.0 contact parsing.
//!
//! The parser normalizes a vCard into the field map used for identity
//! matching: folded lines are joined, names and values are lower-cased,
//! noisy fields are dropped and the PHOTO payload is replaced by a numeric
//! checksum so two stores holding the same picture in different transfer
//! encodings still compare equal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;

use crate::error::{DavError, DavResult};
use crate::item::field::{FieldMap, FieldValue, sort_field_values};

/// Fields that never participate in comparison and are dropped on ingest.
const IGNORED_FIELDS: &[&str] = &["begin", "end", "rev", "uid", "prodid"];

pub fn parse_contact_fields(vcard: &str) -> DavResult<FieldMap> {
    if !vcard.to_ascii_lowercase().contains("begin:vcard")
        || !vcard.to_ascii_lowercase().contains("end:vcard")
    {
        return Err(DavError::Malformed(
            "vCard lacks BEGIN/END markers".to_string(),
        ));
    }

    let mut fields = FieldMap::new();

    for line in unfold_lines(vcard) {
        let line = unescape_after_value_start(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // Split at the first ':' or ';', whichever comes first.
        let split_pos = match (line.find(':'), line.find(';')) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => continue,
        };

        let name = line[..split_pos].to_ascii_lowercase();
        if IGNORED_FIELDS.contains(&name.as_str()) || name.starts_with("x-evolution-") {
            continue;
        }

        let raw_value = &line[split_pos + 1..];
        let value = normalize_value_case(&name, raw_value);

        let field = if name == "note" {
            // RFC 2426 forbids parameters on NOTE; its value may contain
            // characters that would mislead the parameter parser.
            FieldValue::new(value)
        } else {
            FieldValue::parse(&value)
        };

        fields.entry(name).or_default().push(field);
    }

    expand_name_field(&mut fields);
    substitute_photo_checksum(&mut fields)?;
    sort_field_values(&mut fields);

    Ok(fields)
}

/// Join folded continuation lines (RFC 2425 5.8.1) and split into lines.
pub(crate) fn unfold_lines(vcard: &str) -> Vec<String> {
    let mut unfolded = vcard.replace("\r\n ", "").replace("\r\n\t", "");
    unfolded = unfolded.replace("\n ", "").replace("\n\t", "");
    unfolded
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect()
}

/// Unquote `\,` and `\ ` after the first `:` of the line.
pub(crate) fn unescape_after_value_start(line: &str) -> String {
    match line.find(':') {
        None => line.to_string(),
        Some(pos) => {
            let (head, tail) = line.split_at(pos + 1);
            let mut out = String::with_capacity(line.len());
            out.push_str(head);
            let mut chars = tail.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\\'
                    && let Some(&next) = chars.peek()
                    && (next == ',' || next == ' ')
                {
                    continue;
                }
                out.push(c);
            }
            out
        }
    }
}

/// Lower-case the value, preserving the case of PHOTO payloads: the URI
/// part after `://` (or after the last `:` for inline base64) stays intact.
fn normalize_value_case(name: &str, value: &str) -> String {
    if name != "photo" {
        return value.to_ascii_lowercase();
    }
    let preserved_from = value
        .find("://")
        .or_else(|| value.rfind(':'))
        .unwrap_or(value.len());
    let mut out = value[..preserved_from].to_ascii_lowercase();
    out.push_str(&value[preserved_from..]);
    out
}

/// Expand the structural N field into synthesized components when it is
/// properly formatted (exactly five `;`-separated parts, some may be empty).
fn expand_name_field(fields: &mut FieldMap) {
    let Some(name) = fields.get("n").and_then(|v| v.first()) else {
        return;
    };
    let parts: Vec<&str> = name.value().split(';').collect();
    if parts.len() != 5 {
        return;
    }
    let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    for (field, part) in ["n_family", "n_given", "n_middle", "n_prefix", "n_suffix"]
        .iter()
        .zip(parts)
    {
        fields
            .entry(field.to_string())
            .or_default()
            .push(FieldValue::parse(&part));
    }
}

/// Replace an embedded or file-backed PHOTO with its checksum; keep remote
/// URIs in URL form. A structurally invalid PHOTO rejects the whole item.
fn substitute_photo_checksum(fields: &mut FieldMap) -> DavResult<()> {
    let Some(photo) = fields.get("photo").and_then(|v| v.first()).cloned() else {
        return Ok(());
    };

    let non_local_uri = if let Some(values) = photo.param("value") {
        if values.len() != 1 {
            return Err(DavError::Malformed(
                "more than one value type for PHOTO field".to_string(),
            ));
        }
        !photo.value().contains("file://")
    } else if let Some(encodings) = photo.param("encoding") {
        if encodings.len() != 1 || !encodings.contains("b") {
            return Err(DavError::Malformed(
                "unknown encoding for PHOTO field".to_string(),
            ));
        }
        false
    } else {
        return Err(DavError::Malformed("misformatted PHOTO field".to_string()));
    };

    if !non_local_uri {
        let checksum = photo_checksum(&photo);
        fields.insert(
            "photo".to_string(),
            vec![FieldValue::new(checksum.to_string())],
        );
    }

    Ok(())
}

/// Sum of the bytes of the decoded base64 payload or the referenced local
/// file. Failures yield checksum 0 rather than rejecting the item.
pub fn photo_checksum(field: &FieldValue) -> u64 {
    if field
        .param("encoding")
        .is_some_and(|e| e.contains("b"))
    {
        let cleaned: String = field
            .value()
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        match B64.decode(cleaned) {
            Ok(bytes) => return byte_sum(&bytes),
            Err(err) => {
                tracing::warn!("base64 decode of PHOTO failed: {err}");
                return 0;
            }
        }
    }

    if field.param("value").is_some_and(|v| v.contains("uri")) {
        let uri = crate::webdav::xml::decode_href(field.value());
        if let Some(path) = uri.strip_prefix("file://") {
            match std::fs::read(path) {
                Ok(bytes) => return byte_sum(&bytes),
                Err(err) => {
                    tracing::warn!("cannot read PHOTO file {path}: {err}");
                    return 0;
                }
            }
        }
    }

    0
}

fn byte_sum(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc.wrapping_add(*b as u64))
}

/// Rewrite the `UID:` line of a raw vCard/iCalendar body in place, used
/// when a conflicted copy is given a fresh identity.
pub fn substitute_uid(raw: &str, new_uid: &str) -> String {
    let Some(start) = raw.find("UID:") else {
        return raw.to_string();
    };
    let value_start = start + "UID:".len();
    let value_end = raw[value_start..]
        .find('\n')
        .map(|p| {
            let mut end = value_start + p;
            if raw[..end].ends_with('\r') {
                end -= 1;
            }
            end
        })
        .unwrap_or(raw.len());
    let mut out = String::with_capacity(raw.len());
    out.push_str(&raw[..value_start]);
    out.push_str(new_uid);
    out.push_str(&raw[value_end..]);
    out
}

/// Extract the UID value of a raw iCalendar/vCard body, if any.
pub fn extract_uid(raw: &str) -> Option<String> {
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("UID:") {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
