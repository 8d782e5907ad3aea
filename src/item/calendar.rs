//! iCalendar 2.0 parsing into a recursive component tree.

use crate::error::{DavError, DavResult};
use crate::item::contact::{unescape_after_value_start, unfold_lines};
use crate::item::field::{FieldMap, FieldValue, sort_field_values};

/// One iCalendar component: fields plus ordered subcomponents.
///
/// The outer `VCALENDAR` markers are stripped; `vevent`, `vtodo`,
/// `vtimezone` and friends become subcomponents of the root. The tree is an
/// ordinary owning structure, subcomponents cannot reference their parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Component {
    pub name: String,
    pub fields: FieldMap,
    pub subcomponents: Vec<Component>,
}

impl Component {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this component type stores its fields. The `standard` and
    /// `daylight` blocks inside `vtimezone` only describe offsets and would
    /// defeat equality comparison between stores with different timezone
    /// serializations.
    fn keeps_fields(&self) -> bool {
        self.name != "standard" && self.name != "daylight"
    }

    /// First subcomponent with the given name, searched in order.
    pub fn subcomponent(&self, name: &str) -> Option<&Component> {
        self.subcomponents.iter().find(|c| c.name == name)
    }

    fn parse_into(&mut self, lines: &[String]) -> DavResult<()> {
        let mut i = 0usize;
        while i < lines.len() {
            let line = unescape_after_value_start(&lines[i]);
            let line = line.trim();
            i += 1;
            if line.is_empty() {
                continue;
            }

            let split_pos = match (line.find(':'), line.find(';')) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => continue,
            };
            let name = line[..split_pos].to_ascii_lowercase();
            let value = line[split_pos + 1..].to_ascii_lowercase();
            if value.is_empty() {
                continue;
            }

            if name == "begin" && value != "vcalendar" {
                // Collect the nested block up to its matching END.
                let sub_name = value.clone();
                let mut depth = 1usize;
                let start = i;
                while i < lines.len() {
                    let inner = lines[i].trim().to_ascii_lowercase();
                    if let Some(v) = inner.strip_prefix("begin:") {
                        if !v.is_empty() {
                            depth += 1;
                        }
                    } else if let Some(v) = inner.strip_prefix("end:") {
                        if v == sub_name && depth == 1 {
                            break;
                        }
                        depth = depth.saturating_sub(1);
                    }
                    i += 1;
                }
                if i >= lines.len() {
                    return Err(DavError::Malformed(format!(
                        "unterminated {sub_name} component"
                    )));
                }
                let mut sub = Component::new(sub_name.clone());
                sub.parse_into(&lines[start..i])?;
                i += 1; // skip the END line
                self.subcomponents.push(sub);
                continue;
            }

            if name == "rev"
                || name == "prodid"
                || name.starts_with("x-evolution-")
                || (name == "begin" && value == "vcalendar")
                || (name == "end" && value == "vcalendar")
            {
                continue;
            }

            if self.keeps_fields() {
                self.fields
                    .entry(name)
                    .or_default()
                    .push(FieldValue::parse(&value));
            }
        }

        sort_field_values(&mut self.fields);
        Ok(())
    }
}

/// Parse an iCalendar body into the root component.
pub fn parse_calendar_component(ical: &str) -> DavResult<Component> {
    let lower = ical.to_ascii_lowercase();
    if !lower.contains("begin:vcalendar") || !lower.contains("end:vcalendar") {
        return Err(DavError::Malformed(
            "iCalendar lacks BEGIN/END markers".to_string(),
        ));
    }

    let lines = unfold_lines(ical);
    let mut root = Component::new("vcalendar");
    root.parse_into(&lines)?;
    Ok(root)
}
