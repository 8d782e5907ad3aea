//! PIM item model: vCard contacts and iCalendar events/tasks.

pub mod calendar;
pub mod contact;
pub mod field;
pub mod index;

pub use calendar::Component;
pub use field::{FieldMap, FieldValue};
pub use index::{Check, CheckRegistry, CheckRole, ItemIndex};

use crate::error::{DavError, DavResult};

/// Kind of a PIM item. Immutable for the lifetime of the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Contact,
    Event,
    Task,
}

impl ItemKind {
    /// The iCalendar component name carrying this kind's fields.
    pub fn component_name(self) -> Option<&'static str> {
        match self {
            ItemKind::Contact => None,
            ItemKind::Event => Some("vevent"),
            ItemKind::Task => Some("vtodo"),
        }
    }
}

/// A parsed PIM item.
///
/// `id` is the server-assigned opaque identifier (an item URI for DAV
/// stores), `revision` the opaque ETag-like token of the version that was
/// read. Both are empty until a store assigns them. `raw` keeps the
/// original body, which is what gets written back to stores.
#[derive(Debug, Clone, PartialEq)]
pub struct PimItem {
    kind: ItemKind,
    id: String,
    revision: String,
    raw: String,
    fields: FieldMap,
    component: Option<Component>,
}

impl PimItem {
    /// Parse a vCard 3.0 body into a contact item.
    pub fn parse_contact(vcard: &str) -> DavResult<PimItem> {
        let fields = contact::parse_contact_fields(vcard)?;
        Ok(PimItem {
            kind: ItemKind::Contact,
            id: String::new(),
            revision: String::new(),
            raw: vcard.to_string(),
            fields,
            component: None,
        })
    }

    /// Parse an iCalendar 2.0 body into an event or task item.
    pub fn parse_calendar(ical: &str, kind: ItemKind) -> DavResult<PimItem> {
        let component_name = kind
            .component_name()
            .ok_or_else(|| DavError::Malformed("contact is not a calendar kind".to_string()))?;
        let root = calendar::parse_calendar_component(ical)?;
        let fields = root
            .subcomponent(component_name)
            .map(|c| c.fields.clone())
            .unwrap_or_default();
        Ok(PimItem {
            kind,
            id: String::new(),
            revision: String::new(),
            raw: ical.to_string(),
            fields,
            component: Some(root),
        })
    }

    /// Parse a body according to the expected kind.
    pub fn parse(raw: &str, kind: ItemKind) -> DavResult<PimItem> {
        match kind {
            ItemKind::Contact => Self::parse_contact(raw),
            ItemKind::Event | ItemKind::Task => Self::parse_calendar(raw, kind),
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Assign the item id. With `replace_uid` set the `UID:` line of the
    /// raw body is rewritten too, which is how conflicted duplicates get a
    /// fresh identity on the server.
    pub fn set_id(&mut self, id: impl Into<String>, replace_uid: bool) {
        self.id = id.into();
        if replace_uid {
            self.raw = contact::substitute_uid(&self.raw, &self.id);
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn set_revision(&mut self, revision: impl Into<String>) {
        self.revision = revision.into();
    }

    /// The raw textual body as received from the producing store.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parsed field view. For calendar items these are the fields of the
    /// first `vevent`/`vtodo` component.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&[FieldValue]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Root component tree of an iCalendar item.
    pub fn component(&self) -> Option<&Component> {
        self.component.as_ref()
    }

    /// Build the identity index by walking the check registry in
    /// declaration order, appending one entry per stored value.
    pub fn index(&self, registry: &CheckRegistry) -> ItemIndex {
        let mut key_fields = Vec::new();
        let mut conflict_fields = Vec::new();
        for check in registry.all() {
            let Some(values) = self.fields.get(&check.field_name) else {
                continue;
            };
            for value in values {
                let entry = (check.field_name.clone(), value.to_string());
                match check.role {
                    CheckRole::Key => key_fields.push(entry),
                    CheckRole::Conflict => conflict_fields.push(entry),
                }
            }
        }
        ItemIndex::new(self.kind, key_fields, conflict_fields)
    }
}
