//! Identity indexes and the check registry that drives them.
//!
//! A check declares that a field participates in item matching: *key*
//! checks feed the identity index (two items with equal key fields are the
//! same logical item), *conflict* checks only feed full-equality comparison
//! (differing conflict fields on matching items mean one side was edited).

use std::cmp::Ordering;
use std::sync::RwLock;

use crate::item::ItemKind;

/// Role a field plays in comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRole {
    Key,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub field_name: String,
    pub role: CheckRole,
    pub enabled: bool,
}

/// Registry of checks for one item kind.
///
/// The registry is shared configuration: the engine owns one per kind
/// (behind an `Arc`) and mutates it only between sync phases, never while a
/// phase or iterator is live. `disable` is a run-scoped exclusion, it
/// removes a conflict field from equality comparison without forgetting
/// the check.
pub struct CheckRegistry {
    checks: RwLock<Vec<Check>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
        }
    }

    /// Registry seeded with the default checks for the given kind.
    pub fn defaults_for(kind: ItemKind) -> Self {
        let registry = Self::new();
        match kind {
            ItemKind::Contact => {
                registry.add("n_family", CheckRole::Key);
                registry.add("n_given", CheckRole::Key);
                registry.add("n_middle", CheckRole::Key);
                registry.add("n_prefix", CheckRole::Conflict);
                registry.add("n_suffix", CheckRole::Conflict);
                registry.add("tel", CheckRole::Conflict);
                registry.add("email", CheckRole::Conflict);
                registry.add("adr", CheckRole::Conflict);
                registry.add("role", CheckRole::Conflict);
                registry.add("title", CheckRole::Conflict);
                registry.add("nickname", CheckRole::Conflict);
                registry.add("photo", CheckRole::Conflict);
                registry.add("bday", CheckRole::Conflict);
                registry.add("geo", CheckRole::Conflict);
                registry.add("org", CheckRole::Conflict);
                registry.add("note", CheckRole::Conflict);
                registry.add("url", CheckRole::Conflict);
                registry.add("categories", CheckRole::Conflict);
            }
            ItemKind::Event | ItemKind::Task => {
                registry.add("uid", CheckRole::Key);
                registry.add("attendee", CheckRole::Conflict);
                registry.add("description", CheckRole::Conflict);
                registry.add("summary", CheckRole::Conflict);
                registry.add("dtstart", CheckRole::Conflict);
                registry.add("dtend", CheckRole::Conflict);
                registry.add("attach", CheckRole::Conflict);
                registry.add("sequence", CheckRole::Conflict);
                registry.add("location", CheckRole::Conflict);
            }
        }
        registry
    }

    /// Add a check. Fails when a check for the field already exists.
    pub fn add(&self, field_name: &str, role: CheckRole) -> bool {
        let mut checks = self.checks.write().unwrap();
        if checks.iter().any(|c| c.field_name == field_name) {
            tracing::warn!(field_name, "check already exists");
            return false;
        }
        checks.push(Check {
            field_name: field_name.to_string(),
            role,
            enabled: true,
        });
        true
    }

    pub fn remove(&self, field_name: &str) -> bool {
        let mut checks = self.checks.write().unwrap();
        let before = checks.len();
        checks.retain(|c| c.field_name != field_name);
        checks.len() != before
    }

    pub fn disable(&self, field_name: &str) -> bool {
        let mut checks = self.checks.write().unwrap();
        match checks.iter_mut().find(|c| c.field_name == field_name) {
            Some(check) => {
                check.enabled = false;
                true
            }
            None => {
                tracing::warn!(field_name, "cannot disable unknown check");
                false
            }
        }
    }

    pub fn enable(&self, field_name: &str) -> bool {
        let mut checks = self.checks.write().unwrap();
        match checks.iter_mut().find(|c| c.field_name == field_name) {
            Some(check) => {
                check.enabled = true;
                true
            }
            None => false,
        }
    }

    pub fn enable_all(&self) {
        let mut checks = self.checks.write().unwrap();
        for check in checks.iter_mut() {
            check.enabled = true;
        }
    }

    /// Snapshot of all checks in declaration order.
    pub fn all(&self) -> Vec<Check> {
        self.checks.read().unwrap().clone()
    }

    /// Names of currently disabled checks.
    pub fn disabled_names(&self) -> Vec<String> {
        self.checks
            .read()
            .unwrap()
            .iter()
            .filter(|c| !c.enabled)
            .map(|c| c.field_name.clone())
            .collect()
    }

    pub fn any_disabled(&self) -> bool {
        self.checks.read().unwrap().iter().any(|c| !c.enabled)
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived identity record of an item.
///
/// `key_fields` and `conflict_fields` hold `(field name, stringified
/// value)` pairs appended in check order, then in the sorted order of the
/// field's values. The stringified key form is cached for use as a map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIndex {
    kind: ItemKind,
    key_fields: Vec<(String, String)>,
    conflict_fields: Vec<(String, String)>,
    key_string: String,
}

impl ItemIndex {
    pub fn new(
        kind: ItemKind,
        key_fields: Vec<(String, String)>,
        conflict_fields: Vec<(String, String)>,
    ) -> Self {
        let mut key_string = String::new();
        for (_, value) in &key_fields {
            key_string.push_str(value);
            key_string.push('\u{1f}');
        }
        Self {
            kind,
            key_fields,
            conflict_fields,
            key_string,
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Cached stringified form of the key fields.
    pub fn key_string(&self) -> &str {
        &self.key_string
    }

    pub fn key_fields(&self) -> &[(String, String)] {
        &self.key_fields
    }

    pub fn conflict_fields(&self) -> &[(String, String)] {
        &self.conflict_fields
    }

    /// Whether two indexes identify the same logical item: their key fields
    /// are equal as multisets.
    pub fn matches(&self, other: &ItemIndex) -> bool {
        self.kind == other.kind && multiset_eq(&self.key_fields, &other.key_fields)
    }

    /// Full equality: key fields match and every *enabled* conflict field
    /// compares equal. Disabled checks are filtered from both sides, the
    /// exclusion is run-scoped rather than a removal.
    pub fn equals(&self, other: &ItemIndex, registry: &CheckRegistry) -> bool {
        if !self.matches(other) {
            return false;
        }
        if !registry.any_disabled() {
            return multiset_eq(&self.conflict_fields, &other.conflict_fields);
        }
        let disabled = registry.disabled_names();
        let mine = filter_disabled(&self.conflict_fields, &disabled);
        let theirs = filter_disabled(&other.conflict_fields, &disabled);
        multiset_eq(&mine, &theirs)
    }
}

fn filter_disabled<'a>(
    fields: &'a [(String, String)],
    disabled: &[String],
) -> Vec<(&'a String, &'a String)> {
    fields
        .iter()
        .filter(|(name, _)| !disabled.contains(name))
        .map(|(name, value)| (name, value))
        .collect()
}

fn multiset_eq<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

impl PartialOrd for ItemIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_string.cmp(&other.key_string)
    }
}
