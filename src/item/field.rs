//! Field values shared by the vCard and iCalendar parsers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One value of a PIM item field: the textual value plus its parameters.
///
/// Parameter names are unique within a value and map to a set of parameter
/// values; ordering of parameters and parameter values is irrelevant for
/// equality, which is why both sides live in ordered containers. Parameters
/// whose name begins with `x-` are dropped on ingest, they are vendor noise
/// (`X-EVOLUTION-E164`, ...) that would break cross-store comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValue {
    value: String,
    params: BTreeMap<String, BTreeSet<String>>,
}

impl FieldValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            params: BTreeMap::new(),
        }
    }

    /// Parse `param=a,b;param2=c:value` or a bare `value`.
    pub fn parse(raw: &str) -> Self {
        match raw.find(':') {
            None => Self::new(raw),
            Some(pos) => {
                let mut field = Self::new(&raw[pos + 1..]);
                for param in raw[..pos].split(';') {
                    field.process_param(param);
                }
                field
            }
        }
    }

    fn process_param(&mut self, param: &str) {
        let (name, values) = match param.split_once('=') {
            Some((name, values)) => (name, values),
            None => (param, ""),
        };
        if name.starts_with("x-") {
            return;
        }
        let values: BTreeSet<String> = values
            .split(',')
            .map(|v| v.replace('"', ""))
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return;
        }
        self.params.entry(name.to_string()).or_default().extend(values);
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn params(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.params.get(name)
    }
}

/// Deterministic string form: parameters sorted by name, parameter values
/// sorted, joined with `;`/`=`/`,`, then `:value`. Two values with the same
/// content but differently ordered parameters render identically.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, values) in &self.params {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            f.write_str(name)?;
            f.write_str("=")?;
            let mut first_value = true;
            for value in values {
                if !first_value {
                    f.write_str(",")?;
                }
                first_value = false;
                f.write_str(value)?;
            }
        }
        if !first {
            f.write_str(":")?;
        }
        f.write_str(&self.value)
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

/// Ordered multi-map of field name to values, as parsed from an item body.
pub type FieldMap = BTreeMap<String, Vec<FieldValue>>;

/// Sort every field's value list by its stringified form so equivalent
/// items with differently-ordered repeated fields compare equal.
pub fn sort_field_values(fields: &mut FieldMap) {
    for values in fields.values_mut() {
        values.sort();
    }
}
