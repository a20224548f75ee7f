//! Per-variant schema tables: named offsets, offset arrays, strings and
//! record lists that parameterise every address lookup in the crate.
//!
//! The textual schema syntax is parsed elsewhere; this module receives one
//! [`SchemaSource`] (usually deserialized from JSON) and turns it into an
//! immutable [`SchemaStore`].

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Mutex;

use crate::{LayoutError, Result};

/// One item of a record-list declaration, e.g. a fixed-position encounter
/// with several named sub-offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: BTreeMap<String, Vec<i64>>,
}

impl RawRecord {
    pub fn field(&self, name: &str) -> &[i64] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<i64> {
        self.field(name).first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEntry {
    Scalar(i64),
    OffsetArray(Vec<i64>),
    Text(String),
    RecordList(Vec<RawRecord>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyFlags {
    /// Inherit record lists from the base instead of resetting them.
    pub copy_variable_records: bool,
}

/// Keys that resolved to a default. Shared behind a mutex so lookups stay
/// `&self` while each key is only warned about once.
#[derive(Debug, Default)]
struct MissingKeys(Mutex<BTreeSet<String>>);

impl MissingKeys {
    fn note(&self, key: &str) -> bool {
        match self.0.lock() {
            Ok(mut set) => set.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        }
    }

    fn snapshot(&self) -> Vec<String> {
        match self.0.lock() {
            Ok(set) => set.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl Clone for MissingKeys {
    fn clone(&self) -> Self {
        MissingKeys(Mutex::new(self.snapshot().into_iter().collect()))
    }
}

/// All declarations for one image variant.
#[derive(Debug, Clone, Default)]
pub struct SchemaEntrySet {
    pub name: String,
    pub copy_from: Option<String>,
    pub flags: CopyFlags,
    entries: BTreeMap<String, SchemaEntry>,
    missing: MissingKeys,
}

impl PartialEq for SchemaEntrySet {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.copy_from == other.copy_from
            && self.flags == other.flags
            && self.entries == other.entries
    }
}

static NO_RECORDS: [RawRecord; 0] = [];

impl SchemaEntrySet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares `key`, replacing whatever variant it held before.
    pub fn insert(&mut self, key: impl Into<String>, entry: SchemaEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn entry(&self, key: &str) -> Option<&SchemaEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Unknown keys read as 0, which callers treat as "feature disabled".
    pub fn get_scalar(&self, key: &str) -> i64 {
        match self.entries.get(key) {
            Some(SchemaEntry::Scalar(v)) => *v,
            _ => {
                self.note_missing(key);
                0
            }
        }
    }

    /// Like [`get_scalar`](Self::get_scalar) but without recording a default.
    pub fn scalar(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(SchemaEntry::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_array(&self, key: &str) -> &[i64] {
        match self.entries.get(key) {
            Some(SchemaEntry::OffsetArray(v)) => v,
            _ => {
                self.note_missing(key);
                &[]
            }
        }
    }

    pub fn get_text(&self, key: &str) -> &str {
        match self.entries.get(key) {
            Some(SchemaEntry::Text(s)) => s,
            _ => {
                self.note_missing(key);
                ""
            }
        }
    }

    pub fn get_records(&self, key: &str) -> &[RawRecord] {
        match self.entries.get(key) {
            Some(SchemaEntry::RecordList(v)) => v,
            _ => {
                self.note_missing(key);
                &NO_RECORDS
            }
        }
    }

    /// Every key that has resolved to a default so far.
    pub fn missing_keys(&self) -> Vec<String> {
        self.missing.snapshot()
    }

    fn note_missing(&self, key: &str) {
        if self.missing.note(key) {
            warn!("schema '{}': key '{}' is not declared, using default", self.name, key);
        }
    }
}

/// Copy-from-base, then override.
///
/// Record lists are only inherited when `flags.copy_variable_records` is
/// set; otherwise each one is reset to an empty list and its
/// `"<Key>Support"` scalar is forced to 0.
pub fn merge(base: &SchemaEntrySet, child: &SchemaEntrySet, flags: CopyFlags) -> SchemaEntrySet {
    let mut entries = base.entries.clone();

    if !flags.copy_variable_records {
        let record_keys: Vec<String> = base
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, SchemaEntry::RecordList(_)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in record_keys {
            entries.insert(format!("{key}Support"), SchemaEntry::Scalar(0));
            entries.insert(key, SchemaEntry::RecordList(Vec::new()));
        }
    }

    for (key, entry) in &child.entries {
        entries.insert(key.clone(), entry.clone());
    }

    SchemaEntrySet {
        name: child.name.clone(),
        copy_from: child.copy_from.clone(),
        flags,
        entries,
        missing: MissingKeys::default(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSource {
    pub name: String,
    #[serde(default)]
    pub copy_from: Option<String>,
    #[serde(default)]
    pub copy_variable_records: bool,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

/// Output of the external schema parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub variants: Vec<VariantSource>,
}

#[derive(Debug, Default)]
pub struct SchemaStore {
    variants: Vec<SchemaEntrySet>,
    diagnostics: Vec<LayoutError>,
}

impl SchemaStore {
    /// Builds every variant in declaration order. A `copy_from` may only
    /// name a variant declared earlier.
    pub fn load(source: SchemaSource) -> SchemaStore {
        let mut store = SchemaStore::default();

        for variant in source.variants {
            let flags = CopyFlags {
                copy_variable_records: variant.copy_variable_records,
            };
            let mut own = SchemaEntrySet::new(variant.name.clone());
            own.copy_from = variant.copy_from.clone();
            own.flags = flags;

            for decl in &variant.declarations {
                match interpret(&decl.key, &decl.value) {
                    Ok(entry) => own.insert(decl.key.clone(), entry),
                    Err(reason) => {
                        warn!(
                            "schema '{}': skipping declaration '{}': {}",
                            variant.name, decl.key, reason
                        );
                        store.diagnostics.push(LayoutError::MalformedSchemaLine {
                            variant: variant.name.clone(),
                            key: decl.key.clone(),
                            reason,
                        });
                    }
                }
            }

            let merged = match &variant.copy_from {
                Some(base_name) => match store.variant(base_name) {
                    Some(base) => merge(base, &own, flags),
                    None => {
                        warn!(
                            "schema '{}': base '{}' is not declared earlier, not inheriting",
                            variant.name, base_name
                        );
                        store.diagnostics.push(LayoutError::UnknownBase {
                            variant: variant.name.clone(),
                            base: base_name.clone(),
                        });
                        own
                    }
                },
                None => own,
            };

            store.variants.push(merged);
        }

        store
    }

    pub fn from_json_str(json: &str) -> Result<SchemaStore> {
        let source: SchemaSource = serde_json::from_str(json)?;
        Ok(Self::load(source))
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<SchemaStore> {
        let source: SchemaSource = serde_json::from_reader(reader)?;
        Ok(Self::load(source))
    }

    /// Case-insensitive; the most recent declaration of a name wins.
    pub fn variant(&self, name: &str) -> Option<&SchemaEntrySet> {
        self.variants
            .iter()
            .rev()
            .find(|v| v.name.eq_ignore_ascii_case(name))
    }

    pub fn variants(&self) -> &[SchemaEntrySet] {
        &self.variants
    }

    /// Declarations that were skipped while loading.
    pub fn diagnostics(&self) -> &[LayoutError] {
        &self.diagnostics
    }
}

fn is_text_key(key: &str) -> bool {
    key.ends_with("Tweak") || key.ends_with("Locator") || key.ends_with("Prefix")
}

pub(crate) fn parse_int(token: &str) -> Option<i64> {
    let t = token.trim();
    let (negative, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

fn json_int(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => parse_int(s),
        _ => None,
    }
}

fn interpret_record(value: &serde_json::Value) -> std::result::Result<RawRecord, String> {
    let object = value
        .as_object()
        .ok_or_else(|| "record list items must be objects".to_string())?;

    let mut record = RawRecord::default();
    for (name, field) in object {
        let values = match field {
            serde_json::Value::Array(items) => items
                .iter()
                .map(json_int)
                .collect::<Option<Vec<i64>>>()
                .ok_or_else(|| format!("record field '{name}' holds a non-integer"))?,
            other => vec![json_int(other)
                .ok_or_else(|| format!("record field '{name}' is not an integer"))?],
        };
        record.fields.insert(name.clone(), values);
    }
    Ok(record)
}

fn interpret(key: &str, value: &serde_json::Value) -> std::result::Result<SchemaEntry, String> {
    use serde_json::Value;

    match value {
        Value::Number(n) => n
            .as_i64()
            .map(SchemaEntry::Scalar)
            .ok_or_else(|| format!("{n} is not a 64-bit integer")),
        Value::String(s) if is_text_key(key) => Ok(SchemaEntry::Text(s.clone())),
        Value::String(s) => match parse_int(s) {
            Some(v) => Ok(SchemaEntry::Scalar(v)),
            None if key.ends_with("Offset") => Err(format!("'{s}' is not an offset")),
            None => Ok(SchemaEntry::Text(s.clone())),
        },
        Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => items
            .iter()
            .map(interpret_record)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(SchemaEntry::RecordList),
        Value::Array(items) => items
            .iter()
            .map(json_int)
            .collect::<Option<Vec<i64>>>()
            .map(SchemaEntry::OffsetArray)
            .ok_or_else(|| "array mixes integers with other values".to_string()),
        Value::Bool(_) | Value::Null | Value::Object(_) => {
            Err("expected an integer, string or array".to_string())
        }
    }
}
