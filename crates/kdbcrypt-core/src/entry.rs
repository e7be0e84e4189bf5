use std::collections::{btree_map, BTreeMap};

/// Value held by an entry. The variant is the entry's declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text value.
    String(String),
    /// Raw bytes; `None` is a null binary value, distinct from an empty one.
    Binary(Option<Vec<u8>>),
}

impl Default for Value {
    fn default() -> Self {
        Value::String(String::new())
    }
}

/// A named configuration value with metadata, owned by the host store.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    name: String,
    value: Value,
    meta: BTreeMap<String, String>,
    sync: bool,
}

impl Entry {
    /// New entries start out dirty, like anything the host has not persisted yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::default(),
            meta: BTreeMap::new(),
            sync: true,
        }
    }

    pub fn with_string(mut self, value: impl Into<String>) -> Self {
        self.set_string(value);
        self
    }

    pub fn with_binary(mut self, value: Option<Vec<u8>>) -> Self {
        self.set_binary(value);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_meta(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.value, Value::Binary(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.value, Value::String(_))
    }

    /// Text view of the value; binary entries have none.
    pub fn string(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            Value::Binary(_) => None,
        }
    }

    /// Byte view of a binary value; null and string values have none.
    pub fn binary(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Binary(Some(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Size of the stored value in bytes.
    pub fn value_size(&self) -> usize {
        match &self.value {
            Value::String(s) => s.len(),
            Value::Binary(bytes) => bytes.as_ref().map_or(0, Vec::len),
        }
    }

    pub fn set_string(&mut self, value: impl Into<String>) {
        self.set_value(Value::String(value.into()));
    }

    pub fn set_binary(&mut self, value: Option<Vec<u8>>) {
        self.set_value(Value::Binary(value));
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
        self.sync = true;
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// `"1"` is true; any other value, or no value at all, is false.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta(key) == Some("1")
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
        self.sync = true;
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        let removed = self.meta.remove(key);
        if removed.is_some() {
            self.sync = true;
        }
        removed
    }

    pub fn meta_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.meta.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the entry changed since the host last cleared the flag.
    pub fn needs_sync(&self) -> bool {
        self.sync
    }

    pub fn clear_sync(&mut self) {
        self.sync = false;
    }
}

/// Equality covers name, typed value and every metadata entry; the sync flag is bookkeeping.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.meta == other.meta
    }
}

impl Eq for Entry {}

/// Name-ordered collection of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    entries: BTreeMap<String, Entry>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same name.
    pub fn append(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    pub fn lookup(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Entry> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, Entry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, String, Entry> {
        self.entries.values_mut()
    }
}

impl FromIterator<Entry> for KeySet {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut ks = KeySet::new();
        for entry in iter {
            ks.append(entry);
        }
        ks
    }
}

impl IntoIterator for KeySet {
    type Item = Entry;
    type IntoIter = btree_map::IntoValues<String, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}
