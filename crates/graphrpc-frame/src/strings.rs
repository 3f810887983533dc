//! Per-stream deduplicated string table.
//!
//! Index 0 is reserved for an absent string; entries are numbered from 1 in
//! insertion order.

use std::collections::HashMap;
use std::sync::Arc;

/// Wire index meaning "no string".
pub const NULL_STRING: u32 = 0;

/// Interns strings written into one value stream.
#[derive(Debug, Default, Clone)]
pub struct StringTable {
    index: HashMap<Arc<str>, u32>,
    entries: Vec<Arc<str>>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the 1-based index of `value`, inserting it on first sight.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.index.get(value) {
            return idx;
        }
        let entry: Arc<str> = Arc::from(value);
        self.entries.push(Arc::clone(&entry));
        let idx = self.entries.len() as u32;
        self.index.insert(entry, idx);
        idx
    }

    /// Look up an entry by its 1-based index.
    pub fn get(&self, index: u32) -> Option<&str> {
        if index == NULL_STRING {
            return None;
        }
        self.entries.get(index as usize - 1).map(|s| s.as_ref())
    }

    /// Number of distinct strings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in index order (index 1 first).
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_deduplicates() {
        let mut table = StringTable::new();
        let a = table.intern("abc");
        let b = table.intern("def");
        let c = table.intern("abc");

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(c, a);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries().collect::<Vec<_>>(), vec!["abc", "def"]);
    }

    #[test]
    fn empty_string_is_an_entry_not_null() {
        let mut table = StringTable::new();
        let idx = table.intern("");
        assert_eq!(idx, 1);
        assert_eq!(table.get(idx), Some(""));
        assert_eq!(table.get(NULL_STRING), None);
    }

    #[test]
    fn get_out_of_range_is_none() {
        let mut table = StringTable::new();
        table.intern("x");
        assert_eq!(table.get(2), None);
    }
}
