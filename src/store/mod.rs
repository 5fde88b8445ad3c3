//! Triple store backends for the resolver
//!
//! A store knows three things:
//! - interned URIs with stable, monotonically assigned ids
//! - a head table mapping `(subject id, predicate id)` to the offset of the
//!   most recent value record
//! - value records, each carrying the offset of the next (older) record
//!
//! Offset 0 is the end-of-list sentinel, so a list walk always terminates.
//! All list semantics (set replaces, add prepends) live in the resolver;
//! stores only provide these primitives. A list belongs to exactly one
//! head, so once the resolver unlinks a list it hands the list back with
//! [`TripleStore::release`].

use crate::error::Result;
use crate::value::ValueType;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Stable id of an interned URI
pub type UriId = u32;

/// Offset of a value record (0 = none)
pub type RecordOffset = u64;

/// One link of a value list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value_type: ValueType,
    pub data: Vec<u8>,
    pub next: RecordOffset,
}

impl StoredValue {
    /// The record returned for offset 0
    pub fn sentinel() -> Self {
        StoredValue {
            value_type: ValueType::Unknown,
            data: Vec::new(),
            next: 0,
        }
    }
}

/// Backing storage of the attribute resolver
pub trait TripleStore: Send {
    /// Intern a URI, assigning a new id on first sight
    fn intern(&mut self, uri: &str) -> Result<UriId>;

    /// Id of an already interned URI
    fn lookup(&self, uri: &str) -> Result<Option<UriId>>;

    /// URI text for an id
    fn uri(&self, id: UriId) -> Result<Option<String>>;

    /// Offset of the newest record for the pair, 0 if none
    fn head(&self, subject: UriId, predicate: UriId) -> Result<RecordOffset>;

    /// Point the pair at a new list head; 0 removes the pair
    fn set_head(&mut self, subject: UriId, predicate: UriId, head: RecordOffset) -> Result<()>;

    /// Store a record and return its offset (never 0)
    fn append(&mut self, value_type: ValueType, data: &[u8], next: RecordOffset)
        -> Result<RecordOffset>;

    /// Fetch a record; offset 0 yields the sentinel
    fn record(&self, offset: RecordOffset) -> Result<StoredValue>;

    /// Free the list starting at `head`
    ///
    /// The walk stops at the sentinel or at a record that is already gone.
    fn release(&mut self, head: RecordOffset) -> Result<()>;

    /// Predicates that currently have values for a subject
    fn predicates(&self, subject: UriId) -> Result<Vec<UriId>>;

    /// Subjects that currently have at least one value
    fn subjects(&self) -> Result<Vec<UriId>>;

    /// Persist pending changes
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share

    use super::*;

    pub fn interning_is_stable(store: &mut dyn TripleStore) {
        let a = store.intern("aff4://a").unwrap();
        let b = store.intern("aff4://b").unwrap();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(store.intern("aff4://a").unwrap(), a);
        assert_eq!(store.lookup("aff4://b").unwrap(), Some(b));
        assert_eq!(store.lookup("aff4://missing").unwrap(), None);
        assert_eq!(store.uri(a).unwrap().as_deref(), Some("aff4://a"));
    }

    pub fn lists_terminate(store: &mut dyn TripleStore) {
        let s = store.intern("aff4://s").unwrap();
        let p = store.intern("aff4:p").unwrap();
        assert_eq!(store.head(s, p).unwrap(), 0);

        let first = store.append(ValueType::U32, &1u32.to_le_bytes(), 0).unwrap();
        let second = store.append(ValueType::U32, &2u32.to_le_bytes(), first).unwrap();
        assert_ne!(first, 0);
        store.set_head(s, p, second).unwrap();

        let mut offset = store.head(s, p).unwrap();
        let mut seen = Vec::new();
        while offset != 0 {
            let record = store.record(offset).unwrap();
            seen.push(record.data.clone());
            offset = record.next;
        }
        assert_eq!(seen, vec![2u32.to_le_bytes().to_vec(), 1u32.to_le_bytes().to_vec()]);
        assert_eq!(store.record(0).unwrap(), StoredValue::sentinel());
    }

    pub fn heads_can_be_removed(store: &mut dyn TripleStore) {
        let s = store.intern("aff4://s").unwrap();
        let p = store.intern("aff4:p").unwrap();
        let q = store.intern("aff4:q").unwrap();
        let r = store.append(ValueType::String, b"x", 0).unwrap();
        store.set_head(s, p, r).unwrap();
        store.set_head(s, q, r).unwrap();

        let mut predicates = store.predicates(s).unwrap();
        predicates.sort();
        assert_eq!(predicates, vec![p, q]);
        assert_eq!(store.subjects().unwrap(), vec![s]);

        store.set_head(s, p, 0).unwrap();
        assert_eq!(store.predicates(s).unwrap(), vec![q]);
        store.set_head(s, q, 0).unwrap();
        assert!(store.subjects().unwrap().is_empty());
    }

    pub fn released_lists_are_gone(store: &mut dyn TripleStore) {
        let keep = store.append(ValueType::String, b"keep", 0).unwrap();
        let first = store.append(ValueType::String, b"a", 0).unwrap();
        let second = store.append(ValueType::String, b"b", first).unwrap();

        store.release(second).unwrap();
        assert!(store.record(second).is_err());
        assert!(store.record(first).is_err());
        assert_eq!(store.record(keep).unwrap().data, b"keep".to_vec());

        // Releasing twice, or the sentinel, is harmless
        store.release(second).unwrap();
        store.release(0).unwrap();
        let again = store.append(ValueType::String, b"c", keep).unwrap();
        assert_eq!(store.record(again).unwrap().next, keep);
    }
}
