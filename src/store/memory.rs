//! In-memory triple store

use super::{RecordOffset, StoredValue, TripleStore, UriId};
use crate::error::{Aff4Error, Result};
use crate::value::ValueType;
use ahash::AHashMap;
use std::collections::BTreeMap;

/// Volatile store used by default
///
/// Records live in slots of a vector; a record's offset is its slot index
/// plus one so that 0 stays free for the sentinel. Released slots go on a
/// free list and are filled by later appends, so overwriting an attribute
/// again and again does not grow the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ids: AHashMap<String, UriId>,
    uris: Vec<String>,
    heads: BTreeMap<(UriId, UriId), RecordOffset>,
    records: Vec<Option<StoredValue>>,
    free: Vec<RecordOffset>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub fn record_count(&self) -> usize {
        self.records.len() - self.free.len()
    }

    fn slot(&self, offset: RecordOffset) -> Option<&StoredValue> {
        let index = (offset as usize).checked_sub(1)?;
        self.records.get(index)?.as_ref()
    }
}

impl TripleStore for MemoryStore {
    fn intern(&mut self, uri: &str) -> Result<UriId> {
        if let Some(&id) = self.ids.get(uri) {
            return Ok(id);
        }
        let id = self.uris.len() as UriId + 1;
        self.uris.push(uri.to_string());
        self.ids.insert(uri.to_string(), id);
        Ok(id)
    }

    fn lookup(&self, uri: &str) -> Result<Option<UriId>> {
        Ok(self.ids.get(uri).copied())
    }

    fn uri(&self, id: UriId) -> Result<Option<String>> {
        if id == 0 {
            return Ok(None);
        }
        Ok(self.uris.get(id as usize - 1).cloned())
    }

    fn head(&self, subject: UriId, predicate: UriId) -> Result<RecordOffset> {
        Ok(self.heads.get(&(subject, predicate)).copied().unwrap_or(0))
    }

    fn set_head(&mut self, subject: UriId, predicate: UriId, head: RecordOffset) -> Result<()> {
        if head == 0 {
            self.heads.remove(&(subject, predicate));
        } else {
            self.heads.insert((subject, predicate), head);
        }
        Ok(())
    }

    fn append(
        &mut self,
        value_type: ValueType,
        data: &[u8],
        next: RecordOffset,
    ) -> Result<RecordOffset> {
        if next != 0 && self.slot(next).is_none() {
            return Err(Aff4Error::Runtime(format!(
                "record link {} points at no live record",
                next
            )));
        }
        let record = StoredValue {
            value_type,
            data: data.to_vec(),
            next,
        };
        match self.free.pop() {
            Some(offset) => {
                self.records[offset as usize - 1] = Some(record);
                Ok(offset)
            }
            None => {
                self.records.push(Some(record));
                Ok(self.records.len() as RecordOffset)
            }
        }
    }

    fn record(&self, offset: RecordOffset) -> Result<StoredValue> {
        if offset == 0 {
            return Ok(StoredValue::sentinel());
        }
        self.slot(offset)
            .cloned()
            .ok_or_else(|| Aff4Error::Runtime(format!("no record at offset {}", offset)))
    }

    fn release(&mut self, head: RecordOffset) -> Result<()> {
        let mut offset = head;
        while offset != 0 {
            let taken = self
                .records
                .get_mut(offset as usize - 1)
                .and_then(Option::take);
            match taken {
                Some(record) => {
                    self.free.push(offset);
                    offset = record.next;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn predicates(&self, subject: UriId) -> Result<Vec<UriId>> {
        Ok(self
            .heads
            .range((subject, 0)..=(subject, UriId::MAX))
            .map(|(&(_, predicate), _)| predicate)
            .collect())
    }

    fn subjects(&self) -> Result<Vec<UriId>> {
        let mut subjects: Vec<UriId> = self.heads.keys().map(|&(s, _)| s).collect();
        subjects.dedup();
        Ok(subjects)
    }
}
