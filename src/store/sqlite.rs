//! On-disk triple store backed by SQLite
//!
//! Same layout as the in-memory store, spread over three tables. SQLite's
//! own file locking serialises concurrent writers across processes.

use super::{RecordOffset, StoredValue, TripleStore, UriId};
use crate::error::{Aff4Error, Result};
use crate::value::ValueType;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS uris (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS heads (
        subject INTEGER NOT NULL,
        predicate INTEGER NOT NULL,
        head INTEGER NOT NULL,
        PRIMARY KEY (subject, predicate)
    );
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind INTEGER NOT NULL,
        data BLOB NOT NULL,
        next INTEGER NOT NULL
    );
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a store file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!("Opening resolver store at {:?}", path.as_ref());
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// A private store living only as long as this value
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn })
    }
}

impl TripleStore for SqliteStore {
    fn intern(&mut self, uri: &str) -> Result<UriId> {
        if let Some(id) = self.lookup(uri)? {
            return Ok(id);
        }
        self.conn
            .prepare_cached("INSERT INTO uris (uri) VALUES (?1)")?
            .execute(params![uri])?;
        Ok(self.conn.last_insert_rowid() as UriId)
    }

    fn lookup(&self, uri: &str) -> Result<Option<UriId>> {
        let id = self
            .conn
            .prepare_cached("SELECT id FROM uris WHERE uri = ?1")?
            .query_row(params![uri], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(id.map(|id| id as UriId))
    }

    fn uri(&self, id: UriId) -> Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached("SELECT uri FROM uris WHERE id = ?1")?
            .query_row(params![id as i64], |row| row.get(0))
            .optional()?)
    }

    fn head(&self, subject: UriId, predicate: UriId) -> Result<RecordOffset> {
        let head = self
            .conn
            .prepare_cached("SELECT head FROM heads WHERE subject = ?1 AND predicate = ?2")?
            .query_row(params![subject as i64, predicate as i64], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(head.map(|h| h as RecordOffset).unwrap_or(0))
    }

    fn set_head(&mut self, subject: UriId, predicate: UriId, head: RecordOffset) -> Result<()> {
        if head == 0 {
            self.conn
                .prepare_cached("DELETE FROM heads WHERE subject = ?1 AND predicate = ?2")?
                .execute(params![subject as i64, predicate as i64])?;
        } else {
            self.conn
                .prepare_cached(
                    "INSERT INTO heads (subject, predicate, head) VALUES (?1, ?2, ?3)
                     ON CONFLICT(subject, predicate) DO UPDATE SET head = excluded.head",
                )?
                .execute(params![subject as i64, predicate as i64, head as i64])?;
        }
        Ok(())
    }

    fn append(
        &mut self,
        value_type: ValueType,
        data: &[u8],
        next: RecordOffset,
    ) -> Result<RecordOffset> {
        self.conn
            .prepare_cached("INSERT INTO records (kind, data, next) VALUES (?1, ?2, ?3)")?
            .execute(params![value_type as u8 as i64, data, next as i64])?;
        Ok(self.conn.last_insert_rowid() as RecordOffset)
    }

    fn record(&self, offset: RecordOffset) -> Result<StoredValue> {
        if offset == 0 {
            return Ok(StoredValue::sentinel());
        }
        self.conn
            .prepare_cached("SELECT kind, data, next FROM records WHERE id = ?1")?
            .query_row(params![offset as i64], |row| {
                Ok(StoredValue {
                    value_type: ValueType::from_u8(row.get::<_, i64>(0)? as u8),
                    data: row.get(1)?,
                    next: row.get::<_, i64>(2)? as RecordOffset,
                })
            })
            .optional()?
            .ok_or_else(|| Aff4Error::Runtime(format!("no record at offset {}", offset)))
    }

    fn release(&mut self, head: RecordOffset) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut offset = head;
        let mut freed = 0;
        while offset != 0 {
            let next = tx
                .prepare_cached("SELECT next FROM records WHERE id = ?1")?
                .query_row(params![offset as i64], |row| row.get::<_, i64>(0))
                .optional()?;
            let next = match next {
                Some(next) => next as RecordOffset,
                None => break,
            };
            tx.prepare_cached("DELETE FROM records WHERE id = ?1")?
                .execute(params![offset as i64])?;
            freed += 1;
            offset = next;
        }
        tx.commit()?;
        debug!("Released {} record(s) from {}", freed, head);
        Ok(())
    }

    fn predicates(&self, subject: UriId) -> Result<Vec<UriId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT predicate FROM heads WHERE subject = ?1 ORDER BY predicate")?;
        let rows = stmt.query_map(params![subject as i64], |row| row.get::<_, i64>(0))?;
        let mut predicates = Vec::new();
        for row in rows {
            predicates.push(row? as UriId);
        }
        Ok(predicates)
    }

    fn subjects(&self) -> Result<Vec<UriId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT subject FROM heads ORDER BY subject")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut subjects = Vec::new();
        for row in rows {
            subjects.push(row? as UriId);
        }
        Ok(subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    #[test]
    fn test_interning_is_stable() {
        conformance::interning_is_stable(&mut SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_lists_terminate() {
        conformance::lists_terminate(&mut SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_heads_can_be_removed() {
        conformance::heads_can_be_removed(&mut SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_released_lists_are_gone() {
        conformance::released_lists_are_gone(&mut SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resolver.db");

        let (s, p, offset) = {
            let mut store = SqliteStore::open(&path).unwrap();
            let s = store.intern("aff4://image").unwrap();
            let p = store.intern("aff4:size").unwrap();
            let offset = store
                .append(ValueType::U64, &12000u64.to_le_bytes(), 0)
                .unwrap();
            store.set_head(s, p, offset).unwrap();
            (s, p, offset)
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.lookup("aff4://image").unwrap(), Some(s));
        assert_eq!(store.head(s, p).unwrap(), offset);
        let record = store.record(offset).unwrap();
        assert_eq!(record.value_type, ValueType::U64);
        assert_eq!(record.data, 12000u64.to_le_bytes().to_vec());
    }
}
