//! Attribute resolver
//!
//! The resolver is the single source of truth for object state. It holds:
//! - a triple store mapping `(subject, predicate)` to a most-recent-first
//!   list of typed values
//! - named advisory locks
//! - read and write object caches, from which `open` hands out objects and
//!   to which `cache_return` takes them back
//!
//! Objects keep an `Arc<Resolver>`; cached objects therefore keep the
//! resolver alive until [`Resolver::shutdown`] empties the caches.

use crate::cache::Cache;
use crate::config::{Aff4Config, StoreBackend};
use crate::error::{Aff4Error, Result};
use crate::lock::{LockTable, SharedStore, WriteLease};
use crate::object::{Aff4Object, Checkout, Mode, ObjectKind};
use crate::store::{MemoryStore, SqliteStore, StoredValue, TripleStore};
use crate::urn::Urn;
use crate::value::{Value, ValueType};
use crate::vocab;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One exported statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Urn,
    pub predicate: String,
    pub value: Value,
}

/// Forward-only cursor over the values of one `(subject, predicate)` pair
///
/// Not `Clone`: a cursor is consumed by advancing it. Ask the resolver for
/// a new one to restart. The cursor holds the list as it was when created,
/// so a later `set` or `del` does not disturb it.
#[derive(Debug)]
pub struct ValueIter {
    pending: std::vec::IntoIter<StoredValue>,
}

pub struct Resolver {
    store: SharedStore,
    locks: Arc<LockTable>,
    read_cache: Mutex<Cache<Aff4Object>>,
    write_cache: Mutex<Cache<Aff4Object>>,
    config: Aff4Config,
}

impl Resolver {
    /// In-memory resolver with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_store(Aff4Config::default(), Box::new(MemoryStore::new()))
    }

    /// Resolver whose store is chosen by `config.store`
    pub fn with_config(config: Aff4Config) -> Result<Arc<Self>> {
        config.validate()?;
        let store: Box<dyn TripleStore> = match config.store.backend {
            StoreBackend::Memory => Box::new(MemoryStore::new()),
            StoreBackend::Sqlite => {
                let path = config.store.path.as_ref().ok_or_else(|| {
                    Aff4Error::InvalidParameter("sqlite store requires a path".into())
                })?;
                let store: Box<dyn TripleStore> = Box::new(SqliteStore::open(path)?);
                let locks = lock_dir(path);
                return Ok(Self::build(config, store, Some(locks)));
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Resolver over a caller-supplied store; its locks are process-local
    pub fn with_store(config: Aff4Config, store: Box<dyn TripleStore>) -> Arc<Self> {
        Self::build(config, store, None)
    }

    fn build(
        config: Aff4Config,
        store: Box<dyn TripleStore>,
        lock_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let policy = config.cache.policy;
        let read_cache = if config.cache.objects == 0 {
            Cache::unbounded(policy)
        } else {
            Cache::new(config.cache.objects, policy)
        };
        let store: SharedStore = Arc::new(Mutex::new(store));
        Arc::new(Resolver {
            locks: Arc::new(LockTable::with_store(Arc::clone(&store), lock_dir)),
            store,
            read_cache: Mutex::new(read_cache),
            // Write-mode objects hold unflushed state; they leave the cache
            // only through `open` or `shutdown`, never by eviction.
            write_cache: Mutex::new(Cache::unbounded(policy)),
            config,
        })
    }

    pub fn config(&self) -> &Aff4Config {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    // ---- attributes ----------------------------------------------------

    /// Replace every value of `attribute` with `value`
    pub fn set_value(&self, uri: &Urn, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut store = self.store.lock();
        let subject = store.intern(uri.as_str())?;
        let predicate = store.intern(attribute)?;
        let old = store.head(subject, predicate)?;
        let offset = store.append(value.value_type(), &value.encode(), 0)?;
        store.set_head(subject, predicate, offset)?;
        store.release(old)
    }

    /// Prepend `value` to the values of `attribute`
    ///
    /// With `unique`, a value already present is not added again. Returns
    /// whether the value was added.
    pub fn add_value(
        &self,
        uri: &Urn,
        attribute: &str,
        value: impl Into<Value>,
        unique: bool,
    ) -> Result<bool> {
        let value = value.into();
        let value_type = value.value_type();
        let data = value.encode();

        let mut store = self.store.lock();
        let subject = store.intern(uri.as_str())?;
        let predicate = store.intern(attribute)?;
        let head = store.head(subject, predicate)?;

        if unique {
            let mut offset = head;
            while offset != 0 {
                let record = store.record(offset)?;
                if record.value_type == value_type && record.data == data {
                    return Ok(false);
                }
                offset = record.next;
            }
        }

        let offset = store.append(value_type, &data, head)?;
        store.set_head(subject, predicate, offset)?;
        Ok(true)
    }

    /// Remove every occurrence of `value`, keeping the others in order
    pub fn remove_value(&self, uri: &Urn, attribute: &str, value: &Value) -> Result<bool> {
        let value_type = value.value_type();
        let data = value.encode();

        let mut store = self.store.lock();
        let (subject, predicate) = match (store.lookup(uri.as_str())?, store.lookup(attribute)?) {
            (Some(s), Some(p)) => (s, p),
            _ => return Ok(false),
        };

        let mut kept = Vec::new();
        let mut removed = false;
        let old = store.head(subject, predicate)?;
        let mut offset = old;
        while offset != 0 {
            let record = store.record(offset)?;
            offset = record.next;
            if record.value_type == value_type && record.data == data {
                removed = true;
            } else {
                kept.push(record);
            }
        }
        if !removed {
            return Ok(false);
        }

        // Relink the survivors oldest first so the head stays the newest
        let mut head = 0;
        for record in kept.iter().rev() {
            head = store.append(record.value_type, &record.data, head)?;
        }
        store.set_head(subject, predicate, head)?;
        store.release(old)?;
        Ok(true)
    }

    /// Most recent value of `attribute`
    ///
    /// Returns `None` when the attribute is missing or its newest value is
    /// not of the requested type.
    pub fn resolve_value(
        &self,
        uri: &Urn,
        attribute: &str,
        value_type: ValueType,
    ) -> Result<Option<Value>> {
        let store = self.store.lock();
        let (subject, predicate) = match (store.lookup(uri.as_str())?, store.lookup(attribute)?) {
            (Some(s), Some(p)) => (s, p),
            _ => return Ok(None),
        };
        let record = store.record(store.head(subject, predicate)?)?;
        if record.value_type == ValueType::Unknown || !value_type.accepts(record.value_type) {
            return Ok(None);
        }
        Value::decode(record.value_type, &record.data).map(Some)
    }

    /// Like [`resolve_value`](Self::resolve_value) but a miss is an error
    pub fn resolve(&self, uri: &Urn, attribute: &str, value_type: ValueType) -> Result<Value> {
        match self.resolve_value(uri, attribute, ValueType::Any)? {
            Some(value) if value_type.accepts(value.value_type()) => Ok(value),
            Some(value) => Err(Aff4Error::TypeMismatch {
                expected: value_type.name().into(),
                found: value.value_type().name().into(),
            }),
            None => Err(Aff4Error::NotFound(format!("{} {}", uri, attribute))),
        }
    }

    /// Any integer width, widened
    pub fn resolve_u64(&self, uri: &Urn, attribute: &str) -> Result<Option<u64>> {
        Ok(self
            .resolve_value(uri, attribute, ValueType::Any)?
            .and_then(|v| v.as_u64()))
    }

    pub fn resolve_string(&self, uri: &Urn, attribute: &str) -> Result<Option<String>> {
        Ok(self
            .resolve_value(uri, attribute, ValueType::Any)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn resolve_urn(&self, uri: &Urn, attribute: &str) -> Result<Option<Urn>> {
        Ok(match self.resolve_value(uri, attribute, ValueType::Any)? {
            Some(Value::Urn(urn)) => Some(urn),
            Some(Value::String(s)) => Some(Urn::new(s)),
            _ => None,
        })
    }

    /// Cursor over all values of `attribute`, newest first
    pub fn get_iter(&self, uri: &Urn, attribute: &str) -> Result<ValueIter> {
        let store = self.store.lock();
        let mut offset = match (store.lookup(uri.as_str())?, store.lookup(attribute)?) {
            (Some(s), Some(p)) => store.head(s, p)?,
            _ => 0,
        };
        let mut records = Vec::new();
        while offset != 0 {
            let record = store.record(offset)?;
            if record.value_type == ValueType::Unknown {
                break;
            }
            offset = record.next;
            records.push(record);
        }
        Ok(ValueIter {
            pending: records.into_iter(),
        })
    }

    /// Advance a cursor; `None` once the list is exhausted
    pub fn iter_next(&self, iter: &mut ValueIter) -> Result<Option<Value>> {
        match iter.pending.next() {
            Some(record) => Value::decode(record.value_type, &record.data).map(Some),
            None => Ok(None),
        }
    }

    /// Iterator adapter over [`get_iter`](Self::get_iter)
    pub fn values(&self, uri: &Urn, attribute: &str) -> Result<Values<'_>> {
        Ok(Values {
            resolver: self,
            cursor: self.get_iter(uri, attribute)?,
        })
    }

    /// All values of `attribute`, newest first
    pub fn resolve_all(&self, uri: &Urn, attribute: &str) -> Result<Vec<Value>> {
        self.values(uri, attribute)?.collect()
    }

    /// Delete one attribute of `uri`, or all of them
    pub fn del(&self, uri: &Urn, attribute: Option<&str>) -> Result<()> {
        let mut store = self.store.lock();
        let subject = match store.lookup(uri.as_str())? {
            Some(s) => s,
            None => return Ok(()),
        };
        let predicates = match attribute {
            Some(attribute) => store.lookup(attribute)?.into_iter().collect(),
            None => store.predicates(subject)?,
        };
        for predicate in predicates {
            let head = store.head(subject, predicate)?;
            store.set_head(subject, predicate, 0)?;
            store.release(head)?;
        }
        Ok(())
    }

    /// Predicates that currently have values for `uri`
    pub fn attributes(&self, uri: &Urn) -> Result<Vec<String>> {
        let store = self.store.lock();
        let subject = match store.lookup(uri.as_str())? {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let mut names = Vec::new();
        for predicate in store.predicates(subject)? {
            if let Some(name) = store.uri(predicate)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Every subject with at least one value, in order of first sight
    pub fn subjects(&self) -> Result<Vec<Urn>> {
        let store = self.store.lock();
        let mut subjects = Vec::new();
        for id in store.subjects()? {
            if let Some(uri) = store.uri(id)? {
                subjects.push(Urn::new(uri));
            }
        }
        Ok(subjects)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.lock().flush()
    }

    // ---- locks ---------------------------------------------------------

    /// Block until the named lock on `uri` is ours
    ///
    /// The lock's record is created in the store on first use.
    pub fn lock(&self, uri: &Urn, mode: Mode) -> Result<()> {
        self.locks.lock(uri, mode)
    }

    pub fn unlock(&self, uri: &Urn, mode: Mode) {
        self.locks.unlock(uri, mode);
    }

    // ---- objects -------------------------------------------------------

    /// Which kind of object `urn` names
    ///
    /// The URN scheme is checked first, then the `aff4:type` attribute.
    pub fn kind_of(&self, urn: &Urn) -> Result<ObjectKind> {
        if urn.is_file() {
            return Ok(ObjectKind::File);
        }
        let type_urn = self
            .resolve_urn(urn, vocab::AFF4_TYPE)?
            .ok_or_else(|| Aff4Error::NotFound(format!("{} has no {}", urn, vocab::AFF4_TYPE)))?;
        ObjectKind::from_type(type_urn.as_str()).ok_or_else(|| {
            Aff4Error::Unsupported(format!("{} has unknown type {}", urn, type_urn))
        })
    }

    /// Take exclusive ownership of the object named `urn`
    ///
    /// A cached instance is reused when one exists; otherwise a new one is
    /// built from the resolver's attributes. Write mode blocks until the
    /// URN's write lock is free and keeps it until the object is returned
    /// or closed. Every successful `open` must be paired with
    /// [`cache_return`](Self::cache_return) or a close; prefer
    /// [`checkout`](Self::checkout), which guarantees it.
    pub fn open(self: &Arc<Self>, urn: &Urn, mode: Mode) -> Result<Aff4Object> {
        let lease = match mode {
            Mode::Write => Some(WriteLease::acquire(&self.locks, urn)?),
            Mode::Read => None,
        };

        let cached = self.cache_for(mode).lock().get(urn.as_str());
        let mut object = match cached {
            Some(object) => {
                debug!("Cache hit for {} ({:?})", urn, mode);
                object
            }
            None => {
                debug!("Cache miss for {} ({:?})", urn, mode);
                let kind = self.kind_of(urn)?;
                kind.construct(self, urn, mode)?
            }
        };

        if let Some(lease) = lease {
            object.base_mut().attach_lease(lease);
        }
        Ok(object)
    }

    /// [`open`](Self::open) wrapped in a guard that returns the object on drop
    pub fn checkout(self: &Arc<Self>, urn: &Urn, mode: Mode) -> Result<Checkout> {
        let object = self.open(urn, mode)?;
        Ok(Checkout::new(self, object))
    }

    /// Give an opened object back
    ///
    /// The object is parked in the cache for its mode and its write lock is
    /// released. Closed objects are dropped; a member still being written
    /// is finished instead of parked.
    pub fn cache_return(&self, mut object: Aff4Object) {
        if object.is_closed() {
            return;
        }
        if !object.is_cacheable() {
            let urn = object.urn().clone();
            if let Err(e) = object.close() {
                warn!("Closing {} on return failed: {}", urn, e);
            }
            return;
        }

        let lease = object.base_mut().take_lease();
        let key = object.urn().as_str().as_bytes().to_vec();
        let evicted = self.cache_for(object.mode()).lock().put(key, object);
        // Released only once the object is findable again
        drop(lease);

        if let Some((key, old)) = evicted {
            debug!("Evicted {}", String::from_utf8_lossy(&key));
            let urn = old.urn().clone();
            if let Err(e) = old.close() {
                warn!("Closing evicted {} failed: {}", urn, e);
            }
        }
    }

    /// Whether an instance of `urn` is parked for `mode`
    pub fn is_cached(&self, urn: &Urn, mode: Mode) -> bool {
        self.cache_for(mode).lock().present(urn.as_str())
    }

    fn cache_for(&self, mode: Mode) -> &Mutex<Cache<Aff4Object>> {
        match mode {
            Mode::Read => &self.read_cache,
            Mode::Write => &self.write_cache,
        }
    }

    /// Close every cached object and flush the store
    ///
    /// Write-mode objects are closed streams first, volumes after them, so
    /// pending members land before their directory is written. The first
    /// failure is returned after everything has been attempted.
    pub fn shutdown(&self) -> Result<()> {
        let readers = self.read_cache.lock().drain();
        let mut writers: Vec<Aff4Object> = self
            .write_cache
            .lock()
            .drain()
            .into_iter()
            .map(|(_, object)| object)
            .collect();
        writers.sort_by_key(|object| object.kind().close_order());

        let mut first_error = None;
        for object in readers.into_iter().map(|(_, object)| object).chain(writers) {
            let urn = object.urn().clone();
            if let Err(e) = object.close() {
                warn!("Closing {} at shutdown failed: {}", urn, e);
                first_error.get_or_insert(e);
            }
        }
        self.flush()?;
        info!("Resolver shut down");
        first_error.map_or(Ok(()), Err)
    }

    // ---- metadata export ------------------------------------------------

    /// Persistent statements about `subjects`, oldest value first
    pub fn export_triples(&self, subjects: &[Urn]) -> Result<Vec<Triple>> {
        let mut triples = Vec::new();
        for subject in subjects {
            for predicate in self.attributes(subject)? {
                if vocab::is_volatile(&predicate) {
                    continue;
                }
                let mut values = self.resolve_all(subject, &predicate)?;
                values.reverse();
                for value in values {
                    triples.push(Triple {
                        subject: subject.clone(),
                        predicate: predicate.clone(),
                        value,
                    });
                }
            }
        }
        Ok(triples)
    }

    /// Load statements produced by [`export_triples`](Self::export_triples)
    ///
    /// Volatile predicates are skipped. Returns how many values were new.
    pub fn import_triples(&self, triples: &[Triple]) -> Result<usize> {
        let mut added = 0;
        for triple in triples {
            if vocab::is_volatile(&triple.predicate) {
                warn!(
                    "Skipping volatile {} for {} in imported metadata",
                    triple.predicate, triple.subject
                );
                continue;
            }
            if self.add_value(&triple.subject, &triple.predicate, triple.value.clone(), true)? {
                added += 1;
            }
        }
        Ok(added)
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("read_cache", &self.read_cache.lock().len())
            .field("write_cache", &self.write_cache.lock().len())
            .finish()
    }
}

/// Directory of lock record files kept beside an on-disk store
fn lock_dir(store: &Path) -> PathBuf {
    let mut dir = store.as_os_str().to_owned();
    dir.push(".locks");
    PathBuf::from(dir)
}

/// Iterator over one attribute's values, newest first
pub struct Values<'a> {
    resolver: &'a Resolver,
    cursor: ValueIter,
}

impl Iterator for Values<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.resolver.iter_next(&mut self.cursor).transpose()
    }
}
