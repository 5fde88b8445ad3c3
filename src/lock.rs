//! Named advisory locks
//!
//! Locks are cooperative: nothing stops code from touching an object it
//! has not locked, and a lock that is never released starves every other
//! waiter. Read and write locks on the same URN are distinct names and do
//! not exclude each other.
//!
//! A lock has two layers. Threads of one process queue on a condition
//! variable. When the table sits on a resolver store, the first use of a
//! name also creates its lock record in that store, and for an on-disk
//! store the holder takes an OS file lock on the record, so resolvers in
//! other processes sharing the store are excluded too. The OS releases
//! those file locks when a process dies, so a crash cannot wedge a name.

use crate::error::{Aff4Error, Result};
use crate::object::Mode;
use crate::store::{TripleStore, UriId};
use crate::urn::Urn;
use ahash::AHashMap;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a timed acquisition retries a file lock held elsewhere
const FILE_LOCK_POLL: Duration = Duration::from_millis(5);

/// Store shared between a resolver and its lock table
pub type SharedStore = Arc<Mutex<Box<dyn TripleStore>>>;

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    acquisitions: u64,
    /// Id of the lock's record in the store, once created
    record: Option<UriId>,
    /// OS lock held on the record's file
    file: Option<File>,
}

/// Store-level half of a held lock
struct Held {
    record: Option<UriId>,
    file: Option<File>,
}

/// Where lock records live
struct LockRecords {
    store: SharedStore,
    /// Directory of record files for an on-disk store
    dir: Option<PathBuf>,
}

/// Table of named locks, created lazily on first use
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<AHashMap<String, LockState>>,
    released: Condvar,
    records: Option<LockRecords>,
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("locks", &self.locks.lock().len())
            .field(
                "dir",
                &self.records.as_ref().and_then(|records| records.dir.as_ref()),
            )
            .finish()
    }
}

fn lock_name(urn: &Urn, mode: Mode) -> String {
    match mode {
        Mode::Read => format!("{}#read-lock", urn),
        Mode::Write => format!("{}#write-lock", urn),
    }
}

/// How long to keep trying before giving up
#[derive(Clone, Copy)]
enum Wait {
    Forever,
    Until(Instant),
}

impl LockTable {
    /// A table private to this process
    pub fn new() -> Self {
        Self::default()
    }

    /// A table whose lock records live in `store`
    ///
    /// With `dir`, each record is backed by a file there that the holder
    /// keeps OS-locked.
    pub fn with_store(store: SharedStore, dir: Option<PathBuf>) -> Self {
        LockTable {
            records: Some(LockRecords { store, dir }),
            ..Self::default()
        }
    }

    /// Block until the named lock is free, then take it
    pub fn lock(&self, urn: &Urn, mode: Mode) -> Result<()> {
        self.acquire(&lock_name(urn, mode), Wait::Forever)
            .map(|_| ())
    }

    /// Like [`lock`](Self::lock) but gives up after `timeout`
    pub fn try_lock_for(&self, urn: &Urn, mode: Mode, timeout: Duration) -> Result<bool> {
        self.acquire(&lock_name(urn, mode), Wait::Until(Instant::now() + timeout))
    }

    fn acquire(&self, name: &str, wait: Wait) -> Result<bool> {
        let record = {
            let mut locks = self.locks.lock();
            loop {
                let state = locks.entry(name.to_string()).or_default();
                if !state.held {
                    state.held = true;
                    break state.record;
                }
                debug!("Waiting for {}", name);
                match wait {
                    Wait::Forever => self.released.wait(&mut locks),
                    Wait::Until(deadline) => {
                        if self.released.wait_until(&mut locks, deadline).timed_out()
                            && locks.get(name).is_some_and(|state| state.held)
                        {
                            return Ok(false);
                        }
                    }
                }
            }
        };

        // Ours within this process; now the store-level half
        match self.take_record(name, record, wait) {
            Ok(Some(held)) => {
                let mut locks = self.locks.lock();
                let state = locks.entry(name.to_string()).or_default();
                state.acquisitions += 1;
                state.record = held.record;
                state.file = held.file;
                Ok(true)
            }
            Ok(None) => {
                self.release_local(name);
                Ok(false)
            }
            Err(e) => {
                self.release_local(name);
                Err(e)
            }
        }
    }

    /// Create the lock record if needed and lock its file
    ///
    /// `None` when the file stayed locked by another holder until the
    /// deadline.
    fn take_record(&self, name: &str, record: Option<UriId>, wait: Wait) -> Result<Option<Held>> {
        let records = match &self.records {
            Some(records) => records,
            None => {
                return Ok(Some(Held {
                    record: None,
                    file: None,
                }))
            }
        };
        let record = match record {
            Some(id) => id,
            None => {
                let id = records.store.lock().intern(name)?;
                debug!("Created lock record {} for {}", id, name);
                id
            }
        };
        let dir = match &records.dir {
            Some(dir) => dir,
            None => {
                return Ok(Some(Held {
                    record: Some(record),
                    file: None,
                }))
            }
        };

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", record));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match wait {
            Wait::Forever => {
                file.lock_exclusive().map_err(|e| {
                    Aff4Error::Runtime(format!("locking {} ({:?}): {}", name, path, e))
                })?;
            }
            Wait::Until(deadline) => loop {
                if file.try_lock_exclusive().is_ok() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(FILE_LOCK_POLL);
            },
        }
        Ok(Some(Held {
            record: Some(record),
            file: Some(file),
        }))
    }

    fn release_local(&self, name: &str) {
        if let Some(state) = self.locks.lock().get_mut(name) {
            state.held = false;
        }
        self.released.notify_all();
    }

    /// Release a named lock
    ///
    /// Releasing a lock that is not held is a caller bug; it is logged and
    /// otherwise ignored.
    pub fn unlock(&self, urn: &Urn, mode: Mode) {
        let name = lock_name(urn, mode);
        let mut locks = self.locks.lock();
        match locks.get_mut(&name) {
            Some(state) if state.held => {
                if let Some(file) = state.file.take() {
                    if let Err(e) = FileExt::unlock(&file) {
                        warn!("Unlocking the record of {} failed: {}", name, e);
                    }
                }
                state.held = false;
            }
            _ => {
                warn!("Released {} which was not held", name);
                return;
            }
        }
        drop(locks);
        self.released.notify_all();
    }

    pub fn is_locked(&self, urn: &Urn, mode: Mode) -> bool {
        self.locks
            .lock()
            .get(&lock_name(urn, mode))
            .map(|state| state.held)
            .unwrap_or(false)
    }

    /// How many times a lock has been taken since it was created
    pub fn acquisitions(&self, urn: &Urn, mode: Mode) -> u64 {
        self.locks
            .lock()
            .get(&lock_name(urn, mode))
            .map(|state| state.acquisitions)
            .unwrap_or(0)
    }
}

/// Ownership of a URN's write lock
///
/// The lock is released when the lease is dropped, so a write-mode object
/// that goes out of scope on an error path cannot leak its lock.
#[derive(Debug)]
pub struct WriteLease {
    locks: Arc<LockTable>,
    urn: Urn,
}

impl WriteLease {
    /// Block until the write lock on `urn` is ours
    pub fn acquire(locks: &Arc<LockTable>, urn: &Urn) -> Result<Self> {
        locks.lock(urn, Mode::Write)?;
        Ok(WriteLease {
            locks: Arc::clone(locks),
            urn: urn.clone(),
        })
    }

    pub fn try_acquire_for(
        locks: &Arc<LockTable>,
        urn: &Urn,
        timeout: Duration,
    ) -> Result<Option<Self>> {
        Ok(locks
            .try_lock_for(urn, Mode::Write, timeout)?
            .then(|| WriteLease {
                locks: Arc::clone(locks),
                urn: urn.clone(),
            }))
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.locks.unlock(&self.urn, Mode::Write);
    }
}
