//! # AFF4 - Forensic Evidence Containers
//!
//! `aff4` stores disk images and other evidence inside ZIP/Zip64 volumes,
//! with every fact about every object kept in a central attribute
//! resolver:
//!
//! - **Resolver**: a triple store of typed values keyed by URN, plus the
//!   object caches and per-URN write locks everything else goes through
//! - **Zip volumes**: standard ZIP/Zip64 archives whose comment carries
//!   the volume URN, so an archive file is self-describing
//! - **Image streams**: chunked, compressed, append-only streams written
//!   in parallel bevies and read back with random access
//! - **Map streams**: virtual streams stitched together from ranges of
//!   other streams, optionally repeating with a period
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aff4::{ImageConfig, ImageStream, Mode, Resolver, Result, Stream, ZipVolume};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let resolver = Resolver::new();
//!
//! // Acquire
//! let mut volume = ZipVolume::create(&resolver, Path::new("evidence.zip"))?;
//! let urn = volume.urn().join("disk0");
//! let mut image = ImageStream::create(&resolver, urn.clone(), volume.urn(), &ImageConfig::default())?;
//! image.write_all(b"raw disk bytes")?;
//! image.close()?;
//! volume.close()?;
//!
//! // Read back from the file alone
//! let fresh = Resolver::new();
//! ZipVolume::open(&fresh, Path::new("evidence.zip"), Mode::Read)?;
//! let mut image = fresh.checkout(&urn, Mode::Read)?;
//! let data = image.stream()?.read_all()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Ownership
//!
//! Objects handed out by [`Resolver::checkout`] are owned by the returned
//! [`Checkout`] guard and go back to the resolver's cache when it drops.
//! Call [`Resolver::shutdown`] before exit to close whatever is cached.

pub mod cache;
pub mod compression;
pub mod config;
pub mod error;
pub mod file;
pub mod image;
pub mod lock;
pub mod map;
pub mod object;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod thread_pool;
pub mod urn;
pub mod value;
pub mod vocab;
pub mod zip;

pub use cache::{Cache, CacheStats, EvictionPolicy};
pub use compression::Compression;
pub use config::{Aff4Config, CacheConfig, ImageConfig, StoreBackend, StoreConfig, ZipConfig};
pub use error::{Aff4Error, ErrorKind, Result, ResultExt};
pub use file::FileBackedObject;
pub use image::ImageStream;
pub use lock::{LockTable, WriteLease};
pub use map::{MapRange, MapStream, MapTarget};
pub use object::{Aff4Object, Checkout, Mode, ObjectBase, ObjectKind, SeekState, Stream};
pub use queue::Queue;
pub use resolver::{Resolver, Triple, ValueIter};
pub use store::{MemoryStore, SqliteStore, TripleStore};
pub use thread_pool::{Job, ThreadPool};
pub use urn::Urn;
pub use value::{Value, ValueType};
pub use zip::{ZipCompression, ZipSegment, ZipVolume};

use std::sync::{Arc, OnceLock};
use tracing::info;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static ORACLE: OnceLock<Arc<Resolver>> = OnceLock::new();

/// Install the process-wide resolver
///
/// Call once, before anything uses [`oracle`]. A second call is an error.
pub fn init(config: Aff4Config) -> Result<Arc<Resolver>> {
    let resolver = Resolver::with_config(config)?;
    ORACLE
        .set(Arc::clone(&resolver))
        .map_err(|_| Aff4Error::Runtime("aff4 is already initialised".into()))?;
    info!("aff4 {} initialised", VERSION);
    Ok(resolver)
}

/// The process-wide resolver
///
/// Falls back to an in-memory resolver with default settings when
/// [`init`] was never called.
pub fn oracle() -> Arc<Resolver> {
    Arc::clone(ORACLE.get_or_init(Resolver::new))
}
