//! Library configuration
//!
//! Defaults for new image streams, cache bounds and the resolver's store.
//! Loaded from TOML:
//!
//! ```toml
//! [image]
//! chunk_size = 32768
//! chunks_in_segment = 2048
//! compression = "deflate"
//! threads = 4
//!
//! [cache]
//! objects = 64
//! chunks = 256
//! policy = "lru"
//!
//! [store]
//! backend = "sqlite"
//! path = "/var/lib/aff4/resolver.db"
//!
//! [zip]
//! zip64_threshold = 2147483647
//! ```

use crate::cache::EvictionPolicy;
use crate::compression::Compression;
use crate::error::{Aff4Error, Result};
use crate::zip::ZIP64_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Bytes per chunk
    pub chunk_size: u32,
    /// Chunks per bevy
    pub chunks_in_segment: u32,
    pub compression: Compression,
    /// Bevy compression workers per stream
    pub threads: usize,
    /// Bevies that may wait for a worker before writes block
    pub queue_depth: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            chunk_size: 32 * 1024,
            chunks_in_segment: 2048,
            compression: Compression::Deflate,
            threads: 2,
            queue_depth: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Objects parked per access mode (0 = unbounded)
    pub objects: usize,
    /// Decompressed chunks kept per read-mode image
    pub chunks: usize,
    /// Bevy index arrays kept per read-mode image
    pub bevy_indexes: usize,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            objects: 64,
            chunks: 256,
            bevy_indexes: 32,
            policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZipConfig {
    /// Sizes and offsets above this are written as Zip64 values
    pub zip64_threshold: u64,
}

impl Default for ZipConfig {
    fn default() -> Self {
        ZipConfig {
            zip64_threshold: ZIP64_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aff4Config {
    pub image: ImageConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub zip: ZipConfig,
}

impl Aff4Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Aff4Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.chunk_size == 0 {
            return Err(Aff4Error::InvalidParameter("chunk_size must be positive".into()));
        }
        if self.image.chunks_in_segment == 0 {
            return Err(Aff4Error::InvalidParameter(
                "chunks_in_segment must be positive".into(),
            ));
        }
        if self.image.threads == 0 {
            return Err(Aff4Error::InvalidParameter("threads must be positive".into()));
        }
        if self.image.queue_depth == 0 {
            return Err(Aff4Error::InvalidParameter("queue_depth must be positive".into()));
        }
        if self.zip.zip64_threshold == 0 || self.zip.zip64_threshold > ZIP64_LIMIT {
            return Err(Aff4Error::InvalidParameter(format!(
                "zip64_threshold must be between 1 and {}",
                ZIP64_LIMIT
            )));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(Aff4Error::InvalidParameter(
                "sqlite store requires a path".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Aff4Config::default();
        assert_eq!(config.image.chunk_size, 32768);
        assert_eq!(config.image.compression, Compression::Deflate);
        assert_eq!(config.cache.policy, EvictionPolicy::Lru);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = Aff4Config::from_toml_str(
            r#"
            [image]
            chunk_size = 32
            chunks_in_segment = 10
            compression = "stored"

            [cache]
            policy = "fifo"
            "#,
        )
        .unwrap();

        assert_eq!(config.image.chunk_size, 32);
        assert_eq!(config.image.chunks_in_segment, 10);
        assert_eq!(config.image.compression, Compression::Stored);
        assert_eq!(config.image.threads, 2);
        assert_eq!(config.cache.policy, EvictionPolicy::Fifo);
        assert_eq!(config.cache.chunks, 256);
    }

    #[test]
    fn test_validation() {
        assert!(Aff4Config::from_toml_str("[image]\nchunk_size = 0").is_err());
        assert!(Aff4Config::from_toml_str("[store]\nbackend = \"sqlite\"").is_err());
        assert!(Aff4Config::from_toml_str("[image]\ncompression = \"brotli\"").is_err());
        assert!(Aff4Config::from_toml_str("[zip]\nzip64_threshold = 0").is_err());
        assert!(Aff4Config::from_toml_str("[zip]\nzip64_threshold = 4294967296").is_err());
        let lowered = Aff4Config::from_toml_str("[zip]\nzip64_threshold = 4096").unwrap();
        assert_eq!(lowered.zip.zip64_threshold, 4096);

        let config = Aff4Config::from_toml_str(
            "[store]\nbackend = \"sqlite\"\npath = \"/tmp/resolver.db\"",
        )
        .unwrap();
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/resolver.db")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("aff4.toml");
        std::fs::write(&path, "[image]\nthreads = 8\n").unwrap();
        assert_eq!(Aff4Config::load(&path).unwrap().image.threads, 8);
    }
}
