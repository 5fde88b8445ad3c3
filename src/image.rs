//! Chunked image streams
//!
//! An image is a logical bytestream cut into fixed-size chunks. Consecutive
//! chunks are grouped into bevies; each bevy is stored as two volume
//! members:
//!
//! ```text
//! <image>/<bevy:08x>       compressed chunks back to back
//! <image>/<bevy:08x>.idx   little-endian u32 start offset of each chunk
//! ```
//!
//! Writing is append-only. Full bevies are compressed on a worker pool so
//! the writer never waits on the codec; the index member of a bevy is
//! always written before its data member. Reading is random access through
//! a chunk cache.

use crate::cache::Cache;
use crate::compression::Compression;
use crate::config::ImageConfig;
use crate::error::{Aff4Error, Result, ResultExt};
use crate::object::{Mode, ObjectBase, SeekState, Stream};
use crate::resolver::Resolver;
use crate::thread_pool::{Job, ThreadPool};
use crate::urn::Urn;
use crate::value::{Value, ValueType};
use crate::vocab;
use crate::zip::ZipCompression;
use chrono::Utc;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a full bevy waits for a queue slot before completions are reaped
const SCHEDULE_TIMEOUT: Duration = Duration::from_millis(100);

/// Member holding the compressed chunks of bevy `bevy`
pub fn bevy_urn(image: &Urn, bevy: u32) -> Urn {
    image.join(&format!("{:08x}", bevy))
}

/// Member holding the chunk offsets of bevy `bevy`
pub fn bevy_index_urn(image: &Urn, bevy: u32) -> Urn {
    image.join(&format!("{:08x}.idx", bevy))
}

/// Chunk geometry shared by the reader and writer
#[derive(Debug, Clone, Copy)]
struct Geometry {
    chunk_size: u64,
    chunks_in_segment: u64,
    compression: Compression,
}

impl Geometry {
    fn new(chunk_size: u64, chunks_in_segment: u64, compression: Compression) -> Result<Self> {
        if chunk_size == 0 || chunks_in_segment == 0 {
            return Err(Aff4Error::InvalidParameter(
                "chunk_size and chunks_in_segment must be positive".into(),
            ));
        }
        // Chunk offsets inside a bevy are stored as u32
        if chunk_size.saturating_mul(chunks_in_segment) > u32::MAX as u64 {
            return Err(Aff4Error::InvalidParameter(format!(
                "bevy of {} x {} bytes does not fit a 32-bit index",
                chunks_in_segment, chunk_size
            )));
        }
        Ok(Geometry {
            chunk_size,
            chunks_in_segment,
            compression,
        })
    }

    fn bevy_size(&self) -> u64 {
        self.chunk_size * self.chunks_in_segment
    }
}

/// Compress one bevy and store it in the volume
///
/// Owns every byte it touches, so bevies can be flushed in any order.
struct BevyJob {
    resolver: Arc<Resolver>,
    image: Urn,
    volume: Urn,
    bevy: u32,
    data: Vec<u8>,
    geometry: Geometry,
}

struct BevyFlushed {
    bevy: u32,
    chunks: usize,
    result: Result<()>,
}

impl BevyJob {
    fn flush(&self) -> Result<usize> {
        let chunk_size = self.geometry.chunk_size as usize;
        let chunks = self.data.len().div_ceil(chunk_size);
        let mut index = Vec::with_capacity(chunks * 4);
        let mut packed = Vec::with_capacity(self.data.len());

        for chunk in self.data.chunks(chunk_size) {
            let offset = u32::try_from(packed.len()).map_err(|_| {
                Aff4Error::Runtime(format!(
                    "bevy {} of {} compressed past 4 GiB",
                    self.bevy, self.image
                ))
            })?;
            index.extend_from_slice(&offset.to_le_bytes());
            packed.extend_from_slice(&self.geometry.compression.compress(chunk)?);
        }

        let mut volume = self.resolver.checkout(&self.volume, Mode::Read)?;
        let volume = volume.as_volume()?;
        volume.write_member(
            &bevy_index_urn(&self.image, self.bevy),
            &index,
            ZipCompression::Stored,
        )?;
        volume.write_member(
            &bevy_urn(&self.image, self.bevy),
            &packed,
            ZipCompression::Stored,
        )?;
        Ok(chunks)
    }
}

impl Job for BevyJob {
    type Output = BevyFlushed;

    fn run(self) -> BevyFlushed {
        let result = self.flush();
        BevyFlushed {
            bevy: self.bevy,
            chunks: *result.as_ref().unwrap_or(&0),
            result: result
                .map(|_| ())
                .with_context(|| format!("flushing bevy {} of {}", self.bevy, self.image)),
        }
    }
}

struct ImageWriter {
    volume: Urn,
    bevy: Vec<u8>,
    next_bevy: u32,
    hasher: Sha256,
    pool: ThreadPool<BevyJob>,
    first_error: Option<Aff4Error>,
}

impl ImageWriter {
    fn take_job(&mut self, resolver: &Arc<Resolver>, image: &Urn, geometry: Geometry) -> BevyJob {
        let job = BevyJob {
            resolver: Arc::clone(resolver),
            image: image.clone(),
            volume: self.volume.clone(),
            bevy: self.next_bevy,
            data: std::mem::replace(&mut self.bevy, Vec::with_capacity(geometry.bevy_size() as usize)),
            geometry,
        };
        self.next_bevy += 1;
        job
    }

    /// Hand a full bevy to the pool, reaping finished bevies while it waits
    fn dispatch(&mut self, mut job: BevyJob) {
        debug!("Scheduling bevy {} of {}", job.bevy, job.image);
        loop {
            match self.pool.schedule(job, SCHEDULE_TIMEOUT) {
                Ok(()) => break,
                Err(back) => {
                    job = back;
                    self.reap();
                }
            }
        }
        self.reap();
    }

    fn reap(&mut self) {
        let first_error = &mut self.first_error;
        self.pool.complete(|flushed| record(first_error, flushed));
        let panicked = self.pool.panicked();
        if panicked > 0 && self.first_error.is_none() {
            self.first_error = Some(Aff4Error::Runtime(format!(
                "{} bevy flush(es) panicked",
                panicked
            )));
        }
    }

    /// Fails for good once any bevy of `image` could not be stored
    fn check(&self, image: &Urn) -> Result<()> {
        match &self.first_error {
            Some(e) => Err(Aff4Error::Runtime(format!(
                "image {} lost a bevy: {}",
                image, e
            ))),
            None => Ok(()),
        }
    }
}

fn record(first_error: &mut Option<Aff4Error>, flushed: BevyFlushed) {
    match flushed.result {
        Ok(()) => debug!("Flushed bevy {} ({} chunks)", flushed.bevy, flushed.chunks),
        Err(e) => {
            error!("{}", e);
            first_error.get_or_insert(e);
        }
    }
}

struct ImageReader {
    chunks: Cache<Arc<Vec<u8>>>,
    indexes: LruCache<u32, Arc<Vec<u32>>>,
}

enum ImageState {
    Writing(Box<ImageWriter>),
    Reading(ImageReader),
    Closed,
}

/// A chunked, compressed image stream
pub struct ImageStream {
    base: ObjectBase,
    seek: SeekState,
    volume: Urn,
    geometry: Geometry,
    size: u64,
    state: ImageState,
}

impl ImageStream {
    /// Start a new image stored in `volume`
    ///
    /// Blocks until the image URN's write lock is free.
    pub fn create(
        resolver: &Arc<Resolver>,
        urn: Urn,
        volume: &Urn,
        config: &ImageConfig,
    ) -> Result<Self> {
        let geometry = Geometry::new(
            config.chunk_size as u64,
            config.chunks_in_segment as u64,
            config.compression,
        )?;
        let base = ObjectBase::new_leased(resolver, urn.clone())?;

        resolver.del(&urn, None)?;
        resolver.set_value(&urn, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_IMAGE))?;
        resolver.set_value(&urn, vocab::AFF4_STORED, volume)?;
        resolver.set_value(&urn, vocab::AFF4_CHUNK_SIZE, config.chunk_size)?;
        resolver.set_value(&urn, vocab::AFF4_CHUNKS_IN_SEGMENT, config.chunks_in_segment)?;
        resolver.set_value(&urn, vocab::AFF4_COMPRESSION, config.compression.name())?;
        resolver.set_value(&urn, vocab::AFF4_TIMESTAMP, Utc::now().to_rfc3339())?;

        let writer = Self::writer(volume, geometry, config)?;
        info!("Created image {} in {}", urn, volume);
        Ok(ImageStream {
            base,
            seek: SeekState::default(),
            volume: volume.clone(),
            geometry,
            size: 0,
            state: ImageState::Writing(Box::new(writer)),
        })
    }

    /// Construct from resolver attributes
    ///
    /// Write mode starts a fresh stream for an image that was declared but
    /// never finished; a finished image (one with `aff4:size`) is read-only.
    pub(crate) fn from_resolver(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self> {
        let missing = |what: &str| Aff4Error::NotFound(format!("image {} has no {}", urn, what));
        let config = &resolver.config().image;

        let volume = resolver
            .resolve_urn(urn, vocab::AFF4_STORED)?
            .ok_or_else(|| missing(vocab::AFF4_STORED))?;
        let chunk_size = resolver.resolve_u64(urn, vocab::AFF4_CHUNK_SIZE)?;
        let chunks_in_segment = resolver.resolve_u64(urn, vocab::AFF4_CHUNKS_IN_SEGMENT)?;
        let compression = match resolver.resolve_value(urn, vocab::AFF4_COMPRESSION, ValueType::Any)? {
            Some(Value::String(name)) => Compression::from_name(&name).ok_or_else(|| {
                Aff4Error::Unsupported(format!("image {} uses compression {}", urn, name))
            })?,
            Some(value) => value
                .as_u64()
                .and_then(|id| Compression::from_u8(id as u8))
                .ok_or_else(|| {
                    Aff4Error::Unsupported(format!("image {} uses compression {}", urn, value))
                })?,
            None => config.compression,
        };
        let size = resolver.resolve_u64(urn, vocab::AFF4_SIZE)?;

        match mode {
            Mode::Read => {
                let geometry = Geometry::new(
                    chunk_size.ok_or_else(|| missing(vocab::AFF4_CHUNK_SIZE))?,
                    chunks_in_segment.ok_or_else(|| missing(vocab::AFF4_CHUNKS_IN_SEGMENT))?,
                    compression,
                )?;
                let size = size.ok_or_else(|| missing(vocab::AFF4_SIZE))?;
                let cache = &resolver.config().cache;
                let indexes = NonZeroUsize::new(cache.bevy_indexes).unwrap_or(NonZeroUsize::MIN);

                debug!("Opened image {} for reading ({} bytes)", urn, size);
                Ok(ImageStream {
                    base: ObjectBase::new(resolver, urn.clone(), mode),
                    seek: SeekState::default(),
                    volume,
                    geometry,
                    size,
                    state: ImageState::Reading(ImageReader {
                        chunks: Cache::new(cache.chunks, cache.policy),
                        indexes: LruCache::new(indexes),
                    }),
                })
            }
            Mode::Write => {
                if size.is_some() {
                    return Err(Aff4Error::Unsupported(format!(
                        "image {} is finished and cannot be rewritten",
                        urn
                    )));
                }
                let geometry = Geometry::new(
                    chunk_size.unwrap_or(config.chunk_size as u64),
                    chunks_in_segment.unwrap_or(config.chunks_in_segment as u64),
                    compression,
                )?;
                let writer = Self::writer(&volume, geometry, config)?;
                Ok(ImageStream {
                    base: ObjectBase::new(resolver, urn.clone(), mode),
                    seek: SeekState::default(),
                    volume,
                    geometry,
                    size: 0,
                    state: ImageState::Writing(Box::new(writer)),
                })
            }
        }
    }

    fn writer(volume: &Urn, geometry: Geometry, config: &ImageConfig) -> Result<ImageWriter> {
        let pool = ThreadPool::new(config.threads, config.queue_depth, "aff4-bevy")
            .context("starting bevy workers")?;
        Ok(ImageWriter {
            volume: volume.clone(),
            bevy: Vec::with_capacity(geometry.bevy_size() as usize),
            next_bevy: 0,
            hasher: Sha256::new(),
            pool,
            first_error: None,
        })
    }

    pub fn base(&self) -> &ObjectBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }

    pub fn urn(&self) -> &Urn {
        self.base.urn()
    }

    /// Volume holding the bevies
    pub fn volume(&self) -> &Urn {
        &self.volume
    }

    pub fn chunk_size(&self) -> u64 {
        self.geometry.chunk_size
    }

    pub fn chunks_in_segment(&self) -> u64 {
        self.geometry.chunks_in_segment
    }

    pub fn compression(&self) -> Compression {
        self.geometry.compression
    }

    /// Number of bevies the stream occupies
    pub fn bevy_count(&self) -> u64 {
        self.size.div_ceil(self.geometry.bevy_size())
    }

    fn reader_mut(&mut self) -> Result<&mut ImageReader> {
        match &mut self.state {
            ImageState::Reading(reader) => Ok(reader),
            _ => Err(Aff4Error::Runtime(format!(
                "{} has no read state",
                self.base.urn()
            ))),
        }
    }

    fn bevy_index(&mut self, bevy: u32) -> Result<Arc<Vec<u32>>> {
        if let Some(index) = self.reader_mut()?.indexes.get(&bevy) {
            return Ok(Arc::clone(index));
        }

        let urn = bevy_index_urn(self.base.urn(), bevy);
        let raw = {
            let mut segment = self.base.resolver().checkout(&urn, Mode::Read)?;
            let stream = segment.stream()?;
            stream.seek(SeekFrom::Start(0))?;
            stream.read_all()?
        };
        if raw.len() % 4 != 0 {
            return Err(Aff4Error::InvalidArchive(format!(
                "bevy index {} is {} bytes, not a multiple of 4",
                urn,
                raw.len()
            )));
        }
        let index: Arc<Vec<u32>> = Arc::new(
            raw.chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        );
        self.reader_mut()?.indexes.put(bevy, Arc::clone(&index));
        Ok(index)
    }

    /// Decompressed contents of chunk `id`
    fn chunk(&mut self, id: u64) -> Result<Arc<Vec<u8>>> {
        let key = id.to_le_bytes();
        {
            let reader = self.reader_mut()?;
            let mut cursor = reader.chunks.iter(key);
            if let Some(chunk) = reader.chunks.next(&mut cursor) {
                return Ok(Arc::clone(chunk));
            }
        }

        let geometry = self.geometry;
        let bevy = u32::try_from(id / geometry.chunks_in_segment).map_err(|_| {
            Aff4Error::InvalidParameter(format!("chunk {} lies beyond the last bevy", id))
        })?;
        let slot = (id % geometry.chunks_in_segment) as usize;
        let index = self.bevy_index(bevy)?;
        let data_urn = bevy_urn(self.base.urn(), bevy);

        let start = *index.get(slot).ok_or_else(|| {
            Aff4Error::InvalidArchive(format!("{} has no entry for chunk {}", data_urn, slot))
        })? as u64;
        let compressed = {
            let mut segment = self.base.resolver().checkout(&data_urn, Mode::Read)?;
            let stream = segment.stream()?;
            let end = match index.get(slot + 1) {
                Some(&next) => next as u64,
                None => stream.size(),
            };
            if end < start {
                return Err(Aff4Error::InvalidArchive(format!(
                    "chunk {} of {} ends before it starts",
                    slot, data_urn
                )));
            }
            stream.seek(SeekFrom::Start(start))?;
            let mut compressed = vec![0u8; (end - start) as usize];
            if stream.read_fill(&mut compressed)? != compressed.len() {
                return Err(Aff4Error::InvalidArchive(format!(
                    "chunk {} of {} is truncated",
                    slot, data_urn
                )));
            }
            compressed
        };

        // The final chunk is only as long as what is left of the stream
        let expected = geometry.chunk_size.min(self.size - id * geometry.chunk_size) as usize;
        let chunk = Arc::new(
            geometry
                .compression
                .decompress(&compressed, expected)
                .with_context(|| format!("chunk {} of {}", id, self.base.urn()))?,
        );
        self.reader_mut()?.chunks.put(key, Arc::clone(&chunk));
        Ok(chunk)
    }

    fn finish_write(&mut self, mut writer: Box<ImageWriter>) -> Result<()> {
        let urn = self.base.urn().clone();
        let resolver = Arc::clone(self.base.resolver());

        if !writer.bevy.is_empty() {
            let job = writer.take_job(&resolver, &urn, self.geometry);
            record(&mut writer.first_error, job.run());
        }
        writer.pool.join();
        writer.reap();
        if let Some(e) = writer.first_error.take() {
            return Err(e);
        }

        let digest = hex::encode(writer.hasher.finalize());
        resolver.set_value(&urn, vocab::AFF4_SIZE, self.size)?;
        resolver.set_value(&urn, vocab::AFF4_SHA256, Value::String(digest))?;
        info!(
            "Finished image {} ({} bytes in {} bevies)",
            urn, self.size, writer.next_bevy
        );
        Ok(())
    }

    /// Flush pending bevies and finalize the stream attributes
    ///
    /// Blocks until every scheduled bevy has been written.
    pub fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        let result = match std::mem::replace(&mut self.state, ImageState::Closed) {
            ImageState::Writing(writer) => self
                .finish_write(writer)
                .with_context(|| format!("closing image {}", self.base.urn())),
            _ => Ok(()),
        };
        self.base.mark_closed();
        result
    }
}

impl Stream for ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.base.ensure_readable()?;
        let position = self.seek.position();
        if position >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let wanted = buf.len().min((self.size - position) as usize);
        let mut done = 0;
        while done < wanted {
            let offset = position + done as u64;
            let id = offset / self.geometry.chunk_size;
            let within = (offset % self.geometry.chunk_size) as usize;
            let chunk = self.chunk(id)?;
            if within >= chunk.len() {
                return Err(Aff4Error::InvalidArchive(format!(
                    "chunk {} of {} is short",
                    id,
                    self.base.urn()
                )));
            }
            let n = (chunk.len() - within).min(wanted - done);
            buf[done..done + n].copy_from_slice(&chunk[within..within + n]);
            done += n;
        }
        self.seek.advance(done);
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.base.ensure_writable()?;
        if self.seek.position() != self.size {
            return Err(Aff4Error::Unsupported(format!(
                "image {} is append-only (write at {}, size {})",
                self.base.urn(),
                self.seek.position(),
                self.size
            )));
        }

        let resolver = Arc::clone(self.base.resolver());
        let urn = self.base.urn().clone();
        let geometry = self.geometry;
        let bevy_size = geometry.bevy_size() as usize;
        let writer = match &mut self.state {
            ImageState::Writing(writer) => writer,
            _ => return Err(Aff4Error::Runtime(format!("{} has no write state", urn))),
        };
        writer.check(&urn)?;

        let mut rest = buf;
        while !rest.is_empty() {
            let n = (bevy_size - writer.bevy.len()).min(rest.len());
            writer.bevy.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if writer.bevy.len() == bevy_size {
                let job = writer.take_job(&resolver, &urn, geometry);
                writer.dispatch(job);
            }
        }
        writer.hasher.update(buf);
        self.size += buf.len() as u64;
        self.seek.advance(buf.len());

        writer.check(&urn)?;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.base.ensure_open()?;
        self.seek.seek(pos, self.size)
    }

    fn tell(&self) -> u64 {
        self.seek.position()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<()> {
        ImageStream::close(self)
    }
}

impl Drop for ImageStream {
    fn drop(&mut self) {
        if matches!(self.state, ImageState::Writing(_)) {
            warn!("Image {} dropped without close; pending bevies are lost", self.base.urn());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::ZipVolume;
    use tempfile::TempDir;

    fn small(compression: Compression) -> ImageConfig {
        ImageConfig {
            chunk_size: 32,
            chunks_in_segment: 10,
            compression,
            threads: 2,
            queue_depth: 2,
        }
    }

    fn write_image(path: &std::path::Path, data: &[u8], config: &ImageConfig) -> (Arc<Resolver>, Urn) {
        let resolver = Resolver::new();
        let mut volume = ZipVolume::create(&resolver, path).unwrap();
        let urn = volume.urn().join("default");
        let mut image = ImageStream::create(&resolver, urn.clone(), volume.urn(), config).unwrap();
        // Odd-sized writes so bevy boundaries fall mid-buffer
        for piece in data.chunks(45) {
            image.write_all(piece).unwrap();
        }
        image.close().unwrap();
        volume.close().unwrap();
        (resolver, urn)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_every_codec() {
        for compression in [
            Compression::Stored,
            Compression::Deflate,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            let dir = TempDir::new().unwrap();
            let data = pattern(1000);
            let (resolver, urn) = write_image(&dir.path().join("img.zip"), &data, &small(compression));

            let mut image = resolver.checkout(&urn, Mode::Read).unwrap();
            let stream = image.stream().unwrap();
            assert_eq!(stream.size(), 1000);
            assert_eq!(stream.read_all().unwrap(), data, "{:?}", compression);
        }
    }

    #[test]
    fn test_random_access_reads() {
        let dir = TempDir::new().unwrap();
        let data = pattern(700);
        let (resolver, urn) =
            write_image(&dir.path().join("img.zip"), &data, &small(Compression::Deflate));

        let mut image = resolver.checkout(&urn, Mode::Read).unwrap();
        let stream = image.stream().unwrap();
        for (offset, len) in [(0usize, 10usize), (31, 2), (319, 3), (650, 100), (699, 1)] {
            stream.seek(SeekFrom::Start(offset as u64)).unwrap();
            let mut buf = vec![0u8; len];
            let n = stream.read_fill(&mut buf).unwrap();
            let end = (offset + len).min(data.len());
            assert_eq!(&buf[..n], &data[offset..end]);
        }
        stream.seek(SeekFrom::Start(700)).unwrap();
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_bevy_layout() {
        let dir = TempDir::new().unwrap();
        let data = pattern(650);
        let (resolver, urn) =
            write_image(&dir.path().join("img.zip"), &data, &small(Compression::Stored));

        // 650 = 2 full bevies of 320 + 10 bytes
        for bevy in 0..3 {
            assert_eq!(
                resolver.kind_of(&bevy_urn(&urn, bevy)).unwrap(),
                crate::object::ObjectKind::Segment
            );
        }
        assert!(resolver.kind_of(&bevy_urn(&urn, 3)).is_err());

        let mut index = resolver.checkout(&bevy_index_urn(&urn, 2), Mode::Read).unwrap();
        assert_eq!(index.stream().unwrap().read_all().unwrap(), 0u32.to_le_bytes());
        assert_eq!(resolver.resolve_u64(&urn, vocab::AFF4_SIZE).unwrap(), Some(650));
        assert_eq!(
            resolver.resolve_string(&urn, vocab::AFF4_SHA256).unwrap(),
            Some(hex::encode(Sha256::digest(&data)))
        );
    }

    #[test]
    fn test_exact_bevy_multiple_writes_no_empty_bevy() {
        let dir = TempDir::new().unwrap();
        let (resolver, urn) =
            write_image(&dir.path().join("img.zip"), &pattern(320), &small(Compression::Stored));
        assert!(resolver.kind_of(&bevy_urn(&urn, 0)).is_ok());
        assert!(resolver.kind_of(&bevy_urn(&urn, 1)).is_err());
        assert!(resolver.kind_of(&bevy_index_urn(&urn, 1)).is_err());
    }

    #[test]
    fn test_append_only() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new();
        let mut volume = ZipVolume::create(&resolver, &dir.path().join("a.zip")).unwrap();
        let mut image = ImageStream::create(
            &resolver,
            volume.urn().join("img"),
            volume.urn(),
            &small(Compression::Stored),
        )
        .unwrap();

        image.write_all(b"0123456789").unwrap();
        image.seek(SeekFrom::Start(2)).unwrap();
        let err = image.write(b"x").unwrap_err();
        assert!(matches!(err, Aff4Error::Unsupported(_)));
        assert!(image.read(&mut [0u8; 2]).is_err());

        image.seek(SeekFrom::End(0)).unwrap();
        image.write_all(b"ab").unwrap();
        image.close().unwrap();
        assert!(image.write(b"late").is_err());
        volume.close().unwrap();
        assert_eq!(resolver.resolve_u64(image.urn(), vocab::AFF4_SIZE).unwrap(), Some(12));
    }

    #[test]
    fn test_lost_bevy_fails_close() {
        let resolver = Resolver::new();
        let urn = Urn::new("aff4://orphan-image");
        // Nothing is stored under this volume URN, so every bevy flush fails
        let volume = Urn::new("aff4://no-such-volume");
        let mut image =
            ImageStream::create(&resolver, urn.clone(), &volume, &small(Compression::Stored)).unwrap();

        let data = pattern(320);
        let mut failed = false;
        for _ in 0..50 {
            if image.write_all(&data).is_err() {
                failed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(failed, "a lost bevy must surface from write");
        // Once failed, the stream stays failed
        assert!(image.write_all(&data).is_err());

        assert!(image.close().is_err());
        assert_eq!(resolver.resolve_u64(&urn, vocab::AFF4_SIZE).unwrap(), None);
        assert_eq!(resolver.resolve_string(&urn, vocab::AFF4_SHA256).unwrap(), None);
    }

    #[test]
    fn test_failed_final_bevy_fails_close() {
        let resolver = Resolver::new();
        let urn = Urn::new("aff4://short-orphan");
        let mut image = ImageStream::create(
            &resolver,
            urn.clone(),
            &Urn::new("aff4://no-such-volume"),
            &small(Compression::Deflate),
        )
        .unwrap();
        // Less than one bevy: the only flush happens inside close
        image.write_all(&pattern(100)).unwrap();
        assert!(image.close().is_err());
        assert_eq!(resolver.resolve_u64(&urn, vocab::AFF4_SIZE).unwrap(), None);
    }

    #[test]
    fn test_finished_image_refuses_write_mode() {
        let dir = TempDir::new().unwrap();
        let (resolver, urn) =
            write_image(&dir.path().join("img.zip"), &pattern(40), &small(Compression::Stored));
        let err = resolver.open(&urn, Mode::Write).unwrap_err();
        assert!(matches!(err, Aff4Error::Unsupported(_)));
    }

    #[test]
    fn test_rejects_oversized_bevy() {
        let resolver = Resolver::new();
        let config = ImageConfig {
            chunk_size: 1 << 20,
            chunks_in_segment: 1 << 13,
            ..ImageConfig::default()
        };
        let result = ImageStream::create(
            &resolver,
            Urn::new("aff4://huge"),
            &Urn::new("aff4://volume"),
            &config,
        );
        assert!(matches!(result, Err(Aff4Error::InvalidParameter(_))));
    }

    #[test]
    fn test_reopen_with_fresh_resolver() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.zip");
        let data = pattern(999);
        let (_, urn) = write_image(&path, &data, &small(Compression::Zstd));

        let fresh = Resolver::new();
        ZipVolume::open(&fresh, &path, Mode::Read).unwrap();
        let mut image = fresh.checkout(&urn, Mode::Read).unwrap();
        let image = image.as_image().unwrap();
        assert_eq!(image.chunk_size(), 32);
        assert_eq!(image.compression(), Compression::Zstd);
        assert_eq!(image.bevy_count(), 4);
        assert_eq!(image.read_all().unwrap(), data);
    }
}
