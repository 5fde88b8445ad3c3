//! Streams over single archive members
//!
//! A member being written streams straight into the backing file:
//! local header first, then (optionally deflated) data, then a data
//! descriptor once CRC and sizes are known. Its location and checksums are
//! then recorded in the resolver, from which the central directory is
//! rebuilt when the volume closes.

use super::records::{
    dos_datetime, DataDescriptor, LocalFileHeader, FLAG_DATA_DESCRIPTOR, VERSION_DEFAULT,
};
use crate::error::{Aff4Error, Result, ResultExt};
use crate::object::{Checkout, Mode, ObjectBase, SeekState, Stream};
use crate::resolver::Resolver;
use crate::urn::{member_name, Urn};
use crate::value::Value;
use crate::vocab;
use chrono::Utc;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use sha2::{Digest, Sha256};
use std::io::{self, Read, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

/// Decompressed bytes produced per step while inflating a member
const INFLATE_BUFFER: usize = 64 * 1024;

/// Member compression methods understood by the volume layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ZipCompression {
    Stored = 0,
    /// Raw deflate
    Deflate = 8,
}

impl ZipCompression {
    pub fn from_u16(method: u16) -> Result<Self> {
        match method {
            0 => Ok(ZipCompression::Stored),
            8 => Ok(ZipCompression::Deflate),
            other => Err(Aff4Error::Unsupported(format!(
                "zip compression method {}",
                other
            ))),
        }
    }

    pub fn method(self) -> u16 {
        self as u16
    }
}

/// Positioned writer over the backing file's write checkout
struct BackingWriter {
    backing: Checkout,
    position: u64,
    written: u64,
}

impl Write for BackingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.backing.stream().map_err(io::Error::other)?;
        stream
            .seek(SeekFrom::Start(self.position))
            .map_err(io::Error::other)?;
        stream.write_all(buf).map_err(io::Error::other)?;
        self.position += buf.len() as u64;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Positioned reader over a member's stored bytes
struct BackingReader {
    backing: Checkout,
    position: u64,
    remaining: u64,
}

impl Read for BackingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        let stream = self.backing.stream().map_err(io::Error::other)?;
        stream
            .seek(SeekFrom::Start(self.position))
            .map_err(io::Error::other)?;
        let read = stream.read(&mut buf[..n]).map_err(io::Error::other)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "member data is truncated",
            ));
        }
        self.position += read as u64;
        self.remaining -= read as u64;
        Ok(read)
    }
}

enum MemberSink {
    Stored(BackingWriter),
    Deflate(DeflateEncoder<BackingWriter>),
}

impl MemberSink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            MemberSink::Stored(w) => w.write_all(buf),
            MemberSink::Deflate(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> io::Result<BackingWriter> {
        match self {
            MemberSink::Stored(w) => Ok(w),
            MemberSink::Deflate(w) => w.finish(),
        }
    }
}

struct MemberWriter {
    volume: Urn,
    name: String,
    header_offset: u64,
    compression: ZipCompression,
    dos: (u16, u16),
    sink: MemberSink,
    crc: crc32fast::Hasher,
    sha: Sha256,
    size: u64,
}

struct MemberReader {
    backing: Urn,
    data_offset: u64,
    compression: ZipCompression,
    compressed_size: u64,
    size: u64,
    crc: Option<u32>,
    inflated: Option<Vec<u8>>,
}

enum SegmentState {
    Reading(MemberReader),
    Writing(Option<MemberWriter>),
}

/// One member of a zip volume, open for reading or being written
pub struct ZipSegment {
    base: ObjectBase,
    seek: SeekState,
    state: SegmentState,
}

impl ZipSegment {
    /// Open a registered member for reading
    pub fn open_reader(resolver: &Arc<Resolver>, urn: &Urn) -> Result<Self> {
        let missing = |what: &str| Aff4Error::NotFound(format!("{} has no {}", urn, what));

        let volume = resolver
            .resolve_urn(urn, vocab::AFF4_STORED)?
            .ok_or_else(|| missing(vocab::AFF4_STORED))?;
        let backing = resolver
            .resolve_urn(&volume, vocab::AFF4_STORED)?
            .ok_or_else(|| Aff4Error::NotFound(format!("volume {} has no backing file", volume)))?;
        let header_offset = resolver
            .resolve_u64(urn, vocab::VOLATILE_HEADER_OFFSET)?
            .ok_or_else(|| missing(vocab::VOLATILE_HEADER_OFFSET))?;
        let method = resolver
            .resolve_u64(urn, vocab::VOLATILE_COMPRESSION)?
            .unwrap_or(0);
        let compression = ZipCompression::from_u16(method as u16)?;
        let size = resolver
            .resolve_u64(urn, vocab::AFF4_SIZE)?
            .ok_or_else(|| missing(vocab::AFF4_SIZE))?;
        let compressed_size = resolver
            .resolve_u64(urn, vocab::VOLATILE_COMPRESSED_SIZE)?
            .unwrap_or(size);
        let crc = resolver
            .resolve_u64(urn, vocab::VOLATILE_CRC)?
            .map(|crc| crc as u32);

        let data_offset = {
            let mut file = resolver.checkout(&backing, Mode::Read)?;
            let stream = file.stream()?;
            stream.seek(SeekFrom::Start(header_offset))?;
            let mut raw = [0u8; LocalFileHeader::SIZE];
            if stream.read_fill(&mut raw)? != raw.len() {
                return Err(Aff4Error::InvalidArchive(format!(
                    "local header of {} lies past the end of the file",
                    urn
                )));
            }
            let header = LocalFileHeader::from_bytes(&raw)
                .with_context(|| format!("reading member {}", urn))?;
            header_offset + header.data_offset()
        };

        debug!("Opened member {} at {}", urn, data_offset);
        Ok(ZipSegment {
            base: ObjectBase::new(resolver, urn.clone(), Mode::Read),
            seek: SeekState::default(),
            state: SegmentState::Reading(MemberReader {
                backing,
                data_offset,
                compression,
                compressed_size,
                size,
                crc,
                inflated: None,
            }),
        })
    }

    /// Start writing `member` at the volume's current directory offset
    ///
    /// `backing` must be the write checkout of the volume's backing file;
    /// it is held until the member is finished.
    pub(crate) fn begin_write(
        resolver: &Arc<Resolver>,
        volume: &Urn,
        member: &Urn,
        compression: ZipCompression,
        mut backing: Checkout,
    ) -> Result<Self> {
        let header_offset = resolver
            .resolve_u64(volume, vocab::VOLATILE_DIRECTORY_OFFSET)?
            .unwrap_or(0);
        let name = member_name(volume, member);
        if name.len() > u16::MAX as usize {
            return Err(Aff4Error::InvalidParameter(format!(
                "member name of {} is too long",
                member
            )));
        }
        let dos = dos_datetime(Utc::now());

        let header = LocalFileHeader {
            version_needed: VERSION_DEFAULT,
            flags: FLAG_DATA_DESCRIPTOR,
            compression: compression.method(),
            last_mod_time: dos.0,
            last_mod_date: dos.1,
            crc32: 0,
            compressed_size: 0,
            file_size: 0,
            file_name_length: name.len() as u16,
            extra_field_length: 0,
        };
        {
            let stream = backing.stream()?;
            stream.seek(SeekFrom::Start(header_offset))?;
            stream.write_all(&header.to_bytes())?;
            stream.write_all(name.as_bytes())?;
        }

        let writer = BackingWriter {
            backing,
            position: header_offset + header.data_offset(),
            written: 0,
        };
        let sink = match compression {
            ZipCompression::Stored => MemberSink::Stored(writer),
            ZipCompression::Deflate => MemberSink::Deflate(DeflateEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
        };

        debug!("Writing member {} at {}", member, header_offset);
        Ok(ZipSegment {
            base: ObjectBase::new(resolver, member.clone(), Mode::Write),
            seek: SeekState::default(),
            state: SegmentState::Writing(Some(MemberWriter {
                volume: volume.clone(),
                name,
                header_offset,
                compression,
                dos,
                sink,
                crc: crc32fast::Hasher::new(),
                sha: Sha256::new(),
                size: 0,
            })),
        })
    }

    pub fn base(&self) -> &ObjectBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }

    pub fn is_writing(&self) -> bool {
        matches!(self.state, SegmentState::Writing(Some(_)))
    }

    /// Write the data descriptor and record the member in the resolver
    ///
    /// Hands back the backing file checkout so the caller can keep writing
    /// under the same lease.
    pub(crate) fn finish(&mut self) -> Result<Checkout> {
        let writer = match &mut self.state {
            SegmentState::Writing(writer) => writer
                .take()
                .ok_or_else(|| Aff4Error::closed(self.base.urn().as_str()))?,
            SegmentState::Reading(_) => {
                return Err(Aff4Error::Unsupported(format!(
                    "{} is open for reading",
                    self.base.urn()
                )))
            }
        };

        let mut out = writer.sink.finish()?;
        let descriptor = DataDescriptor {
            crc32: writer.crc.finalize(),
            compressed_size: out.written,
            file_size: writer.size,
        };
        let resolver = Arc::clone(self.base.resolver());
        out.write_all(&descriptor.to_bytes(resolver.config().zip.zip64_threshold))?;

        let urn = self.base.urn().clone();
        let (time, date) = writer.dos;
        resolver.set_value(&urn, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_SEGMENT))?;
        resolver.set_value(&urn, vocab::AFF4_STORED, &writer.volume)?;
        resolver.set_value(&urn, vocab::AFF4_SIZE, descriptor.file_size)?;
        resolver.set_value(
            &urn,
            vocab::AFF4_SHA256,
            Value::String(hex::encode(writer.sha.finalize())),
        )?;
        resolver.set_value(&urn, vocab::VOLATILE_COMPRESSED_SIZE, descriptor.compressed_size)?;
        resolver.set_value(&urn, vocab::VOLATILE_COMPRESSION, writer.compression.method())?;
        resolver.set_value(&urn, vocab::VOLATILE_CRC, descriptor.crc32)?;
        resolver.set_value(&urn, vocab::VOLATILE_HEADER_OFFSET, writer.header_offset)?;
        resolver.set_value(&urn, vocab::VOLATILE_FILENAME, writer.name)?;
        resolver.set_value(
            &urn,
            vocab::VOLATILE_DOS_DATETIME,
            ((date as u32) << 16) | time as u32,
        )?;
        resolver.add_value(&writer.volume, vocab::VOLATILE_CONTAINS, &urn, true)?;
        resolver.set_value(&writer.volume, vocab::VOLATILE_DIRECTORY_OFFSET, out.position)?;

        debug!(
            "Finished member {} ({} bytes, {} stored)",
            urn, descriptor.file_size, descriptor.compressed_size
        );
        self.base.mark_closed();
        Ok(out.backing)
    }

    /// Decompress the whole member, checking its CRC as the data streams by
    fn inflate(reader: &mut MemberReader, resolver: &Arc<Resolver>, urn: &Urn) -> Result<()> {
        let source = BackingReader {
            backing: resolver.checkout(&reader.backing, Mode::Read)?,
            position: reader.data_offset,
            remaining: reader.compressed_size,
        };
        let mut decoder = DeflateDecoder::new(source);
        let mut crc = crc32fast::Hasher::new();
        let mut data = Vec::with_capacity(reader.size as usize);
        let mut buf = vec![0u8; INFLATE_BUFFER];
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| Aff4Error::Compression(format!("inflating {}: {}", urn, e)))?;
            if n == 0 {
                break;
            }
            if data.len() as u64 + n as u64 > reader.size {
                return Err(Aff4Error::InvalidArchive(format!(
                    "member {} inflates past its {} bytes",
                    urn, reader.size
                )));
            }
            crc.update(&buf[..n]);
            data.extend_from_slice(&buf[..n]);
        }
        if data.len() as u64 != reader.size {
            return Err(Aff4Error::InvalidArchive(format!(
                "member {} inflated to {} bytes, expected {}",
                urn,
                data.len(),
                reader.size
            )));
        }
        if let Some(expected) = reader.crc {
            let actual = crc.finalize();
            if actual != expected {
                return Err(Aff4Error::InvalidArchive(format!(
                    "CRC mismatch in {}: {:#010x} != {:#010x}",
                    urn, actual, expected
                )));
            }
        }
        reader.inflated = Some(data);
        Ok(())
    }
}

impl Stream for ZipSegment {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.base.ensure_readable()?;
        let reader = match &mut self.state {
            SegmentState::Reading(reader) => reader,
            SegmentState::Writing(_) => {
                return Err(Aff4Error::Unsupported(format!(
                    "{} is being written",
                    self.base.urn()
                )))
            }
        };

        let position = self.seek.position();
        if position >= reader.size {
            return Ok(0);
        }
        let n = buf.len().min((reader.size - position) as usize);

        match reader.compression {
            ZipCompression::Stored => {
                let mut file = self.base.resolver().checkout(&reader.backing, Mode::Read)?;
                let stream = file.stream()?;
                stream.seek(SeekFrom::Start(reader.data_offset + position))?;
                let read = stream.read_fill(&mut buf[..n])?;
                self.seek.advance(read);
                Ok(read)
            }
            ZipCompression::Deflate => {
                if reader.inflated.is_none() {
                    let resolver = Arc::clone(self.base.resolver());
                    Self::inflate(reader, &resolver, self.base.urn())?;
                }
                let data = reader.inflated.as_deref().unwrap_or_default();
                let start = position as usize;
                buf[..n].copy_from_slice(&data[start..start + n]);
                self.seek.advance(n);
                Ok(n)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.base.ensure_writable()?;
        let writer = match &mut self.state {
            SegmentState::Writing(Some(writer)) => writer,
            _ => return Err(Aff4Error::closed(self.base.urn().as_str())),
        };
        writer.sink.write_all(buf)?;
        writer.crc.update(buf);
        writer.sha.update(buf);
        writer.size += buf.len() as u64;
        self.seek.advance(buf.len());
        Ok(buf.len())
    }

    /// Members being written only support seeking to where they already are
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.base.ensure_open()?;
        let size = self.size();
        if let SegmentState::Writing(_) = self.state {
            let mut target = self.seek;
            if target.seek(pos, size)? != self.seek.position() {
                return Err(Aff4Error::Unsupported(format!(
                    "member {} is written sequentially",
                    self.base.urn()
                )));
            }
        }
        self.seek.seek(pos, size)
    }

    fn tell(&self) -> u64 {
        self.seek.position()
    }

    fn size(&self) -> u64 {
        match &self.state {
            SegmentState::Reading(reader) => reader.size,
            SegmentState::Writing(Some(writer)) => writer.size,
            SegmentState::Writing(None) => self.seek.position(),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        match self.state {
            SegmentState::Writing(_) => self.finish().map(drop),
            SegmentState::Reading(_) => {
                self.base.mark_closed();
                Ok(())
            }
        }
    }
}
