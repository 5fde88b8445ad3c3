//! Zip volumes
//!
//! A volume is a ZIP/Zip64 archive whose member table lives in the
//! resolver. Opening a volume parses its central directory into resolver
//! attributes; closing a write-mode volume writes the metadata segment and
//! then rebuilds the whole central directory from those attributes.
//!
//! **Layout written on close**:
//! ```text
//! [members...][information.json][central directory]
//! [zip64 end record][zip64 locator]   (only when needed)
//! [end of central directory]["aff4" + volume URN]
//! ```

use super::records::{
    CentralDirectoryHeader, EndCentralDirectory, MemberEntry, Zip64EndCentralDirectory,
    Zip64Locator, MAX_COMMENT_SCAN, VOLUME_COMMENT_TAG, ZIP64_LIMIT,
};
use super::segment::{ZipCompression, ZipSegment};
use crate::error::{Aff4Error, Result, ResultExt};
use crate::object::{Mode, ObjectBase, ObjectKind, Stream};
use crate::resolver::{Resolver, Triple};
use crate::urn::{member_name, member_urn, Urn};
use crate::value::Value;
use crate::vocab;
use chrono::Utc;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A ZIP archive holding AFF4 members
#[derive(Debug)]
pub struct ZipVolume {
    base: ObjectBase,
    backing: Urn,
}

impl ZipVolume {
    /// Create an empty volume at `path` under a fresh URN
    pub fn create(resolver: &Arc<Resolver>, path: &Path) -> Result<Self> {
        Self::create_with_urn(resolver, Urn::random(), path)
    }

    /// Create an empty volume at `path`, replacing any existing file
    pub fn create_with_urn(resolver: &Arc<Resolver>, urn: Urn, path: &Path) -> Result<Self> {
        let backing = Urn::from_path(path)?;
        let base = ObjectBase::new_leased(resolver, urn.clone())?;
        {
            let mut file = resolver.checkout(&backing, Mode::Write)?;
            file.as_file()?.truncate(0)?;
        }

        resolver.del(&urn, None)?;
        resolver.set_value(&urn, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_ZIP_VOLUME))?;
        resolver.set_value(&urn, vocab::AFF4_STORED, &backing)?;
        resolver.set_value(&urn, vocab::AFF4_TIMESTAMP, Utc::now().to_rfc3339())?;
        resolver.set_value(&urn, vocab::VOLATILE_DIRECTORY_OFFSET, 0u64)?;
        resolver.set_value(&urn, vocab::VOLATILE_LOADED, 1u16)?;

        info!("Created volume {} in {}", urn, path.display());
        Ok(ZipVolume { base, backing })
    }

    /// Open an existing archive from its file alone
    ///
    /// The volume URN is recovered from the archive comment. Write mode
    /// appends: new members go where the old central directory was.
    pub fn open(resolver: &Arc<Resolver>, path: &Path, mode: Mode) -> Result<Self> {
        let backing = Urn::from_path(path)?;
        let urn = load_directory(resolver, &backing)
            .with_context(|| format!("opening volume {}", path.display()))?;
        let base = match mode {
            Mode::Read => ObjectBase::new(resolver, urn, mode),
            Mode::Write => ObjectBase::new_leased(resolver, urn)?,
        };
        info!("Opened volume {} ({:?})", base.urn(), mode);
        Ok(ZipVolume { base, backing })
    }

    /// Construct from resolver attributes, parsing the file on first use
    pub(crate) fn from_resolver(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self> {
        let backing = resolver
            .resolve_urn(urn, vocab::AFF4_STORED)?
            .ok_or_else(|| Aff4Error::NotFound(format!("volume {} has no backing file", urn)))?;

        if resolver.resolve_u64(urn, vocab::VOLATILE_LOADED)?.is_none() {
            let found = load_directory(resolver, &backing)?;
            if &found != urn {
                warn!("{} carries volume URN {}, expected {}", backing, found, urn);
            }
        }

        Ok(ZipVolume {
            base: ObjectBase::new(resolver, urn.clone(), mode),
            backing,
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

    /// URN of the file holding the archive
    pub fn backing(&self) -> &Urn {
        &self.backing
    }

    /// Members in the order they were first written
    pub fn members(&self) -> Result<Vec<Urn>> {
        let resolver = self.base.resolver();
        let mut members: Vec<Urn> = resolver
            .resolve_all(self.urn(), vocab::VOLATILE_CONTAINS)?
            .into_iter()
            .filter_map(|value| match value {
                Value::Urn(urn) => Some(urn),
                _ => None,
            })
            .collect();
        members.reverse();
        Ok(members)
    }

    pub fn has_member(&self, member: &Urn) -> Result<bool> {
        let resolver = self.base.resolver();
        Ok(
            resolver.resolve_urn(member, vocab::AFF4_STORED)?.as_ref() == Some(self.urn())
                && matches!(resolver.kind_of(member), Ok(ObjectKind::Segment)),
        )
    }

    /// Open a member stream
    ///
    /// Writing blocks until no other member of this volume is being
    /// written, and holds the backing file until the member is closed.
    pub fn open_member(
        &self,
        member: &Urn,
        mode: Mode,
        compression: ZipCompression,
    ) -> Result<ZipSegment> {
        self.base.ensure_open()?;
        let resolver = self.base.resolver();
        match mode {
            Mode::Read => ZipSegment::open_reader(resolver, member),
            Mode::Write => {
                let backing = resolver.checkout(&self.backing, Mode::Write)?;
                ZipSegment::begin_write(resolver, self.urn(), member, compression, backing)
            }
        }
    }

    /// Write a whole member in one go
    pub fn write_member(&self, member: &Urn, data: &[u8], compression: ZipCompression) -> Result<()> {
        let mut segment = self.open_member(member, Mode::Write, compression)?;
        segment.write_all(data)?;
        segment.close()
    }

    /// Read a whole member
    pub fn read_member(&self, member: &Urn) -> Result<Vec<u8>> {
        let mut segment = self.open_member(member, Mode::Read, ZipCompression::Stored)?;
        let data = segment.read_all()?;
        segment.close()?;
        Ok(data)
    }

    /// Finish the volume
    ///
    /// In write mode this writes the metadata segment and the central
    /// directory, holding the backing file's write lock throughout so no
    /// member write can interleave.
    pub fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        if self.base.mode() == Mode::Write {
            self.write_directory()
                .with_context(|| format!("closing volume {}", self.urn()))?;
        }
        info!("Closed volume {}", self.urn());
        self.base.mark_closed();
        Ok(())
    }

    fn metadata(&self) -> Result<Vec<u8>> {
        let resolver = self.base.resolver();
        let mut subjects = vec![self.urn().clone()];
        for subject in resolver.subjects()? {
            if &subject == self.urn() {
                continue;
            }
            let stored_here =
                resolver.resolve_urn(&subject, vocab::AFF4_STORED)?.as_ref() == Some(self.urn());
            let is_segment = resolver
                .resolve_urn(&subject, vocab::AFF4_TYPE)?
                .is_some_and(|t| t.as_str() == vocab::AFF4_SEGMENT);
            if stored_here && !is_segment {
                subjects.push(subject);
            }
        }

        let mut triples: Vec<Triple> = resolver.export_triples(&subjects)?;
        // The backing path is a property of this copy of the file
        triples.retain(|t| !(&t.subject == self.urn() && t.predicate == vocab::AFF4_STORED));
        Ok(serde_json::to_vec_pretty(&triples)?)
    }

    fn write_directory(&mut self) -> Result<()> {
        let resolver = Arc::clone(self.base.resolver());
        let urn = self.urn().clone();

        let backing = resolver.checkout(&self.backing, Mode::Write)?;
        let metadata = self.metadata()?;
        let mut segment = ZipSegment::begin_write(
            &resolver,
            &urn,
            &urn.join(vocab::METADATA_SEGMENT),
            ZipCompression::Deflate,
            backing,
        )?;
        segment.write_all(&metadata)?;
        let mut backing = segment.finish()?;

        let cd_offset = resolver
            .resolve_u64(&urn, vocab::VOLATILE_DIRECTORY_OFFSET)?
            .unwrap_or(0);

        let members = self.members()?;
        let mut out = Vec::new();
        for member in &members {
            out.extend(central_record(&resolver, &urn, member)?);
        }
        let entries = members.len() as u64;
        let cd_size = out.len() as u64;

        let mut comment = VOLUME_COMMENT_TAG.to_vec();
        comment.extend_from_slice(urn.as_str().as_bytes());
        if comment.len() > u16::MAX as usize {
            return Err(Aff4Error::InvalidParameter(format!(
                "volume URN {} does not fit in the archive comment",
                urn
            )));
        }

        let limit = resolver.config().zip.zip64_threshold.min(ZIP64_LIMIT);
        let eocd = if entries >= 0xFFFF || cd_offset > limit || cd_size > limit {
            let end_offset = cd_offset + cd_size;
            out.extend(Zip64EndCentralDirectory::new(entries, cd_size, cd_offset).to_bytes());
            out.extend(Zip64Locator::new(end_offset).to_bytes());
            EndCentralDirectory::zip64(comment.len() as u16)
        } else {
            EndCentralDirectory::new(entries, cd_size, cd_offset, comment.len() as u16)
        };
        out.extend(eocd.to_bytes());
        out.extend(comment);

        {
            let stream = backing.stream()?;
            stream.seek(SeekFrom::Start(cd_offset))?;
            stream.write_all(&out)?;
        }
        let end = cd_offset + out.len() as u64;
        let file = backing.as_file()?;
        file.truncate(end)?;
        file.sync()?;

        debug!(
            "Wrote central directory of {} ({} entries at {})",
            urn, entries, cd_offset
        );
        Ok(())
    }
}

impl Drop for ZipVolume {
    fn drop(&mut self) {
        if self.base.mode() == Mode::Write && !self.base.is_closed() {
            warn!("Volume {} dropped without close; directory not written", self.urn());
        }
    }
}

/// Central directory record (with name and extra) for one member
fn central_record(resolver: &Resolver, volume: &Urn, member: &Urn) -> Result<Vec<u8>> {
    let missing = |what: &str| Aff4Error::NotFound(format!("member {} has no {}", member, what));
    let get = |attribute: &'static str| -> Result<u64> {
        resolver
            .resolve_u64(member, attribute)?
            .ok_or_else(|| missing(attribute))
    };

    let name = resolver
        .resolve_string(member, vocab::VOLATILE_FILENAME)?
        .unwrap_or_else(|| member_name(volume, member));
    let dos = resolver
        .resolve_u64(member, vocab::VOLATILE_DOS_DATETIME)?
        .unwrap_or(0) as u32;

    let entry = MemberEntry {
        compression: get(vocab::VOLATILE_COMPRESSION)? as u16,
        crc32: get(vocab::VOLATILE_CRC)? as u32,
        compressed_size: get(vocab::VOLATILE_COMPRESSED_SIZE)?,
        file_size: get(vocab::AFF4_SIZE)?,
        header_offset: get(vocab::VOLATILE_HEADER_OFFSET)?,
        dos: (dos as u16, (dos >> 16) as u16),
    };
    let (header, extra) =
        CentralDirectoryHeader::for_member(&name, &entry, resolver.config().zip.zip64_threshold);

    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend(extra);
    Ok(bytes)
}

fn read_at(stream: &mut dyn Stream, offset: u64, len: usize, what: &str) -> Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    if stream.read_fill(&mut buf)? != len {
        return Err(Aff4Error::InvalidArchive(format!("{} is truncated", what)));
    }
    Ok(buf)
}

/// Parse an archive's central directory into the resolver
///
/// Returns the volume URN found in the archive comment, or the file's own
/// URN for archives written by other tools.
fn load_directory(resolver: &Arc<Resolver>, backing: &Urn) -> Result<Urn> {
    let mut file = resolver.checkout(backing, Mode::Read)?;
    let stream = file.stream()?;
    let file_size = stream.size();

    let tail_len = file_size.min(MAX_COMMENT_SCAN + EndCentralDirectory::SIZE as u64);
    let tail_start = file_size - tail_len;
    let tail = read_at(stream, tail_start, tail_len as usize, "archive tail")?;
    let pos = EndCentralDirectory::find(&tail).ok_or_else(|| {
        Aff4Error::InvalidArchive(format!("no end of central directory in {}", backing))
    })?;
    let eocd = EndCentralDirectory::from_bytes(&tail[pos..])?;
    let eocd_offset = tail_start + pos as u64;

    if eocd.number_of_this_disk != 0 || eocd.disk_with_cd != 0 {
        return Err(Aff4Error::Unsupported("multi-disk archives".into()));
    }

    let comment_start = pos + EndCentralDirectory::SIZE;
    let comment_end = (comment_start + eocd.comment_len as usize).min(tail.len());
    let comment = &tail[comment_start..comment_end];
    let urn = match comment.strip_prefix(VOLUME_COMMENT_TAG.as_slice()) {
        Some(rest) => Urn::new(String::from_utf8(rest.to_vec()).map_err(|_| {
            Aff4Error::InvalidArchive("volume URN in archive comment is not UTF-8".into())
        })?),
        None => {
            warn!("{} carries no volume URN; using the file URN", backing);
            backing.clone()
        }
    };

    let (entries, cd_offset, cd_size) = if eocd.needs_zip64() {
        let locator_offset = eocd_offset.checked_sub(Zip64Locator::SIZE as u64).ok_or_else(|| {
            Aff4Error::InvalidArchive("no room for a zip64 locator".into())
        })?;
        let locator = Zip64Locator::from_bytes(&read_at(
            stream,
            locator_offset,
            Zip64Locator::SIZE,
            "zip64 locator",
        )?)?;
        if locator.number_of_disks != 1 || locator.disk_with_cd != 0 {
            return Err(Aff4Error::Unsupported("multi-disk archives".into()));
        }
        let end = Zip64EndCentralDirectory::from_bytes(&read_at(
            stream,
            locator.offset_of_end_cd,
            Zip64EndCentralDirectory::SIZE,
            "zip64 end of central directory",
        )?)?;
        if end.number_of_disk != 0 || end.disk_with_cd != 0 {
            return Err(Aff4Error::Unsupported("multi-disk archives".into()));
        }
        (end.number_of_entries_in_total, end.offset_of_cd, end.size_of_cd)
    } else {
        (
            eocd.total_entries_in_cd as u64,
            eocd.offset_of_cd as u64,
            eocd.size_of_cd as u64,
        )
    };

    if cd_offset.saturating_add(cd_size) > file_size {
        return Err(Aff4Error::InvalidArchive(format!(
            "central directory ({} bytes at {}) runs past the end of the file",
            cd_size, cd_offset
        )));
    }
    let directory = read_at(stream, cd_offset, cd_size as usize, "central directory")?;
    drop(file);

    resolver.set_value(&urn, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_ZIP_VOLUME))?;
    resolver.set_value(&urn, vocab::AFF4_STORED, backing)?;

    let mut pos = 0usize;
    let mut metadata = None;
    for _ in 0..entries {
        let header = CentralDirectoryHeader::from_bytes(&directory[pos.min(directory.len())..])?;
        let name_start = pos + CentralDirectoryHeader::SIZE;
        let extra_start = name_start + header.file_name_length as usize;
        let extra_end = extra_start + header.extra_field_length as usize;
        if pos + CentralDirectoryHeader::SIZE + header.trailer_len() > directory.len() {
            return Err(Aff4Error::InvalidArchive(
                "central directory record runs past the directory".into(),
            ));
        }
        let name = String::from_utf8_lossy(&directory[name_start..extra_start]).into_owned();
        let (size, compressed_size, header_offset) =
            header.resolve_sizes(&directory[extra_start..extra_end])?;
        pos += CentralDirectoryHeader::SIZE + header.trailer_len();

        let member = member_urn(&urn, &name);
        resolver.set_value(&member, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_SEGMENT))?;
        resolver.set_value(&member, vocab::AFF4_STORED, &urn)?;
        resolver.set_value(&member, vocab::AFF4_SIZE, size)?;
        resolver.set_value(&member, vocab::VOLATILE_COMPRESSED_SIZE, compressed_size)?;
        resolver.set_value(&member, vocab::VOLATILE_COMPRESSION, header.compression)?;
        resolver.set_value(&member, vocab::VOLATILE_CRC, header.crc32)?;
        resolver.set_value(&member, vocab::VOLATILE_HEADER_OFFSET, header_offset)?;
        resolver.set_value(&member, vocab::VOLATILE_FILENAME, name.clone())?;
        resolver.set_value(
            &member,
            vocab::VOLATILE_DOS_DATETIME,
            ((header.last_mod_date as u32) << 16) | header.last_mod_time as u32,
        )?;
        resolver.add_value(&urn, vocab::VOLATILE_CONTAINS, &member, true)?;

        if name == vocab::METADATA_SEGMENT {
            metadata = Some(member);
        }
    }

    resolver.set_value(&urn, vocab::VOLATILE_DIRECTORY_OFFSET, cd_offset)?;
    resolver.set_value(&urn, vocab::VOLATILE_LOADED, 1u16)?;

    if let Some(member) = metadata {
        if let Err(e) = import_metadata(resolver, &member) {
            warn!("Skipping unreadable metadata in {}: {}", urn, e);
        }
    }

    info!("Loaded volume {} ({} members)", urn, entries);
    Ok(urn)
}

fn import_metadata(resolver: &Arc<Resolver>, member: &Urn) -> Result<()> {
    let mut segment = ZipSegment::open_reader(resolver, member)?;
    let data = segment.read_all()?;
    segment.close()?;
    let triples: Vec<Triple> = serde_json::from_slice(&data)?;
    let added = resolver.import_triples(&triples)?;
    debug!("Imported {} metadata values from {}", added, member);
    Ok(())
}
