//! ZIP and Zip64 on-disk records
//!
//! All records are little-endian and packed. Each record knows its fixed
//! size, its magic, and how to encode/decode its fixed part; variable
//! trailers (names, extras, comments) are carried alongside.

use crate::error::{Aff4Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};

pub const LOCAL_FILE_HEADER_MAGIC: u32 = 0x04034b50;
pub const CENTRAL_FILE_HEADER_MAGIC: u32 = 0x02014b50;
pub const END_CENTRAL_DIRECTORY_MAGIC: u32 = 0x06054b50;
pub const ZIP64_END_CENTRAL_DIRECTORY_MAGIC: u32 = 0x06064b50;
pub const ZIP64_LOCATOR_MAGIC: u32 = 0x07064b50;
pub const DATA_DESCRIPTOR_MAGIC: u32 = 0x08074b50;

/// Values above this are stored in Zip64 fields
pub const ZIP64_LIMIT: u64 = 0x7FFF_FFFF;
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Flag bit 3: CRC and sizes follow the data in a descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;

/// Prefix of the archive comment that carries the volume URN
pub const VOLUME_COMMENT_TAG: &[u8; 4] = b"aff4";

/// Longest trailing comment the EOCD scan will step over
pub const MAX_COMMENT_SCAN: u64 = 4096;

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn check_len(bytes: &[u8], size: usize, what: &str) -> Result<()> {
    if bytes.len() < size {
        return Err(Aff4Error::InvalidArchive(format!(
            "{} truncated: {} of {} bytes",
            what,
            bytes.len(),
            size
        )));
    }
    Ok(())
}

fn check_magic(bytes: &[u8], magic: u32, what: &str) -> Result<()> {
    let found = u32_at(bytes, 0);
    if found != magic {
        return Err(Aff4Error::InvalidArchive(format!(
            "bad {} magic: {:#010x}",
            what, found
        )));
    }
    Ok(())
}

/// Clamp a value into a 32-bit field, using the Zip64 sentinel when it
/// is above `limit`
pub fn clamp32(value: u64, limit: u64) -> u32 {
    if value > limit.min(ZIP64_LIMIT) {
        u32::MAX
    } else {
        value as u32
    }
}

/// DOS (time, date) of a timestamp
pub fn dos_datetime(ts: DateTime<Utc>) -> (u16, u16) {
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
    let year = ts.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    (time, date)
}

/// Local file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub file_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub const SIZE: usize = 30;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.version_needed.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.compression.to_le_bytes());
        bytes.extend_from_slice(&self.last_mod_time.to_le_bytes());
        bytes.extend_from_slice(&self.last_mod_date.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.compressed_size.to_le_bytes());
        bytes.extend_from_slice(&self.file_size.to_le_bytes());
        bytes.extend_from_slice(&self.file_name_length.to_le_bytes());
        bytes.extend_from_slice(&self.extra_field_length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "local file header")?;
        check_magic(bytes, LOCAL_FILE_HEADER_MAGIC, "local file header")?;
        Ok(LocalFileHeader {
            version_needed: u16_at(bytes, 4),
            flags: u16_at(bytes, 6),
            compression: u16_at(bytes, 8),
            last_mod_time: u16_at(bytes, 10),
            last_mod_date: u16_at(bytes, 12),
            crc32: u32_at(bytes, 14),
            compressed_size: u32_at(bytes, 18),
            file_size: u32_at(bytes, 22),
            file_name_length: u16_at(bytes, 26),
            extra_field_length: u16_at(bytes, 28),
        })
    }

    /// Offset of the member data relative to the header
    pub fn data_offset(&self) -> u64 {
        Self::SIZE as u64 + self.file_name_length as u64 + self.extra_field_length as u64
    }
}

/// Trailing data descriptor written after streamed member data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub file_size: u64,
}

impl DataDescriptor {
    pub fn is_zip64(&self, limit: u64) -> bool {
        let limit = limit.min(ZIP64_LIMIT);
        self.compressed_size > limit || self.file_size > limit
    }

    /// Signature, CRC, then 4- or 8-byte sizes
    pub fn to_bytes(&self, limit: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&DATA_DESCRIPTOR_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        if self.is_zip64(limit) {
            bytes.extend_from_slice(&self.compressed_size.to_le_bytes());
            bytes.extend_from_slice(&self.file_size.to_le_bytes());
        } else {
            bytes.extend_from_slice(&(self.compressed_size as u32).to_le_bytes());
            bytes.extend_from_slice(&(self.file_size as u32).to_le_bytes());
        }
        bytes
    }
}

/// Zip64 extended information extra field
///
/// Only the overridden values are present, always in the order
/// uncompressed size, compressed size, header offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64Extra {
    pub file_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub header_offset: Option<u64>,
}

impl Zip64Extra {
    /// Overrides needed for a member with these true values
    pub fn for_values(file_size: u64, compressed_size: u64, header_offset: u64, limit: u64) -> Self {
        let limit = limit.min(ZIP64_LIMIT);
        Zip64Extra {
            file_size: (file_size > limit).then_some(file_size),
            compressed_size: (compressed_size > limit).then_some(compressed_size),
            header_offset: (header_offset > limit).then_some(header_offset),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file_size.is_none() && self.compressed_size.is_none() && self.header_offset.is_none()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let fields: Vec<u64> = [self.file_size, self.compressed_size, self.header_offset]
            .into_iter()
            .flatten()
            .collect();
        let mut bytes = Vec::with_capacity(4 + fields.len() * 8);
        bytes.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        bytes.extend_from_slice(&((fields.len() * 8) as u16).to_le_bytes());
        for field in fields {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Find and decode the Zip64 field in an extra block
    ///
    /// Which values are present is decided by which 32-bit fields of the
    /// owning record hold the `0xFFFFFFFF` sentinel.
    pub fn parse(
        extra: &[u8],
        want_file_size: bool,
        want_compressed_size: bool,
        want_header_offset: bool,
    ) -> Result<Self> {
        let mut result = Zip64Extra::default();
        let mut pos = 0;
        while pos + 4 <= extra.len() {
            let id = u16_at(extra, pos);
            let len = u16_at(extra, pos + 2) as usize;
            let body = extra.get(pos + 4..pos + 4 + len).ok_or_else(|| {
                Aff4Error::InvalidArchive("extra field runs past its block".into())
            })?;
            if id == ZIP64_EXTRA_ID {
                let mut cursor = 0;
                let mut next = |present: bool| -> Result<Option<u64>> {
                    if !present {
                        return Ok(None);
                    }
                    check_len(&body[cursor.min(body.len())..], 8, "zip64 extra field")?;
                    let value = u64_at(body, cursor);
                    cursor += 8;
                    Ok(Some(value))
                };
                result.file_size = next(want_file_size)?;
                result.compressed_size = next(want_compressed_size)?;
                result.header_offset = next(want_header_offset)?;
                return Ok(result);
            }
            pos += 4 + len;
        }
        if want_file_size || want_compressed_size || want_header_offset {
            return Err(Aff4Error::InvalidArchive(
                "record uses Zip64 sentinels but has no Zip64 extra field".into(),
            ));
        }
        Ok(result)
    }
}

/// True values of one member, before any Zip64 substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberEntry {
    pub compression: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub file_size: u64,
    pub header_offset: u64,
    /// DOS (time, date)
    pub dos: (u16, u16),
}

/// Central directory file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub file_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub relative_offset_local_header: u32,
}

impl CentralDirectoryHeader {
    pub const SIZE: usize = 46;

    /// Record for a member with the given true values
    ///
    /// Values above `limit` are replaced by the sentinel; the returned
    /// extra block carries them.
    pub fn for_member(name: &str, entry: &MemberEntry, limit: u64) -> (Self, Vec<u8>) {
        let zip64 = Zip64Extra::for_values(
            entry.file_size,
            entry.compressed_size,
            entry.header_offset,
            limit,
        );
        let extra = if zip64.is_empty() {
            Vec::new()
        } else {
            zip64.to_bytes()
        };
        let version = if zip64.is_empty() {
            VERSION_DEFAULT
        } else {
            VERSION_ZIP64
        };
        let header = CentralDirectoryHeader {
            version_made_by: version,
            version_needed: version,
            flags: FLAG_DATA_DESCRIPTOR,
            compression: entry.compression,
            last_mod_time: entry.dos.0,
            last_mod_date: entry.dos.1,
            crc32: entry.crc32,
            compressed_size: clamp32(entry.compressed_size, limit),
            file_size: clamp32(entry.file_size, limit),
            file_name_length: name.len() as u16,
            extra_field_length: extra.len() as u16,
            file_comment_length: 0,
            disk_number_start: 0,
            internal_attributes: 0,
            external_attributes: 0o644 << 16,
            relative_offset_local_header: clamp32(entry.header_offset, limit),
        };
        (header, extra)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&CENTRAL_FILE_HEADER_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.version_made_by.to_le_bytes());
        bytes.extend_from_slice(&self.version_needed.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.compression.to_le_bytes());
        bytes.extend_from_slice(&self.last_mod_time.to_le_bytes());
        bytes.extend_from_slice(&self.last_mod_date.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.compressed_size.to_le_bytes());
        bytes.extend_from_slice(&self.file_size.to_le_bytes());
        bytes.extend_from_slice(&self.file_name_length.to_le_bytes());
        bytes.extend_from_slice(&self.extra_field_length.to_le_bytes());
        bytes.extend_from_slice(&self.file_comment_length.to_le_bytes());
        bytes.extend_from_slice(&self.disk_number_start.to_le_bytes());
        bytes.extend_from_slice(&self.internal_attributes.to_le_bytes());
        bytes.extend_from_slice(&self.external_attributes.to_le_bytes());
        bytes.extend_from_slice(&self.relative_offset_local_header.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "central directory record")?;
        check_magic(bytes, CENTRAL_FILE_HEADER_MAGIC, "central directory record")?;
        Ok(CentralDirectoryHeader {
            version_made_by: u16_at(bytes, 4),
            version_needed: u16_at(bytes, 6),
            flags: u16_at(bytes, 8),
            compression: u16_at(bytes, 10),
            last_mod_time: u16_at(bytes, 12),
            last_mod_date: u16_at(bytes, 14),
            crc32: u32_at(bytes, 16),
            compressed_size: u32_at(bytes, 20),
            file_size: u32_at(bytes, 24),
            file_name_length: u16_at(bytes, 28),
            extra_field_length: u16_at(bytes, 30),
            file_comment_length: u16_at(bytes, 32),
            disk_number_start: u16_at(bytes, 34),
            internal_attributes: u16_at(bytes, 36),
            external_attributes: u32_at(bytes, 38),
            relative_offset_local_header: u32_at(bytes, 42),
        })
    }

    /// Bytes following the fixed part (name, extra, comment)
    pub fn trailer_len(&self) -> usize {
        self.file_name_length as usize
            + self.extra_field_length as usize
            + self.file_comment_length as usize
    }

    /// True (size, compressed size, header offset), applying any Zip64
    /// overrides found in `extra`
    pub fn resolve_sizes(&self, extra: &[u8]) -> Result<(u64, u64, u64)> {
        let zip64 = Zip64Extra::parse(
            extra,
            self.file_size == u32::MAX,
            self.compressed_size == u32::MAX,
            self.relative_offset_local_header == u32::MAX,
        )?;
        Ok((
            zip64.file_size.unwrap_or(self.file_size as u64),
            zip64.compressed_size.unwrap_or(self.compressed_size as u64),
            zip64
                .header_offset
                .unwrap_or(self.relative_offset_local_header as u64),
        ))
    }
}

/// End of central directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndCentralDirectory {
    pub number_of_this_disk: u16,
    pub disk_with_cd: u16,
    pub total_entries_in_cd_on_disk: u16,
    pub total_entries_in_cd: u16,
    pub size_of_cd: u32,
    pub offset_of_cd: u32,
    pub comment_len: u16,
}

impl EndCentralDirectory {
    pub const SIZE: usize = 22;

    pub fn new(entries: u64, size_of_cd: u64, offset_of_cd: u64, comment_len: u16) -> Self {
        let entries = if entries >= 0xFFFF { 0xFFFF } else { entries as u16 };
        EndCentralDirectory {
            number_of_this_disk: 0,
            disk_with_cd: 0,
            total_entries_in_cd_on_disk: entries,
            total_entries_in_cd: entries,
            size_of_cd: clamp32(size_of_cd, ZIP64_LIMIT),
            offset_of_cd: clamp32(offset_of_cd, ZIP64_LIMIT),
            comment_len,
        }
    }

    /// Record whose every field defers to the Zip64 records
    pub fn zip64(comment_len: u16) -> Self {
        EndCentralDirectory {
            number_of_this_disk: 0,
            disk_with_cd: 0,
            total_entries_in_cd_on_disk: 0xFFFF,
            total_entries_in_cd: 0xFFFF,
            size_of_cd: u32::MAX,
            offset_of_cd: u32::MAX,
            comment_len,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&END_CENTRAL_DIRECTORY_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.number_of_this_disk.to_le_bytes());
        bytes.extend_from_slice(&self.disk_with_cd.to_le_bytes());
        bytes.extend_from_slice(&self.total_entries_in_cd_on_disk.to_le_bytes());
        bytes.extend_from_slice(&self.total_entries_in_cd.to_le_bytes());
        bytes.extend_from_slice(&self.size_of_cd.to_le_bytes());
        bytes.extend_from_slice(&self.offset_of_cd.to_le_bytes());
        bytes.extend_from_slice(&self.comment_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "end of central directory")?;
        check_magic(bytes, END_CENTRAL_DIRECTORY_MAGIC, "end of central directory")?;
        Ok(EndCentralDirectory {
            number_of_this_disk: u16_at(bytes, 4),
            disk_with_cd: u16_at(bytes, 6),
            total_entries_in_cd_on_disk: u16_at(bytes, 8),
            total_entries_in_cd: u16_at(bytes, 10),
            size_of_cd: u32_at(bytes, 12),
            offset_of_cd: u32_at(bytes, 16),
            comment_len: u16_at(bytes, 20),
        })
    }

    /// Whether the real values live in the Zip64 records
    pub fn needs_zip64(&self) -> bool {
        self.offset_of_cd == u32::MAX
            || self.size_of_cd == u32::MAX
            || self.total_entries_in_cd == 0xFFFF
    }

    /// Position of the last EOCD magic in `tail`, if any
    pub fn find(tail: &[u8]) -> Option<usize> {
        let magic = END_CENTRAL_DIRECTORY_MAGIC.to_le_bytes();
        (0..=tail.len().checked_sub(Self::SIZE)?)
            .rev()
            .find(|&i| tail[i..i + 4] == magic)
    }
}

/// Zip64 end of central directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EndCentralDirectory {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub number_of_disk: u32,
    pub disk_with_cd: u32,
    pub number_of_entries_in_volume: u64,
    pub number_of_entries_in_total: u64,
    pub size_of_cd: u64,
    pub offset_of_cd: u64,
}

impl Zip64EndCentralDirectory {
    pub const SIZE: usize = 56;

    pub fn new(entries: u64, size_of_cd: u64, offset_of_cd: u64) -> Self {
        Zip64EndCentralDirectory {
            version_made_by: VERSION_ZIP64,
            version_needed: VERSION_ZIP64,
            number_of_disk: 0,
            disk_with_cd: 0,
            number_of_entries_in_volume: entries,
            number_of_entries_in_total: entries,
            size_of_cd,
            offset_of_cd,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&ZIP64_END_CENTRAL_DIRECTORY_MAGIC.to_le_bytes());
        // Size of the remaining record
        bytes.extend_from_slice(&((Self::SIZE - 12) as u64).to_le_bytes());
        bytes.extend_from_slice(&self.version_made_by.to_le_bytes());
        bytes.extend_from_slice(&self.version_needed.to_le_bytes());
        bytes.extend_from_slice(&self.number_of_disk.to_le_bytes());
        bytes.extend_from_slice(&self.disk_with_cd.to_le_bytes());
        bytes.extend_from_slice(&self.number_of_entries_in_volume.to_le_bytes());
        bytes.extend_from_slice(&self.number_of_entries_in_total.to_le_bytes());
        bytes.extend_from_slice(&self.size_of_cd.to_le_bytes());
        bytes.extend_from_slice(&self.offset_of_cd.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "zip64 end of central directory")?;
        check_magic(
            bytes,
            ZIP64_END_CENTRAL_DIRECTORY_MAGIC,
            "zip64 end of central directory",
        )?;
        Ok(Zip64EndCentralDirectory {
            version_made_by: u16_at(bytes, 12),
            version_needed: u16_at(bytes, 14),
            number_of_disk: u32_at(bytes, 16),
            disk_with_cd: u32_at(bytes, 20),
            number_of_entries_in_volume: u64_at(bytes, 24),
            number_of_entries_in_total: u64_at(bytes, 32),
            size_of_cd: u64_at(bytes, 40),
            offset_of_cd: u64_at(bytes, 48),
        })
    }
}

/// Zip64 end of central directory locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64Locator {
    pub disk_with_cd: u32,
    pub offset_of_end_cd: u64,
    pub number_of_disks: u32,
}

impl Zip64Locator {
    pub const SIZE: usize = 20;

    pub fn new(offset_of_end_cd: u64) -> Self {
        Zip64Locator {
            disk_with_cd: 0,
            offset_of_end_cd,
            number_of_disks: 1,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&ZIP64_LOCATOR_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.disk_with_cd.to_le_bytes());
        bytes.extend_from_slice(&self.offset_of_end_cd.to_le_bytes());
        bytes.extend_from_slice(&self.number_of_disks.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "zip64 locator")?;
        check_magic(bytes, ZIP64_LOCATOR_MAGIC, "zip64 locator")?;
        Ok(Zip64Locator {
            disk_with_cd: u32_at(bytes, 4),
            offset_of_end_cd: u64_at(bytes, 8),
            number_of_disks: u32_at(bytes, 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_local_header_layout() {
        let header = LocalFileHeader {
            version_needed: VERSION_DEFAULT,
            flags: FLAG_DATA_DESCRIPTOR,
            compression: 8,
            last_mod_time: 0,
            last_mod_date: 0,
            crc32: 0,
            compressed_size: 0,
            file_size: 0,
            file_name_length: 5,
            extra_field_length: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LocalFileHeader::SIZE);
        assert_eq!(&bytes[0..4], &[0x50, 0x4b, 0x03, 0x04]);
        assert_eq!(u16_at(&bytes, 6), FLAG_DATA_DESCRIPTOR);
        assert_eq!(LocalFileHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.data_offset(), 35);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = EndCentralDirectory::new(1, 46, 100, 0).to_bytes();
        bytes[0] = 0;
        let err = EndCentralDirectory::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Aff4Error::InvalidArchive(_)));
        assert!(LocalFileHeader::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_data_descriptor_widths() {
        let small = DataDescriptor {
            crc32: 1,
            compressed_size: 10,
            file_size: 20,
        };
        assert_eq!(small.to_bytes(ZIP64_LIMIT).len(), 16);
        // A lowered threshold widens the same record
        assert_eq!(small.to_bytes(15).len(), 24);

        let large = DataDescriptor {
            crc32: 1,
            compressed_size: 10,
            file_size: ZIP64_LIMIT + 1,
        };
        let bytes = large.to_bytes(ZIP64_LIMIT);
        assert_eq!(bytes.len(), 24);
        assert_eq!(u32_at(&bytes, 0), DATA_DESCRIPTOR_MAGIC);
        assert_eq!(u64_at(&bytes, 16), ZIP64_LIMIT + 1);
    }

    #[test]
    fn test_zip64_threshold_in_cd_record() {
        let huge = 3 * 1024 * 1024 * 1024u64;
        let entry = MemberEntry {
            compression: 0,
            crc32: 7,
            compressed_size: huge,
            file_size: huge,
            header_offset: 1234,
            dos: (0, 0),
        };
        let (header, extra) = CentralDirectoryHeader::for_member("big", &entry, ZIP64_LIMIT);
        assert_eq!(header.file_size, 0xFFFF_FFFF);
        assert_eq!(header.compressed_size, 0xFFFF_FFFF);
        assert_eq!(header.relative_offset_local_header, 1234);
        assert_eq!(header.version_needed, VERSION_ZIP64);

        // id, length, then size before compressed size
        assert_eq!(u16_at(&extra, 0), ZIP64_EXTRA_ID);
        assert_eq!(u16_at(&extra, 2), 16);
        assert_eq!(u64_at(&extra, 4), huge);
        assert_eq!(u64_at(&extra, 12), huge);

        let parsed = CentralDirectoryHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.resolve_sizes(&extra).unwrap(), (huge, huge, 1234));
    }

    #[test]
    fn test_zip64_extra_keeps_field_order() {
        let extra = Zip64Extra::for_values(10, ZIP64_LIMIT + 5, ZIP64_LIMIT + 9, ZIP64_LIMIT);
        assert_eq!(extra.file_size, None);
        let bytes = extra.to_bytes();
        assert_eq!(u16_at(&bytes, 2), 16);
        assert_eq!(u64_at(&bytes, 4), ZIP64_LIMIT + 5);
        assert_eq!(u64_at(&bytes, 12), ZIP64_LIMIT + 9);

        let parsed = Zip64Extra::parse(&bytes, false, true, true).unwrap();
        assert_eq!(parsed, extra);
    }

    #[test]
    fn test_threshold_never_exceeds_format_limit() {
        assert_eq!(clamp32(100, 64), u32::MAX);
        assert_eq!(clamp32(64, 64), 64);
        assert_eq!(clamp32(ZIP64_LIMIT + 1, u64::MAX), u32::MAX);
        let extra = Zip64Extra::for_values(100, 10, 65, 64);
        assert_eq!(extra.file_size, Some(100));
        assert_eq!(extra.compressed_size, None);
        assert_eq!(extra.header_offset, Some(65));
    }

    #[test]
    fn test_sentinel_without_extra_is_rejected() {
        assert!(Zip64Extra::parse(&[], true, false, false).is_err());
        assert_eq!(Zip64Extra::parse(&[], false, false, false).unwrap(), Zip64Extra::default());
    }

    #[test]
    fn test_eocd_scan_skips_comment() {
        let comment = b"aff4aff4://volume";
        let mut tail = vec![0xAAu8; 64];
        tail.extend(EndCentralDirectory::new(3, 138, 1000, comment.len() as u16).to_bytes());
        tail.extend_from_slice(comment);

        let pos = EndCentralDirectory::find(&tail).unwrap();
        assert_eq!(pos, 64);
        let eocd = EndCentralDirectory::from_bytes(&tail[pos..]).unwrap();
        assert_eq!(eocd.total_entries_in_cd, 3);
        assert_eq!(eocd.offset_of_cd, 1000);
        assert!(!eocd.needs_zip64());
        assert_eq!(EndCentralDirectory::find(&[0u8; 10]), None);
    }

    #[test]
    fn test_zip64_end_records() {
        let end = Zip64EndCentralDirectory::new(70000, 1 << 20, 5 << 30);
        let bytes = end.to_bytes();
        assert_eq!(bytes.len(), Zip64EndCentralDirectory::SIZE);
        assert_eq!(u64_at(&bytes, 4), 44);
        assert_eq!(Zip64EndCentralDirectory::from_bytes(&bytes).unwrap(), end);

        let locator = Zip64Locator::new(5 << 30);
        assert_eq!(Zip64Locator::from_bytes(&locator.to_bytes()).unwrap(), locator);

        let eocd = EndCentralDirectory::new(70000, 1 << 20, 5 << 30, 0);
        assert!(eocd.needs_zip64());
        assert_eq!(eocd.total_entries_in_cd, 0xFFFF);
    }

    #[test]
    fn test_dos_datetime() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 13, 45, 30).unwrap();
        let (time, date) = dos_datetime(ts);
        assert_eq!(time >> 11, 13);
        assert_eq!((time >> 5) & 0x3f, 45);
        assert_eq!(time & 0x1f, 15);
        assert_eq!(date >> 9, 44);
        assert_eq!((date >> 5) & 0xf, 3);
        assert_eq!(date & 0x1f, 15);
    }
}
