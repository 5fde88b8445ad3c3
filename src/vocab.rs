//! Stable attribute and type names
//!
//! Every implementation must agree on these strings: they end up inside the
//! archive's metadata segment. Names in the volatile namespace are
//! bookkeeping derived from the physical archive and are never serialized.

pub const AFF4_NAMESPACE: &str = "aff4:";
pub const VOLATILE_NAMESPACE: &str = "aff4volatile:";

// Persistent predicates
pub const AFF4_TYPE: &str = "aff4:type";
pub const AFF4_STORED: &str = "aff4:stored";
pub const AFF4_SIZE: &str = "aff4:size";
pub const AFF4_SHA256: &str = "aff4:sha256";
pub const AFF4_TIMESTAMP: &str = "aff4:timestamp";
pub const AFF4_CHUNK_SIZE: &str = "aff4:chunk_size";
pub const AFF4_COMPRESSION: &str = "aff4:compression";
pub const AFF4_CHUNKS_IN_SEGMENT: &str = "aff4:chunks_in_segment";
pub const AFF4_BLOCKSIZE: &str = "aff4:blocksize";
pub const AFF4_IMAGE_PERIOD: &str = "aff4:image_period";
pub const AFF4_TARGET_PERIOD: &str = "aff4:target_period";
pub const AFF4_TARGET: &str = "aff4:target";

// Volatile predicates
pub const VOLATILE_CONTAINS: &str = "aff4volatile:contains";
pub const VOLATILE_HEADER_OFFSET: &str = "aff4volatile:header_offset";
pub const VOLATILE_COMPRESSED_SIZE: &str = "aff4volatile:compressed_size";
pub const VOLATILE_COMPRESSION: &str = "aff4volatile:compression";
pub const VOLATILE_CRC: &str = "aff4volatile:crc32";
pub const VOLATILE_DIRECTORY_OFFSET: &str = "aff4volatile:directory_offset";
pub const VOLATILE_DIRTY: &str = "aff4volatile:dirty";
pub const VOLATILE_LOADED: &str = "aff4volatile:loaded";
pub const VOLATILE_FILENAME: &str = "aff4volatile:filename";
/// DOS `(date << 16) | time` of a member
pub const VOLATILE_DOS_DATETIME: &str = "aff4volatile:dos_datetime";

// Object types
pub const AFF4_ZIP_VOLUME: &str = "aff4:zip_volume";
pub const AFF4_SEGMENT: &str = "aff4:segment";
pub const AFF4_IMAGE: &str = "aff4:image";
pub const AFF4_MAP: &str = "aff4:map";

// Map sentinel targets
pub const AFF4_ZERO_TARGET: &str = "aff4:Zero";
pub const AFF4_NULL_TARGET: &str = "aff4:UnknownData";

/// Member holding the serialized metadata of a volume
pub const METADATA_SEGMENT: &str = "information.json";

/// Whether a predicate belongs to the non-persisted namespace
pub fn is_volatile(predicate: &str) -> bool {
    predicate.starts_with(VOLATILE_NAMESPACE)
}
