//! ZIP/Zip64 volume layer

pub mod records;
mod segment;
mod volume;

pub use records::ZIP64_LIMIT;
pub use segment::{ZipCompression, ZipSegment};
pub use volume::ZipVolume;
