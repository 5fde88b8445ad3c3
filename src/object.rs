//! Object model shared by every resolvable entity
//!
//! Objects are a closed set of kinds ([`Aff4Object`]). Shared state lives in
//! [`ObjectBase`] and shared stream behaviour in the [`Stream`] trait plus the
//! [`SeekState`] helper each stream embeds.
//!
//! Ownership: an object belongs to exactly one of its creator, the
//! resolver's object cache, or a [`Checkout`] guard. `open` moves it out of
//! the cache, `cache_return` moves it back.

use crate::error::{Aff4Error, Result};
use crate::file::FileBackedObject;
use crate::image::ImageStream;
use crate::lock::WriteLease;
use crate::map::MapStream;
use crate::resolver::Resolver;
use crate::urn::Urn;
use crate::vocab;
use crate::zip::{ZipSegment, ZipVolume};
use std::fmt;
use std::io::SeekFrom;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Access mode of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    /// Parse the single-letter form (`'r'` / `'w'`)
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'r' => Ok(Mode::Read),
            'w' => Ok(Mode::Write),
            other => Err(Aff4Error::InvalidParameter(format!(
                "unknown access mode {:?}",
                other
            ))),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Mode::Read => 'r',
            Mode::Write => 'w',
        }
    }
}

/// Read/write pointer of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekState {
    position: u64,
}

impl SeekState {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set(&mut self, position: u64) {
        self.position = position;
    }

    pub fn advance(&mut self, n: usize) {
        self.position += n as u64;
    }

    /// Resolve a seek request against a stream of length `size`
    ///
    /// Seeking past the end is allowed; seeking before the start is not.
    pub fn seek(&mut self, pos: SeekFrom, size: u64) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(Aff4Error::InvalidParameter(format!(
                "seek to {:?} lands before the start of the stream",
                pos
            ))),
        }
    }
}

/// Byte stream contract shared by files, members, images and maps
pub trait Stream {
    /// Read at the current position; 0 means end of stream
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write at the current position
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn tell(&self) -> u64;

    /// Logical length of the stream
    fn size(&self) -> u64;

    /// Flush and invalidate the stream; further calls fail
    fn close(&mut self) -> Result<()>;

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Aff4Error::Runtime("stream accepted no bytes".into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Read until `buf` is full or the stream ends
    fn read_fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read everything from the current position to the end
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let remaining = self.size().saturating_sub(self.tell());
        let mut out = vec![0u8; remaining as usize];
        let n = self.read_fill(&mut out)?;
        out.truncate(n);
        Ok(out)
    }
}

/// Identity and lifecycle state every object carries
#[derive(Debug)]
pub struct ObjectBase {
    urn: Urn,
    mode: Mode,
    resolver: Arc<Resolver>,
    lease: Option<WriteLease>,
    closed: bool,
}

impl ObjectBase {
    pub fn new(resolver: &Arc<Resolver>, urn: Urn, mode: Mode) -> Self {
        ObjectBase {
            urn,
            mode,
            resolver: Arc::clone(resolver),
            lease: None,
            closed: false,
        }
    }

    /// Base of a write-mode object created outside `Resolver::open`
    ///
    /// Blocks until the URN's write lock is free.
    pub fn new_leased(resolver: &Arc<Resolver>, urn: Urn) -> Result<Self> {
        let lease = WriteLease::acquire(resolver.locks(), &urn)?;
        let mut base = ObjectBase::new(resolver, urn, Mode::Write);
        base.lease = Some(lease);
        Ok(base)
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub(crate) fn attach_lease(&mut self, lease: WriteLease) {
        self.lease = Some(lease);
    }

    pub(crate) fn take_lease(&mut self) -> Option<WriteLease> {
        self.lease.take()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Aff4Error::closed(self.urn.as_str()));
        }
        Ok(())
    }

    pub fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode != Mode::Write {
            return Err(Aff4Error::Unsupported(format!(
                "{} is open for reading",
                self.urn
            )));
        }
        Ok(())
    }

    pub fn ensure_readable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode != Mode::Read {
            return Err(Aff4Error::Unsupported(format!(
                "{} is open for writing",
                self.urn
            )));
        }
        Ok(())
    }

    /// Terminal transition; releases the write lease
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.lease = None;
    }
}

/// The closed set of object kinds the resolver can construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    File,
    Volume,
    Segment,
    Image,
    Map,
}

impl ObjectKind {
    /// Value of `aff4:type` for this kind (files are found by scheme)
    pub fn type_urn(self) -> Option<&'static str> {
        match self {
            ObjectKind::File => None,
            ObjectKind::Volume => Some(vocab::AFF4_ZIP_VOLUME),
            ObjectKind::Segment => Some(vocab::AFF4_SEGMENT),
            ObjectKind::Image => Some(vocab::AFF4_IMAGE),
            ObjectKind::Map => Some(vocab::AFF4_MAP),
        }
    }

    pub fn from_type(type_urn: &str) -> Option<Self> {
        match type_urn {
            vocab::AFF4_ZIP_VOLUME => Some(ObjectKind::Volume),
            vocab::AFF4_SEGMENT => Some(ObjectKind::Segment),
            vocab::AFF4_IMAGE => Some(ObjectKind::Image),
            vocab::AFF4_MAP => Some(ObjectKind::Map),
            _ => None,
        }
    }

    /// Build a fresh instance from the resolver's attributes
    pub(crate) fn construct(
        self,
        resolver: &Arc<Resolver>,
        urn: &Urn,
        mode: Mode,
    ) -> Result<Aff4Object> {
        Ok(match self {
            ObjectKind::File => Aff4Object::File(FileBackedObject::open(resolver, urn, mode)?),
            ObjectKind::Volume => Aff4Object::Volume(ZipVolume::from_resolver(resolver, urn, mode)?),
            ObjectKind::Segment => {
                if mode == Mode::Write {
                    return Err(Aff4Error::Unsupported(format!(
                        "segment {} can only be written through its volume",
                        urn
                    )));
                }
                Aff4Object::Segment(ZipSegment::open_reader(resolver, urn)?)
            }
            ObjectKind::Image => Aff4Object::Image(ImageStream::from_resolver(resolver, urn, mode)?),
            ObjectKind::Map => Aff4Object::Map(MapStream::from_resolver(resolver, urn, mode)?),
        })
    }

    /// Order in which cached write-mode objects are closed at shutdown
    pub(crate) fn close_order(self) -> u8 {
        match self {
            ObjectKind::Image | ObjectKind::Map => 0,
            ObjectKind::Segment => 1,
            ObjectKind::Volume => 2,
            ObjectKind::File => 3,
        }
    }
}

/// Any object the resolver manages
pub enum Aff4Object {
    File(FileBackedObject),
    Volume(ZipVolume),
    Segment(ZipSegment),
    Image(ImageStream),
    Map(MapStream),
}

impl Aff4Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Aff4Object::File(_) => ObjectKind::File,
            Aff4Object::Volume(_) => ObjectKind::Volume,
            Aff4Object::Segment(_) => ObjectKind::Segment,
            Aff4Object::Image(_) => ObjectKind::Image,
            Aff4Object::Map(_) => ObjectKind::Map,
        }
    }

    pub fn base(&self) -> &ObjectBase {
        match self {
            Aff4Object::File(o) => o.base(),
            Aff4Object::Volume(o) => o.base(),
            Aff4Object::Segment(o) => o.base(),
            Aff4Object::Image(o) => o.base(),
            Aff4Object::Map(o) => o.base(),
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut ObjectBase {
        match self {
            Aff4Object::File(o) => o.base_mut(),
            Aff4Object::Volume(o) => o.base_mut(),
            Aff4Object::Segment(o) => o.base_mut(),
            Aff4Object::Image(o) => o.base_mut(),
            Aff4Object::Map(o) => o.base_mut(),
        }
    }

    pub fn urn(&self) -> &Urn {
        self.base().urn()
    }

    pub fn mode(&self) -> Mode {
        self.base().mode()
    }

    pub fn is_closed(&self) -> bool {
        self.base().is_closed()
    }

    /// Whether the object may be parked in the resolver's cache
    ///
    /// A member being written owns the backing file's write lease and must
    /// be finished, not parked.
    pub(crate) fn is_cacheable(&self) -> bool {
        !matches!(self, Aff4Object::Segment(s) if s.is_writing())
    }

    pub fn close(mut self) -> Result<()> {
        match &mut self {
            Aff4Object::File(o) => o.close(),
            Aff4Object::Volume(o) => o.close(),
            Aff4Object::Segment(o) => o.close(),
            Aff4Object::Image(o) => o.close(),
            Aff4Object::Map(o) => o.close(),
        }
    }

    /// The object's stream interface, if it has one
    pub fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        match self {
            Aff4Object::File(o) => Some(o),
            Aff4Object::Segment(o) => Some(o),
            Aff4Object::Image(o) => Some(o),
            Aff4Object::Map(o) => Some(o),
            Aff4Object::Volume(_) => None,
        }
    }

    pub fn stream(&mut self) -> Result<&mut dyn Stream> {
        let urn = self.urn().clone();
        self.as_stream().ok_or_else(|| Aff4Error::TypeMismatch {
            expected: "stream".into(),
            found: format!("volume {}", urn),
        })
    }

    pub fn as_file(&mut self) -> Result<&mut FileBackedObject> {
        match self {
            Aff4Object::File(o) => Ok(o),
            other => Err(other.mismatch("file")),
        }
    }

    pub fn as_volume(&mut self) -> Result<&mut ZipVolume> {
        match self {
            Aff4Object::Volume(o) => Ok(o),
            other => Err(other.mismatch(vocab::AFF4_ZIP_VOLUME)),
        }
    }

    pub fn as_segment(&mut self) -> Result<&mut ZipSegment> {
        match self {
            Aff4Object::Segment(o) => Ok(o),
            other => Err(other.mismatch(vocab::AFF4_SEGMENT)),
        }
    }

    pub fn as_image(&mut self) -> Result<&mut ImageStream> {
        match self {
            Aff4Object::Image(o) => Ok(o),
            other => Err(other.mismatch(vocab::AFF4_IMAGE)),
        }
    }

    pub fn as_map(&mut self) -> Result<&mut MapStream> {
        match self {
            Aff4Object::Map(o) => Ok(o),
            other => Err(other.mismatch(vocab::AFF4_MAP)),
        }
    }

    fn mismatch(&self, expected: &str) -> Aff4Error {
        Aff4Error::TypeMismatch {
            expected: expected.to_string(),
            found: format!("{:?} {}", self.kind(), self.urn()),
        }
    }
}

impl fmt::Debug for Aff4Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aff4Object")
            .field("kind", &self.kind())
            .field("urn", self.urn())
            .field("mode", &self.mode())
            .finish()
    }
}

/// Scoped ownership of an object opened through the resolver
///
/// Dropping the guard hands the object back with `cache_return`, so the
/// write lock cannot leak on an early return. [`Checkout::close`] closes
/// the object instead of caching it.
pub struct Checkout {
    resolver: Arc<Resolver>,
    object: Option<Box<Aff4Object>>,
}

impl Checkout {
    pub(crate) fn new(resolver: &Arc<Resolver>, object: Aff4Object) -> Self {
        Checkout {
            resolver: Arc::clone(resolver),
            object: Some(Box::new(object)),
        }
    }

    /// Close the object; the closed object is not returned to the cache
    pub fn close(mut self) -> Result<()> {
        match self.object.take() {
            Some(object) => (*object).close(),
            None => Ok(()),
        }
    }

    /// Take the object out of the guard without returning it
    pub fn into_inner(mut self) -> Aff4Object {
        // `object` is only emptied by consuming methods
        *self.object.take().expect("checkout already consumed")
    }
}

impl Deref for Checkout {
    type Target = Aff4Object;

    fn deref(&self) -> &Aff4Object {
        self.object.as_deref().expect("checkout already consumed")
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut Aff4Object {
        self.object.as_deref_mut().expect("checkout already consumed")
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.resolver.cache_return(*object);
        }
    }
}

impl fmt::Debug for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checkout").field(&self.object).finish()
    }
}
