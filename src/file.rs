//! Physical file streams (`file://` URNs)

use crate::error::{Aff4Error, Result, ResultExt};
use crate::object::{Mode, ObjectBase, SeekState, Stream};
use crate::resolver::Resolver;
use crate::urn::Urn;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A local file seen through the stream interface
///
/// Every read and write is positioned explicitly, so several instances of
/// the same file (one per cached reader) never disturb each other.
#[derive(Debug)]
pub struct FileBackedObject {
    base: ObjectBase,
    file: File,
    path: PathBuf,
    seek: SeekState,
}

impl FileBackedObject {
    /// Open the file named by a `file://` URN
    ///
    /// Write mode creates the file if needed but never truncates it.
    pub fn open(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self> {
        let path = urn.to_path().ok_or_else(|| {
            Aff4Error::InvalidParameter(format!("{} is not a file URN", urn))
        })?;

        let file = match mode {
            Mode::Read => File::open(&path),
            Mode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path),
        }
        .with_context(|| format!("opening {}", path.display()))?;

        debug!("Opened {} ({:?})", path.display(), mode);
        Ok(FileBackedObject {
            base: ObjectBase::new(resolver, urn.clone(), mode),
            file,
            path,
            seek: SeekState::default(),
        })
    }

    pub fn base(&self) -> &ObjectBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut or extend the file to `len` bytes
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.base.ensure_writable()?;
        self.file.set_len(len)?;
        if self.seek.position() > len {
            self.seek.set(len);
        }
        Ok(())
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Stream for FileBackedObject {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.base.ensure_open()?;
        self.file.seek(SeekFrom::Start(self.seek.position()))?;
        let n = self.file.read(buf)?;
        self.seek.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.base.ensure_writable()?;
        self.file.seek(SeekFrom::Start(self.seek.position()))?;
        self.file.write_all(buf)?;
        self.seek.advance(buf.len());
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.size();
        self.seek.seek(pos, size)
    }

    fn tell(&self) -> u64 {
        self.seek.position()
    }

    /// Current length on disk; other handles may have grown the file
    fn size(&self) -> u64 {
        self.file
            .metadata()
            .map(|m| m.len())
            .unwrap_or_else(|_| self.seek.position())
    }

    fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        if self.base.mode() == Mode::Write {
            self.file.flush()?;
        }
        debug!("Closed {}", self.path.display());
        self.base.mark_closed();
        Ok(())
    }
}
