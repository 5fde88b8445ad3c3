//! Map streams
//!
//! A map is a virtual stream assembled from ranges of other streams. Each
//! point says "from this logical offset on, read target T at offset O";
//! a point holds until the next one takes over.
//!
//! With an image period the points describe one window of `image_period`
//! logical bytes and the window repeats: window `n` reads its targets
//! `n * target_period` bytes further on. Striped sources (RAID members,
//! interleaved dumps) are described this way with a handful of points.
//!
//! A range never crosses a point, a window boundary or the end of the map.

use crate::error::{Aff4Error, Result, ResultExt};
use crate::object::{Mode, ObjectBase, SeekState, Stream};
use crate::resolver::Resolver;
use crate::urn::Urn;
use crate::value::Value;
use crate::vocab;
use crate::zip::ZipCompression;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Member name under the map URN holding its points
const POINTS_MEMBER: &str = "map";

/// Where a range of a map comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapTarget {
    /// Bytes of another stream
    Stream(Urn),
    /// Explicit zero fill (`aff4:Zero`)
    Zero,
    /// Data that was never acquired (`aff4:UnknownData`); reads as zeros
    Null,
}

impl MapTarget {
    pub fn from_urn(urn: &Urn) -> Self {
        match urn.as_str() {
            vocab::AFF4_ZERO_TARGET => MapTarget::Zero,
            vocab::AFF4_NULL_TARGET => MapTarget::Null,
            _ => MapTarget::Stream(urn.clone()),
        }
    }

    pub fn to_urn(&self) -> Urn {
        match self {
            MapTarget::Stream(urn) => urn.clone(),
            MapTarget::Zero => Urn::new(vocab::AFF4_ZERO_TARGET),
            MapTarget::Null => Urn::new(vocab::AFF4_NULL_TARGET),
        }
    }
}

/// A contiguous run of a map served by a single target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRange {
    pub target: MapTarget,
    pub target_offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MapPoint {
    target_offset: u64,
    target: MapTarget,
}

#[derive(Debug)]
pub struct MapStream {
    base: ObjectBase,
    seek: SeekState,
    volume: Urn,
    points: BTreeMap<u64, MapPoint>,
    image_period: Option<u64>,
    target_period: Option<u64>,
    size: u64,
}

impl MapStream {
    /// Start an empty map stored in `volume`
    pub fn create(resolver: &Arc<Resolver>, urn: Urn, volume: &Urn) -> Result<Self> {
        let base = ObjectBase::new_leased(resolver, urn.clone())?;
        resolver.del(&urn, None)?;
        resolver.set_value(&urn, vocab::AFF4_TYPE, Urn::new(vocab::AFF4_MAP))?;
        resolver.set_value(&urn, vocab::AFF4_STORED, volume)?;
        resolver.set_value(&urn, vocab::AFF4_TIMESTAMP, Utc::now().to_rfc3339())?;

        info!("Created map {} in {}", urn, volume);
        Ok(MapStream {
            base,
            seek: SeekState::default(),
            volume: volume.clone(),
            points: BTreeMap::new(),
            image_period: None,
            target_period: None,
            size: 0,
        })
    }

    pub(crate) fn from_resolver(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self> {
        let volume = resolver
            .resolve_urn(urn, vocab::AFF4_STORED)?
            .ok_or_else(|| Aff4Error::NotFound(format!("map {} has no {}", urn, vocab::AFF4_STORED)))?;
        let size = resolver.resolve_u64(urn, vocab::AFF4_SIZE)?;

        let mut map = MapStream {
            base: ObjectBase::new(resolver, urn.clone(), mode),
            seek: SeekState::default(),
            volume,
            points: BTreeMap::new(),
            image_period: None,
            target_period: None,
            size: 0,
        };

        match mode {
            Mode::Write if size.is_some() => Err(Aff4Error::Unsupported(format!(
                "map {} is finished and cannot be rewritten",
                urn
            ))),
            Mode::Write => Ok(map),
            Mode::Read => {
                map.size = size.ok_or_else(|| {
                    Aff4Error::NotFound(format!("map {} has no {}", urn, vocab::AFF4_SIZE))
                })?;
                map.image_period = resolver.resolve_u64(urn, vocab::AFF4_IMAGE_PERIOD)?;
                map.target_period = resolver.resolve_u64(urn, vocab::AFF4_TARGET_PERIOD)?;
                map.load_points()
                    .with_context(|| format!("loading points of map {}", urn))?;
                debug!("Opened map {} ({} points)", urn, map.points.len());
                Ok(map)
            }
        }
    }

    fn load_points(&mut self) -> Result<()> {
        let member = self.base.urn().join(POINTS_MEMBER);
        let raw = {
            let mut segment = self.base.resolver().checkout(&member, Mode::Read)?;
            let stream = segment.stream()?;
            stream.seek(SeekFrom::Start(0))?;
            stream.read_all()?
        };
        let text = String::from_utf8(raw)
            .map_err(|_| Aff4Error::InvalidArchive(format!("{} is not UTF-8", member)))?;

        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let bad = || Aff4Error::InvalidArchive(format!("{} line {}: {:?}", member, number + 1, line));
            let mut fields = line.splitn(3, ',');
            let logical = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            let target_offset = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            let target = fields.next().filter(|f| !f.is_empty()).ok_or_else(bad)?;
            self.points.insert(
                logical,
                MapPoint {
                    target_offset,
                    target: MapTarget::from_urn(&Urn::new(target)),
                },
            );
        }
        Ok(())
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

    /// Map `logical_offset` onwards to `target` at `target_offset`
    ///
    /// A point at the same logical offset is replaced.
    pub fn add_point(&mut self, logical_offset: u64, target_offset: u64, target: &Urn) -> Result<()> {
        self.base.ensure_writable()?;
        self.points.insert(
            logical_offset,
            MapPoint {
                target_offset,
                target: MapTarget::from_urn(target),
            },
        );
        Ok(())
    }

    pub fn set_size(&mut self, size: u64) -> Result<()> {
        self.base.ensure_writable()?;
        self.size = size;
        Ok(())
    }

    /// Make the points repeat every `image_period` logical bytes
    ///
    /// Each repetition advances the targets by `target_period`, which
    /// defaults to `image_period`.
    pub fn set_period(&mut self, image_period: u64, target_period: Option<u64>) -> Result<()> {
        self.base.ensure_writable()?;
        if image_period == 0 {
            return Err(Aff4Error::InvalidParameter("image_period must be positive".into()));
        }
        if let Some((&last, _)) = self.points.last_key_value() {
            if last >= image_period {
                warn!(
                    "Map {} has a point at {} beyond its period {}",
                    self.base.urn(),
                    last,
                    image_period
                );
            }
        }
        self.image_period = Some(image_period);
        self.target_period = target_period;
        Ok(())
    }

    pub fn image_period(&self) -> Option<u64> {
        self.image_period
    }

    pub fn target_period(&self) -> Option<u64> {
        self.target_period.or(self.image_period)
    }

    /// Points in logical order as `(logical, target_offset, target)`
    pub fn points(&self) -> impl Iterator<Item = (u64, u64, &MapTarget)> {
        self.points
            .iter()
            .map(|(&logical, point)| (logical, point.target_offset, &point.target))
    }

    /// Distinct stream targets in order of first appearance
    pub fn targets(&self) -> Vec<Urn> {
        let mut targets: Vec<Urn> = Vec::new();
        for point in self.points.values() {
            if let MapTarget::Stream(urn) = &point.target {
                if !targets.contains(urn) {
                    targets.push(urn.clone());
                }
            }
        }
        targets
    }

    /// Which target serves `read_ptr`, and for how many bytes
    ///
    /// `None` past the end of the map. Bytes before the first point are
    /// unknown data.
    pub fn get_range(&self, read_ptr: u64) -> Option<MapRange> {
        if read_ptr >= self.size {
            return None;
        }
        let (period, within, window_end) = match self.image_period {
            Some(image_period) => (read_ptr / image_period, read_ptr % image_period, image_period),
            None => (0, read_ptr, u64::MAX),
        };
        let shift = period.saturating_mul(self.target_period().unwrap_or(0));

        let next_point = self
            .points
            .range(within + 1..)
            .next()
            .map_or(u64::MAX, |(&logical, _)| logical);
        let length = (next_point.min(window_end) - within).min(self.size - read_ptr);

        Some(match self.points.range(..=within).next_back() {
            Some((&logical, point)) => MapRange {
                target: point.target.clone(),
                target_offset: point
                    .target_offset
                    .saturating_add(within - logical)
                    .saturating_add(shift),
                length,
            },
            None => MapRange {
                target: MapTarget::Null,
                target_offset: 0,
                length,
            },
        })
    }

    fn finish_write(&mut self) -> Result<()> {
        let resolver = Arc::clone(self.base.resolver());
        let urn = self.base.urn().clone();

        let mut text = String::new();
        for (logical, point) in &self.points {
            text.push_str(&format!(
                "{},{},{}\n",
                logical,
                point.target_offset,
                point.target.to_urn()
            ));
        }
        {
            let mut volume = resolver.checkout(&self.volume, Mode::Read)?;
            volume.as_volume()?.write_member(
                &urn.join(POINTS_MEMBER),
                text.as_bytes(),
                ZipCompression::Deflate,
            )?;
        }

        resolver.set_value(&urn, vocab::AFF4_SIZE, self.size)?;
        if let Some(image_period) = self.image_period {
            resolver.set_value(&urn, vocab::AFF4_IMAGE_PERIOD, image_period)?;
        }
        if let Some(target_period) = self.target_period {
            resolver.set_value(&urn, vocab::AFF4_TARGET_PERIOD, target_period)?;
        }
        resolver.del(&urn, Some(vocab::AFF4_TARGET))?;
        for target in self.targets() {
            resolver.add_value(&urn, vocab::AFF4_TARGET, Value::Urn(target), true)?;
        }

        info!("Finished map {} ({} points, {} bytes)", urn, self.points.len(), self.size);
        Ok(())
    }

    /// Persist the points (write mode) and invalidate the stream
    pub fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        let result = match self.base.mode() {
            Mode::Write => self
                .finish_write()
                .with_context(|| format!("closing map {}", self.base.urn())),
            Mode::Read => Ok(()),
        };
        self.base.mark_closed();
        result
    }
}

impl Stream for MapStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.base.ensure_open()?;
        let position = self.seek.position();
        let mut done = 0;

        while done < buf.len() {
            let range = match self.get_range(position + done as u64) {
                Some(range) => range,
                None => break,
            };
            let want = (range.length.min((buf.len() - done) as u64)) as usize;
            let out = &mut buf[done..done + want];

            let got = match &range.target {
                MapTarget::Stream(target) => {
                    let mut stream = self.base.resolver().checkout(target, Mode::Read)?;
                    let stream = stream.stream()?;
                    stream.seek(SeekFrom::Start(range.target_offset))?;
                    stream.read_fill(out)?
                }
                MapTarget::Zero | MapTarget::Null => {
                    out.fill(0);
                    want
                }
            };
            done += got;
            if got < want {
                warn!(
                    "Map {} target {:?} ended early at {}",
                    self.base.urn(),
                    range.target,
                    range.target_offset + got as u64
                );
                break;
            }
        }

        self.seek.advance(done);
        Ok(done)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        self.base.ensure_open()?;
        Err(Aff4Error::Unsupported(format!(
            "map {} is built from points, not written",
            self.base.urn()
        )))
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
        MapStream::close(self)
    }
}
