//! Replacement targets
//!
//! A target is the region a replacement job writes into plus the action
//! that makes the new content authoritative. Two kinds exist:
//!
//! - boot image: A/B slot files; the job writes the slot that is *not*
//!   selected for next boot and commit flips a small pointer file
//! - content store: one raw region, erased then rewritten in place

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::region::{FileRegion, StorageRegion, crc32_prefix};

/// Which region a job replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    BootImage,
    ContentStore,
}

impl TargetKind {
    /// Whether the region is erased before the first write
    pub fn requires_erase(self) -> bool {
        matches!(self, TargetKind::ContentStore)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::BootImage => write!(f, "boot image"),
            TargetKind::ContentStore => write!(f, "content store"),
        }
    }
}

/// Destination of one replacement job
pub trait ReplacementTarget: Send {
    fn kind(&self) -> TargetKind;

    /// Largest payload the target accepts
    fn capacity(&self) -> u64;

    /// Start a write session; must not destroy current content
    fn prepare(&mut self) -> io::Result<()>;

    /// Destroy current content ahead of the first write
    ///
    /// Targets that need no destructive pre-erase keep the default.
    fn erase(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Write one chunk at `offset`
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make the first `length` bytes authoritative after checking they read
    /// back with checksum `crc32`
    fn commit(&mut self, length: u64, crc32: u32) -> io::Result<()>;
}

/// Creates a fresh target per job
pub trait TargetFactory: Send + Sync {
    fn kind(&self) -> TargetKind;

    fn capacity(&self) -> u64;

    /// Build a target; no I/O that alters stored content
    fn create(&self) -> io::Result<Box<dyn ReplacementTarget>>;
}

fn verify_readback(
    region: &dyn StorageRegion,
    length: u64,
    expected: u32,
) -> io::Result<()> {
    let (actual, read) = crc32_prefix(region, length)?;
    if read != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("readback returned {} of {} bytes", read, length),
        ));
    }
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "readback checksum {:08x} does not match written {:08x}",
                actual, expected
            ),
        ));
    }
    Ok(())
}

/// Boot slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }

    fn parse(name: &str) -> Option<Slot> {
        match name {
            "a" => Some(Slot::A),
            "b" => Some(Slot::B),
            _ => None,
        }
    }
}

/// Contents of the "next boot" pointer file
///
/// ```text
/// slot=b
/// length=1048576
/// crc32=1c291ca3
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPointer {
    pub slot: Slot,
    pub length: u64,
    pub crc32: u32,
}

impl BootPointer {
    fn invalid(msg: String) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }

    pub fn parse(text: &str) -> io::Result<Self> {
        let (mut slot, mut length, mut crc32) = (None, None, None);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(Self::invalid(format!("malformed pointer line '{}'", line)));
            };
            match key.trim() {
                "slot" => slot = Slot::parse(value.trim()),
                "length" => length = value.trim().parse().ok(),
                "crc32" => crc32 = u32::from_str_radix(value.trim(), 16).ok(),
                other => debug!("Ignoring unknown boot pointer key '{}'", other),
            }
        }
        match (slot, length, crc32) {
            (Some(slot), Some(length), Some(crc32)) => Ok(Self {
                slot,
                length,
                crc32,
            }),
            _ => Err(Self::invalid("incomplete boot pointer".to_string())),
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "slot={}\nlength={}\ncrc32={:08x}\n",
            self.slot.name(),
            self.length,
            self.crc32
        )
    }

    /// Read the pointer at `path`; `None` if it does not exist yet
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the pointer at `path` in one rename
    pub fn write_atomic(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp)?;
            io::Write::write_all(&mut &file, self.to_text().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

/// Slot currently selected for boot; slot A when no pointer exists
pub fn active_slot(pointer: &Path) -> io::Result<Slot> {
    Ok(BootPointer::read(pointer)?.map_or(Slot::A, |p| p.slot))
}

/// Boot image replacement into the inactive A/B slot
pub struct BootImageTarget {
    slots: [PathBuf; 2],
    pointer: PathBuf,
    capacity: u64,
    session: Option<(Slot, FileRegion)>,
}

impl BootImageTarget {
    pub fn new(slots: [PathBuf; 2], pointer: PathBuf, capacity: u64) -> Self {
        Self {
            slots,
            pointer,
            capacity,
            session: None,
        }
    }

    fn session(&mut self) -> io::Result<&mut (Slot, FileRegion)> {
        self.session
            .as_mut()
            .ok_or_else(|| io::Error::other("boot image write session not started"))
    }
}

impl ReplacementTarget for BootImageTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::BootImage
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn prepare(&mut self) -> io::Result<()> {
        let target = active_slot(&self.pointer)?.other();
        let region = FileRegion::open(&self.slots[target.index()], self.capacity)?;
        info!(
            "Writing boot image to slot {} ({})",
            target.name(),
            region.path().display()
        );
        self.session = Some((target, region));
        Ok(())
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.session()?.1.write_at(offset, data)
    }

    fn commit(&mut self, length: u64, crc32: u32) -> io::Result<()> {
        let pointer_path = self.pointer.clone();
        let (slot, region) = self.session()?;
        region.truncate(length)?;
        region.sync()?;
        verify_readback(&*region, length, crc32)?;

        BootPointer {
            slot: *slot,
            length,
            crc32,
        }
        .write_atomic(&pointer_path)?;
        info!("Next boot: slot {}", slot.name());
        Ok(())
    }
}

/// Content store replacement in place
pub struct ContentStoreTarget {
    region: Box<dyn StorageRegion>,
}

impl ContentStoreTarget {
    pub fn new(region: Box<dyn StorageRegion>) -> Self {
        Self { region }
    }
}

impl ReplacementTarget for ContentStoreTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::ContentStore
    }

    fn capacity(&self) -> u64 {
        self.region.capacity()
    }

    fn prepare(&mut self) -> io::Result<()> {
        // Readers see the old content until the erase; flush it first
        info!("Detaching content store for rewrite");
        self.region.sync()
    }

    fn erase(&mut self) -> io::Result<()> {
        self.region.erase()
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.region.write_at(offset, data)
    }

    fn commit(&mut self, length: u64, crc32: u32) -> io::Result<()> {
        self.region.sync()?;
        verify_readback(self.region.as_ref(), length, crc32)
    }
}

/// File-backed boot image slots
#[derive(Debug, Clone)]
pub struct BootImageFactory {
    pub slots: [PathBuf; 2],
    pub pointer: PathBuf,
    pub capacity: u64,
}

impl TargetFactory for BootImageFactory {
    fn kind(&self) -> TargetKind {
        TargetKind::BootImage
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn create(&self) -> io::Result<Box<dyn ReplacementTarget>> {
        Ok(Box::new(BootImageTarget::new(
            self.slots.clone(),
            self.pointer.clone(),
            self.capacity,
        )))
    }
}

/// File-backed content store
#[derive(Debug, Clone)]
pub struct ContentStoreFactory {
    pub path: PathBuf,
    pub capacity: u64,
}

impl TargetFactory for ContentStoreFactory {
    fn kind(&self) -> TargetKind {
        TargetKind::ContentStore
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn create(&self) -> io::Result<Box<dyn ReplacementTarget>> {
        let region = FileRegion::open(&self.path, self.capacity)?;
        Ok(Box::new(ContentStoreTarget::new(Box::new(region))))
    }
}
