//! hook
//!
//! Contract between a device and its low-level I/O backend. The hook is the
//! only party that performs actual I/O; the engine schedules transfers and
//! owns their buffers, then hands granule-sized requests down through this
//! trait.

use crate::{
    error::Result,
    resolver::{FileSystemFlags, FileTarget},
};
use std::{any::Any, fmt};

/// Application defined file ID, resolved to a location by the host resolver.
pub type FileId = u32;

/// Identifies a device within the stream manager. Assigned as an index into
/// the manager device table and stable for the device lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Open mode of a stream. Automatic streams always open for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Backend descriptor of an open (or about to be opened) file. Produced by
/// the resolver or by [`IoHook::open`]; every field but `device_id` is
/// opaque to the stream manager.
pub struct FileDesc {
    /// Device the resolver routed this file to
    pub device_id: DeviceId,
    /// Total file size in bytes, as known at open time
    pub file_size: u64,
    /// Base offset applied by the backend (e.g. a file packaged in an archive)
    pub sector_offset: u64,
    /// Addressing unit of the backend. `0` or `1` means the descriptor
    /// accepts arbitrary offsets; anything larger means transfers must start
    /// on granule-aligned positions
    pub block_size: u32,
    /// Backend private handle, carried untouched between hook calls
    pub handle: Option<Box<dyn Any + Send + Sync>>,
}

impl FileDesc {
    /// A descriptor routed to `device_id` with everything else unset. The
    /// backend fills the rest on open.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            file_size: 0,
            sector_offset: 0,
            block_size: 0,
            handle: None,
        }
    }
}

impl fmt::Debug for FileDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDesc")
            .field("device_id", &self.device_id)
            .field("file_size", &self.file_size)
            .field("sector_offset", &self.sector_offset)
            .field("block_size", &self.block_size)
            .field("handle", &self.handle.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Everything needed to open a file later. Captured when the resolver defers
/// the open; the target and flags are owned copies, so the caller arguments
/// may be dropped as soon as stream creation returns.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub target: FileTarget,
    pub flags: Option<FileSystemFlags>,
    pub open_mode: OpenMode,
}

/// Low-level I/O hook, one per device.
///
/// `read` and `write` are synchronous granule transfers; a deferred device
/// calls them from several transfer threads at once, one outstanding call per
/// descriptor, so implementations only need interior mutability for state
/// shared across files.
#[cfg_attr(test, mockall::automock)]
pub trait IoHook: Send + Sync {
    /// Open a file from a deferred-open record.
    fn open(&self, record: &OpenRecord) -> Result<FileDesc>;

    /// Close a descriptor. Called exactly once per opened descriptor.
    fn close(&self, desc: FileDesc) -> Result<()>;

    /// Read up to `dst.len()` bytes at `offset`. Returns the byte count;
    /// fewer than requested means end of file.
    fn read(&self, desc: &mut FileDesc, offset: u64, dst: &mut [u8]) -> Result<usize>;

    /// Write `src` at `offset`. A short write is a backend failure.
    fn write(&self, desc: &mut FileDesc, offset: u64, src: &[u8]) -> Result<usize>;

    /// Addressing unit of the descriptor.
    fn block_size(&self, desc: &FileDesc) -> u32 {
        desc.block_size.max(1)
    }
}
