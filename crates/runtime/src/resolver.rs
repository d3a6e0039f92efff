//! resolver
//!
//! Contract between the stream manager and the host supplied file-location
//! resolver. The resolver maps an application name or ID to a device and a
//! backend descriptor; it may open the file on the spot or defer the open to
//! the device hook by clearing the `sync_open` flag.

use crate::{
    error::Result,
    hook::{FileDesc, FileId, OpenMode},
};
use std::fmt;

/// Vendor ID of assets shipped with the engine runtime itself.
pub const ENGINE_VENDOR_ID: u32 = 0;

/// Codec ID of sound bank assets.
pub const BANK_CODEC_ID: u32 = 1;

/// What the application asked to open: a name (title, path, or code) or an
/// application defined file ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    Name(String),
    Id(FileId),
}

impl From<&str> for FileTarget {
    fn from(value: &str) -> Self {
        Self::Name(value.to_owned())
    }
}

impl From<String> for FileTarget {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<FileId> for FileTarget {
    fn from(value: FileId) -> Self {
        Self::Id(value)
    }
}

impl fmt::Display for FileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// File system flags passed through to the resolver. The engine stamps
/// `is_automatic_stream` before every resolver call; the rest is between the
/// application and its resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSystemFlags {
    /// Vendor that defined `codec_id`
    pub vendor_id: u32,
    /// Codec of the file content
    pub codec_id: u32,
    /// Resolver private parameter
    pub custom_param: u32,
    /// The file lives in a per-language directory
    pub is_language_specific: bool,
    /// Set by the engine: the stream being created is automatic
    pub is_automatic_stream: bool,
}

impl FileSystemFlags {
    pub fn new(vendor_id: u32, codec_id: u32) -> Self {
        Self {
            vendor_id,
            codec_id,
            custom_param: 0,
            is_language_specific: false,
            is_automatic_stream: false,
        }
    }

    /// A language-specific bank asset. Not finding one is an expected part of
    /// language fallback, so the manager does not monitor-log that case.
    pub(crate) fn is_language_bank(&self) -> bool {
        self.vendor_id == ENGINE_VENDOR_ID
            && self.codec_id == BANK_CODEC_ID
            && self.is_language_specific
    }
}

/// Host supplied file-location resolver. Consulted on every stream creation.
///
/// On success `FileDesc::device_id` selects the device and the remaining
/// fields are backend-opaque. If the implementation clears `sync_open` from
/// `true`, the descriptor is not yet open and the engine will open it through
/// the device hook at first dispatch; if it leaves `sync_open` set, the
/// descriptor must be fully open on return.
pub trait FileLocationResolver: Send + Sync {
    fn open(
        &self,
        target: &FileTarget,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        sync_open: &mut bool,
    ) -> Result<FileDesc>;
}
