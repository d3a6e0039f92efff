//! rill
//!
//! Asynchronous file streaming for realtime audio runtimes. Consumers open
//! standard streams (explicit reads and writes) or automatic streams
//! (heuristic prefetch) against I/O devices; each device schedules granule
//! transfers on its own worker thread, feeding from a fixed buffer pool,
//! through a pluggable low-level I/O hook.

mod device;
mod pool;

pub mod error;
pub mod fs;
pub mod hook;
pub mod mgr;
pub mod resolver;
pub mod settings;
pub mod task;

#[cfg(feature = "profiling")]
pub mod profile;

pub use error::{Error, Result};
pub use hook::{DeviceId, FileDesc, FileId, IoHook, OpenMode, OpenRecord};
pub use mgr::StreamMgr;
pub use resolver::{FileLocationResolver, FileSystemFlags, FileTarget};
pub use settings::{
    BufferSettings, DeviceSettings, Heuristics, PoolAttributes, Priority, SchedulerFlags,
    StreamMgrSettings, ThreadPriority, ThreadProperties, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};
pub use task::{AutoStream, Fetch, SeekOrigin, StdStream, StreamBuffer, StreamInfo, StreamStatus};

#[cfg(feature = "profiling")]
pub use profile::{DeviceProfile, StreamMgrProfile, StreamProfile};
