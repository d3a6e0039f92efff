//! settings

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::time::Duration;

/// Scheduling priority of a stream, in `[MIN_PRIORITY, MAX_PRIORITY]`.
pub type Priority = u8;

pub const MIN_PRIORITY: Priority = 0;
pub const MAX_PRIORITY: Priority = 100;
pub const DEFAULT_PRIORITY: Priority = 50;

bitflags! {
    /// Scheduling discipline of a device. Exactly one flag must be set when
    /// the device is created; the discipline is fixed for the device lifetime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedulerFlags: u32 {
        /// One synchronous transfer at a time, performed on the worker thread
        const BLOCKING = 0x01;
        /// Up to `max_concurrent_io` transfers in flight, lined up in file
        /// order across eligible streams
        const DEFERRED_LINED_UP = 0x02;
    }
}

bitflags! {
    /// Block-allocation attributes of the device buffer pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolAttributes: u32 {
        /// Granules are equal sized and may be released independently
        const FIXED_SIZED_BLOCKS = 0x01;
    }
}

/// Advisory scheduling class for the device worker thread. Portable targets
/// honor the name and stack size; the class itself is a hint for hosts that
/// pin or boost their I/O threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    Normal,
    AboveNormal,
    TimeCritical,
}

/// Properties applied to the worker thread of a device.
#[derive(Debug, Clone)]
pub struct ThreadProperties {
    /// Stack size in bytes, or the platform default when `None`
    pub stack_size: Option<usize>,
    /// Scheduling class hint. The device I/O thread defaults above normal
    pub priority: ThreadPriority,
}

impl Default for ThreadProperties {
    fn default() -> Self {
        Self {
            stack_size: None,
            priority: ThreadPriority::AboveNormal,
        }
    }
}

/// Settings consumed once by [`crate::mgr::StreamMgr::new`].
#[derive(Debug, Clone, Default)]
pub struct StreamMgrSettings {}

/// Settings consumed once per device by [`crate::mgr::StreamMgr::create_device`].
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Total size of the device I/O buffer pool, in bytes
    pub io_memory_size: u32,
    /// Alignment of the pool region. Must be a power of two
    pub io_memory_alignment: u32,
    /// Block-allocation attributes of the pool
    pub pool_attributes: PoolAttributes,
    /// Transfer size unit. Ties the pool granule size and on-disk alignment
    pub granularity: u32,
    /// Scheduling discipline. Exactly one flag must be set
    pub scheduler_flags: SchedulerFlags,
    /// Worker thread properties
    pub thread: ThreadProperties,
    /// Seconds of prefetch an automatic stream aims to keep buffered
    pub target_auto_stm_buffer_length: f32,
    /// How long the worker sleeps when it has nothing to schedule
    pub idle_wait_time: Duration,
    /// Concurrent outstanding transfers (deferred discipline only)
    pub max_concurrent_io: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            io_memory_size: 2 * 1024 * 1024,
            io_memory_alignment: 4096,
            pool_attributes: PoolAttributes::FIXED_SIZED_BLOCKS,
            granularity: 16 * 1024,
            scheduler_flags: SchedulerFlags::BLOCKING,
            thread: ThreadProperties::default(),
            target_auto_stm_buffer_length: 0.38,
            idle_wait_time: Duration::from_millis(100),
            max_concurrent_io: 8,
        }
    }
}

impl DeviceSettings {
    /// Reject settings a device cannot be built from. Invalid inputs are
    /// rejected synchronously without side effects.
    pub fn validate(&self) -> Result<()> {
        if self.granularity == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.io_memory_size < self.granularity {
            return Err(Error::InvalidParameter);
        }
        if self.io_memory_alignment == 0 || !self.io_memory_alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let scheduler = self.scheduler_flags
            & (SchedulerFlags::BLOCKING | SchedulerFlags::DEFERRED_LINED_UP);
        if scheduler.bits().count_ones() != 1 {
            return Err(Error::InvalidParameter);
        }
        if scheduler == SchedulerFlags::DEFERRED_LINED_UP && self.max_concurrent_io == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Number of granules the pool will be carved into.
    pub(crate) fn granule_count(&self) -> usize {
        (self.io_memory_size / self.granularity) as usize
    }
}

/// Heuristics steering the prefetch of an automatic stream.
#[derive(Debug, Clone, Copy)]
pub struct Heuristics {
    /// Average consumption rate, in bytes per second
    pub throughput: f32,
    /// Loop start position, in bytes. Ignored unless `loop_end > loop_start`
    pub loop_start: u32,
    /// Loop end position, in bytes. Prefetch wraps back to `loop_start` here
    pub loop_end: u32,
    /// Floor on the number of granules kept buffered ahead of the consumer
    pub min_num_buffers: u16,
    /// Nominal priority in `[MIN_PRIORITY, MAX_PRIORITY]`
    pub priority: Priority,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            throughput: 0.0,
            loop_start: 0,
            loop_end: 0,
            min_num_buffers: 0,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl Heuristics {
    pub fn validate(&self) -> Result<()> {
        if self.throughput < 0.0 || !self.throughput.is_finite() {
            return Err(Error::InvalidParameter);
        }
        if self.priority > MAX_PRIORITY {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub(crate) fn looping(&self) -> bool {
        self.loop_end > self.loop_start
    }
}

/// Per-stream override of the automatic buffering computed from heuristics.
/// Pass `None` at stream creation to use the device defaults (recommended).
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSettings {
    /// Hard override of the total buffering, in bytes. `0` means no override
    pub buffer_size: u32,
    /// Floor on the total buffering, in bytes
    pub min_buffer_size: u32,
    /// Forced transfer block size, in bytes. `0` means use the device value
    pub block_size: u32,
}
