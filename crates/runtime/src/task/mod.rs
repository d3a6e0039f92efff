//! task
//!
//! The stream task is the unit of scheduling: per-stream status, descriptor,
//! position and buffers, shared between a consumer-facing stream handle and
//! the device worker. Client threads enqueue intent under the task lock and
//! wake the worker; the worker drives I/O and signals completion through the
//! per-task condvar. Two variants exist: standard (explicit operations) and
//! automatic (heuristic prefetch).

pub(crate) mod auto;
pub(crate) mod standard;

pub use auto::{AutoStream, Fetch, StreamBuffer};
pub use standard::{SeekOrigin, StdStream};

use crate::{
    device::DeviceShared,
    error::Error,
    hook::{DeviceId, FileDesc, OpenMode, OpenRecord},
    pool::Granule,
    resolver::FileTarget,
    settings::{BufferSettings, Heuristics, Priority},
};
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};
use tracing::debug;

/// Consumer visible status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// No operation posted, or the automatic stream is stopped
    Idle,
    /// An operation or prefetch is in progress
    Pending,
    /// The posted operation completed (standard) or the end of file was
    /// reached (automatic)
    Completed,
    /// The last operation was cancelled
    Cancelled,
    /// The task failed; see [`StdStream::error`] / [`AutoStream::error`]
    Error,
}

/// Read-only description of a stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Device the stream lives on
    pub device_id: DeviceId,
    /// What was asked to be opened
    pub target: FileTarget,
    /// Total file size in bytes (0 until the descriptor is open)
    pub file_size: u64,
    /// Open mode
    pub open_mode: OpenMode,
    /// Whether this is an automatic stream
    pub is_automatic: bool,
    /// Engine assigned stream ID, for profiling
    pub stream_id: u32,
}

/// Internal task status. Richer than [`StreamStatus`]: the worker
/// distinguishes queued work from an in-flight transfer, and destruction is
/// a status of its own so a dead task stops scheduling I/O at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    Idle,
    Pending,
    Running,
    Completed,
    Cancelled,
    Errored,
    Destroyed,
}

impl TaskStatus {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored | Self::Destroyed)
    }
}

/// Direction of a standard stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
}

/// One explicit operation of a standard stream. The staging buffer is owned
/// by the task so a polled caller can drop out at any point.
pub(crate) struct StdOp {
    pub kind: OpKind,
    /// Read destination (filled chunk by chunk) or write source
    pub buf: BytesMut,
    /// Total bytes this operation moves
    pub requested: usize,
    /// Bytes moved so far
    pub transferred: usize,
    /// File position the operation started at
    pub base_offset: u64,
    /// Caller supplied scheduling priority
    pub priority: Priority,
}

impl StdOp {
    pub(crate) fn remaining(&self) -> usize {
        self.requested - self.transferred
    }
}

/// Standard task context.
pub(crate) struct StdCtx {
    pub op: Option<StdOp>,
    /// Data of the last completed read, until the consumer takes it
    pub data: Option<Bytes>,
    /// Bytes moved by the last completed operation
    pub last_transferred: usize,
    /// Bumped on every post and cancel; in-flight transfers carrying an
    /// older tag retire as stale
    pub op_seq: u64,
}

/// A prefetched granule waiting in the ready ring, tagged with the file
/// offset it was read from so the client position survives loop wraps.
pub(crate) struct Staged {
    pub granule: Granule,
    pub offset: u64,
}

/// Automatic task context.
pub(crate) struct AutoCtx {
    pub heuristics: Heuristics,
    pub buf_settings: Option<BufferSettings>,
    /// Floor applied by `set_min_target_buffer_size`, in bytes
    pub min_target_override: u32,
    pub started: bool,
    /// Prefetched granules staged ahead of the consumer, oldest first
    pub ready: VecDeque<Staged>,
    /// Buffers currently granted to the consumer
    pub granted: usize,
    /// File offset the next prefetch transfer starts at
    pub next_fetch: u64,
    /// End of file reached and no loop to wrap into
    pub reached_end: bool,
    /// Bumped on every reposition; in-flight transfers carrying an older
    /// tag retire as stale
    pub fetch_seq: u64,
}

impl AutoCtx {
    /// Bytes staged ahead of the consumer right now.
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.ready.iter().map(|staged| staged.granule.len()).sum()
    }

    /// Prefetch budget in bytes: heuristic target clamped by the per-stream
    /// overrides and floored to at least one granule, in whole granules.
    pub(crate) fn target_bytes(&self, granularity: usize, target_secs: f32) -> usize {
        let mut target = (self.heuristics.throughput as f64 * target_secs as f64) as usize;
        if let Some(settings) = &self.buf_settings {
            if settings.buffer_size > 0 {
                target = settings.buffer_size as usize;
            } else {
                target = target.max(settings.min_buffer_size as usize);
            }
        }
        target = target.max(self.min_target_override as usize);
        let granules = target
            .div_ceil(granularity)
            .max(self.heuristics.min_num_buffers as usize)
            .max(1);
        granules * granularity
    }

    /// Below this level the scheduler treats the stream as starving and
    /// elevates it to the maximum priority.
    pub(crate) fn starvation_threshold(&self, granularity: usize, target_secs: f32) -> usize {
        (self.target_bytes(granularity, target_secs) / 4).max(granularity)
    }
}

/// Task variant payload.
pub(crate) enum TaskKind {
    Std(StdCtx),
    Auto(AutoCtx),
}

/// Mutable task state, guarded by [`StmTask::state`].
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub error: Option<Error>,
    /// Client visible file position
    pub position: u64,
    /// Snapshot of the descriptor size, 0 until open
    pub file_size: u64,
    /// Addressing unit of the descriptor, 0/1 when offsets are free
    pub block_size: u32,
    pub file_open: bool,
    /// A transfer for this task is currently dispatched
    pub in_flight: bool,
    pub kind: TaskKind,
}

/// Descriptor side of the task, held only across hook calls so status
/// queries never wait behind blocking I/O.
pub(crate) struct TaskIo {
    pub desc: Option<FileDesc>,
    pub deferred: Option<OpenRecord>,
}

/// The polymorphic unit of scheduling. Belongs to exactly one device for its
/// whole lifetime.
pub(crate) struct StmTask {
    pub(crate) device: Weak<DeviceShared>,
    pub(crate) device_id: DeviceId,
    /// Creation order; the scheduler breaks priority ties oldest first
    pub(crate) seq: u64,
    pub(crate) stream_id: u32,
    pub(crate) target: FileTarget,
    pub(crate) open_mode: OpenMode,
    pub(crate) state: Mutex<TaskState>,
    /// Signaled on every status edge and every retired transfer
    pub(crate) done: Condvar,
    pub(crate) io: Mutex<TaskIo>,
}

impl StmTask {
    pub(crate) fn new(
        device: &Arc<DeviceShared>,
        seq: u64,
        stream_id: u32,
        target: FileTarget,
        open_mode: OpenMode,
        kind: TaskKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::downgrade(device),
            device_id: device.id,
            seq,
            stream_id,
            target,
            open_mode,
            state: Mutex::new(TaskState {
                status: TaskStatus::Idle,
                error: None,
                position: 0,
                file_size: 0,
                block_size: 0,
                file_open: false,
                in_flight: false,
                kind,
            }),
            done: Condvar::new(),
            io: Mutex::new(TaskIo {
                desc: None,
                deferred: None,
            }),
        })
    }

    /// Confirm the descriptor was opened synchronously by the resolver.
    pub(crate) fn set_file_open(&self, desc: FileDesc) {
        let mut state = self.state.lock();
        state.file_size = desc.file_size;
        state.block_size = desc.block_size;
        state.file_open = true;
        drop(state);
        self.io.lock().desc = Some(desc);
    }

    /// Attach a deferred-open record; the worker opens the descriptor on
    /// first dispatch.
    pub(crate) fn set_deferred_open(&self, record: OpenRecord) {
        self.io.lock().deferred = Some(record);
    }

    /// Mark the task for destruction. Reclamation (buffers, descriptor,
    /// table slot) happens on the next worker tick. Idempotent.
    pub(crate) fn kill(&self) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Destroyed {
            return;
        }
        debug!(stream = self.stream_id, "stream marked for destruction");
        state.status = TaskStatus::Destroyed;
        drop(state);
        self.done.notify_all();
        self.wake_device();
    }

    /// Nudge the device worker.
    pub(crate) fn wake_device(&self) {
        if let Some(device) = self.device.upgrade() {
            device.wake();
        }
    }

    /// Hand a consumer-released granule back to the device pool. Falls back
    /// to dropping the granule when the device is already gone (the region
    /// keeps the memory alive until then).
    pub(crate) fn release_granule(&self, granule: Granule) {
        if let TaskKind::Auto(auto) = &mut self.state.lock().kind {
            debug_assert!(auto.granted > 0);
            auto.granted = auto.granted.saturating_sub(1);
        }
        if let Some(device) = self.device.upgrade() {
            device.pool.lock().release(granule);
            device.wake();
        }
    }

    pub(crate) fn status(&self) -> StreamStatus {
        let state = self.state.lock();
        self.status_locked(&state)
    }

    /// Status mapping for a caller that already holds the state lock.
    pub(crate) fn status_locked(&self, state: &TaskState) -> StreamStatus {
        match state.status {
            TaskStatus::Idle => StreamStatus::Idle,
            TaskStatus::Pending | TaskStatus::Running => StreamStatus::Pending,
            TaskStatus::Completed => StreamStatus::Completed,
            TaskStatus::Cancelled | TaskStatus::Destroyed => StreamStatus::Cancelled,
            TaskStatus::Errored => StreamStatus::Error,
        }
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.state.lock().error
    }

    pub(crate) fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            device_id: self.device_id,
            target: self.target.clone(),
            file_size: state.file_size,
            open_mode: self.open_mode,
            is_automatic: matches!(state.kind, TaskKind::Auto(_)),
            stream_id: self.stream_id,
        }
    }
}
