//! standard
//!
//! Explicit request-driven streams: one read or write operation at a time,
//! blocking or polled at the caller's choice per operation.

use crate::{
    error::{Error, Result},
    hook::OpenMode,
    settings::Priority,
    task::{OpKind, StdOp, StmTask, StreamInfo, StreamStatus, TaskKind, TaskStatus},
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

/// Origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Handle to a standard stream. Dropping the handle destroys the stream;
/// reclamation is completed asynchronously by the device worker.
pub struct StdStream {
    pub(crate) task: Arc<StmTask>,
}

impl StdStream {
    /// Read up to `buf.len()` bytes at the current position, blocking until
    /// the operation completes. Returns the byte count; fewer than requested
    /// means end of file.
    pub fn read(&self, buf: &mut [u8], priority: Priority) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.post(OpKind::Read, BytesMut::with_capacity(buf.len()), buf.len(), priority)?;
        let data = self.wait()?;
        let count = data.len().min(buf.len());
        buf[..count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    /// Post a read of `size` bytes and return immediately. Completion is
    /// observed through [`status`](Self::status); the data is then collected
    /// with [`take_data`](Self::take_data).
    pub fn read_async(&self, size: u32, priority: Priority) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        let size = size as usize;
        self.post(OpKind::Read, BytesMut::with_capacity(size), size, priority)
    }

    /// Take the data of a completed asynchronous read. Returns `None` while
    /// the operation is still pending or after the data was already taken.
    pub fn take_data(&self) -> Option<Bytes> {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        if state.status != TaskStatus::Completed {
            return None;
        }
        let ctx = match &mut state.kind {
            TaskKind::Std(ctx) => ctx,
            TaskKind::Auto(_) => unreachable!("standard handle on automatic task"),
        };
        let data = ctx.data.take();
        if data.is_some() {
            state.status = TaskStatus::Idle;
        }
        data
    }

    /// Write `data` at the current position, blocking until done. Transfers
    /// are granular; the final chunk may be short.
    pub fn write(&self, data: &[u8], priority: Priority) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.post(OpKind::Write, BytesMut::from(data), data.len(), priority)?;
        self.wait()?;
        let state = self.task.state.lock();
        match &state.kind {
            TaskKind::Std(ctx) => Ok(ctx.last_transferred),
            TaskKind::Auto(_) => unreachable!("standard handle on automatic task"),
        }
    }

    /// Post a write and return immediately; poll [`status`](Self::status).
    pub fn write_async(&self, data: Bytes, priority: Priority) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let requested = data.len();
        self.post(OpKind::Write, BytesMut::from(&data[..]), requested, priority)
    }

    /// Move the stream position. Fails while an operation is pending. The
    /// position snaps down to a granule boundary when the descriptor does
    /// not accept arbitrary offsets.
    pub fn seek(&self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let mut state = self.task.state.lock();
        match state.status {
            TaskStatus::Destroyed => return Err(Error::Cancelled),
            TaskStatus::Pending | TaskStatus::Running => return Err(Error::Fail),
            _ => {}
        }
        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => state.position as i64,
            SeekOrigin::End => state.file_size as i64,
        };
        let target = base.checked_add(offset).ok_or(Error::InvalidParameter)?;
        if target < 0 {
            return Err(Error::InvalidParameter);
        }
        let mut target = target as u64;
        if state.block_size > 1 {
            let granularity = self
                .task
                .device
                .upgrade()
                .map(|device| device.settings.granularity as u64)
                .ok_or(Error::Cancelled)?;
            target -= target % granularity;
        }
        state.position = target;
        Ok(target)
    }

    /// Abandon the pending operation, if any. Any in-flight transfer is
    /// discarded when it lands; the stream reports [`StreamStatus::Cancelled`]
    /// until a new operation is posted.
    pub fn cancel(&self) {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        if !matches!(state.status, TaskStatus::Pending | TaskStatus::Running) {
            return;
        }
        if let TaskKind::Std(ctx) = &mut state.kind {
            ctx.op = None;
            ctx.data = None;
            ctx.op_seq += 1;
        }
        state.status = TaskStatus::Cancelled;
        drop(guard);
        debug!(stream = self.task.stream_id, "operation cancelled");
        self.task.done.notify_all();
    }

    pub fn status(&self) -> StreamStatus {
        self.task.status()
    }

    /// Error code of a failed task, once `status()` reports
    /// [`StreamStatus::Error`].
    pub fn error(&self) -> Option<Error> {
        self.task.error()
    }

    pub fn info(&self) -> StreamInfo {
        self.task.info()
    }

    /// Current stream position.
    pub fn position(&self) -> u64 {
        self.task.state.lock().position
    }

    /// Mark the stream for destruction and return. The worker releases the
    /// buffers and closes the descriptor asynchronously. Idempotent.
    pub fn destroy(&self) {
        self.task.kill();
    }

    /// Queue one operation. Exactly one operation may be outstanding.
    fn post(&self, kind: OpKind, buf: BytesMut, requested: usize, priority: Priority) -> Result<()> {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        match state.status {
            TaskStatus::Destroyed => return Err(Error::Cancelled),
            TaskStatus::Errored => return Err(state.error.unwrap_or(Error::Fail)),
            TaskStatus::Pending | TaskStatus::Running => return Err(Error::Fail),
            _ => {}
        }
        match (kind, self.task.open_mode) {
            (OpKind::Read, OpenMode::Write) => return Err(Error::InvalidParameter),
            (OpKind::Write, OpenMode::Read) => return Err(Error::InvalidParameter),
            _ => {}
        }
        let base_offset = state.position;
        let ctx = match &mut state.kind {
            TaskKind::Std(ctx) => ctx,
            TaskKind::Auto(_) => unreachable!("standard handle on automatic task"),
        };
        ctx.op = Some(StdOp {
            kind,
            buf,
            requested,
            transferred: 0,
            base_offset,
            priority,
        });
        ctx.data = None;
        ctx.op_seq += 1;
        state.status = TaskStatus::Pending;
        drop(guard);
        self.task.wake_device();
        Ok(())
    }

    /// Block until the posted operation reaches a terminal status.
    fn wait(&self) -> Result<Bytes> {
        let mut state = self.task.state.lock();
        loop {
            match state.status {
                TaskStatus::Pending | TaskStatus::Running => self.task.done.wait(&mut state),
                TaskStatus::Completed => {
                    let ctx = match &mut state.kind {
                        TaskKind::Std(ctx) => ctx,
                        TaskKind::Auto(_) => unreachable!("standard handle on automatic task"),
                    };
                    return Ok(ctx.data.take().unwrap_or_else(Bytes::new));
                }
                TaskStatus::Cancelled | TaskStatus::Destroyed => return Err(Error::Cancelled),
                TaskStatus::Errored => return Err(state.error.unwrap_or(Error::Fail)),
                TaskStatus::Idle => return Err(Error::Fail),
            }
        }
    }
}

impl Drop for StdStream {
    fn drop(&mut self) {
        self.task.kill();
    }
}
