//! auto
//!
//! Automatic streams: continuous prefetch governed by throughput and
//! priority heuristics. The device worker stages granules ahead of the
//! consumer; the consumer drains them through [`AutoStream::get_buffer`].

use crate::{
    error::{Error, Result},
    pool::Granule,
    settings::Heuristics,
    task::{standard::SeekOrigin, StmTask, StreamInfo, StreamStatus, TaskKind, TaskStatus},
};
use std::{fmt, ops::Deref, sync::Arc, time::Duration};
use tracing::debug;

/// Longest a waiting [`AutoStream::get_buffer`] call may block before it
/// reports no data ready.
const GET_BUFFER_WAIT_BUDGET: Duration = Duration::from_millis(100);

/// Outcome of [`AutoStream::get_buffer`].
pub enum Fetch {
    /// The next granule of the stream, in file order
    Data(StreamBuffer),
    /// Nothing buffered yet; try again later
    NoDataReady,
    /// The stream played out: end of file reached and the ring is drained
    NoMoreData,
}

impl fmt::Debug for Fetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(buffer) => f.debug_tuple("Data").field(&buffer.len()).finish(),
            Self::NoDataReady => write!(f, "NoDataReady"),
            Self::NoMoreData => write!(f, "NoMoreData"),
        }
    }
}

/// A granule granted to the consumer. Owns the memory until dropped;
/// dropping releases the granule back to the device pool. Release exactly
/// once is therefore guaranteed by move semantics.
pub struct StreamBuffer {
    granule: Option<Granule>,
    task: Arc<StmTask>,
}

impl Deref for StreamBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.granule {
            Some(granule) => granule.filled(),
            None => &[],
        }
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        if let Some(granule) = self.granule.take() {
            self.task.release_granule(granule);
        }
    }
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("len", &self.len())
            .field("stream", &self.task.stream_id)
            .finish()
    }
}

/// Handle to an automatic stream. Dropping the handle destroys the stream;
/// reclamation is completed asynchronously by the device worker.
pub struct AutoStream {
    pub(crate) task: Arc<StmTask>,
}

impl AutoStream {
    /// Begin (or resume) prefetching.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        match state.status {
            TaskStatus::Destroyed => return Err(Error::Cancelled),
            TaskStatus::Errored => return Err(state.error.unwrap_or(Error::Fail)),
            _ => {}
        }
        let auto = match &mut state.kind {
            TaskKind::Auto(auto) => auto,
            TaskKind::Std(_) => unreachable!("automatic handle on standard task"),
        };
        auto.started = true;
        if !auto.reached_end {
            state.status = TaskStatus::Pending;
        }
        drop(guard);
        self.task.wake_device();
        Ok(())
    }

    /// Halt prefetching. Buffered data stays available to
    /// [`get_buffer`](Self::get_buffer).
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        if state.status == TaskStatus::Destroyed {
            return Err(Error::Cancelled);
        }
        let auto = match &mut state.kind {
            TaskKind::Auto(auto) => auto,
            TaskKind::Std(_) => unreachable!("automatic handle on standard task"),
        };
        auto.started = false;
        if !state.status.is_terminal() {
            state.status = TaskStatus::Idle;
        }
        Ok(())
    }

    /// Obtain the next ready granule. With `wait` set the call may block up
    /// to a fixed budget; it never blocks past it.
    pub fn get_buffer(&self, wait: bool) -> Result<Fetch> {
        let deadline = std::time::Instant::now() + GET_BUFFER_WAIT_BUDGET;
        let mut guard = self.task.state.lock();
        loop {
            let state = &mut *guard;
            match state.status {
                TaskStatus::Destroyed => return Err(Error::Cancelled),
                TaskStatus::Errored => return Err(state.error.unwrap_or(Error::Fail)),
                _ => {}
            }
            let auto = match &mut state.kind {
                TaskKind::Auto(auto) => auto,
                TaskKind::Std(_) => unreachable!("automatic handle on standard task"),
            };
            if let Some(staged) = auto.ready.pop_front() {
                auto.granted += 1;
                state.position = staged.offset + staged.granule.len() as u64;
                drop(guard);
                // A ring slot opened up; let the worker top the stream off
                self.task.wake_device();
                return Ok(Fetch::Data(StreamBuffer {
                    granule: Some(staged.granule),
                    task: Arc::clone(&self.task),
                }));
            }
            if auto.reached_end {
                return Ok(Fetch::NoMoreData);
            }
            if !wait || !auto.started {
                return Ok(Fetch::NoDataReady);
            }
            if self.task.done.wait_until(&mut guard, deadline).timed_out() {
                return Ok(Fetch::NoDataReady);
            }
        }
    }

    /// Replace the streaming heuristics. Takes effect on the next
    /// scheduling pass.
    pub fn set_heuristics(&self, heuristics: Heuristics) -> Result<()> {
        heuristics.validate()?;
        let mut state = self.task.state.lock();
        if state.status == TaskStatus::Destroyed {
            return Err(Error::Cancelled);
        }
        match &mut state.kind {
            TaskKind::Auto(auto) => auto.heuristics = heuristics,
            TaskKind::Std(_) => unreachable!("automatic handle on standard task"),
        }
        drop(state);
        self.task.wake_device();
        Ok(())
    }

    /// Floor the prefetch budget at `bytes`, on top of whatever the
    /// heuristics ask for.
    pub fn set_min_target_buffer_size(&self, bytes: u32) {
        let mut state = self.task.state.lock();
        if let TaskKind::Auto(auto) = &mut state.kind {
            auto.min_target_override = bytes;
        }
        drop(state);
        self.task.wake_device();
    }

    /// File position of the next byte [`get_buffer`](Self::get_buffer) will
    /// return.
    pub fn position(&self) -> u64 {
        self.task.state.lock().position
    }

    /// Move the read cursor. Flushes everything prefetched; buffers already
    /// granted stay valid until dropped. The position snaps down to a
    /// granule boundary when the descriptor does not accept arbitrary
    /// offsets.
    pub fn set_position(&self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let mut guard = self.task.state.lock();
        let state = &mut *guard;
        match state.status {
            TaskStatus::Destroyed => return Err(Error::Cancelled),
            TaskStatus::Errored => return Err(state.error.unwrap_or(Error::Fail)),
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
        let auto = match &mut state.kind {
            TaskKind::Auto(auto) => auto,
            TaskKind::Std(_) => unreachable!("automatic handle on standard task"),
        };
        let flushed: Vec<Granule> = auto.ready.drain(..).map(|staged| staged.granule).collect();
        auto.next_fetch = target;
        auto.reached_end = false;
        auto.fetch_seq += 1;
        state.position = target;
        if !state.status.is_terminal() {
            state.status = TaskStatus::Pending;
        }
        drop(guard);
        debug!(stream = self.task.stream_id, position = target, "stream repositioned");
        if let Some(device) = self.task.device.upgrade() {
            let mut pool = device.pool.lock();
            for granule in flushed {
                pool.release(granule);
            }
            drop(pool);
            device.wake();
        }
        Ok(target)
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

    /// Mark the stream for destruction and return. The worker releases the
    /// buffers and closes the descriptor asynchronously. Idempotent.
    pub fn destroy(&self) {
        self.task.kill();
    }
}

impl Drop for AutoStream {
    fn drop(&mut self) {
        self.task.kill();
    }
}
