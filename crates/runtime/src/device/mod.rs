//! device
//!
//! An I/O device is an independent transport: its own buffer pool, its own
//! task list, and one dedicated worker thread driving transfers according to
//! the discipline fixed at creation. Client threads enqueue intent under
//! short task locks and nudge the worker through a one-slot wake channel;
//! the worker owns all I/O and all reclamation.
//!
//! Lock order: the task table lock may be taken before task state locks;
//! the pool lock may be taken while a state lock is held; the pool lock is
//! never held when taking any other lock.

pub(crate) mod blocking;
pub(crate) mod deferred;

use crate::{
    error::{Error, Result},
    hook::{DeviceId, IoHook, OpenMode},
    mgr::MgrShared,
    pool::{BufferPool, Granule},
    resolver::FileTarget,
    settings::{
        BufferSettings, DeviceSettings, Heuristics, Priority, SchedulerFlags, DEFAULT_PRIORITY,
    },
    task::{AutoCtx, OpKind, Staged, StdCtx, StmTask, TaskKind, TaskState, TaskStatus},
};
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
};
use tracing::{debug, warn};

/// Transfer counters, read by the profiling surface.
#[derive(Default)]
pub(crate) struct DeviceCounters {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub transfers: AtomicU64,
}

/// State shared between the device facade, its tasks, and the worker.
pub(crate) struct DeviceShared {
    pub id: DeviceId,
    pub settings: DeviceSettings,
    pub hook: Arc<dyn IoHook>,
    pub mgr: Weak<MgrShared>,
    pub tasks: Mutex<Vec<Arc<StmTask>>>,
    pub pool: Mutex<BufferPool>,
    pub counters: DeviceCounters,
    pub monitoring: AtomicBool,
    shutdown: AtomicBool,
    wake_tx: Sender<()>,
    next_seq: AtomicU64,
}

impl DeviceShared {
    /// Nudge the worker. The channel holds one slot, so redundant wakes
    /// coalesce.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Streams not yet marked for destruction.
    pub(crate) fn live_stream_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|task| task.state.lock().status != TaskStatus::Destroyed)
            .count()
    }

    pub(crate) fn pool_exhausted(&self) -> bool {
        self.pool.lock().free_count() == 0
    }

    /// Whether a worker tick can still recover granules from dying tasks.
    pub(crate) fn has_reclaimable(&self) -> bool {
        self.tasks.lock().iter().any(|task| {
            let state = task.state.lock();
            state.status == TaskStatus::Destroyed
                && matches!(&state.kind, TaskKind::Auto(auto) if !auto.ready.is_empty())
        })
    }

    /// Release a batch of granules while holding no other lock.
    fn release_all(&self, granules: Vec<Granule>) {
        if granules.is_empty() {
            return;
        }
        let mut pool = self.pool.lock();
        for granule in granules {
            pool.release(granule);
        }
    }

    /// Attach a new standard task to this device.
    pub(crate) fn create_std(
        self: &Arc<Self>,
        stream_id: u32,
        target: FileTarget,
        open_mode: OpenMode,
    ) -> Result<Arc<StmTask>> {
        if self.shutting_down() {
            return Err(Error::Fail);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = StmTask::new(
            self,
            seq,
            stream_id,
            target,
            open_mode,
            TaskKind::Std(StdCtx {
                op: None,
                data: None,
                last_transferred: 0,
                op_seq: 0,
            }),
        );
        self.tasks.lock().push(Arc::clone(&task));
        Ok(task)
    }

    /// Attach a new automatic task to this device.
    pub(crate) fn create_auto(
        self: &Arc<Self>,
        stream_id: u32,
        target: FileTarget,
        heuristics: Heuristics,
        buf_settings: Option<BufferSettings>,
    ) -> Result<Arc<StmTask>> {
        if self.shutting_down() {
            return Err(Error::Fail);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = StmTask::new(
            self,
            seq,
            stream_id,
            target,
            OpenMode::Read,
            TaskKind::Auto(AutoCtx {
                heuristics,
                buf_settings,
                min_target_override: 0,
                started: false,
                ready: VecDeque::new(),
                granted: 0,
                next_fetch: 0,
                reached_end: false,
                fetch_seq: 0,
            }),
        );
        self.tasks.lock().push(Arc::clone(&task));
        Ok(task)
    }
}

/// An I/O device. Owns the worker thread; dropping the device shuts it down.
pub(crate) struct Device {
    shared: Arc<DeviceShared>,
    worker: Option<JoinHandle<()>>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        settings: DeviceSettings,
        hook: Box<dyn IoHook>,
        mgr: Weak<MgrShared>,
    ) -> Result<Self> {
        settings.validate()?;
        let pool = BufferPool::new(&settings)?;
        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(DeviceShared {
            id,
            hook: Arc::from(hook),
            mgr,
            tasks: Mutex::new(Vec::new()),
            pool: Mutex::new(pool),
            counters: DeviceCounters::default(),
            monitoring: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake_tx,
            next_seq: AtomicU64::new(0),
            settings,
        });

        let deferred = shared
            .settings
            .scheduler_flags
            .contains(SchedulerFlags::DEFERRED_LINED_UP);
        let mut builder = std::thread::Builder::new().name(format!("rill-{id}"));
        if let Some(stack_size) = shared.settings.thread.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let worker_shared = Arc::clone(&shared);
        let worker = builder
            .spawn(move || {
                if deferred {
                    deferred::run(worker_shared, wake_rx)
                } else {
                    blocking::run(worker_shared, wake_rx)
                }
            })
            .map_err(|_| Error::Fail)?;

        debug!(device = %shared.id, deferred, "device created");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Signal the worker to drain and tear everything down, then join it.
    pub(crate) fn destroy(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(device = %self.shared.id, "device destroyed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// One granule transfer, prepared by the scheduler and performed either
/// inline (blocking discipline) or by a transfer thread (deferred).
pub(crate) struct TransferJob {
    pub task: Arc<StmTask>,
    pub granule: Granule,
    pub offset: u64,
    pub len: usize,
    pub kind: OpKind,
    /// Generation tag; a completion whose tag no longer matches the task is
    /// discarded (the op was cancelled or the stream repositioned)
    pub op_seq: u64,
}

/// What the scheduler decided to do this tick.
pub(crate) enum Work {
    /// Dispatch this transfer
    Transfer(TransferJob),
    /// Open this task's descriptor from its deferred record first
    Open(Arc<StmTask>),
    /// The pool has no free granule for the elected task of this priority
    Starved(Priority),
    /// Something was resolved inline; re-run the scheduler without sleeping
    Again,
    /// Nothing to do
    Idle,
}

/// Effective priority of a task, or `None` when it is ineligible. The key
/// orders starving automatic tasks ahead of everything else; within a band,
/// nominal priority decides and ties go to the oldest task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Effective {
    starving: bool,
    priority: Priority,
}

fn eligibility(state: &TaskState, granularity: usize, target_secs: f32) -> Option<Effective> {
    if state.in_flight {
        return None;
    }
    match state.status {
        TaskStatus::Destroyed | TaskStatus::Errored | TaskStatus::Cancelled => return None,
        _ => {}
    }
    match &state.kind {
        TaskKind::Std(ctx) => ctx.op.as_ref().map(|op| Effective {
            starving: false,
            priority: op.priority,
        }),
        TaskKind::Auto(auto) => {
            if !auto.started || auto.reached_end {
                return None;
            }
            let buffered = auto.buffered_bytes();
            // Only dispatch when a whole granule still fits under the target
            if buffered + granularity > auto.target_bytes(granularity, target_secs) {
                return None;
            }
            Some(Effective {
                starving: buffered < auto.starvation_threshold(granularity, target_secs),
                priority: auto.heuristics.priority,
            })
        }
    }
}

/// Nominal priority used by the force-cleanup victim election.
fn nominal_priority(state: &TaskState) -> Priority {
    match &state.kind {
        TaskKind::Std(ctx) => ctx
            .op
            .as_ref()
            .map(|op| op.priority)
            .unwrap_or(DEFAULT_PRIORITY),
        TaskKind::Auto(auto) => auto.heuristics.priority,
    }
}

/// Whether the loop points of an automatic task are usable against the file.
fn loop_active(auto: &AutoCtx, file_size: u64) -> bool {
    auto.heuristics.looping() && (auto.heuristics.loop_start as u64) < file_size
}

/// Elect the next task and prepare one granule transfer for it.
pub(crate) fn next_work(shared: &Arc<DeviceShared>) -> Work {
    let tasks: Vec<Arc<StmTask>> = shared.tasks.lock().clone();
    let granularity = shared.settings.granularity as usize;
    let target_secs = shared.settings.target_auto_stm_buffer_length;

    // Highest effective priority wins; ties go to the oldest task
    let mut best: Option<(Effective, u64, Arc<StmTask>)> = None;
    for task in &tasks {
        let state = task.state.lock();
        let Some(effective) = eligibility(&state, granularity, target_secs) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((best_effective, best_seq, _)) => {
                effective > *best_effective
                    || (effective == *best_effective && task.seq < *best_seq)
            }
        };
        if better {
            best = Some((effective, task.seq, Arc::clone(task)));
        }
    }
    let Some((_, _, task)) = best else {
        return Work::Idle;
    };

    // A deferred open gates the first transfer
    let needs_open = task.io.lock().deferred.is_some();
    if needs_open {
        return Work::Open(task);
    }

    enum Prep {
        Go(u64, usize, OpKind, u64),
        DoneInline,
        Skip,
    }

    let mut guard = task.state.lock();
    let state = &mut *guard;
    if eligibility(state, granularity, target_secs).is_none() {
        // Lost the race against a client thread; re-elect
        return Work::Again;
    }
    if !state.file_open {
        // No descriptor and no deferred record; nothing this task can do
        return Work::Again;
    }

    // Work out the transfer window
    let prep = match &mut state.kind {
        TaskKind::Std(ctx) => {
            let op_seq = ctx.op_seq;
            match ctx.op.as_mut() {
                None => Prep::Skip,
                Some(op) => {
                    let kind = op.kind;
                    let offset = op.base_offset + op.transferred as u64;
                    let mut len = op.remaining().min(granularity);
                    if kind == OpKind::Read {
                        len = len.min(state.file_size.saturating_sub(offset) as usize);
                    }
                    if len == 0 {
                        // At or past the end; the op completes with what it
                        // has
                        let transferred = op.transferred;
                        let data = op.buf.split().freeze();
                        ctx.op = None;
                        ctx.last_transferred = transferred;
                        ctx.data = (kind == OpKind::Read).then_some(data);
                        state.status = TaskStatus::Completed;
                        Prep::DoneInline
                    } else {
                        Prep::Go(offset, len, kind, op_seq)
                    }
                }
            }
        }
        TaskKind::Auto(auto) => {
            let offset = auto.next_fetch;
            let looping = loop_active(auto, state.file_size);
            let window = if looping && offset < auto.heuristics.loop_end as u64 {
                (auto.heuristics.loop_end as u64).min(state.file_size) - offset
            } else {
                state.file_size.saturating_sub(offset)
            };
            if window == 0 {
                if looping {
                    auto.next_fetch = auto.heuristics.loop_start as u64;
                    Prep::Skip
                } else {
                    auto.reached_end = true;
                    state.status = TaskStatus::Completed;
                    Prep::DoneInline
                }
            } else {
                Prep::Go(
                    offset,
                    (window as usize).min(granularity),
                    OpKind::Read,
                    auto.fetch_seq,
                )
            }
        }
    };

    let (offset, len, kind, op_seq) = match prep {
        Prep::Go(offset, len, kind, op_seq) => (offset, len, kind, op_seq),
        Prep::DoneInline => {
            drop(guard);
            task.done.notify_all();
            return Work::Again;
        }
        Prep::Skip => return Work::Again,
    };

    // One granule from the pool feeds the transfer
    let Some(mut granule) = shared.pool.lock().alloc() else {
        // Report the nominal priority: the cleanup victim must be strictly
        // below the starved task as the caller sees it, not below its
        // elevated scheduling band
        return Work::Starved(nominal_priority(state));
    };
    if kind == OpKind::Write {
        if let TaskKind::Std(ctx) = &state.kind {
            if let Some(op) = &ctx.op {
                granule.as_io_slice()[..len]
                    .copy_from_slice(&op.buf[op.transferred..op.transferred + len]);
                granule.set_len(len);
            }
        }
    }
    state.status = TaskStatus::Running;
    state.in_flight = true;
    drop(guard);

    Work::Transfer(TransferJob {
        task,
        granule,
        offset,
        len,
        kind,
        op_seq,
    })
}

/// Open a task's descriptor from its deferred record. Failure parks the task
/// in the error state with the hook's code.
pub(crate) fn open_deferred(shared: &Arc<DeviceShared>, task: &Arc<StmTask>) {
    let record = task.io.lock().deferred.take();
    let Some(record) = record else { return };
    debug!(device = %shared.id, file = %record.target, "deferred open");
    match shared.hook.open(&record) {
        Ok(desc) => task.set_file_open(desc),
        Err(error) => {
            warn!(device = %shared.id, file = %record.target, %error, "deferred open failed");
            let mut state = task.state.lock();
            state.status = TaskStatus::Errored;
            state.error = Some(error);
            drop(state);
            task.done.notify_all();
        }
    }
}

/// Perform one prepared transfer through the hook. Called with no task state
/// lock held; the descriptor lock is private to the I/O side.
pub(crate) fn perform(shared: &DeviceShared, job: &mut TransferJob) -> Result<usize> {
    let mut io = job.task.io.lock();
    let desc = io.desc.as_mut().ok_or(Error::Fail)?;
    match job.kind {
        OpKind::Read => {
            let count = shared
                .hook
                .read(desc, job.offset, &mut job.granule.as_io_slice()[..job.len])?;
            job.granule.set_len(count);
            Ok(count)
        }
        OpKind::Write => shared.hook.write(desc, job.offset, &job.granule.filled()[..job.len]),
    }
}

/// Retire a finished transfer into its task.
pub(crate) fn retire(shared: &Arc<DeviceShared>, job: TransferJob, result: Result<usize>) {
    let TransferJob {
        task,
        granule,
        offset,
        len,
        kind,
        op_seq,
    } = job;
    shared.counters.transfers.fetch_add(1, Ordering::Relaxed);

    let mut guard = task.state.lock();
    let state = &mut *guard;
    state.in_flight = false;

    // The task died or the op was withdrawn while the transfer was in the
    // air; the result is nobody's
    let stale = match (state.status, &state.kind) {
        (TaskStatus::Destroyed | TaskStatus::Cancelled, _) => true,
        (_, TaskKind::Std(ctx)) => ctx.op_seq != op_seq || ctx.op.is_none(),
        (_, TaskKind::Auto(auto)) => auto.fetch_seq != op_seq,
    };
    if stale {
        shared.pool.lock().release(granule);
        drop(guard);
        task.done.notify_all();
        return;
    }

    match result {
        Err(error) => {
            warn!(device = %shared.id, stream = task.stream_id, %error, "transfer failed");
            state.status = TaskStatus::Errored;
            state.error = Some(error);
            shared.pool.lock().release(granule);
        }
        Ok(count) => match &mut state.kind {
            TaskKind::Std(ctx) => {
                let Some(op) = ctx.op.as_mut() else {
                    unreachable!("stale op checked above")
                };
                let short = count < len;
                if kind == OpKind::Read {
                    op.buf.extend_from_slice(&granule.filled()[..count]);
                    shared
                        .counters
                        .bytes_read
                        .fetch_add(count as u64, Ordering::Relaxed);
                } else {
                    shared
                        .counters
                        .bytes_written
                        .fetch_add(count as u64, Ordering::Relaxed);
                }
                op.transferred += count;
                state.position = offset + count as u64;
                if kind == OpKind::Write {
                    state.file_size = state.file_size.max(state.position);
                }
                if kind == OpKind::Write && short {
                    // A short write is a backend failure
                    state.status = TaskStatus::Errored;
                    state.error = Some(Error::Fail);
                } else if op.transferred == op.requested || short {
                    let transferred = op.transferred;
                    let data = op.buf.split().freeze();
                    ctx.op = None;
                    ctx.last_transferred = transferred;
                    ctx.data = (kind == OpKind::Read).then_some(data);
                    state.status = TaskStatus::Completed;
                } else {
                    state.status = TaskStatus::Pending;
                }
                shared.pool.lock().release(granule);
            }
            TaskKind::Auto(auto) => {
                if count == 0 {
                    if loop_active(auto, state.file_size) {
                        auto.next_fetch = auto.heuristics.loop_start as u64;
                    } else {
                        auto.reached_end = true;
                        state.status = TaskStatus::Completed;
                    }
                    shared.pool.lock().release(granule);
                } else {
                    shared
                        .counters
                        .bytes_read
                        .fetch_add(count as u64, Ordering::Relaxed);
                    let mut staged = granule;
                    staged.set_len(count);
                    auto.ready.push_back(Staged {
                        granule: staged,
                        offset,
                    });
                    auto.next_fetch = offset + count as u64;
                    let looping = loop_active(auto, state.file_size);
                    let wrapped = looping && auto.next_fetch >= auto.heuristics.loop_end as u64;
                    let hit_eof = auto.next_fetch >= state.file_size || count < len;
                    if wrapped || (looping && hit_eof) {
                        auto.next_fetch = auto.heuristics.loop_start as u64;
                    } else if hit_eof {
                        auto.reached_end = true;
                        state.status = TaskStatus::Completed;
                    } else {
                        state.status = TaskStatus::Running;
                    }
                }
            }
        },
    }
    drop(guard);
    task.done.notify_all();
}

/// Reap tasks marked for destruction: release their buffers, close their
/// descriptors, drop them from the table. Tasks with a transfer still in the
/// air are picked up on a later tick.
pub(crate) fn cleanup_pass(shared: &Arc<DeviceShared>) {
    let mut dead = Vec::new();
    {
        let mut tasks = shared.tasks.lock();
        tasks.retain(|task| {
            let mut state = task.state.lock();
            if state.status != TaskStatus::Destroyed || state.in_flight {
                return true;
            }
            if let TaskKind::Auto(auto) = &mut state.kind {
                let flushed: Vec<Granule> =
                    auto.ready.drain(..).map(|staged| staged.granule).collect();
                drop(state);
                shared.release_all(flushed);
            }
            dead.push(Arc::clone(task));
            false
        });
    }
    for task in dead {
        let desc = task.io.lock().desc.take();
        if let Some(desc) = desc {
            debug!(device = %shared.id, stream = task.stream_id, "closing descriptor");
            if let Err(error) = shared.hook.close(desc) {
                warn!(device = %shared.id, stream = task.stream_id, %error, "close failed");
            }
        }
        task.done.notify_all();
    }
}

/// Device side of the manager-wide cleanup broadcast. Reclaims buffers of
/// dying tasks; when this device initiated the broadcast, additionally kills
/// its lowest-priority task strictly below `priority` (oldest on tie) and
/// reclaims that task's buffers on the spot.
pub(crate) fn force_cleanup(shared: &Arc<DeviceShared>, is_caller: bool, priority: Priority) {
    let tasks: Vec<Arc<StmTask>> = shared.tasks.lock().clone();

    for task in &tasks {
        let mut state = task.state.lock();
        if state.status != TaskStatus::Destroyed {
            continue;
        }
        if let TaskKind::Auto(auto) = &mut state.kind {
            let flushed: Vec<Granule> = auto.ready.drain(..).map(|staged| staged.granule).collect();
            drop(state);
            shared.release_all(flushed);
        }
    }

    if !is_caller {
        return;
    }

    let mut victim: Option<(Priority, u64, Arc<StmTask>)> = None;
    for task in &tasks {
        let state = task.state.lock();
        if state.status == TaskStatus::Destroyed {
            continue;
        }
        let nominal = nominal_priority(&state);
        if nominal >= priority {
            continue;
        }
        let better = match &victim {
            None => true,
            Some((victim_priority, victim_seq, _)) => {
                nominal < *victim_priority || (nominal == *victim_priority && task.seq < *victim_seq)
            }
        };
        if better {
            victim = Some((nominal, task.seq, Arc::clone(task)));
        }
    }

    if let Some((nominal, _, task)) = victim {
        warn!(
            device = %shared.id,
            stream = task.stream_id,
            priority = nominal,
            "killing lowest priority stream to reclaim buffers"
        );
        task.kill();
        let mut state = task.state.lock();
        if let TaskKind::Auto(auto) = &mut state.kind {
            let flushed: Vec<Granule> = auto.ready.drain(..).map(|staged| staged.granule).collect();
            drop(state);
            shared.release_all(flushed);
        }
    }
}

/// Final drain at worker exit: every task dies, buffers and descriptors are
/// reclaimed.
pub(crate) fn shutdown_drain(shared: &Arc<DeviceShared>) {
    let tasks: Vec<Arc<StmTask>> = shared.tasks.lock().clone();
    for task in &tasks {
        task.kill();
    }
    cleanup_pass(shared);
    debug!(device = %shared.id, "worker drained");
}
