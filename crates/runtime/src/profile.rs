//! profile
//!
//! Read-only enumeration of devices and their streams for monitoring tools.
//! Snapshots are taken under the same short locks the engine itself uses;
//! nothing here mutates scheduling state beyond the monitoring toggles.

use crate::{
    hook::DeviceId,
    mgr::StreamMgr,
    settings::{PoolAttributes, Priority, SchedulerFlags},
    task::{StreamStatus, TaskKind},
};
use std::sync::atomic::Ordering;

/// Point-in-time snapshot of one stream.
#[derive(Debug, Clone)]
pub struct StreamProfile {
    pub stream_id: u32,
    /// Display form of what was opened
    pub target: String,
    pub file_size: u64,
    pub position: u64,
    /// Bytes staged ahead of the consumer (automatic streams)
    pub buffered_bytes: usize,
    pub priority: Priority,
    pub status: StreamStatus,
    /// A transfer for this stream was in flight at snapshot time
    pub blocked_on_io: bool,
    pub is_automatic: bool,
}

/// Point-in-time snapshot of one device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub id: DeviceId,
    pub scheduler: SchedulerFlags,
    pub pool_attributes: PoolAttributes,
    pub granularity: u32,
    pub granule_count: usize,
    pub granules_free: usize,
    /// Fewest granules ever simultaneously free
    pub granules_low_water: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub transfers: u64,
    pub monitoring: bool,
    /// Per-stream rows; captured only while monitoring is on
    pub streams: Vec<StreamProfile>,
}

/// Profiling facade over a [`StreamMgr`].
pub struct StreamMgrProfile<'mgr> {
    mgr: &'mgr StreamMgr,
}

impl StreamMgr {
    /// The profiling surface. Only compiled with the `profiling` feature.
    pub fn profile(&self) -> StreamMgrProfile<'_> {
        StreamMgrProfile { mgr: self }
    }
}

impl StreamMgrProfile<'_> {
    /// Number of live devices (holes in the table are not counted).
    pub fn num_devices(&self) -> usize {
        self.mgr
            .shared()
            .devices
            .lock()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Snapshot of the `index`-th live device, counting non-empty slots
    /// only.
    pub fn device(&self, index: usize) -> Option<DeviceProfile> {
        let devices = self.mgr.shared().devices.lock();
        let mut live = 0;
        for slot in devices.iter() {
            let Some(device) = slot else { continue };
            if live == index {
                return Some(snapshot(device.shared()));
            }
            live += 1;
        }
        None
    }

    /// Enable per-stream capture on every device.
    pub fn start_monitoring(&self) {
        let devices = self.mgr.shared().devices.lock();
        for device in devices.iter().flatten() {
            device.shared().monitoring.store(true, Ordering::Relaxed);
        }
    }

    /// Disable per-stream capture on every device.
    pub fn stop_monitoring(&self) {
        let devices = self.mgr.shared().devices.lock();
        for device in devices.iter().flatten() {
            device.shared().monitoring.store(false, Ordering::Relaxed);
        }
    }
}

fn snapshot(shared: &crate::device::DeviceShared) -> DeviceProfile {
    let monitoring = shared.monitoring.load(Ordering::Relaxed);
    let (granule_count, granules_free, granules_low_water) = {
        let pool = shared.pool.lock();
        (pool.capacity(), pool.free_count(), pool.low_water())
    };
    let streams = if monitoring {
        shared
            .tasks
            .lock()
            .iter()
            .map(|task| {
                let state = task.state.lock();
                let (buffered_bytes, priority, is_automatic) = match &state.kind {
                    TaskKind::Auto(auto) => {
                        (auto.buffered_bytes(), auto.heuristics.priority, true)
                    }
                    TaskKind::Std(ctx) => (
                        0,
                        ctx.op
                            .as_ref()
                            .map(|op| op.priority)
                            .unwrap_or(crate::settings::DEFAULT_PRIORITY),
                        false,
                    ),
                };
                StreamProfile {
                    stream_id: task.stream_id,
                    target: task.target.to_string(),
                    file_size: state.file_size,
                    position: state.position,
                    buffered_bytes,
                    priority,
                    status: task.status_locked(&state),
                    blocked_on_io: state.in_flight,
                    is_automatic,
                }
            })
            .collect()
    } else {
        Vec::new()
    };
    DeviceProfile {
        id: shared.id,
        scheduler: shared.settings.scheduler_flags,
        pool_attributes: shared.settings.pool_attributes,
        granularity: shared.settings.granularity,
        granule_count,
        granules_free,
        granules_low_water,
        bytes_read: shared.counters.bytes_read.load(Ordering::Relaxed),
        bytes_written: shared.counters.bytes_written.load(Ordering::Relaxed),
        transfers: shared.counters.transfers.load(Ordering::Relaxed),
        monitoring,
        streams,
    }
}
