//! blocking
//!
//! The blocking discipline: one synchronous granule transfer per scheduling
//! tick, performed on the worker thread itself. At most one outstanding I/O
//! per device; good for platforms with efficient blocking I/O.

use super::{
    cleanup_pass, next_work, open_deferred, perform, retire, shutdown_drain, DeviceShared, Work,
};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use tracing::debug;

pub(crate) fn run(shared: Arc<DeviceShared>, wake_rx: Receiver<()>) {
    debug!(device = %shared.id, "blocking scheduler up");
    // One forced cleanup per pool-exhaustion episode
    let mut cleaned_up = false;
    loop {
        if shared.shutting_down() {
            break;
        }
        cleanup_pass(&shared);
        match next_work(&shared) {
            Work::Open(task) => open_deferred(&shared, &task),
            Work::Transfer(mut job) => {
                cleaned_up = false;
                let result = perform(&shared, &mut job);
                retire(&shared, job, result);
            }
            Work::Starved(priority) => {
                if !cleaned_up {
                    cleaned_up = true;
                    if let Some(mgr) = shared.mgr.upgrade() {
                        mgr.force_cleanup(Some(shared.id), priority);
                    }
                } else {
                    // Nothing left to sacrifice; wait for a consumer to
                    // release a buffer
                    let _ = wake_rx.recv_timeout(shared.settings.idle_wait_time);
                }
            }
            Work::Again => {}
            Work::Idle => {
                let _ = wake_rx.recv_timeout(shared.settings.idle_wait_time);
            }
        }
    }
    shutdown_drain(&shared);
}
