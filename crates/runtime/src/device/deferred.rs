//! deferred
//!
//! The deferred lined-up discipline: up to `max_concurrent_io` granule
//! transfers in flight at once, lined up across eligible streams and
//! performed by a small crew of transfer threads. A completion wakes the
//! scheduler, which retires the granule into its task and lines up more.
//! One transfer per task is outstanding at any time, so each stream's
//! completions land in submission order.

use super::{
    cleanup_pass, next_work, open_deferred, perform, retire, shutdown_drain, DeviceShared,
    TransferJob, Work,
};
use crate::error::Result;
use crossbeam::channel::{unbounded, Receiver};
use std::sync::Arc;
use tracing::debug;

pub(crate) fn run(shared: Arc<DeviceShared>, wake_rx: Receiver<()>) {
    let crew_size = shared.settings.max_concurrent_io as usize;
    debug!(device = %shared.id, crew_size, "deferred lined-up scheduler up");

    let (job_tx, job_rx) = unbounded::<TransferJob>();
    let (done_tx, done_rx) = unbounded::<(TransferJob, Result<usize>)>();

    let crew: Vec<_> = (0..crew_size)
        .map(|lane| {
            let shared = Arc::clone(&shared);
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            std::thread::Builder::new()
                .name(format!("rill-{}-io{lane}", shared.id))
                .spawn(move || {
                    for mut job in job_rx.iter() {
                        let result = perform(&shared, &mut job);
                        if done_tx.send((job, result)).is_err() {
                            break;
                        }
                    }
                })
                .expect("transfer lane spawn")
        })
        .collect();

    let mut inflight = 0usize;
    // One forced cleanup per pool-exhaustion episode
    let mut cleaned_up = false;
    loop {
        while let Ok((job, result)) = done_rx.try_recv() {
            inflight -= 1;
            retire(&shared, job, result);
        }
        if shared.shutting_down() {
            break;
        }
        cleanup_pass(&shared);

        // Line up transfers until the crew is saturated or nothing is
        // eligible
        while inflight < crew_size {
            match next_work(&shared) {
                Work::Open(task) => open_deferred(&shared, &task),
                Work::Transfer(job) => {
                    cleaned_up = false;
                    if job_tx.send(job).is_err() {
                        break;
                    }
                    inflight += 1;
                }
                Work::Starved(priority) => {
                    if !cleaned_up {
                        cleaned_up = true;
                        if let Some(mgr) = shared.mgr.upgrade() {
                            mgr.force_cleanup(Some(shared.id), priority);
                        }
                        continue;
                    }
                    break;
                }
                Work::Again => {}
                Work::Idle => break,
            }
        }

        crossbeam::select! {
            recv(done_rx) -> msg => {
                if let Ok((job, result)) = msg {
                    inflight -= 1;
                    retire(&shared, job, result);
                }
            }
            recv(wake_rx) -> _msg => {}
            default(shared.settings.idle_wait_time) => {}
        }
    }

    // Stop feeding the crew and wait for everything in the air to land
    drop(job_tx);
    while inflight > 0 {
        match done_rx.recv() {
            Ok((job, result)) => {
                inflight -= 1;
                retire(&shared, job, result);
            }
            Err(_) => break,
        }
    }
    for lane in crew {
        let _ = lane.join();
    }
    shutdown_drain(&shared);
}
