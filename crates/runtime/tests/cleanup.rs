//! Force-cleanup: a starved high-priority stream sacrifices the lowest
//! priority task on its device.

mod common;

use common::{rig, wait_for};
use rill_runtime::{Fetch, Heuristics, SchedulerFlags, StreamStatus};
use std::time::Duration;

fn hog_heuristics(priority: u8) -> Heuristics {
    Heuristics {
        // Wants far more than the 8-granule pool can hold
        throughput: 10_000_000.0,
        priority,
        ..Heuristics::default()
    }
}

#[test]
fn test_high_priority_stream_evicts_lowest() {
    let (mgr, hook, _) = rig(SchedulerFlags::BLOCKING);
    hook.insert("bed-a.wem", vec![1u8; 256 * 1024]);
    hook.insert("bed-b.wem", vec![2u8; 256 * 1024]);
    hook.insert("urgent.wem", vec![3u8; 64 * 1024]);

    // Two low-priority hogs; the scheduler favors the older one, so bed_a
    // ends up holding the pool
    let bed_a = mgr
        .create_auto("bed-a.wem", None, hog_heuristics(10), None, true)
        .unwrap();
    let bed_b = mgr
        .create_auto("bed-b.wem", None, hog_heuristics(10), None, true)
        .unwrap();
    bed_a.start().unwrap();
    bed_b.start().unwrap();

    let exhausted = wait_for(Duration::from_secs(2), || {
        mgr.profile()
            .device(0)
            .map(|device| device.granules_free == 0)
            .unwrap_or(false)
    });
    assert!(exhausted, "hogs never filled the pool");

    // Slow transfers down so the surviving hog cannot instantly re-consume
    // what the cleanup is about to free
    hook.set_read_delay(Duration::from_millis(5));

    // A high-priority stream shows up with nothing left to feed it
    let urgent = mgr
        .create_auto("urgent.wem", None, hog_heuristics(90), None, true)
        .unwrap();
    urgent.start().unwrap();

    // Exactly one hog dies for it: the lowest priority, oldest on tie
    assert!(wait_for(Duration::from_secs(2), || {
        bed_a.status() == StreamStatus::Cancelled
    }));
    assert_ne!(StreamStatus::Cancelled, bed_b.status());

    // And the newcomer is served
    let served = wait_for(Duration::from_secs(2), || {
        matches!(urgent.get_buffer(false), Ok(Fetch::Data(_)))
    });
    assert!(served, "high priority stream still starved after cleanup");
}

#[test]
fn test_no_victim_above_requested_priority() {
    let (mgr, hook, _) = rig(SchedulerFlags::BLOCKING);
    hook.insert("bed.wem", vec![1u8; 256 * 1024]);
    hook.insert("equal.wem", vec![2u8; 64 * 1024]);

    let bed = mgr
        .create_auto("bed.wem", None, hog_heuristics(50), None, true)
        .unwrap();
    bed.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        mgr.profile()
            .device(0)
            .map(|device| device.granules_free == 0)
            .unwrap_or(false)
    }));

    // Same priority is not strictly below: nothing may be killed, and with
    // no memory to reclaim the creation itself reports the exhaustion
    let result = mgr.create_auto("equal.wem", None, hog_heuristics(50), None, true);
    assert_eq!(
        Err(rill_runtime::Error::InsufficientMemory),
        result.map(|_| ())
    );
    assert_ne!(StreamStatus::Cancelled, bed.status());
}
