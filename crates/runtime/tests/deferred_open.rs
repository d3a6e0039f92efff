//! Deferred opens: the resolver hands back an unopened descriptor and the
//! device hook opens it on first dispatch.

mod common;

use common::{rig, wait_for, MemHook, MemResolver};
use rill_runtime::{
    Error, Fetch, Heuristics, OpenMode, SchedulerFlags, StreamStatus, DEFAULT_PRIORITY,
};
use std::{sync::Arc, time::Duration};

fn deferring_rig() -> (rill_runtime::StreamMgr, Arc<MemHook>) {
    let (mgr, hook, device_id) = rig(SchedulerFlags::BLOCKING);
    let resolver = MemResolver::new(device_id, Arc::clone(&hook));
    resolver.defer_opens();
    mgr.set_resolver(Arc::new(resolver));
    (mgr, hook)
}

#[test]
fn test_first_read_triggers_hook_open() {
    let (mgr, hook) = deferring_rig();
    hook.insert("late.wem", vec![4u8; 4096]);

    let stream = mgr
        .create_std("late.wem", None, OpenMode::Read, false)
        .unwrap();
    // Nothing was opened at creation
    assert_eq!(0, hook.opens());

    let mut chunk = [0u8; 4096];
    assert_eq!(4096, stream.read(&mut chunk, DEFAULT_PRIORITY).unwrap());
    assert_eq!(1, hook.opens());
    assert!(chunk.iter().all(|&byte| byte == 4));
}

#[test]
fn test_failed_deferred_open_reports_error_status() {
    let (mgr, hook) = deferring_rig();
    hook.fail_open_with(Error::FileNotFound);

    let stream = mgr
        .create_std("ghost.wem", None, OpenMode::Read, false)
        .unwrap();
    stream.read_async(1024, DEFAULT_PRIORITY).unwrap();

    // The hook refuses the open; the task parks in the error state
    assert!(wait_for(Duration::from_secs(2), || {
        stream.status() == StreamStatus::Error
    }));
    assert_eq!(Some(Error::FileNotFound), stream.error());

    // No descriptor was ever opened, so none may be closed
    stream.destroy();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(0, hook.opens());
    assert_eq!(0, hook.closes());
}

#[test]
fn test_deferred_auto_stream_opens_on_start() {
    let (mgr, hook) = deferring_rig();
    hook.insert("bgm.wem", vec![6u8; 16 * 1024]);

    let heuristics = Heuristics {
        throughput: 50_000.0,
        ..Heuristics::default()
    };
    let stream = mgr
        .create_auto("bgm.wem", None, heuristics, None, false)
        .unwrap();
    assert_eq!(0, hook.opens());

    stream.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        matches!(stream.get_buffer(false), Ok(Fetch::Data(_)))
    }));
    assert_eq!(1, hook.opens());
}

#[test]
fn test_deferred_stream_closes_exactly_once() {
    let (mgr, hook) = deferring_rig();
    hook.insert("closeme.wem", vec![8u8; 2048]);

    let stream = mgr
        .create_std("closeme.wem", None, OpenMode::Read, false)
        .unwrap();
    let mut chunk = [0u8; 512];
    stream.read(&mut chunk, DEFAULT_PRIORITY).unwrap();

    drop(stream);
    assert!(wait_for(Duration::from_secs(2), || hook.closes() == 1));
    drop(mgr);
    assert_eq!(1, hook.opens());
    assert_eq!(1, hook.closes());
}
