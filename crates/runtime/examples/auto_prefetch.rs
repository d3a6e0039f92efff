//! Stream a file through an automatic stream on a deferred lined-up device.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example auto_prefetch
//! ```

use rill_runtime::{
    fs::FsHook, DeviceId, DeviceSettings, Fetch, FileDesc, FileLocationResolver, FileSystemFlags,
    FileTarget, Heuristics, IoHook, OpenMode, OpenRecord, Result, SchedulerFlags, StreamMgr,
    StreamMgrSettings,
};
use std::sync::Arc;

struct DirResolver {
    opener: FsHook,
}

impl FileLocationResolver for DirResolver {
    fn open(
        &self,
        target: &FileTarget,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        _sync_open: &mut bool,
    ) -> Result<FileDesc> {
        self.opener.open(&OpenRecord {
            target: target.clone(),
            flags: flags.copied(),
            open_mode,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let root = std::env::temp_dir().join("rill-auto-prefetch");
    std::fs::create_dir_all(&root).map_err(rill_runtime::Error::from)?;
    let payload: Vec<u8> = (0..1_000_000u32).map(|byte| (byte % 239) as u8).collect();
    std::fs::write(root.join("music.pcm"), &payload).map_err(rill_runtime::Error::from)?;

    let mgr = StreamMgr::new(StreamMgrSettings::default())?;
    let mut settings = DeviceSettings::default();
    settings.scheduler_flags = SchedulerFlags::DEFERRED_LINED_UP;
    settings.max_concurrent_io = 4;
    let device = mgr.create_device(settings, Box::new(FsHook::new(DeviceId::new(0), &root)))?;
    mgr.set_resolver(Arc::new(DirResolver {
        opener: FsHook::new(device, root.clone()),
    }));

    // 192 kB/s of 48 kHz stereo float frames, give or take
    let heuristics = Heuristics {
        throughput: 192_000.0,
        ..Heuristics::default()
    };
    let stream = mgr.create_auto("music.pcm", None, heuristics, None, true)?;
    stream.start()?;

    let mut total = 0usize;
    let mut grants = 0usize;
    loop {
        match stream.get_buffer(true)? {
            Fetch::Data(buffer) => {
                total += buffer.len();
                grants += 1;
                // A decoder would consume the granule here; dropping the
                // buffer releases it back to the device pool
            }
            Fetch::NoDataReady => {}
            Fetch::NoMoreData => break,
        }
    }
    println!("played out {total} bytes over {grants} buffers");
    Ok(())
}
