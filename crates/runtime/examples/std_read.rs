//! Read a file through a blocking device in granule-sized chunks.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example std_read
//! ```

use rill_runtime::{
    fs::FsHook, DeviceId, DeviceSettings, FileDesc, FileLocationResolver, FileSystemFlags,
    FileTarget, IoHook, OpenMode, OpenRecord, Result, SchedulerFlags, StreamMgr, StreamMgrSettings,
    DEFAULT_PRIORITY,
};
use std::{path::PathBuf, sync::Arc};

/// Resolves every target inside one directory, always to the same device.
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

    // Stage a demo file
    let root = std::env::temp_dir().join("rill-std-read");
    std::fs::create_dir_all(&root).map_err(rill_runtime::Error::from)?;
    let payload: Vec<u8> = (0..100_000u32).map(|byte| (byte % 251) as u8).collect();
    std::fs::write(root.join("demo.pcm"), &payload).map_err(rill_runtime::Error::from)?;

    let mgr = StreamMgr::new(StreamMgrSettings::default())?;
    let mut settings = DeviceSettings::default();
    settings.scheduler_flags = SchedulerFlags::BLOCKING;
    settings.granularity = 16 * 1024;
    settings.io_memory_size = 256 * 1024;
    let device = mgr.create_device(settings, Box::new(FsHook::new(DeviceId::new(0), &root)))?;
    mgr.set_resolver(Arc::new(DirResolver {
        opener: FsHook::new(device, PathBuf::from(&root)),
    }));

    let stream = mgr.create_std("demo.pcm", None, OpenMode::Read, true)?;
    let info = stream.info();
    println!("streaming {} ({} bytes)", info.target, info.file_size);

    let mut chunk = vec![0u8; 16 * 1024];
    let mut total = 0usize;
    let mut reads = 0usize;
    loop {
        let count = stream.read(&mut chunk, DEFAULT_PRIORITY)?;
        if count == 0 {
            break;
        }
        total += count;
        reads += 1;
    }
    println!("done: {total} bytes over {reads} reads, status {:?}", stream.status());
    Ok(())
}
