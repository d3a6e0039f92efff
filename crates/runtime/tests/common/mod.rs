//! Shared in-memory backend for the integration tests: a hook serving files
//! out of a map, and a resolver that routes everything to one device and can
//! be told to defer opens.

#![allow(dead_code)]

use parking_lot::Mutex;
use rill_runtime::{
    DeviceId, DeviceSettings, Error, FileDesc, FileLocationResolver, FileSystemFlags, FileTarget,
    IoHook, OpenMode, OpenRecord, Result, SchedulerFlags,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Hook serving an in-memory file map, with open/close accounting and a
/// failure knob for deferred-open tests.
pub struct MemHook {
    device_id: DeviceId,
    files: Mutex<HashMap<String, Vec<u8>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: Mutex<Option<Error>>,
    read_delay: Mutex<Option<Duration>>,
}

impl MemHook {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            files: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_open: Mutex::new(None),
            read_delay: Mutex::new(None),
        }
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_owned(), data);
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make every subsequent open fail with `error`.
    pub fn fail_open_with(&self, error: Error) {
        *self.fail_open.lock() = Some(error);
    }

    /// Slow every read down, to widen scheduling windows under test.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    fn key_of(target: &FileTarget) -> String {
        match target {
            FileTarget::Name(name) => name.clone(),
            FileTarget::Id(id) => format!("{id}.bin"),
        }
    }
}

impl IoHook for MemHook {
    fn open(&self, record: &OpenRecord) -> Result<FileDesc> {
        if let Some(error) = *self.fail_open.lock() {
            return Err(error);
        }
        let key = Self::key_of(&record.target);
        let mut files = self.files.lock();
        let file_size = match files.get(&key) {
            Some(data) => data.len() as u64,
            None if record.open_mode == OpenMode::Read => return Err(Error::FileNotFound),
            None => {
                files.insert(key.clone(), Vec::new());
                0
            }
        };
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FileDesc {
            device_id: self.device_id,
            file_size,
            sector_offset: 0,
            block_size: 0,
            handle: Some(Box::new(key)),
        })
    }

    fn close(&self, desc: FileDesc) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        drop(desc);
        Ok(())
    }

    fn read(&self, desc: &mut FileDesc, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let key = desc
            .handle
            .as_ref()
            .and_then(|handle| handle.downcast_ref::<String>())
            .ok_or(Error::InvalidParameter)?;
        let files = self.files.lock();
        let data = files.get(key).ok_or(Error::Fail)?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = dst.len().min(data.len() - offset);
        dst[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write(&self, desc: &mut FileDesc, offset: u64, src: &[u8]) -> Result<usize> {
        let key = desc
            .handle
            .as_ref()
            .and_then(|handle| handle.downcast_ref::<String>())
            .ok_or(Error::InvalidParameter)?;
        let mut files = self.files.lock();
        let data = files.get_mut(key).ok_or(Error::Fail)?;
        let offset = offset as usize;
        if data.len() < offset + src.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

/// Resolver routing every target to one device. When `defer` is set it
/// clears `sync_open` and leaves the descriptor unopened.
pub struct MemResolver {
    device_id: DeviceId,
    hook: Arc<MemHook>,
    defer: AtomicBool,
}

impl MemResolver {
    pub fn new(device_id: DeviceId, hook: Arc<MemHook>) -> Self {
        Self {
            device_id,
            hook,
            defer: AtomicBool::new(false),
        }
    }

    pub fn defer_opens(&self) {
        self.defer.store(true, Ordering::SeqCst);
    }
}

impl FileLocationResolver for MemResolver {
    fn open(
        &self,
        target: &FileTarget,
        open_mode: OpenMode,
        flags: Option<&FileSystemFlags>,
        sync_open: &mut bool,
    ) -> Result<FileDesc> {
        if self.defer.load(Ordering::SeqCst) {
            *sync_open = false;
            return Ok(FileDesc::new(self.device_id));
        }
        self.hook.open(&OpenRecord {
            target: target.clone(),
            flags: flags.copied(),
            open_mode,
        })
    }
}

/// Device settings sized for tests: 2048-byte granules, 16 KiB pool.
pub fn small_device(scheduler: SchedulerFlags) -> DeviceSettings {
    let mut settings = DeviceSettings::default();
    settings.io_memory_size = 16 * 1024;
    settings.granularity = 2048;
    settings.scheduler_flags = scheduler;
    settings.idle_wait_time = Duration::from_millis(10);
    settings.max_concurrent_io = 4;
    settings
}

/// Poll `probe` until it returns true or the timeout lapses.
pub fn wait_for(timeout: Duration, probe: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    probe()
}

/// A manager with one device of the given scheduler and the mem backend
/// wired up.
pub fn rig(scheduler: SchedulerFlags) -> (rill_runtime::StreamMgr, Arc<MemHook>, DeviceId) {
    rig_with(small_device(scheduler))
}

pub fn rig_with(
    settings: DeviceSettings,
) -> (rill_runtime::StreamMgr, Arc<MemHook>, DeviceId) {
    let mgr = rill_runtime::StreamMgr::new(rill_runtime::StreamMgrSettings::default()).unwrap();
    // The device ID is the first free slot, which is 0 on a fresh manager
    let device_id = DeviceId::new(0);
    let hook = Arc::new(MemHook::new(device_id));
    let shared = SharedHook(Arc::clone(&hook));
    let created = mgr.create_device(settings, Box::new(shared)).unwrap();
    assert_eq!(device_id, created);
    mgr.set_resolver(Arc::new(MemResolver::new(device_id, Arc::clone(&hook))));
    (mgr, hook, device_id)
}

/// Lets the test keep a handle on the hook the device owns.
pub struct SharedHook(pub Arc<MemHook>);

impl IoHook for SharedHook {
    fn open(&self, record: &OpenRecord) -> Result<FileDesc> {
        self.0.open(record)
    }

    fn close(&self, desc: FileDesc) -> Result<()> {
        self.0.close(desc)
    }

    fn read(&self, desc: &mut FileDesc, offset: u64, dst: &mut [u8]) -> Result<usize> {
        self.0.read(desc, offset, dst)
    }

    fn write(&self, desc: &mut FileDesc, offset: u64, src: &[u8]) -> Result<usize> {
        self.0.write(desc, offset, src)
    }
}
