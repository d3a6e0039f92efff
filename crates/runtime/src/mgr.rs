//! mgr
//!
//! The stream manager owns a sparse table of I/O devices and routes every
//! stream creation through the host file-location resolver to the device it
//! names. The manager is an explicitly constructed owner: create it once,
//! hand it (or its streams) to consumers, drop it to tear everything down.
//! `create_device` / `destroy_device` are not thread-safe with each other or
//! with live streams on the device being destroyed; serialize them
//! externally exactly as you would serialize hot-plugging the transport.

use crate::{
    device::{self, Device, DeviceShared},
    error::{Error, Result},
    hook::{DeviceId, IoHook, OpenMode, OpenRecord},
    resolver::{FileLocationResolver, FileSystemFlags, FileTarget},
    settings::{
        BufferSettings, DeviceSettings, Heuristics, Priority, StreamMgrSettings, DEFAULT_PRIORITY,
    },
    task::{AutoStream, StdStream, StmTask},
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tracing::{debug, error};

/// State shared with the devices, so a starved device can broadcast a
/// cleanup without holding a reference cycle.
pub(crate) struct MgrShared {
    pub(crate) devices: Mutex<Vec<Option<Device>>>,
    pub(crate) resolver: RwLock<Option<Arc<dyn FileLocationResolver>>>,
    next_stream_id: AtomicU32,
}

impl MgrShared {
    /// Broadcast a cleanup to every device. Only the calling device may
    /// sacrifice a task, and only one strictly below `priority`. Must be
    /// called with no device lock held.
    pub(crate) fn force_cleanup(&self, caller: Option<DeviceId>, priority: Priority) {
        let devices = self.devices.lock();
        for device in devices.iter().flatten() {
            let shared = device.shared();
            device::force_cleanup(shared, Some(shared.id) == caller, priority);
        }
    }
}

/// The stream manager.
pub struct StreamMgr {
    shared: Arc<MgrShared>,
}

impl StreamMgr {
    pub fn new(_settings: StreamMgrSettings) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(MgrShared {
                devices: Mutex::new(Vec::new()),
                resolver: RwLock::new(None),
                next_stream_id: AtomicU32::new(0),
            }),
        })
    }

    /// Install the file-location resolver. Must happen before any stream
    /// creation; replacing it while streams are being created is undefined.
    pub fn set_resolver(&self, resolver: Arc<dyn FileLocationResolver>) {
        *self.shared.resolver.write() = Some(resolver);
    }

    /// Create a device with the scheduler selected by
    /// `settings.scheduler_flags`. The returned ID is the device's stable
    /// slot in the manager table; IDs are not necessarily contiguous after
    /// creation failures or destructions.
    pub fn create_device(&self, settings: DeviceSettings, hook: Box<dyn IoHook>) -> Result<DeviceId> {
        settings.validate()?;
        let mut devices = self.shared.devices.lock();
        let slot = match devices.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                devices.push(None);
                devices.len() - 1
            }
        };
        let id = DeviceId::new(slot as u32);
        let device = Device::new(id, settings, hook, Arc::downgrade(&self.shared))?;
        devices[slot] = Some(device);
        debug!(device = %id, "device registered");
        Ok(id)
    }

    /// Destroy a device and clear its slot. The documented precondition is
    /// that no stream lives on the device; this is checked by debug
    /// assertion, release builds proceed best effort.
    pub fn destroy_device(&self, id: DeviceId) -> Result<()> {
        let mut device = {
            let mut devices = self.shared.devices.lock();
            devices
                .get_mut(id.index())
                .and_then(Option::take)
                .ok_or(Error::InvalidParameter)?
        };
        debug_assert!(
            device.shared().live_stream_count() == 0,
            "destroying a device that still has live streams"
        );
        device.destroy();
        Ok(())
    }

    /// Create a standard (request-driven) stream.
    pub fn create_std(
        &self,
        target: impl Into<FileTarget>,
        flags: Option<FileSystemFlags>,
        open_mode: OpenMode,
        sync_open: bool,
    ) -> Result<StdStream> {
        let target = target.into();
        if matches!(&target, FileTarget::Name(name) if name.is_empty()) {
            return Err(Error::InvalidParameter);
        }
        let task = self.create_task(target, flags, open_mode, sync_open, None)?;
        Ok(StdStream { task })
    }

    /// Create an automatic (heuristic prefetch) stream. Automatic streams
    /// always open for reading; call [`AutoStream::start`] to begin
    /// prefetching.
    pub fn create_auto(
        &self,
        target: impl Into<FileTarget>,
        flags: Option<FileSystemFlags>,
        heuristics: Heuristics,
        buf_settings: Option<BufferSettings>,
        sync_open: bool,
    ) -> Result<AutoStream> {
        let target = target.into();
        if matches!(&target, FileTarget::Name(name) if name.is_empty()) {
            return Err(Error::InvalidParameter);
        }
        heuristics.validate()?;
        let task = self.create_task(
            target,
            flags,
            OpenMode::Read,
            sync_open,
            Some((heuristics, buf_settings)),
        )?;
        Ok(AutoStream { task })
    }

    pub(crate) fn shared(&self) -> &Arc<MgrShared> {
        &self.shared
    }

    /// The routing common to both stream kinds: resolve, locate the device,
    /// attach a task, wire the descriptor or the deferred-open record.
    fn create_task(
        &self,
        target: FileTarget,
        mut flags: Option<FileSystemFlags>,
        open_mode: OpenMode,
        sync_open: bool,
        auto: Option<(Heuristics, Option<BufferSettings>)>,
    ) -> Result<Arc<StmTask>> {
        let resolver = self.shared.resolver.read().clone();
        let Some(resolver) = resolver else {
            debug_assert!(false, "file location resolver was not set on the stream manager");
            return Err(Error::Fail);
        };

        let is_automatic = auto.is_some();
        if let Some(flags) = &mut flags {
            flags.is_automatic_stream = is_automatic;
        }

        let mut sync = sync_open;
        let desc = match resolver.open(&target, open_mode, flags.as_ref(), &mut sync) {
            Ok(desc) => desc,
            Err(err) => {
                // Language-specific banks routinely miss during language
                // fallback; stay quiet for those
                let quiet = !is_automatic
                    && err == Error::FileNotFound
                    && flags.map(|flags| flags.is_language_bank()).unwrap_or(false);
                if !quiet {
                    match err {
                        Error::FileNotFound => error!("file not found: {target}"),
                        _ => error!("cannot open file: {target}"),
                    }
                }
                return Err(err);
            }
        };
        // The resolver may downgrade a requested-async open to sync, never
        // the other way around
        debug_assert!(sync || !sync_open, "resolver cannot defer a synchronous open");

        let device: Arc<DeviceShared> = {
            let devices = self.shared.devices.lock();
            let device = devices
                .get(desc.device_id.index())
                .and_then(Option::as_ref);
            match device {
                Some(device) => Arc::clone(device.shared()),
                None => {
                    debug_assert!(false, "resolver returned an unknown device ID");
                    return Err(Error::Fail);
                }
            }
        };

        // Pool already bone dry: force one cleanup round before giving up
        let priority = auto
            .as_ref()
            .map(|(heuristics, _)| heuristics.priority)
            .unwrap_or(DEFAULT_PRIORITY);
        if device.pool_exhausted() {
            self.shared.force_cleanup(Some(device.id), priority);
            if device.pool_exhausted() && !device.has_reclaimable() {
                if sync {
                    let _ = device.hook.close(desc);
                }
                return Err(Error::InsufficientMemory);
            }
        }

        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let task = match auto {
            Some((heuristics, buf_settings)) => {
                device.create_auto(stream_id, target.clone(), heuristics, buf_settings)
            }
            None => device.create_std(stream_id, target.clone(), open_mode),
        };
        let task = match task {
            Ok(task) => task,
            Err(err) => {
                // The descriptor was opened for a task that never existed
                if sync {
                    let _ = device.hook.close(desc);
                }
                return Err(err);
            }
        };

        if sync {
            task.set_file_open(desc);
        } else {
            task.set_deferred_open(OpenRecord {
                target,
                flags,
                open_mode,
            });
        }
        Ok(task)
    }
}

impl Drop for StreamMgr {
    fn drop(&mut self) {
        // Take the table apart without holding its lock: joining a worker
        // that is mid-broadcast would deadlock otherwise
        let drained: Vec<Option<Device>> = {
            let mut devices = self.shared.devices.lock();
            devices.drain(..).collect()
        };
        drop(drained);
        *self.shared.resolver.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hook::{FileDesc, MockIoHook},
        settings::SchedulerFlags,
    };

    /// Function-pointer resolver double.
    type OpenFn = fn(&FileTarget, OpenMode, Option<&FileSystemFlags>, &mut bool) -> Result<FileDesc>;

    struct StubResolver(OpenFn);

    impl FileLocationResolver for StubResolver {
        fn open(
            &self,
            target: &FileTarget,
            open_mode: OpenMode,
            flags: Option<&FileSystemFlags>,
            sync_open: &mut bool,
        ) -> Result<FileDesc> {
            (self.0)(target, open_mode, flags, sync_open)
        }
    }

    fn tiny_settings() -> DeviceSettings {
        let mut settings = DeviceSettings::default();
        settings.io_memory_size = 8 * 2048;
        settings.granularity = 2048;
        settings.scheduler_flags = SchedulerFlags::BLOCKING;
        settings
    }

    #[test]
    fn test_device_slots_are_reused_first_empty() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        let first = mgr
            .create_device(tiny_settings(), Box::new(MockIoHook::new()))
            .unwrap();
        let second = mgr
            .create_device(tiny_settings(), Box::new(MockIoHook::new()))
            .unwrap();
        assert_eq!(0, first.raw());
        assert_eq!(1, second.raw());

        // Destroying the first device frees its slot for the next creation
        mgr.destroy_device(first).unwrap();
        let third = mgr
            .create_device(tiny_settings(), Box::new(MockIoHook::new()))
            .unwrap();
        assert_eq!(0, third.raw());
    }

    #[test]
    fn test_destroy_device_rejects_bad_ids() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        assert_eq!(
            Err(Error::InvalidParameter),
            mgr.destroy_device(DeviceId::new(4))
        );

        let id = mgr
            .create_device(tiny_settings(), Box::new(MockIoHook::new()))
            .unwrap();
        mgr.destroy_device(id).unwrap();
        assert_eq!(Err(Error::InvalidParameter), mgr.destroy_device(id));
    }

    #[test]
    fn test_create_device_rejects_invalid_settings() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        let mut settings = tiny_settings();
        settings.scheduler_flags = SchedulerFlags::empty();
        let result = mgr.create_device(settings, Box::new(MockIoHook::new()));
        assert_eq!(Err(Error::InvalidParameter), result.map(|_| ()));
    }

    #[test]
    fn test_create_std_rejects_empty_name() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        mgr.set_resolver(Arc::new(StubResolver(|_: &FileTarget, _, _, _: &mut bool| {
            Err(Error::Fail)
        })));
        let result = mgr.create_std("", None, OpenMode::Read, true);
        assert_eq!(Err(Error::InvalidParameter), result.map(|_| ()));
    }

    #[test]
    fn test_create_auto_rejects_bad_heuristics() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        mgr.set_resolver(Arc::new(StubResolver(|_: &FileTarget, _, _, _: &mut bool| {
            Err(Error::Fail)
        })));
        let heuristics = Heuristics {
            throughput: -2.0,
            ..Heuristics::default()
        };
        let result = mgr.create_auto("voice.wem", None, heuristics, None, true);
        assert_eq!(Err(Error::InvalidParameter), result.map(|_| ()));
    }

    #[test]
    fn test_resolver_failure_propagates_unchanged() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        mgr.set_resolver(Arc::new(StubResolver(|_: &FileTarget, _, _, _: &mut bool| {
            Err(Error::FileNotFound)
        })));

        let result = mgr.create_std("gone.wem", None, OpenMode::Read, true);
        assert_eq!(Err(Error::FileNotFound), result.map(|_| ()));
    }

    #[test]
    fn test_unknown_device_from_resolver_fails() {
        let mgr = StreamMgr::new(StreamMgrSettings::default()).unwrap();
        mgr.set_resolver(Arc::new(StubResolver(|_: &FileTarget, _, _, _: &mut bool| {
            Ok(FileDesc::new(DeviceId::new(9)))
        })));

        // No device 9 exists; routing fails without panicking in release
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mgr.create_std("lost.wem", None, OpenMode::Read, false)
        }));
        match result {
            Ok(created) => assert_eq!(Err(Error::Fail), created.map(|_| ())),
            // Debug builds trip the assertion instead
            Err(_) => {}
        }
    }
}
