//! fs
//!
//! Reference low-level hook over `std::fs`. Resolves names relative to a
//! root directory and IDs to `<id>.bin` in that directory. Good enough for
//! tools, demos and tests; console backends supply their own [`IoHook`].

use crate::{
    error::{Error, Result},
    hook::{DeviceId, FileDesc, IoHook, OpenMode, OpenRecord},
    resolver::FileTarget,
};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};
use tracing::debug;

/// A hook that serves one directory tree through regular file I/O.
pub struct FsHook {
    device_id: DeviceId,
    root: PathBuf,
}

impl FsHook {
    pub fn new(device_id: DeviceId, root: impl Into<PathBuf>) -> Self {
        Self {
            device_id,
            root: root.into(),
        }
    }

    fn path_of(&self, target: &FileTarget) -> PathBuf {
        match target {
            FileTarget::Name(name) => self.root.join(name),
            FileTarget::Id(id) => self.root.join(format!("{id}.bin")),
        }
    }

    fn file_of<'desc>(&self, desc: &'desc mut FileDesc) -> Result<&'desc mut File> {
        desc.handle
            .as_mut()
            .and_then(|handle| handle.downcast_mut::<File>())
            .ok_or(Error::InvalidParameter)
    }
}

impl IoHook for FsHook {
    fn open(&self, record: &OpenRecord) -> Result<FileDesc> {
        let path = self.path_of(&record.target);
        let file = match record.open_mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&path),
            OpenMode::Write => OpenOptions::new().write(true).create(true).open(&path),
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path),
        }?;
        let file_size = file.metadata()?.len();
        debug!(path = %path.display(), file_size, "opened");
        Ok(FileDesc {
            device_id: self.device_id,
            file_size,
            sector_offset: 0,
            block_size: 0,
            handle: Some(Box::new(file)),
        })
    }

    fn close(&self, desc: FileDesc) -> Result<()> {
        // Dropping the boxed File releases the OS handle
        drop(desc);
        Ok(())
    }

    fn read(&self, desc: &mut FileDesc, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let base = desc.sector_offset;
        let file = self.file_of(desc)?;
        file.seek(SeekFrom::Start(base + offset))?;
        let mut filled = 0;
        while filled < dst.len() {
            let count = file.read(&mut dst[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled)
    }

    fn write(&self, desc: &mut FileDesc, offset: u64, src: &[u8]) -> Result<usize> {
        let base = desc.sector_offset;
        let file = self.file_of(desc)?;
        file.seek(SeekFrom::Start(base + offset))?;
        file.write_all(src)?;
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rill-fs-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(name: &str, open_mode: OpenMode) -> OpenRecord {
        OpenRecord {
            target: FileTarget::from(name),
            flags: None,
            open_mode,
        }
    }

    #[test]
    fn test_fs_hook_round_trip() {
        let dir = scratch_dir("roundtrip");
        let hook = FsHook::new(DeviceId::new(0), &dir);

        // Write a file through the hook
        let mut desc = hook.open(&record("take.pcm", OpenMode::ReadWrite)).unwrap();
        assert_eq!(13, hook.write(&mut desc, 0, b"hello granule").unwrap());
        hook.close(desc).unwrap();

        // Read it back at an offset
        let mut desc = hook.open(&record("take.pcm", OpenMode::Read)).unwrap();
        assert_eq!(13, desc.file_size);
        let mut buf = [0u8; 7];
        assert_eq!(7, hook.read(&mut desc, 6, &mut buf).unwrap());
        assert_eq!(b"granule", &buf);
        hook.close(desc).unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_fs_hook_missing_file() {
        let dir = scratch_dir("missing");
        let hook = FsHook::new(DeviceId::new(0), &dir);
        let result = hook.open(&record("no-such.pcm", OpenMode::Read));
        assert_eq!(Err(Error::FileNotFound), result.map(|_| ()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_fs_hook_short_read_at_eof() {
        let dir = scratch_dir("eof");
        std::fs::write(dir.join("short.pcm"), b"0123456789").unwrap();
        let hook = FsHook::new(DeviceId::new(0), &dir);

        let mut desc = hook.open(&record("short.pcm", OpenMode::Read)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(10, hook.read(&mut desc, 0, &mut buf).unwrap());
        assert_eq!(0, hook.read(&mut desc, 10, &mut buf).unwrap());
        hook.close(desc).unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }
}
