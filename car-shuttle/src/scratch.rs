use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Take},
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

/// A temp file used as a reverse-filled arena for CAR blocks.
///
/// The file's logical capacity is fixed at creation. `offset` is the low
/// water mark: bytes in `[offset, capacity)` are live, space in
/// `[0, offset)` is free. [`Scratch::try_take`] moves the mark down and
/// callers then write their reservation with [`Scratch::write_all_at`] or
/// [`Scratch::copy_from_file`]. Filling from the high end lets the CAR
/// envelope, which depends on the root CID computed last, be prepended at
/// upload time without relocating payload.
///
/// The backing file is created with mode 0o600 and unlinked on drop.
#[derive(Debug)]
pub struct Scratch {
    file: File,
    path: PathBuf,
    capacity: u64,
    offset: u64,
}

impl Scratch {
    /// Create (or truncate) the scratch file at `path`. The file stays
    /// sparse; `capacity` only positions the initial water mark.
    pub fn create(path: &Path, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_owned(),
            capacity,
            offset: capacity,
        })
    }

    /// The fixed logical capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The current low water mark.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Free space below the water mark.
    pub fn headroom(&self) -> u64 {
        self.offset
    }

    /// Bytes of live block data, `[offset, capacity)`.
    pub fn live_len(&self) -> u64 {
        self.capacity - self.offset
    }

    /// Reserve `size` bytes, returning the offset the caller must write
    /// them at. `None` means the chunk is full and must be rotated out.
    pub fn try_take(&mut self, size: u64) -> Option<u64> {
        if self.offset < size {
            return None;
        }
        self.offset -= size;
        Some(self.offset)
    }

    /// Write all of `buf` at the absolute position `offset`, retrying
    /// partial writes.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Splice `len` bytes from `src` at `*src_off` into this file at
    /// `dst_off` without routing them through user space.
    ///
    /// The kernel advances `src_off` in place; neither file's seek cursor
    /// moves. Short copies are retried until the full range is in place.
    #[cfg(target_os = "linux")]
    pub fn copy_from_file(
        &self,
        src: &File,
        src_off: &mut i64,
        dst_off: u64,
        len: u64,
    ) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let mut dst_off = dst_off as i64;
        let mut remaining = len as usize;
        while remaining > 0 {
            let copied = unsafe {
                libc::copy_file_range(
                    src.as_raw_fd(),
                    src_off,
                    self.file.as_raw_fd(),
                    &mut dst_off,
                    remaining,
                    0,
                )
            };
            if copied < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if copied == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source file ended before the requested range was copied",
                ));
            }
            remaining -= copied as usize;
        }
        Ok(())
    }

    /// Buffered fallback for platforms without an in-kernel range copy.
    /// Same contract as the Linux version, one user-space hop slower.
    #[cfg(not(target_os = "linux"))]
    pub fn copy_from_file(
        &self,
        src: &File,
        src_off: &mut i64,
        dst_off: u64,
        len: u64,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; 128 * 1024];
        let mut dst_off = dst_off;
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = src.read_at(&mut buf[..want], *src_off as u64)?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source file ended before the requested range was copied",
                ));
            }
            self.file.write_all_at(&buf[..got], dst_off)?;
            *src_off += got as i64;
            dst_off += got as u64;
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Drop all live data and move the water mark back to the top.
    pub fn reset(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.offset = self.capacity;
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// A reader over the live range `[offset, capacity)`, on its own
    /// duplicated handle so the arena's cursor state is untouched.
    pub fn live_reader(&self) -> io::Result<Take<File>> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(self.offset))?;
        Ok(reader.take(self.live_len()))
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    fn scratch(capacity: u64) -> (tempfile::TempDir, Scratch) {
        let dir = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(&dir.path().join(".temp.A.car"), capacity).unwrap();
        (dir, scratch)
    }

    #[test]
    fn take_moves_the_water_mark_down() -> TestResult {
        let (_dir, mut scratch) = scratch(100);
        assert_eq!(scratch.try_take(30), Some(70));
        assert_eq!(scratch.try_take(50), Some(20));
        assert_eq!(scratch.headroom(), 20);
        assert_eq!(scratch.live_len(), 80);
        // no room left for 21 bytes
        assert_eq!(scratch.try_take(21), None);
        assert_eq!(scratch.try_take(20), Some(0));
        Ok(())
    }

    #[test]
    fn live_reader_sees_reserved_writes() -> TestResult {
        let (_dir, mut scratch) = scratch(64);
        let off = scratch.try_take(5).unwrap();
        scratch.write_all_at(b"hello", off)?;

        let mut live = Vec::new();
        scratch.live_reader()?.read_to_end(&mut live)?;
        assert_eq!(live, b"hello");
        Ok(())
    }

    #[test]
    fn copy_from_file_advances_the_source_offset_exactly_once() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src_path, &payload)?;
        let src = File::open(&src_path)?;

        let mut scratch = Scratch::create(&dir.path().join(".temp.B.car"), 200_000)?;
        let mut src_off: i64 = 0;

        // two back-to-back ranges sharing the offset pointer
        let first = scratch.try_take(60_000).unwrap();
        scratch.copy_from_file(&src, &mut src_off, first, 60_000)?;
        assert_eq!(src_off, 60_000);

        let second = scratch.try_take(40_000).unwrap();
        scratch.copy_from_file(&src, &mut src_off, second, 40_000)?;
        assert_eq!(src_off, payload.len() as i64);

        // the second range sits below the first in the arena
        let mut live = Vec::new();
        scratch.live_reader()?.read_to_end(&mut live)?;
        assert_eq!(&live[..40_000], &payload[60_000..]);
        assert_eq!(&live[40_000..], &payload[..60_000]);
        Ok(())
    }

    #[test]
    fn copy_from_file_leaves_seek_cursors_alone() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src");
        fs::write(&src_path, vec![7u8; 4096])?;
        let mut src = File::open(&src_path)?;

        let mut probe = [0u8; 4];
        src.read_exact(&mut probe)?;

        let mut scratch = Scratch::create(&dir.path().join(".temp.A.car"), 8192)?;
        let off = scratch.try_take(4096).unwrap();
        let mut src_off: i64 = 0;
        scratch.copy_from_file(&src, &mut src_off, off, 4096)?;

        // the splice must not disturb the read cursor
        assert_eq!(src.stream_position()?, 4);
        Ok(())
    }

    #[test]
    fn reset_truncates_and_restores_headroom() -> TestResult {
        let (_dir, mut scratch) = scratch(64);
        let off = scratch.try_take(10).unwrap();
        scratch.write_all_at(b"0123456789", off)?;
        scratch.reset()?;
        assert_eq!(scratch.headroom(), 64);
        assert_eq!(scratch.live_len(), 0);
        assert_eq!(scratch.live_reader()?.bytes().count(), 0);
        Ok(())
    }

    #[test]
    fn dropping_removes_the_backing_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".temp.A.car");
        let scratch = Scratch::create(&path, 16)?;
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
        Ok(())
    }
}
