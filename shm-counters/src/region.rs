//! Memory maps backing a counters store.
use core::ptr::NonNull;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::{Mmap, MmapRaw};

use crate::memory::MemoryView;

/// A shared mapping of a file or shared memory object.
///
/// The writer maps read-write, readers map read-only. The mapping is released when the region is
/// dropped. Views into it borrow the region, so none can outlive the unmap.
pub struct Region {
    map: Mapping,
}

enum Mapping {
    Writable(MmapRaw),
    ReadOnly(Mmap),
}

impl Region {
    /// Create a new file at `path` of `len` bytes and map it for writing.
    ///
    /// Fails if the file already exists. Every page is touched once, so the kernel allocates the
    /// whole backing store here and not on the hot path.
    pub fn create(path: &Path, len: usize, page_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let region = file
            .set_len(len as u64)
            .and_then(|()| Self::map_writable(&file, page_size));

        if let Err(err) = &region {
            tracing::debug!(path = %path.display(), %err, "removing partially created region");
            let _ = std::fs::remove_file(path);
        }

        region
    }

    /// Resize an already open descriptor, such as a memfd, to `len` bytes and map it for writing.
    ///
    /// Prior contents of the descriptor are discarded.
    pub fn create_in<F: AsRawFd>(fd: &F, len: usize, page_size: usize) -> io::Result<Self> {
        let len = libc::off_t::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;

        for size in [0, len] {
            if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Self::map_writable(fd, page_size)
    }

    /// Map an existing file read-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::open_in(&file)
    }

    /// Map an open descriptor read-only.
    pub fn open_in<F: AsRawFd>(fd: &F) -> io::Result<Self> {
        // Safety: the mapping is never handed out as a plain slice. All reads go through atomic
        // loads of `MemoryView`, which tolerate concurrent modification by the writer.
        let map = unsafe { Mmap::map(fd)? };
        tracing::debug!(len = map.len(), "mapped region read-only");

        Ok(Region {
            map: Mapping::ReadOnly(map),
        })
    }

    fn map_writable<F: AsRawFd>(fd: &F, page_size: usize) -> io::Result<Self> {
        let map = MmapRaw::map_raw(fd)?;
        let region = Region {
            map: Mapping::Writable(map),
        };

        let view = region.view();
        for offset in (0..view.len()).step_by(page_size.max(1)) {
            let byte = view.load_u8(offset, core::sync::atomic::Ordering::Relaxed);
            view.store_u8(offset, byte, core::sync::atomic::Ordering::Relaxed);
        }

        tracing::debug!(len = region.len(), page_size, "mapped region for writing");
        Ok(region)
    }

    pub fn len(&self) -> usize {
        match &self.map {
            Mapping::Writable(map) => map.len(),
            Mapping::ReadOnly(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::Writable(_))
    }

    /// The whole mapping.
    ///
    /// Stores through the view of a read-only region fault, so only the writer side may issue
    /// them.
    pub(crate) fn view(&self) -> MemoryView<'_> {
        let (ptr, len) = match &self.map {
            Mapping::Writable(map) => (map.as_mut_ptr(), map.len()),
            Mapping::ReadOnly(map) => (map.as_ptr() as *mut u8, map.len()),
        };

        match NonNull::new(ptr) {
            // Safety: the map is valid for `len` bytes for as long as `self` is borrowed, and the
            // file contents are initialized.
            Some(ptr) => unsafe { MemoryView::from_raw_parts(ptr, len) },
            None => unsafe { MemoryView::from_raw_parts(NonNull::dangling(), 0) },
        }
    }

    /// Unmap the region.
    pub fn close(self) {}
}

impl Drop for Region {
    fn drop(&mut self) {
        tracing::debug!(len = self.len(), writable = self.is_writable(), "unmapping region");
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Region;

    #[test]
    fn failed_create_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        assert!(Region::create(&path, usize::MAX, 4096).is_err());
        assert!(!path.exists());

        let region = Region::create(&path, 8192, 4096).unwrap();
        assert_eq!(region.len(), 8192);
        assert!(region.is_writable());
    }
}
