use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::encoder::{stored_label, Encoder};
use crate::error::Result;
use crate::layout::{Layout, Statics};
use crate::memory::MemoryView;
use crate::region::Region;

/// The writer of a counters region.
///
/// Exactly one store exists per region. It may be shared between threads, which add and free
/// counters concurrently without any lock.
pub struct CounterStore {
    region: Region,
    layout: Layout,
    ids: AtomicU64,
    path: Option<PathBuf>,
}

/// A live counter.
///
/// The handle borrows its store, so it can not be used after the store is closed. Dropping or
/// closing a handle keeps the counter allocated, use [`Counter::free`] to release its slot.
pub struct Counter<'store> {
    store: &'store CounterStore,
    id: u64,
    label: String,
    values: MemoryView<'store>,
    offset: usize,
    closed: AtomicBool,
}

impl CounterStore {
    /// Create the counters file `path` with room for `max_counters` counters.
    ///
    /// Fails if the file exists.
    pub fn create(path: impl AsRef<Path>, statics: &Statics, max_counters: usize) -> Result<Self> {
        Self::create_with(path, statics, max_counters, &Config::default())
    }

    pub fn create_with(
        path: impl AsRef<Path>,
        statics: &Statics,
        max_counters: usize,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let layout = Layout::new(statics, max_counters)?;
        let region = Region::create(path, layout.region_len(config.page_size), config.page_size)?;

        let store = Self::initialize(region, layout, statics, Some(path.to_path_buf()))?;
        tracing::debug!(path = %path.display(), max_counters, "created counters store");
        Ok(store)
    }

    /// Create the counters file called `name` in the configured directory.
    ///
    /// Missing parent directories are created.
    pub fn create_named(
        name: impl AsRef<Path>,
        statics: &Statics,
        max_counters: usize,
        config: &Config,
    ) -> Result<Self> {
        let path = config.path_for(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Self::create_with(&path, statics, max_counters, config)
    }

    /// Create a store in an open descriptor, such as a memory file, replacing its contents.
    pub fn create_in<F: AsRawFd>(
        fd: &F,
        statics: &Statics,
        max_counters: usize,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(statics, max_counters)?;
        let region = Region::create_in(fd, layout.region_len(config.page_size), config.page_size)?;

        let store = Self::initialize(region, layout, statics, None)?;
        tracing::debug!(max_counters, "created counters store in descriptor");
        Ok(store)
    }

    fn initialize(
        region: Region,
        layout: Layout,
        statics: &Statics,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_millis() as u64);

        Encoder::new(region.view(), &layout).initialize(
            u64::from(std::process::id()),
            start_time_millis,
            statics,
        )?;

        Ok(CounterStore {
            region,
            layout,
            ids: AtomicU64::new(0),
            path,
        })
    }

    /// The file backing the store, if it was created from a path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Maximum number of simultaneously allocated counters.
    pub fn capacity(&self) -> usize {
        self.layout.slots()
    }

    fn encoder(&self) -> Encoder<'_> {
        Encoder::new(self.region.view(), &self.layout)
    }

    /// Allocate a counter with a fresh id.
    ///
    /// Labels longer than the label buffer are truncated. Fails with
    /// [`Error::CapacityExceeded`](crate::Error::CapacityExceeded) if all slots are taken.
    pub fn add_counter(&self, label: &str, initial: i64) -> Result<Counter<'_>> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let encoder = self.encoder();
        let allocation = encoder.allocate(id, label, initial)?;

        Ok(Counter {
            store: self,
            id,
            label: stored_label(label).to_owned(),
            values: encoder.values(),
            offset: allocation.value_offset,
            closed: AtomicBool::new(false),
        })
    }

    /// Free the counter, releasing its slot for reuse.
    ///
    /// Returns `false` if the counter was not allocated anymore, or if it belongs to another store.
    /// In the latter case the counter stays allocated in its own store.
    pub fn free(&self, counter: Counter<'_>) -> bool {
        if !core::ptr::eq(counter.store, self) {
            tracing::warn!(id = counter.id, "counter of another store not freed");
            return false;
        }

        self.encoder().free(counter.id)
    }

    /// Unmap the region. Readers keep their own mappings of the file.
    pub fn close(self) {
        tracing::debug!(path = ?self.path, "closing counters store");
    }
}

impl Counter<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The label as stored, possibly truncated.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self) -> i64 {
        self.values.load_i64(self.offset, Ordering::Acquire)
    }

    /// Read without ordering against other memory accesses.
    pub fn get_weak(&self) -> i64 {
        self.values.load_i64(self.offset, Ordering::Relaxed)
    }

    pub fn set(&self, value: i64) {
        self.values.store_i64(self.offset, value, Ordering::Release)
    }

    /// Write without ordering against other memory accesses.
    ///
    /// Not suitable to publish a value another party synchronizes on.
    pub fn set_weak(&self, value: i64) {
        self.values.store_i64(self.offset, value, Ordering::Relaxed)
    }

    /// Add `delta`, wrapping on overflow. Returns the new value.
    pub fn increment(&self, delta: i64) -> i64 {
        self.fetch_add(delta).wrapping_add(delta)
    }

    /// Add `delta`, wrapping on overflow. Returns the previous value.
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.values.fetch_add_i64(self.offset, delta, Ordering::AcqRel)
    }

    pub fn swap(&self, value: i64) -> i64 {
        self.values.swap_i64(self.offset, value, Ordering::AcqRel)
    }

    /// Replace the value if it is `current`. Returns the value found as `Err` otherwise.
    pub fn compare_exchange(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.values.compare_exchange_i64(self.offset, current, new)
    }

    /// Mark the handle closed. The counter stays allocated and visible to readers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the slot of this counter. Readers stop listing it.
    pub fn free(self) -> bool {
        let store = self.store;
        store.free(self)
    }
}

impl core::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CounterStore")
            .field("path", &self.path)
            .field("capacity", &self.capacity())
            .field("region", &self.region)
            .finish()
    }
}

impl core::fmt::Debug for Counter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("value", &self.get_weak())
            .field("closed", &self.is_closed())
            .finish()
    }
}
