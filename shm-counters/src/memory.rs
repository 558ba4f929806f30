//! Bounds-checked atomic access into a span of shared bytes.
//!
//! This is the only place that turns byte offsets into addresses. Everything above it names
//! fields by offset constants from [`crate::layout`].
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// A window over shared memory, addressed by byte offsets.
///
/// Every access is an atomic operation on the underlying bytes. The memory may be concurrently
/// modified by another thread or by another process mapping the same file, so we never hand out a
/// plain reference to it. The ordering argument of each method selects the visibility contract:
///
/// * `Relaxed` is the _weak_ mode. Use it only for values no other party synchronizes on, or for
///   fields that are published later by a release store.
/// * `Acquire` loads pair with `Release` stores of the same field, also across processes.
/// * `SeqCst` is the fully ordered mode.
///
/// An access outside the window, or a misaligned one, is a programming error and panics.
#[derive(Clone, Copy)]
pub struct MemoryView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    region: PhantomData<&'a [AtomicU8]>,
}

// Safety: all access through the pointer is atomic.
unsafe impl Send for MemoryView<'_> {}
unsafe impl Sync for MemoryView<'_> {}

impl<'a> MemoryView<'a> {
    /// View a slice of atomic words as bytes.
    ///
    /// Useful to operate on heap memory with the same code paths that run on a memory map.
    pub fn from_words(words: &'a [AtomicU64]) -> Self {
        MemoryView {
            ptr: NonNull::from(words).cast::<u8>(),
            len: core::mem::size_of_val(words),
            region: PhantomData,
        }
    }

    /// # Safety
    ///
    /// Caller promises that `ptr` is valid for reads of `len` bytes for the lifetime `'a` and that
    /// the memory is initialized. If any store is issued through the view, the memory must also be
    /// writable. Other parties may only modify the memory through atomic operations.
    pub(crate) unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        MemoryView {
            ptr,
            len,
            region: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-window of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> MemoryView<'a> {
        self.check(offset, len);
        MemoryView {
            // Safety: in-bounds by the check above.
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
            region: PhantomData,
        }
    }

    pub fn load_u8(&self, offset: usize, order: Ordering) -> u8 {
        self.atomic::<AtomicU8>(offset).load(order)
    }

    pub fn store_u8(&self, offset: usize, value: u8, order: Ordering) {
        self.atomic::<AtomicU8>(offset).store(value, order)
    }

    pub fn load_u32(&self, offset: usize, order: Ordering) -> u32 {
        self.atomic::<AtomicU32>(offset).load(order)
    }

    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) {
        self.atomic::<AtomicU32>(offset).store(value, order)
    }

    pub fn load_u64(&self, offset: usize, order: Ordering) -> u64 {
        self.atomic::<AtomicU64>(offset).load(order)
    }

    pub fn store_u64(&self, offset: usize, value: u64, order: Ordering) {
        self.atomic::<AtomicU64>(offset).store(value, order)
    }

    /// Replace `current` with `new`, with acquire-release semantics on success.
    ///
    /// Returns the value found in memory as `Err` if it was not `current`.
    pub fn compare_exchange_u64(&self, offset: usize, current: u64, new: u64) -> Result<u64, u64> {
        self.atomic::<AtomicU64>(offset)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn load_i64(&self, offset: usize, order: Ordering) -> i64 {
        self.atomic::<AtomicI64>(offset).load(order)
    }

    pub fn store_i64(&self, offset: usize, value: i64, order: Ordering) {
        self.atomic::<AtomicI64>(offset).store(value, order)
    }

    /// Wrapping add, returns the previous value.
    pub fn fetch_add_i64(&self, offset: usize, delta: i64, order: Ordering) -> i64 {
        self.atomic::<AtomicI64>(offset).fetch_add(delta, order)
    }

    pub fn swap_i64(&self, offset: usize, value: i64, order: Ordering) -> i64 {
        self.atomic::<AtomicI64>(offset).swap(value, order)
    }

    pub fn compare_exchange_i64(&self, offset: usize, current: i64, new: i64) -> Result<i64, i64> {
        self.atomic::<AtomicI64>(offset)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Copy bytes into the window with relaxed byte stores.
    ///
    /// The bytes are only meaningful to another party after a later release store that it
    /// acquires.
    pub fn copy_from_slice(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        for (idx, &byte) in data.iter().enumerate() {
            self.byte(offset + idx).store(byte, Ordering::Relaxed);
        }
    }

    /// Copy bytes out of the window with relaxed byte loads.
    pub fn copy_to_slice(&self, offset: usize, data: &mut [u8]) {
        self.check(offset, data.len());
        for (idx, byte) in data.iter_mut().enumerate() {
            *byte = self.byte(offset + idx).load(Ordering::Relaxed);
        }
    }

    fn check(&self, offset: usize, size: usize) {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => {}
            _ => panic!(
                "access of {size} bytes at offset {offset} is out of bounds of a view of {} bytes",
                self.len
            ),
        }
    }

    fn byte(&self, offset: usize) -> &'a AtomicU8 {
        // Safety: callers checked the whole range; `AtomicU8` has no alignment requirement.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU8) }
    }

    /// Resolve an atomic of type `T` at `offset`. Only instantiated with atomic integer types.
    fn atomic<T>(&self, offset: usize) -> &'a T {
        let size = core::mem::size_of::<T>();
        self.check(offset, size);

        // Safety: in-bounds by the check above.
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert!(
            ptr as usize % core::mem::align_of::<T>() == 0,
            "misaligned access of {size} bytes at offset {offset}"
        );

        // Safety: in bounds and aligned. Atomic integers are valid for any initialized bit
        // pattern and the mapping is initialized (zero-filled on first touch).
        unsafe { &*(ptr as *const T) }
    }
}

impl core::fmt::Debug for MemoryView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryView;
    use core::sync::atomic::{AtomicU64, Ordering};

    fn words(n: usize) -> Vec<AtomicU64> {
        (0..n).map(|_| AtomicU64::new(0)).collect()
    }

    #[test]
    fn integers_at_offsets() {
        let backing = words(4);
        let view = MemoryView::from_words(&backing);
        assert_eq!(view.len(), 32);

        view.store_u32(4, 0xdead_beef, Ordering::Release);
        view.store_u64(8, u64::MAX - 1, Ordering::SeqCst);
        view.store_i64(16, -7, Ordering::Relaxed);

        assert_eq!(view.load_u32(4, Ordering::Acquire), 0xdead_beef);
        assert_eq!(view.load_u32(0, Ordering::Acquire), 0);
        assert_eq!(view.load_u64(8, Ordering::SeqCst), u64::MAX - 1);
        assert_eq!(view.load_i64(16, Ordering::Relaxed), -7);
    }

    #[test]
    fn read_modify_write() {
        let backing = words(2);
        let view = MemoryView::from_words(&backing);

        assert_eq!(view.fetch_add_i64(8, 5, Ordering::AcqRel), 0);
        assert_eq!(view.fetch_add_i64(8, -2, Ordering::AcqRel), 5);
        assert_eq!(view.swap_i64(8, 40, Ordering::AcqRel), 3);
        assert_eq!(view.compare_exchange_i64(8, 41, 1), Err(40));
        assert_eq!(view.compare_exchange_i64(8, 40, 1), Ok(40));
        assert_eq!(view.load_i64(8, Ordering::Acquire), 1);

        assert_eq!(view.compare_exchange_u64(0, 0, 0x102), Ok(0));
        assert_eq!(view.compare_exchange_u64(0, 0, 0x103), Err(0x102));
    }

    #[test]
    fn bytes_and_slices() {
        let backing = words(4);
        let view = MemoryView::from_words(&backing);
        let inner = view.slice(8, 16);

        inner.copy_from_slice(3, b"counter");
        let mut out = [0u8; 7];
        view.copy_to_slice(11, &mut out);
        assert_eq!(&out, b"counter");

        inner.store_u64(8, 9, Ordering::Relaxed);
        assert_eq!(view.load_u64(16, Ordering::Relaxed), 9);
        assert_eq!(view.load_u8(11, Ordering::Relaxed), b'c');
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_is_fatal() {
        let backing = words(1);
        let view = MemoryView::from_words(&backing);
        view.load_u64(4, Ordering::Relaxed);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn slice_out_of_bounds_is_fatal() {
        let backing = words(2);
        let view = MemoryView::from_words(&backing);
        view.slice(8, 9);
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn misaligned_is_fatal() {
        let backing = words(2);
        let view = MemoryView::from_words(&backing);
        view.load_u64(4, Ordering::Relaxed);
    }
}
