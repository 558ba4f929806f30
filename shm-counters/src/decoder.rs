//! Read-only walk over a counters region.
//!
//! Readers never lock. A record is only reported if the packed id/status word of its slot is
//! unchanged after its label and value were read, otherwise the writer reused the slot while we
//! were reading and the record is skipped. A single pass is thus a consistent view of every
//! reported counter, but not an atomic snapshot of the whole region.
use core::ops::ControlFlow;
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, FormatError, Result};
use crate::layout::{
    IdStatus, Layout, SlotStatus, HEADER_LEN, HEADER_METADATA_LENGTH_OFFSET, HEADER_PID_OFFSET,
    HEADER_START_TIME_OFFSET, HEADER_STATICS_LENGTH_OFFSET, HEADER_VALUES_LENGTH_OFFSET,
    HEADER_VERSION_OFFSET, METADATA_ID_STATUS_OFFSET, METADATA_LABEL_CAPACITY,
    METADATA_LABEL_LENGTH_OFFSET, METADATA_LABEL_OFFSET, METADATA_RECORD_LEN, STATICS_COUNT_OFFSET,
    STATICS_RECORDS_OFFSET, STATIC_LABEL_LENGTH_OFFSET, STATIC_LABEL_OFFSET,
    STATIC_VALUE_LENGTH_OFFSET, VALUE_OFFSET, VALUE_RECORD_LEN, VERSION,
};
use crate::memory::MemoryView;

#[derive(Clone, Copy, Debug)]
pub struct Decoder<'a> {
    header: MemoryView<'a>,
    statics: MemoryView<'a>,
    metadata: MemoryView<'a>,
    values: MemoryView<'a>,
    layout: Layout,
}

/// One live counter, as observed by a reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterRecord {
    pub id: u64,
    pub label: String,
    pub value: i64,
}

impl<'a> Decoder<'a> {
    /// Validate the region and split it into its blocks.
    ///
    /// Checks the version first, then that the block lengths of the header fit the region and
    /// that every static record lies within the statics block.
    pub fn prepare(region: MemoryView<'a>) -> Result<Self, FormatError> {
        if region.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                needed: HEADER_LEN,
                len: region.len(),
            });
        }

        let header = region.slice(0, HEADER_LEN);
        match header.load_u32(HEADER_VERSION_OFFSET, Ordering::Acquire) {
            0 => return Err(FormatError::NotInitialized),
            VERSION => {}
            other => return Err(FormatError::UnsupportedVersion(other)),
        }

        let layout = Layout::from_lengths(
            header.load_u32(HEADER_STATICS_LENGTH_OFFSET, Ordering::Relaxed),
            header.load_u32(HEADER_METADATA_LENGTH_OFFSET, Ordering::Relaxed),
            header.load_u32(HEADER_VALUES_LENGTH_OFFSET, Ordering::Relaxed),
        )?;

        if layout.end() > region.len() {
            return Err(FormatError::Truncated {
                needed: layout.end(),
                len: region.len(),
            });
        }

        let decoder = Decoder::new(region, &layout);
        decoder.walk_statics(|_, _| ControlFlow::Continue(()))?;
        Ok(decoder)
    }

    /// Split a region whose layout is already known, without validation.
    ///
    /// Panics if the region is shorter than the layout.
    pub fn new(region: MemoryView<'a>, layout: &Layout) -> Self {
        Decoder {
            header: region.slice(0, HEADER_LEN),
            statics: region.slice(layout.statics_offset(), layout.statics_len()),
            metadata: region.slice(layout.metadata_offset(), layout.metadata_len()),
            values: region.slice(layout.values_offset(), layout.values_len()),
            layout: *layout,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn version(&self) -> u32 {
        self.header
            .load_u32(HEADER_VERSION_OFFSET, Ordering::Acquire)
    }

    /// Process id of the writer.
    pub fn pid(&self) -> u64 {
        self.header.load_u64(HEADER_PID_OFFSET, Ordering::Acquire)
    }

    /// Creation time of the region, in milliseconds since the Unix epoch.
    pub fn start_time_millis(&self) -> u64 {
        self.header
            .load_u64(HEADER_START_TIME_OFFSET, Ordering::Acquire)
    }

    /// Collect all static label/value pairs, in stored order.
    pub fn statics(&self, into: &mut impl Extend<(String, String)>) {
        let walked = self.walk_statics(|label, value| {
            into.extend(Some((lossy(label), lossy(value))));
            ControlFlow::Continue(())
        });

        if let Err(err) = walked {
            tracing::warn!(%err, "stopped reading statics");
        }
    }

    /// The value of the static named `label`.
    pub fn static_value(&self, label: &str) -> Option<String> {
        let mut found = None;
        let walked = self.walk_statics(|candidate, value| {
            if candidate == label.as_bytes() {
                found = Some(lossy(value));
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        if let Err(err) = walked {
            tracing::warn!(%err, "stopped reading statics");
        }

        found
    }

    /// Collect every counter that is allocated and stays unchanged while it is read.
    ///
    /// The scan ends at the first slot that was never used.
    pub fn counters(&self, into: &mut impl Extend<CounterRecord>) {
        self.counters_observed(into, &mut |_| {})
    }

    /// Enumeration with a hook that runs between reading the data of `slot` and validating it.
    pub(crate) fn counters_observed(
        &self,
        into: &mut impl Extend<CounterRecord>,
        before_check: &mut dyn FnMut(usize),
    ) {
        let mut label = Vec::with_capacity(METADATA_LABEL_CAPACITY);

        for slot in 0..self.layout.slots() {
            let seen = self.id_status(slot);
            match seen.status() {
                Some(SlotStatus::NotUsed) => break,
                Some(SlotStatus::Allocated) => {
                    let read = self.read_allocated(slot, seen, Some(&mut label), before_check);
                    if let Some(value) = read {
                        into.extend(Some(CounterRecord {
                            id: seen.id(),
                            label: lossy(&label),
                            value,
                        }));
                    }
                }
                _ => {}
            }
        }
    }

    pub fn counter_value(&self, id: u64) -> Result<i64> {
        self.lookup(id, None, &mut |_| {})
    }

    pub fn counter_label(&self, id: u64) -> Result<String> {
        let mut label = Vec::with_capacity(METADATA_LABEL_CAPACITY);
        self.lookup(id, Some(&mut label), &mut |_| {})?;
        Ok(lossy(&label))
    }

    /// Lookup of `id` with a hook that runs before each validation, see [`Self::counters_observed`].
    pub(crate) fn lookup(
        &self,
        id: u64,
        mut label: Option<&mut Vec<u8>>,
        before_check: &mut dyn FnMut(usize),
    ) -> Result<i64> {
        let mut slot = 0;

        while slot < self.layout.slots() {
            let seen = self.id_status(slot);
            match seen.status() {
                Some(SlotStatus::NotUsed) => break,
                _ if seen.id() != id => slot += 1,
                Some(SlotStatus::Allocated) => {
                    match self.read_allocated(slot, seen, label.as_deref_mut(), before_check) {
                        Some(value) => return Ok(value),
                        // The slot changed while reading. Its new state decides.
                        None => continue,
                    }
                }
                _ => break,
            }
        }

        Err(Error::NotFound { id })
    }

    fn id_status(&self, slot: usize) -> IdStatus {
        let offset = slot * METADATA_RECORD_LEN + METADATA_ID_STATUS_OFFSET;
        IdStatus(self.metadata.load_u64(offset, Ordering::Acquire))
    }

    /// Read the value, and the label if requested, of a slot seen as `seen`.
    ///
    /// Returns `None` if the id/status word changed in the meantime.
    fn read_allocated(
        &self,
        slot: usize,
        seen: IdStatus,
        label: Option<&mut Vec<u8>>,
        before_check: &mut dyn FnMut(usize),
    ) -> Option<i64> {
        let record = slot * METADATA_RECORD_LEN;

        if let Some(label) = label {
            let len = self
                .metadata
                .load_u32(record + METADATA_LABEL_LENGTH_OFFSET, Ordering::Relaxed)
                as usize;
            label.resize(len.min(METADATA_LABEL_CAPACITY), 0);
            self.metadata
                .copy_to_slice(record + METADATA_LABEL_OFFSET, label);
        }

        let value = self.values.load_i64(
            slot * VALUE_RECORD_LEN + VALUE_OFFSET,
            Ordering::Relaxed,
        );

        before_check(slot);

        // Pairs with the release fence of a writer reclaiming the slot: if we read any of its
        // data, the check below sees its claim.
        fence(Ordering::Acquire);
        (self.id_status(slot) == seen).then_some(value)
    }

    /// Visit every static record until `visit` breaks.
    fn walk_statics(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), FormatError> {
        let count = self
            .statics
            .load_u32(STATICS_COUNT_OFFSET, Ordering::Acquire);

        let mut label = Vec::new();
        let mut value = Vec::new();
        let mut offset = STATICS_RECORDS_OFFSET;

        for _ in 0..count {
            let (label_len, value_len, next) = self
                .static_bounds(offset)
                .ok_or(FormatError::CorruptStatics { offset })?;

            let label_at = offset + STATIC_LABEL_OFFSET;
            label.resize(label_len, 0);
            value.resize(value_len, 0);
            self.statics.copy_to_slice(label_at, &mut label);
            self.statics.copy_to_slice(label_at + label_len, &mut value);

            if visit(&label, &value).is_break() {
                break;
            }

            offset = next;
        }

        Ok(())
    }

    /// Label length, value length and end of the static record at `offset`, if it fits.
    fn static_bounds(&self, offset: usize) -> Option<(usize, usize, usize)> {
        let fields_end = offset.checked_add(STATIC_LABEL_OFFSET)?;
        if fields_end > self.statics.len() {
            return None;
        }

        let label_len = self
            .statics
            .load_u32(offset + STATIC_LABEL_LENGTH_OFFSET, Ordering::Relaxed)
            as usize;
        let value_len = self
            .statics
            .load_u32(offset + STATIC_VALUE_LENGTH_OFFSET, Ordering::Relaxed)
            as usize;

        let end = fields_end.checked_add(label_len)?.checked_add(value_len)?;
        let next = end.checked_add(3)? & !3;

        (next <= self.statics.len()).then_some((label_len, value_len, next))
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
