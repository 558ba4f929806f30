//! Writer side of the layout: header, statics and the slot state machine.
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result, ValidationError};
use crate::layout::{
    statics_len, IdStatus, Layout, SlotStatus, Statics, HEADER_LEN, HEADER_METADATA_LENGTH_OFFSET,
    HEADER_PID_OFFSET, HEADER_START_TIME_OFFSET, HEADER_STATICS_LENGTH_OFFSET,
    HEADER_VALUES_LENGTH_OFFSET, HEADER_VERSION_OFFSET, METADATA_ID_STATUS_OFFSET,
    METADATA_LABEL_CAPACITY, METADATA_LABEL_LENGTH_OFFSET, METADATA_LABEL_OFFSET,
    METADATA_RECORD_LEN, STATICS_COUNT_OFFSET, STATICS_RECORDS_OFFSET, STATIC_LABEL_LENGTH_OFFSET,
    STATIC_LABEL_OFFSET, STATIC_VALUE_LENGTH_OFFSET, VALUE_OFFSET, VALUE_RECORD_LEN, VERSION,
};
use crate::memory::MemoryView;

/// Mutating access to a counters region.
///
/// Only the single writer process uses an encoder, but any number of its threads may allocate
/// and free concurrently. They coordinate solely through compare-and-swap on the packed id/status
/// word of each slot.
#[derive(Clone, Copy, Debug)]
pub struct Encoder<'a> {
    header: MemoryView<'a>,
    statics: MemoryView<'a>,
    metadata: MemoryView<'a>,
    values: MemoryView<'a>,
    slots: usize,
}

/// How often a contended slot is retried before the scan moves on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed compare-and-swap attempts tolerated on one slot.
    pub per_slot: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { per_slot: 64 }
    }
}

/// Where a counter was placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub slot: usize,
    /// Byte offset of the value within the values block.
    pub value_offset: usize,
    /// Number of label bytes stored.
    pub label_len: usize,
    /// Failed compare-and-swap attempts during the scan.
    pub retries: u32,
}

impl<'a> Encoder<'a> {
    /// Split `region` into the blocks of `layout`.
    ///
    /// Panics if the region is shorter than the layout.
    pub fn new(region: MemoryView<'a>, layout: &Layout) -> Self {
        Encoder {
            header: region.slice(0, HEADER_LEN),
            statics: region.slice(layout.statics_offset(), layout.statics_len()),
            metadata: region.slice(layout.metadata_offset(), layout.metadata_len()),
            values: region.slice(layout.values_offset(), layout.values_len()),
            slots: layout.slots(),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The values block, indexed by [`Allocation::value_offset`].
    pub fn values(&self) -> MemoryView<'a> {
        self.values
    }

    /// Fill in a fresh region and publish it to readers.
    ///
    /// Everything is written before the version, which is stored last with release semantics.
    pub fn initialize(&self, pid: u64, start_time_millis: u64, statics: &Statics) -> Result<()> {
        for (offset, len) in [
            (HEADER_STATICS_LENGTH_OFFSET, self.statics.len()),
            (HEADER_METADATA_LENGTH_OFFSET, self.metadata.len()),
            (HEADER_VALUES_LENGTH_OFFSET, self.values.len()),
        ] {
            let len = u32::try_from(len).map_err(|_| ValidationError::FieldTooLong { len })?;
            self.header.store_u32(offset, len, Ordering::Relaxed);
        }

        self.header.store_u64(HEADER_PID_OFFSET, pid, Ordering::Release);
        self.header
            .store_u64(HEADER_START_TIME_OFFSET, start_time_millis, Ordering::Release);
        self.write_statics(statics)?;
        self.publish_version(VERSION);

        Ok(())
    }

    pub fn publish_version(&self, version: u32) {
        self.header
            .store_u32(HEADER_VERSION_OFFSET, version, Ordering::Release);
    }

    /// Encode the statics, ordered by label. Must happen before the version is published.
    pub fn write_statics(&self, statics: &Statics) -> Result<(), ValidationError> {
        let needed = statics_len(statics)?;
        if needed > self.statics.len() {
            return Err(ValidationError::StaticsOverflow {
                needed,
                capacity: self.statics.len(),
            });
        }

        let mut offset = STATICS_RECORDS_OFFSET;
        for (label, value) in statics {
            let (label, value) = (label.as_bytes(), value.as_bytes());
            let label_at = offset + STATIC_LABEL_OFFSET;

            self.statics.copy_from_slice(label_at, label);
            self.statics.copy_from_slice(label_at + label.len(), value);
            // Both lengths fit a u32, `statics_len` checked them.
            self.statics.store_u32(
                offset + STATIC_LABEL_LENGTH_OFFSET,
                label.len() as u32,
                Ordering::Relaxed,
            );
            self.statics.store_u32(
                offset + STATIC_VALUE_LENGTH_OFFSET,
                value.len() as u32,
                Ordering::Relaxed,
            );

            offset += crate::layout::static_record_len(label.len(), value.len());
        }

        self.statics
            .store_u32(STATICS_COUNT_OFFSET, statics.len() as u32, Ordering::Release);
        Ok(())
    }

    /// Claim the first usable slot for counter `id`, then publish its label and initial value.
    pub fn allocate(&self, id: u64, label: &str, initial: i64) -> Result<Allocation> {
        self.allocate_with(id, label, initial, RetryPolicy::default())
    }

    pub fn allocate_with(
        &self,
        id: u64,
        label: &str,
        initial: i64,
        policy: RetryPolicy,
    ) -> Result<Allocation> {
        self.allocate_observed(id, label, initial, policy, &mut |_| {})
    }

    /// Allocation with a hook that runs right before each claim attempt on `slot`.
    pub(crate) fn allocate_observed(
        &self,
        id: u64,
        label: &str,
        initial: i64,
        policy: RetryPolicy,
        before_claim: &mut dyn FnMut(usize),
    ) -> Result<Allocation> {
        if id == 0 || id > IdStatus::MAX_ID {
            return Err(ValidationError::InvalidId(id).into());
        }

        let label = stored_label(label).as_bytes();
        let claim = IdStatus::new(id, SlotStatus::Allocating);
        let mut retries = 0;

        for slot in 0..self.slots {
            let offset = slot * METADATA_RECORD_LEN + METADATA_ID_STATUS_OFFSET;
            let mut current = IdStatus(self.metadata.load_u64(offset, Ordering::Acquire));
            let mut attempts = 0;

            while matches!(
                current.status(),
                Some(SlotStatus::NotUsed | SlotStatus::Freed)
            ) {
                before_claim(slot);

                match self.metadata.compare_exchange_u64(offset, current.0, claim.0) {
                    Ok(_) => {
                        self.fill(slot, id, label, initial);
                        tracing::trace!(slot, id, retries, "allocated counter");

                        return Ok(Allocation {
                            slot,
                            value_offset: slot * VALUE_RECORD_LEN + VALUE_OFFSET,
                            label_len: label.len(),
                            retries,
                        });
                    }
                    // Someone else changed the slot. It may still be usable, look again.
                    Err(found) => {
                        retries += 1;
                        attempts += 1;
                        if attempts > policy.per_slot {
                            break;
                        }
                        current = IdStatus(found);
                    }
                }
            }
        }

        tracing::warn!(id, capacity = self.slots, "no free slot for counter");
        Err(Error::CapacityExceeded {
            capacity: self.slots,
        })
    }

    /// Write label and value of a claimed slot, then mark it allocated.
    fn fill(&self, slot: usize, id: u64, label: &[u8], initial: i64) {
        let record = slot * METADATA_RECORD_LEN;

        // Order the claim before the data stores, for readers still looking at the last epoch.
        fence(Ordering::Release);

        self.metadata.store_u32(
            record + METADATA_LABEL_LENGTH_OFFSET,
            label.len() as u32,
            Ordering::Relaxed,
        );
        self.metadata
            .copy_from_slice(record + METADATA_LABEL_OFFSET, label);
        self.values.store_i64(
            slot * VALUE_RECORD_LEN + VALUE_OFFSET,
            initial,
            Ordering::Relaxed,
        );

        let allocated = IdStatus::new(id, SlotStatus::Allocated);
        self.metadata.store_u64(
            record + METADATA_ID_STATUS_OFFSET,
            allocated.0,
            Ordering::Release,
        );
    }

    /// Free the allocated counter `id`.
    ///
    /// Returns `false` if no slot holds `id` in the allocated state. Losing a race against another
    /// thread freeing the same id still counts as success.
    pub fn free(&self, id: u64) -> bool {
        for slot in 0..self.slots {
            let offset = slot * METADATA_RECORD_LEN + METADATA_ID_STATUS_OFFSET;
            let current = IdStatus(self.metadata.load_u64(offset, Ordering::Acquire));

            match current.status() {
                Some(SlotStatus::NotUsed) => break,
                _ if current.id() != id => continue,
                Some(SlotStatus::Allocated) => {
                    let freed = IdStatus::new(id, SlotStatus::Freed);
                    let _ = self.metadata.compare_exchange_u64(offset, current.0, freed.0);
                    tracing::trace!(slot, id, "freed counter");
                    return true;
                }
                _ => return false,
            }
        }

        false
    }
}

/// The prefix of `label` that fits the metadata label buffer, cut at a character boundary.
pub fn stored_label(label: &str) -> &str {
    if label.len() <= METADATA_LABEL_CAPACITY {
        return label;
    }

    let mut end = METADATA_LABEL_CAPACITY;
    while !label.is_char_boundary(end) {
        end -= 1;
    }

    &label[..end]
}
