//! Binary layout of a counters region.
//!
//! ```text
//! +--------+----------------+--------------------+------------------+---------+
//! | header | statics block  | metadata block     | values block     | padding |
//! | 128 B  | 128 B aligned  | slots x 512 B      | slots x 128 B    | to page |
//! +--------+----------------+--------------------+------------------+---------+
//! ```
//!
//! The header holds `version: u32, statics_len: u32, metadata_len: u32, values_len: u32,
//! pid: u64, start_time_millis: u64`, zero padded to two cache lines. The version is written last
//! by the writer and read first by any reader.
//!
//! The statics block starts with a `u32` count followed by records of `label_len: u32,
//! value_len: u32, label, value`, each padded to 4 bytes.
//!
//! A metadata record starts with the packed `id << 8 | status` word on its own two cache lines,
//! followed by `label_len: u32` and a label buffer of fixed capacity. A value record is an `i64`
//! padded to two cache lines, so that independent counters never share a cache line.
use std::collections::BTreeMap;

use crate::error::{FormatError, ValidationError};

/// Static label/value pairs, written once when a store is created.
///
/// The map is ordered by label which makes the encoded block deterministic. The order does not
/// carry any meaning otherwise.
pub type Statics = BTreeMap<String, String>;

/// The layout version this crate reads and writes.
pub const VERSION: u32 = 1;

pub const CACHE_LINE: usize = 64;
/// Alignment of every block boundary.
pub const BLOCK_ALIGN: usize = 2 * CACHE_LINE;
/// Upper bound on the number of counters of a single region.
pub const MAX_COUNTERS: usize = 10_000;

pub const HEADER_VERSION_OFFSET: usize = 0;
pub const HEADER_STATICS_LENGTH_OFFSET: usize = HEADER_VERSION_OFFSET + 4;
pub const HEADER_METADATA_LENGTH_OFFSET: usize = HEADER_STATICS_LENGTH_OFFSET + 4;
pub const HEADER_VALUES_LENGTH_OFFSET: usize = HEADER_METADATA_LENGTH_OFFSET + 4;
pub const HEADER_PID_OFFSET: usize = HEADER_VALUES_LENGTH_OFFSET + 4;
pub const HEADER_START_TIME_OFFSET: usize = HEADER_PID_OFFSET + 8;
pub const HEADER_LEN: usize = align(HEADER_START_TIME_OFFSET + 8, BLOCK_ALIGN);

pub const STATICS_COUNT_OFFSET: usize = 0;
pub const STATICS_RECORDS_OFFSET: usize = STATICS_COUNT_OFFSET + 4;
pub const STATIC_LABEL_LENGTH_OFFSET: usize = 0;
pub const STATIC_VALUE_LENGTH_OFFSET: usize = STATIC_LABEL_LENGTH_OFFSET + 4;
pub const STATIC_LABEL_OFFSET: usize = STATIC_VALUE_LENGTH_OFFSET + 4;

pub const METADATA_ID_STATUS_OFFSET: usize = 0;
pub const METADATA_LABEL_LENGTH_OFFSET: usize = 2 * CACHE_LINE;
pub const METADATA_LABEL_OFFSET: usize = METADATA_LABEL_LENGTH_OFFSET + 4;
/// Maximum number of label bytes stored for a counter. Longer labels are truncated.
pub const METADATA_LABEL_CAPACITY: usize = 6 * CACHE_LINE - 4;
pub const METADATA_RECORD_LEN: usize = METADATA_LABEL_OFFSET + METADATA_LABEL_CAPACITY;

pub const VALUE_OFFSET: usize = 0;
pub const VALUE_RECORD_LEN: usize = 2 * CACHE_LINE;

const _: () = assert!(HEADER_LEN == 128);
const _: () = assert!(METADATA_RECORD_LEN == 512);

/// Round `value` up to the next multiple of `alignment`, a power of two.
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Lifecycle of a slot, stored in the low byte of the packed id/status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotStatus {
    /// Never touched. Such slots only occur as a suffix of the metadata block.
    NotUsed = 0,
    /// Claimed by a writer that is still filling in label and value.
    Allocating = 1,
    /// Label and value are published.
    Allocated = 2,
    /// Released, may be claimed again.
    Freed = 3,
}

impl SlotStatus {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => SlotStatus::NotUsed,
            1 => SlotStatus::Allocating,
            2 => SlotStatus::Allocated,
            3 => SlotStatus::Freed,
            _ => return None,
        })
    }
}

/// The packed `id << 8 | status` word of a metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdStatus(pub u64);

impl IdStatus {
    /// Ids have 56 bits.
    pub const MAX_ID: u64 = (1 << 56) - 1;

    pub fn new(id: u64, status: SlotStatus) -> Self {
        debug_assert!(id <= Self::MAX_ID);
        IdStatus((id << 8) | status as u64)
    }

    pub fn id(self) -> u64 {
        self.0 >> 8
    }

    /// `None` for a status byte this version does not know.
    pub fn status(self) -> Option<SlotStatus> {
        SlotStatus::from_raw(self.0 as u8)
    }
}

/// Length of one encoded static record, including the padding to the next record.
pub fn static_record_len(label_len: usize, value_len: usize) -> usize {
    align(STATIC_LABEL_OFFSET + label_len + value_len, 4)
}

/// Length of the statics block needed to hold `statics`.
pub fn statics_len(statics: &Statics) -> Result<usize, ValidationError> {
    let mut len = STATICS_RECORDS_OFFSET;

    for (label, value) in statics {
        for field in [label.len(), value.len()] {
            if u32::try_from(field).is_err() {
                return Err(ValidationError::FieldTooLong { len: field });
            }
        }

        len = len
            .checked_add(static_record_len(label.len(), value.len()))
            .ok_or(ValidationError::FieldTooLong { len: usize::MAX })?;
    }

    let len = align(len, BLOCK_ALIGN);
    if u32::try_from(len).is_err() {
        return Err(ValidationError::FieldTooLong { len });
    }

    Ok(len)
}

pub fn metadata_len(counters: usize) -> usize {
    counters * METADATA_RECORD_LEN
}

pub fn values_len(counters: usize) -> usize {
    counters * VALUE_RECORD_LEN
}

/// Block lengths and offsets of one region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    statics_len: usize,
    slots: usize,
}

impl Layout {
    /// Compute the layout for a new region.
    pub fn new(statics: &Statics, max_counters: usize) -> Result<Self, ValidationError> {
        if max_counters > MAX_COUNTERS {
            return Err(ValidationError::TooManyCounters {
                requested: max_counters,
                max: MAX_COUNTERS,
            });
        }

        Ok(Layout {
            statics_len: statics_len(statics)?,
            slots: max_counters,
        })
    }

    /// Reconstruct the layout from the lengths recorded in a header.
    pub fn from_lengths(
        statics_len: u32,
        metadata_len: u32,
        values_len: u32,
    ) -> Result<Self, FormatError> {
        let [statics_len, metadata_len, values_len] =
            [statics_len, metadata_len, values_len].map(|len| len as usize);

        let consistent = statics_len >= STATICS_RECORDS_OFFSET
            && statics_len % BLOCK_ALIGN == 0
            && metadata_len % METADATA_RECORD_LEN == 0
            && values_len % VALUE_RECORD_LEN == 0
            && metadata_len / METADATA_RECORD_LEN == values_len / VALUE_RECORD_LEN
            && values_len / VALUE_RECORD_LEN <= MAX_COUNTERS;

        if !consistent {
            return Err(FormatError::InconsistentLengths);
        }

        Ok(Layout {
            statics_len,
            slots: values_len / VALUE_RECORD_LEN,
        })
    }

    /// Number of counter slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn statics_len(&self) -> usize {
        self.statics_len
    }

    pub fn metadata_len(&self) -> usize {
        metadata_len(self.slots)
    }

    pub fn values_len(&self) -> usize {
        values_len(self.slots)
    }

    pub fn statics_offset(&self) -> usize {
        HEADER_LEN
    }

    pub fn metadata_offset(&self) -> usize {
        self.statics_offset() + self.statics_len
    }

    pub fn values_offset(&self) -> usize {
        self.metadata_offset() + self.metadata_len()
    }

    /// End of the values block, the minimum length of a region with this layout.
    pub fn end(&self) -> usize {
        self.values_offset() + self.values_len()
    }

    /// Length of the backing store, rounded up to `page_size` which must be a power of two.
    pub fn region_len(&self, page_size: usize) -> usize {
        align(self.end(), page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizes() {
        assert_eq!(HEADER_LEN, 128);
        assert_eq!(HEADER_START_TIME_OFFSET, 24);
        assert_eq!(METADATA_LABEL_OFFSET, 132);
        assert_eq!(METADATA_LABEL_CAPACITY, 380);
        assert_eq!(METADATA_RECORD_LEN, 512);
        assert_eq!(VALUE_RECORD_LEN, 128);
    }

    #[test]
    fn statics_block_is_padded() {
        assert_eq!(statics_len(&Statics::new()), Ok(BLOCK_ALIGN));

        let mut statics = Statics::new();
        statics.insert("host".into(), "a".into());
        // 4 + align(8 + 4 + 1, 4)
        assert_eq!(static_record_len(4, 1), 16);
        assert_eq!(statics_len(&statics), Ok(BLOCK_ALIGN));

        for idx in 0..20 {
            statics.insert(format!("property{idx:02}"), format!("value{idx:02}"));
        }
        // 16 + 20 * align(8 + 10 + 7, 4)
        assert_eq!(statics_len(&statics), Ok(align(4 + 16 + 20 * 28, BLOCK_ALIGN)));
    }

    #[test]
    fn offsets_follow_blocks() {
        let layout = Layout::new(&Statics::new(), 3).unwrap();
        assert_eq!(layout.slots(), 3);
        assert_eq!(layout.statics_offset(), 128);
        assert_eq!(layout.metadata_offset(), 256);
        assert_eq!(layout.values_offset(), 256 + 3 * 512);
        assert_eq!(layout.end(), 256 + 3 * 512 + 3 * 128);
        assert_eq!(layout.region_len(4096), 4096);
        assert_eq!(layout.region_len(1024), 3072);
        assert_eq!(layout.region_len(128), 2176);
    }

    #[test]
    fn counter_cap() {
        assert!(Layout::new(&Statics::new(), MAX_COUNTERS).is_ok());
        assert_eq!(
            Layout::new(&Statics::new(), MAX_COUNTERS + 1),
            Err(ValidationError::TooManyCounters {
                requested: MAX_COUNTERS + 1,
                max: MAX_COUNTERS
            })
        );
    }

    #[test]
    fn lengths_roundtrip_through_header() {
        let layout = Layout::new(&Statics::new(), 7).unwrap();
        let recovered = Layout::from_lengths(
            layout.statics_len() as u32,
            layout.metadata_len() as u32,
            layout.values_len() as u32,
        );
        assert_eq!(recovered, Ok(layout));

        assert_eq!(
            Layout::from_lengths(128, 512, 256),
            Err(FormatError::InconsistentLengths)
        );
        assert_eq!(
            Layout::from_lengths(0, 0, 0),
            Err(FormatError::InconsistentLengths)
        );
        assert_eq!(
            Layout::from_lengths(100, 512, 128),
            Err(FormatError::InconsistentLengths)
        );
        // An unpadded empty statics block would misalign the metadata block.
        assert_eq!(
            Layout::from_lengths(4, 512, 128),
            Err(FormatError::InconsistentLengths)
        );
    }

    #[test]
    fn id_status_packing() {
        let packed = IdStatus::new(0x00ab_cdef, SlotStatus::Allocated);
        assert_eq!(packed.0, 0xab_cdef_02);
        assert_eq!(packed.id(), 0x00ab_cdef);
        assert_eq!(packed.status(), Some(SlotStatus::Allocated));

        let top = IdStatus::new(IdStatus::MAX_ID, SlotStatus::Freed);
        assert_eq!(top.id(), IdStatus::MAX_ID);
        assert_eq!(top.status(), Some(SlotStatus::Freed));

        assert_eq!(IdStatus(0x17).status(), None);
        assert_eq!(IdStatus(0).status(), Some(SlotStatus::NotUsed));
    }
}
