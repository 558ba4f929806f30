use thiserror::Error as ThisError;

/// Errors of the counters store and its readers.
///
/// All of them are reported synchronously to the caller; nothing is retried in the background.
/// Contention between concurrent writers is not an error and never surfaces here.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Bad arguments, detected before anything is published.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No free slot was left for a new counter.
    #[error("no free slot left among {capacity} counters")]
    CapacityExceeded { capacity: usize },
    /// No live counter with this id. Does not tell whether it never existed or was freed.
    #[error("counter {id} not found")]
    NotFound { id: u64 },
    /// The region does not hold a counters layout this version understands.
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ValidationError {
    #[error("requested {requested} counters, at most {max} are supported")]
    TooManyCounters { requested: usize, max: usize },
    /// The statics do not fit the block computed for them.
    #[error("statics need {needed} bytes but the block only holds {capacity}")]
    StaticsOverflow { needed: usize, capacity: usize },
    #[error("a static label or value of {len} bytes is too long")]
    FieldTooLong { len: usize },
    /// Ids are non-zero and have at most 56 bits.
    #[error("counter id {0} is out of range")]
    InvalidId(u64),
    #[error("page size {0} is not a power of two")]
    InvalidPageSize(usize),
    #[error("environment variable {name} has an invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum FormatError {
    /// The writer did not publish the version yet.
    #[error("counters not yet initialized")]
    NotInitialized,
    #[error("unsupported version {0} of the counters layout")]
    UnsupportedVersion(u32),
    #[error("region of {len} bytes is truncated, the layout needs {needed}")]
    Truncated { needed: usize, len: usize },
    #[error("block lengths in the header are inconsistent")]
    InconsistentLengths,
    #[error("malformed static record at offset {offset}")]
    CorruptStatics { offset: usize },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
