//! Counters in shared memory, written by one process and read by any number of others.
//!
//! A [`CounterStore`] creates a file, typically in `/dev/shm`, and lays out a fixed number of
//! counter slots in it. The writer adds labeled 64-bit counters and updates them with plain
//! atomic operations on the mapped memory. Other processes open the same file with a
//! [`CounterView`] and enumerate the live counters, their labels and values, as well as a set of
//! static label/value pairs fixed at creation.
//!
//! Neither side takes a lock. Slots are claimed and released by compare-and-swap of a packed
//! id/status word, and readers validate every record by re-reading that word after its data.
//!
//! ```no_run
//! use shm_counters::{CounterStore, CounterView, Statics};
//!
//! let mut statics = Statics::new();
//! statics.insert("service".into(), "frontend".into());
//!
//! let store = CounterStore::create("/dev/shm/frontend", &statics, 64)?;
//! let requests = store.add_counter("requests", 0)?;
//! requests.increment(1);
//!
//! let view = CounterView::open("/dev/shm/frontend")?;
//! let mut counters = Vec::new();
//! view.counters(&mut counters);
//! assert_eq!(counters[0].value, 1);
//! # Ok::<_, shm_counters::Error>(())
//! ```
//!
//! ## It's not a database
//!
//! Values are not persisted in any meaningful sense, the file is only a rendezvous for the
//! mapping. A listing is consistent per counter, but counters allocated or freed while a reader
//! scans may or may not appear. Ids are unique for the lifetime of a store, a freed counter never
//! comes back under the same id.
mod config;
mod decoder;
mod encoder;
mod error;
pub mod layout;
mod memory;
mod region;
mod store;
mod view;


pub use config::{host_page_size, Config};
pub use decoder::{CounterRecord, Decoder};
pub use encoder::{stored_label, Allocation, Encoder, RetryPolicy};
pub use error::{Error, FormatError, Result, ValidationError};
pub use layout::{Layout, Statics};
pub use memory::MemoryView;
pub use region::Region;
pub use store::{Counter, CounterStore};
pub use view::CounterView;
