use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::config::Config;
use crate::decoder::{CounterRecord, Decoder};
use crate::error::Result;
use crate::layout::Layout;
use crate::region::Region;

/// A reader of a counters region, typically in another process than the writer.
///
/// The region is validated once when the view is opened. All reads tolerate the writer mutating
/// the region at the same time.
#[derive(Debug)]
pub struct CounterView {
    region: Region,
    layout: Layout,
}

impl CounterView {
    /// Map the counters file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let view = Self::from_region(Region::open(path)?)?;
        tracing::debug!(path = %path.display(), counters = view.layout.slots(), "opened counters view");
        Ok(view)
    }

    /// Map the counters file called `name` in the configured directory.
    pub fn open_named(name: impl AsRef<Path>, config: &Config) -> Result<Self> {
        Self::open(config.path_for(name))
    }

    /// Map an open descriptor of a counters region.
    pub fn open_in<F: AsRawFd>(fd: &F) -> Result<Self> {
        Self::from_region(Region::open_in(fd)?)
    }

    /// Read from an already mapped region.
    ///
    /// Fails if the region was not initialized yet, has another layout version or is malformed.
    pub fn from_region(region: Region) -> Result<Self> {
        let layout = match Decoder::prepare(region.view()) {
            Ok(decoder) => decoder.layout(),
            Err(err) => {
                tracing::warn!(%err, len = region.len(), "rejected counters region");
                return Err(err.into());
            }
        };

        Ok(CounterView { region, layout })
    }

    fn decoder(&self) -> Decoder<'_> {
        Decoder::new(self.region.view(), &self.layout)
    }

    pub fn version(&self) -> u32 {
        self.decoder().version()
    }

    /// Process id of the writer.
    pub fn pid(&self) -> u64 {
        self.decoder().pid()
    }

    /// When the writer created the region, in milliseconds since the Unix epoch.
    pub fn start_time_millis(&self) -> u64 {
        self.decoder().start_time_millis()
    }

    /// Number of counter slots of the region.
    pub fn capacity(&self) -> usize {
        self.layout.slots()
    }

    /// All static label/value pairs, ordered by label.
    pub fn statics(&self) -> Vec<(String, String)> {
        let mut statics = Vec::new();
        self.decoder().statics(&mut statics);
        statics
    }

    pub fn static_value(&self, label: &str) -> Option<String> {
        self.decoder().static_value(label)
    }

    /// Collect the live counters.
    ///
    /// Counters allocated or freed during the call may or may not be part of the result.
    pub fn counters(&self, into: &mut impl Extend<CounterRecord>) {
        self.decoder().counters(into)
    }

    /// The current value of counter `id`.
    pub fn counter_value(&self, id: u64) -> Result<i64> {
        self.decoder().counter_value(id)
    }

    pub fn counter_label(&self, id: u64) -> Result<String> {
        self.decoder().counter_label(id)
    }

    /// Unmap the region.
    pub fn close(self) {
        tracing::debug!(len = self.region.len(), "closing counters view");
    }
}
