//! Line based text rendering of a counters region.
//!
//! ```text
//! file: /dev/shm/shm-counters-me/frontend
//! version: 1
//! pid: 4242
//! started: 1700000000000
//! static: service=frontend
//! counter: requests[1]=17
//! ```
//!
//! Labels and values are printed verbatim except that `=` and `\` are escaped with a backslash,
//! so the first unescaped `=` of a line separates label and value.
use std::borrow::Cow;
use std::io::{self, Write};
use std::path::Path;

use shm_counters::CounterView;

pub fn write_report(out: &mut impl Write, path: &Path, view: &CounterView) -> io::Result<()> {
    writeln!(out, "file: {}", path.display())?;
    writeln!(out, "version: {}", view.version())?;
    writeln!(out, "pid: {}", view.pid())?;
    writeln!(out, "started: {}", view.start_time_millis())?;

    for (label, value) in view.statics() {
        writeln!(out, "static: {}={}", escape(&label), escape(&value))?;
    }

    let mut counters = Vec::new();
    view.counters(&mut counters);
    for counter in &counters {
        writeln!(
            out,
            "counter: {}[{}]={}",
            escape(&counter.label),
            counter.id,
            counter.value
        )?;
    }

    out.flush()
}

pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(|ch: char| matches!(ch, '=' | '\\')) {
        return Cow::Borrowed(text);
    }

    let mut escaped = String::with_capacity(text.len() + 4);
    for ch in text.chars() {
        if matches!(ch, '=' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    Cow::Owned(escaped)
}
