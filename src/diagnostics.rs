//! Non-fatal problems noticed while reading procfs.
//!
//! Every component owns a [`Diagnostics`] sink. Recording a [`Diagnostic`]
//! emits the matching `tracing` event and keeps the structured value, so a
//! caller can inspect what was skipped or degraded after the fact.

use std::fmt;
use std::io;

use tracing::{debug, info, warn};

use crate::pagemap::FrameTable;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A mapping table line matched neither a header nor a field line.
    MalformedLine { line: usize, text: String },
    /// A field line showed up before the first mapping header.
    OrphanField { line: usize, text: String },
    /// A well-formed field line with a name we do not track.
    UnknownField { line: usize, name: String },
    UnknownVmFlag { line: usize, flag: String },
    /// The frame table could not be opened; its field stays absent on every page.
    FrameTableUnavailable { table: FrameTable, kind: io::ErrorKind },
    /// The frame table had no entry for this PFN.
    FrameUnreadable { table: FrameTable, pfn: u64 },
    /// The mapping lies entirely above the range the page table reports.
    OutsidePageTable { name: String, start: u64, stop: u64 },
    /// The caller asked for mappings with this name to be skipped.
    SkippedByPolicy { name: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MalformedLine { line, text } => {
                write!(f, "line {line}: unable to parse: {text}")
            }
            Diagnostic::OrphanField { line, text } => {
                write!(f, "line {line}: field before any mapping header: {text}")
            }
            Diagnostic::UnknownField { line, name } => {
                write!(f, "line {line}: unknown field '{name}', ignored")
            }
            Diagnostic::UnknownVmFlag { line, flag } => {
                write!(f, "line {line}: unknown VmFlags entry '{flag}', ignored")
            }
            Diagnostic::FrameTableUnavailable { table, kind } => write!(
                f,
                "cannot open {table} ({kind}), start with elevated privileges for per-frame info"
            ),
            Diagnostic::FrameUnreadable { table, pfn } => {
                write!(f, "unable to read {table} for PFN {pfn}")
            }
            Diagnostic::OutsidePageTable { name, start, stop } => write!(
                f,
                "mapping {start:x}-{stop:x} '{name}' is not covered by the page table"
            ),
            Diagnostic::SkippedByPolicy { name } => write!(f, "mapping '{name}' skipped"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::UnknownField { .. } | Diagnostic::UnknownVmFlag { .. } => {
                debug!("{}", diagnostic)
            }
            Diagnostic::OutsidePageTable { .. } | Diagnostic::SkippedByPolicy { .. } => {
                info!("{}", diagnostic)
            }
            _ => warn!("{}", diagnostic),
        }
        self.entries.push(diagnostic);
    }

    /// Moves everything out of `other` without logging it a second time.
    pub fn absorb(&mut self, other: &mut Diagnostics) {
        self.entries.append(&mut other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
