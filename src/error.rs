use std::path::PathBuf;

use crate::inspect::Selector;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The process is gone, or the caller cannot see it.
    #[error("{} does not exist", path.display())]
    NotFound { path: PathBuf },

    /// Nothing in the file looked like a mapping header.
    #[error("no mapping found in {}", path.display())]
    EmptyResult { path: PathBuf },

    #[error(
        "only read {got} of {expected} bytes from {} for range {start:#x}-{stop:#x}",
        path.display()
    )]
    ShortRead {
        path: PathBuf,
        start: u64,
        stop: u64,
        expected: usize,
        got: usize,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid range {start:#x}-{stop:#x} for page size {page_size}")]
    InvalidRange { start: u64, stop: u64, page_size: u64 },

    #[error("no mapping matches {0}")]
    SelectorNotFound(Selector),
}

impl Error {
    /// Classifies an open/read failure, keeping a missing file distinguishable.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound { path },
            _ => Error::Io { path, source },
        }
    }
}
