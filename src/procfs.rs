use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/proc";

/// Where procfs is mounted. Everything else derives its paths from here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn smaps(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("smaps")
    }

    pub fn pagemap(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("pagemap")
    }

    /// Global, root only.
    pub fn kpagecount(&self) -> PathBuf {
        self.root.join("kpagecount")
    }

    /// Global, root only.
    pub fn kpageflags(&self) -> PathBuf {
        self.root.join("kpageflags")
    }
}
