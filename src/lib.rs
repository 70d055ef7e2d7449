//! Point-in-time view of which pages of a Linux process mapping are resident,
//! swapped out, or not mapped at all.
//!
//! The mapping table comes from `/proc/<pid>/smaps`, the per-page state from
//! `/proc/<pid>/pagemap`, and, when readable, per-frame reference counts and
//! flags from `/proc/kpagecount` and `/proc/kpageflags`.

use core::fmt;
use core::ops::Range;

use bitflags::bitflags;

mod diagnostics;
mod error;
mod inspect;
mod pagemap;
mod parse;
mod procfs;

pub use diagnostics::{Diagnostic, Diagnostics};
pub use error::Error;
pub use inspect::{resolve, Class, Inspection, Inspector, Selector, USERSPACE_END};
pub use pagemap::{
    Backing, FrameFlags, FrameSource, FrameTable, KernelFrames, PageMap, PageState, Present,
    ENTRY_SIZE,
};
pub use parse::{Parser, Smaps};
pub use procfs::ProcFs;

/// One region from the mapping table, with the statistics that followed its
/// header line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    pub permissions: Permissions,
    pub offset: u64,
    pub device: Device,
    pub inode: u64,
    /// Empty for anonymous mappings; `[heap]`, `[stack]` etc. for pseudo-mappings.
    pub name: String,
    pub usage: Usage,
}

impl Mapping {
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Byte counts reported for a mapping. The kernel reports kB; values are
/// scaled on ingest. A field is `None` when the running kernel did not emit it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub size: Option<u64>,
    pub kernel_page_size: Option<u64>,
    pub mmu_page_size: Option<u64>,
    pub rss: Option<u64>,
    pub pss: Option<u64>,
    pub pss_dirty: Option<u64>,
    pub shared_clean: Option<u64>,
    pub shared_dirty: Option<u64>,
    pub private_clean: Option<u64>,
    pub private_dirty: Option<u64>,
    pub referenced: Option<u64>,
    pub anonymous: Option<u64>,
    pub ksm: Option<u64>,
    pub lazy_free: Option<u64>,
    pub anon_huge_pages: Option<u64>,
    pub shmem_pmd_mapped: Option<u64>,
    pub file_pmd_mapped: Option<u64>,
    pub shared_hugetlb: Option<u64>,
    pub private_hugetlb: Option<u64>,
    pub swap: Option<u64>,
    pub swap_pss: Option<u64>,
    pub locked: Option<u64>,
    pub thp_eligible: Option<bool>,
    pub protection_key: Option<u64>,
    pub vm_flags: Option<VmFlags>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const MAY_SHARE = 1 << 3;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = |flag, c| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            letter(Permissions::READ, 'r'),
            letter(Permissions::WRITE, 'w'),
            letter(Permissions::EXECUTE, 'x'),
            if self.contains(Permissions::MAY_SHARE) { 's' } else { 'p' },
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// readable
        const RD = 1 << 0;
        /// writable
        const WR = 1 << 1;
        /// executable
        const EX = 1 << 2;
        /// shared
        const SH = 1 << 3;
        /// may read
        const MR = 1 << 4;
        /// may write
        const MW = 1 << 5;
        /// may execute
        const ME = 1 << 6;
        /// may share
        const MS = 1 << 7;
        /// stack segment grows down
        const GD = 1 << 8;
        /// pure PFN range
        const PF = 1 << 9;
        /// disabled write to the mapped file
        const DW = 1 << 10;
        /// pages are locked in memory
        const LO = 1 << 11;
        /// memory mapped I/O area
        const IO = 1 << 12;
        /// sequential read advise provided
        const SR = 1 << 13;
        /// random read advise provided
        const RR = 1 << 14;
        /// do not copy area on fork
        const DC = 1 << 15;
        /// do not expand area on remapping
        const DE = 1 << 16;
        /// area is accountable
        const AC = 1 << 17;
        /// swap space is not reserved for the area
        const NR = 1 << 18;
        /// area uses huge tlb pages
        const HT = 1 << 19;
        /// perform synchronous page faults
        const SF = 1 << 20;
        /// non-linear mapping
        const NL = 1 << 21;
        /// architecture specific flag
        const AR = 1 << 22;
        /// wipe on fork
        const WF = 1 << 23;
        /// do not include area into core dump
        const DD = 1 << 24;
        /// soft-dirty flag
        const SD = 1 << 25;
        /// mixed map area
        const MM = 1 << 26;
        /// huge page advise flag
        const HG = 1 << 27;
        /// no-huge page advise flag
        const NH = 1 << 28;
        /// mergeable advise flag
        const MG = 1 << 29;
        /// userfaultfd missing pages tracking
        const UM = 1 << 30;
        /// userfaultfd wprotect pages tracking
        const UW = 1 << 31;
    }
}
