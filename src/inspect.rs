use core::fmt;
use core::ops::Range;

use tracing::{debug, info};

use crate::Diagnostic;
use crate::Diagnostics;
use crate::Error;
use crate::KernelFrames;
use crate::Mapping;
use crate::PageMap;
use crate::PageState;
use crate::ProcFs;
use crate::Smaps;

/// Start of the kernel half of the address space on 64-bit. The pagemap
/// reports nothing at or above it (e.g. `[vsyscall]`).
pub const USERSPACE_END: u64 = 0xffff_8000_0000_0000;

/// Which mapping to inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// First mapping whose name matches exactly.
    Name(String),
    /// An explicit address range, which must lie inside a single mapping.
    Range(Range<u64>),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Name(name) => write!(f, "name '{name}'"),
            Selector::Range(range) => write!(f, "range {:x}-{:x}", range.start, range.end),
        }
    }
}

/// Finds the mapping `selector` refers to, and the range within it to inspect.
pub fn resolve<'a>(
    mappings: &'a [Mapping],
    selector: &Selector,
) -> Option<(&'a Mapping, Range<u64>)> {
    match selector {
        Selector::Name(name) => mappings
            .iter()
            .find(|mapping| mapping.name == *name)
            .map(|mapping| (mapping, mapping.range())),
        Selector::Range(range) if range.start < range.end => mappings
            .iter()
            .find(|mapping| mapping.start <= range.start && range.end <= mapping.end)
            .map(|mapping| (mapping, range.clone())),
        Selector::Range(_) => None,
    }
}

/// Per-page category for the bitmap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    NotMapped,
    Active,
    Swapped,
}

impl Class {
    pub fn of(page: &PageState) -> Self {
        match (page.is_present(), page.is_swapped()) {
            (true, true) => Class::Swapped,
            (true, false) => Class::Active,
            (false, _) => Class::NotMapped,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Class::NotMapped => '.',
            Class::Active => 'x',
            Class::Swapped => 's',
        }
    }
}

/// Page counts and per-page classes for one mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inspection {
    pub mapping: Mapping,
    /// What was actually read; may be clipped to the page table's reach.
    pub range: Range<u64>,
    pub page_size: u64,
    pub total_pages: usize,
    /// Includes swapped pages.
    pub present_pages: usize,
    pub swapped_pages: usize,
    pub classes: Vec<Class>,
    pub pages: Vec<PageState>,
}

impl Inspection {
    pub fn from_pages(
        mapping: Mapping,
        range: Range<u64>,
        page_size: u64,
        pages: Vec<PageState>,
    ) -> Self {
        let classes: Vec<Class> = pages.iter().map(Class::of).collect();
        let count = |wanted: Class| classes.iter().filter(|&&class| class == wanted).count();
        let swapped_pages = count(Class::Swapped);
        let active_pages = count(Class::Active);

        Self {
            mapping,
            range,
            page_size,
            total_pages: classes.len(),
            present_pages: active_pages + swapped_pages,
            swapped_pages,
            classes,
            pages,
        }
    }

    pub fn empty(mapping: Mapping, range: Range<u64>, page_size: u64) -> Self {
        Self::from_pages(mapping, range, page_size, Vec::new())
    }

    pub fn active_pages(&self) -> usize {
        self.present_pages - self.swapped_pages
    }

    pub fn not_mapped_pages(&self) -> usize {
        self.total_pages - self.present_pages
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_pages as u64 * self.page_size
    }

    pub fn present_bytes(&self) -> u64 {
        self.present_pages as u64 * self.page_size
    }

    pub fn swapped_bytes(&self) -> u64 {
        self.swapped_pages as u64 * self.page_size
    }

    pub fn not_mapped_bytes(&self) -> u64 {
        self.not_mapped_pages() as u64 * self.page_size
    }
}

/// Reads the mapping table and page table of one process.
///
/// Every call opens its own files and closes them before returning. The
/// mapping table and the page table are two separate reads of a live process,
/// so a mapping can change or vanish in between; freeze the target if that
/// matters.
#[derive(Debug)]
pub struct Inspector {
    procfs: ProcFs,
    pid: u32,
    address_limit: u64,
    skip: Vec<String>,
    augment: bool,
    diagnostics: Diagnostics,
}

impl Inspector {
    pub fn new(pid: u32) -> Self {
        Self {
            procfs: ProcFs::default(),
            pid,
            address_limit: USERSPACE_END,
            skip: Vec::new(),
            augment: true,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn procfs(mut self, procfs: ProcFs) -> Self {
        self.procfs = procfs;
        self
    }

    /// Addresses at or above `limit` are not looked up in the page table.
    pub fn address_limit(mut self, limit: u64) -> Self {
        self.address_limit = limit;
        self
    }

    /// Mappings named `name` come back as empty inspections.
    pub fn skip_name(mut self, name: impl Into<String>) -> Self {
        self.skip.push(name.into());
        self
    }

    /// Whether to try kpagecount/kpageflags at all.
    pub fn augment(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn mappings(&mut self) -> Result<Vec<Mapping>, Error> {
        let mut smaps = Smaps::new(&self.procfs, self.pid);
        let result = smaps.read_all();
        self.diagnostics.absorb(smaps.diagnostics_mut());
        result
    }

    pub fn inspect(&mut self, selector: &Selector) -> Result<Inspection, Error> {
        let mappings = self.mappings()?;
        let (mapping, range) = resolve(&mappings, selector)
            .ok_or_else(|| Error::SelectorNotFound(selector.clone()))?;
        self.inspect_range(mapping, range)
    }

    pub fn inspect_mapping(&mut self, mapping: &Mapping) -> Result<Inspection, Error> {
        self.inspect_range(mapping, mapping.range())
    }

    fn inspect_range(
        &mut self,
        mapping: &Mapping,
        range: Range<u64>,
    ) -> Result<Inspection, Error> {
        let page_size = mapping
            .usage
            .kernel_page_size
            .filter(|&size| size > 0)
            .unwrap_or_else(system_page_size);

        if self.skip.iter().any(|name| *name == mapping.name) {
            self.diagnostics.record(Diagnostic::SkippedByPolicy {
                name: mapping.name.clone(),
            });
            return Ok(Inspection::empty(mapping.clone(), range, page_size));
        }

        if range.start >= self.address_limit {
            self.diagnostics.record(Diagnostic::OutsidePageTable {
                name: mapping.name.clone(),
                start: range.start,
                stop: range.end,
            });
            return Ok(Inspection::empty(mapping.clone(), range, page_size));
        }
        let range = range.start..range.end.min(self.address_limit);

        let mut pagemap = PageMap::open(&self.procfs, self.pid)?;
        if self.augment {
            let frames = KernelFrames::open(&self.procfs, &mut self.diagnostics);
            if !frames.is_empty() {
                pagemap = pagemap.with_frames(frames);
            }
        }

        let result = pagemap.read(range.clone(), page_size);
        self.diagnostics.absorb(pagemap.diagnostics_mut());
        let pages = result?;

        let inspection = Inspection::from_pages(mapping.clone(), range, page_size, pages);
        info!(
            "mapping {:x}-{:x} '{}': {} pages, {} present, {} swapped",
            inspection.range.start,
            inspection.range.end,
            mapping.name,
            inspection.total_pages,
            inspection.present_pages,
            inspection.swapped_pages
        );
        Ok(inspection)
    }
}

fn system_page_size() -> u64 {
    // SAFETY: sysconf is safe to call with _SC_PAGESIZE
    // Returns -1 on error, handled by the > 0 check
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        return size as u64;
    }
    debug!("sysconf(_SC_PAGESIZE) failed, assuming 4096");
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, Permissions, Usage};

    fn mapping(start: u64, end: u64, name: &str) -> Mapping {
        Mapping {
            start,
            end,
            permissions: Permissions::READ | Permissions::WRITE,
            offset: 0,
            device: Device::default(),
            inode: 0,
            name: name.to_owned(),
            usage: Usage::default(),
        }
    }

    fn page(address: u64, word: u64) -> PageState {
        PageState::decode(address, word)
    }

    const ACTIVE: u64 = (1 << 63) | 42;
    const SWAPPED: u64 = (1 << 63) | (1 << 62) | (3 << 5);

    // -------------------------------------------------------------------------
    // Selector resolution
    // -------------------------------------------------------------------------

    #[test]
    fn test_resolve_first_name_match() {
        let mappings = vec![
            mapping(0x1000, 0x2000, "/bin/true"),
            mapping(0x2000, 0x3000, "[heap]"),
            mapping(0x5000, 0x6000, "[heap]"),
        ];
        let (found, range) = resolve(&mappings, &Selector::Name("[heap]".to_owned())).unwrap();
        assert_eq!(found.start, 0x2000);
        assert_eq!(range, 0x2000..0x3000);

        assert!(resolve(&mappings, &Selector::Name("[stack]".to_owned())).is_none());
    }

    #[test]
    fn test_resolve_range_within_mapping() {
        let mappings = vec![mapping(0x1000, 0x4000, ""), mapping(0x8000, 0x9000, "")];

        let (found, range) = resolve(&mappings, &Selector::Range(0x2000..0x3000)).unwrap();
        assert_eq!(found.start, 0x1000);
        assert_eq!(range, 0x2000..0x3000);

        // Spans the gap between the two mappings.
        assert!(resolve(&mappings, &Selector::Range(0x3000..0x8800)).is_none());
        assert!(resolve(&mappings, &Selector::Range(0x2000..0x2000)).is_none());
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(Selector::Name("[heap]".to_owned()).to_string(), "name '[heap]'");
        assert_eq!(Selector::Range(0x1000..0x2000).to_string(), "range 1000-2000");
    }

    // -------------------------------------------------------------------------
    // Reduction
    // -------------------------------------------------------------------------

    #[test]
    fn test_class_of_page() {
        assert_eq!(Class::of(&page(0, 0)), Class::NotMapped);
        assert_eq!(Class::of(&page(0, ACTIVE)), Class::Active);
        assert_eq!(Class::of(&page(0, SWAPPED)), Class::Swapped);
        // Swapped bit without present bit is still not mapped.
        assert_eq!(Class::of(&page(0, 1 << 62)), Class::NotMapped);
    }

    #[test]
    fn test_from_pages_counts() {
        let pages = vec![
            page(0x1000, ACTIVE),
            page(0x2000, 0),
            page(0x3000, SWAPPED),
            page(0x4000, ACTIVE),
            page(0x5000, 0),
        ];
        let inspection =
            Inspection::from_pages(mapping(0x1000, 0x6000, ""), 0x1000..0x6000, 0x1000, pages);

        assert_eq!(inspection.total_pages, 5);
        assert_eq!(inspection.present_pages, 3);
        assert_eq!(inspection.swapped_pages, 1);
        assert_eq!(inspection.active_pages(), 2);
        assert_eq!(inspection.not_mapped_pages(), 2);
        assert_eq!(
            inspection.classes,
            vec![
                Class::Active,
                Class::NotMapped,
                Class::Swapped,
                Class::Active,
                Class::NotMapped
            ]
        );
        let bitmap: String = inspection.classes.iter().map(|class| class.symbol()).collect();
        assert_eq!(bitmap, "x.sx.");

        assert_eq!(inspection.total_bytes(), 5 * 0x1000);
        assert_eq!(inspection.present_bytes(), 3 * 0x1000);
        assert_eq!(inspection.swapped_bytes(), 0x1000);
        assert_eq!(inspection.not_mapped_bytes(), 2 * 0x1000);
    }

    #[test]
    fn test_counts_are_ordered() {
        let words = [0, ACTIVE, SWAPPED, SWAPPED, 0, ACTIVE, 0, 0];
        for len in 0..=words.len() {
            let pages = words[..len]
                .iter()
                .enumerate()
                .map(|(index, &word)| page(index as u64 * 0x1000, word))
                .collect();
            let inspection =
                Inspection::from_pages(mapping(0, 0x8000, ""), 0..0x8000, 0x1000, pages);

            assert!(inspection.swapped_pages <= inspection.present_pages);
            assert!(inspection.present_pages <= inspection.total_pages);
            assert_eq!(inspection.total_pages, inspection.classes.len());
            assert_eq!(inspection.total_pages, len);
        }
    }

    #[test]
    fn test_empty_inspection() {
        let inspection =
            Inspection::empty(mapping(0x1000, 0x2000, "[vsyscall]"), 0x1000..0x2000, 0x1000);
        assert_eq!(inspection.total_pages, 0);
        assert!(inspection.classes.is_empty());
        assert_eq!(inspection.total_bytes(), 0);
    }

    #[test]
    fn test_system_page_size_is_power_of_two() {
        assert!(system_page_size().is_power_of_two());
    }
}
