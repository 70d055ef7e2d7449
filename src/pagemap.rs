//! Decoding of `/proc/<pid>/pagemap`, optionally joined with the global
//! `/proc/kpagecount` and `/proc/kpageflags` tables.
//!
//! Each table holds one native-endian 64-bit word per page. The pagemap is
//! indexed by virtual page number, the two kpage tables by PFN.

use core::fmt;
use core::ops::Range;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, error};

use crate::Diagnostic;
use crate::Diagnostics;
use crate::Error;
use crate::ProcFs;

/// Bytes per entry in pagemap, kpagecount and kpageflags.
pub const ENTRY_SIZE: usize = 8;

const PRESENT: u64 = 1 << 63;
const SWAPPED: u64 = 1 << 62;
const RESERVED: u64 = 1 << 61;
const PAGE_SHIFT_MASK: u64 = 0x1f80_0000_0000_0000;
const PAGE_SHIFT_OFFSET: u32 = 55;
// Bits 0-54
const PFN_MASK: u64 = 0x007f_ffff_ffff_ffff;
const SWAP_TYPE_MASK: u64 = 0x1f;
const SWAP_OFFSET_MASK: u64 = 0x007f_ffff_ffff_ffe0;
const SWAP_OFFSET_SHIFT: u32 = 5;

/// Where a present page lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    Frame { pfn: u64 },
    Swap { kind: u8, offset: u64 },
}

/// The fields that only exist for a present page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Present {
    pub backing: Backing,
    pub page_shift: u8,
    pub reserved: u8,
}

impl Present {
    /// Returns `None` for a page that is not present.
    pub fn decode(word: u64) -> Option<Self> {
        if word & PRESENT == 0 {
            return None;
        }

        let backing = if word & SWAPPED == 0 {
            Backing::Frame {
                pfn: word & PFN_MASK,
            }
        } else {
            Backing::Swap {
                kind: (word & SWAP_TYPE_MASK) as u8,
                offset: (word & SWAP_OFFSET_MASK) >> SWAP_OFFSET_SHIFT,
            }
        };

        Some(Self {
            backing,
            page_shift: ((word & PAGE_SHIFT_MASK) >> PAGE_SHIFT_OFFSET) as u8,
            reserved: ((word & RESERVED) >> 61) as u8,
        })
    }
}

/// Decoded state of one virtual page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageState {
    pub address: u64,
    /// `None` when the page is not present.
    pub present: Option<Present>,
    /// Only set when kpagecount was readable and the page has a frame.
    pub map_count: Option<u64>,
    /// Only set when kpageflags was readable and the page has a frame.
    pub flags: Option<FrameFlags>,
}

impl PageState {
    pub fn decode(address: u64, word: u64) -> Self {
        Self {
            address,
            present: Present::decode(word),
            map_count: None,
            flags: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present.is_some()
    }

    pub fn is_swapped(&self) -> bool {
        matches!(
            self.present,
            Some(Present {
                backing: Backing::Swap { .. },
                ..
            })
        )
    }

    pub fn pfn(&self) -> Option<u64> {
        match self.present?.backing {
            Backing::Frame { pfn } => Some(pfn),
            Backing::Swap { .. } => None,
        }
    }

    /// `(type, offset)` of the swap slot.
    pub fn swap(&self) -> Option<(u8, u64)> {
        match self.present?.backing {
            Backing::Swap { kind, offset } => Some((kind, offset)),
            Backing::Frame { .. } => None,
        }
    }

    pub fn page_shift(&self) -> Option<u8> {
        self.present.map(|present| present.page_shift)
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.address)?;
        match self.present {
            None => write!(f, " not present")?,
            Some(present) => {
                write!(
                    f,
                    " present shift:{} reserved:{}",
                    present.page_shift, present.reserved
                )?;
                match present.backing {
                    Backing::Frame { pfn } => write!(f, " pfn:{pfn}")?,
                    Backing::Swap { kind, offset } => {
                        write!(f, " swapped type:{kind} offset:{offset}")?
                    }
                }
            }
        }
        if let Some(count) = self.map_count {
            write!(f, " mapcount:{count}")?;
        }
        if let Some(flags) = self.flags {
            write!(f, " {flags}")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Physical frame state from `/proc/kpageflags`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FrameFlags: u64 {
        const LOCKED = 1 << 0;
        const ERROR = 1 << 1;
        const REFERENCED = 1 << 2;
        const UPTODATE = 1 << 3;
        const DIRTY = 1 << 4;
        const LRU = 1 << 5;
        const ACTIVE = 1 << 6;
        const SLAB = 1 << 7;
        const WRITEBACK = 1 << 8;
        const RECLAIM = 1 << 9;
        const BUDDY = 1 << 10;
        const MMAP = 1 << 11;
        const ANON = 1 << 12;
        const SWAPCACHE = 1 << 13;
        const SWAPBACKED = 1 << 14;
        const COMPOUND_HEAD = 1 << 15;
        const COMPOUND_TAIL = 1 << 16;
        const HUGE = 1 << 17;
        const UNEVICTABLE = 1 << 18;
        const HWPOISON = 1 << 19;
        const NOPAGE = 1 << 20;
        const KSM = 1 << 21;
        const THP = 1 << 22;
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (name, _)) in self.iter_names().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameTable {
    Count,
    Flags,
}

impl fmt::Display for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameTable::Count => f.write_str("kpagecount"),
            FrameTable::Flags => f.write_str("kpageflags"),
        }
    }
}

/// Per-frame data keyed by PFN.
pub trait FrameSource {
    /// `Ok(None)` when `table` is not available at all; an error when it is
    /// available but has no entry for `pfn`.
    fn frame_word(&mut self, table: FrameTable, pfn: u64) -> io::Result<Option<u64>>;
}

/// The kernel's kpagecount/kpageflags pair. Either may be missing.
#[derive(Debug)]
pub struct KernelFrames<R = File> {
    count: Option<R>,
    flags: Option<R>,
}

impl KernelFrames<File> {
    /// Opens both tables, recording a diagnostic for each one that cannot be opened.
    pub fn open(procfs: &ProcFs, diagnostics: &mut Diagnostics) -> Self {
        let mut open = |table, path: PathBuf| match File::open(&path) {
            Ok(file) => Some(file),
            Err(error) => {
                diagnostics.record(Diagnostic::FrameTableUnavailable {
                    table,
                    kind: error.kind(),
                });
                None
            }
        };

        let count = open(FrameTable::Count, procfs.kpagecount());
        let flags = open(FrameTable::Flags, procfs.kpageflags());
        Self { count, flags }
    }
}

impl<R: Read + Seek> KernelFrames<R> {
    pub fn new(count: Option<R>, flags: Option<R>) -> Self {
        Self { count, flags }
    }

    /// True when neither table could be opened.
    pub fn is_empty(&self) -> bool {
        self.count.is_none() && self.flags.is_none()
    }
}

impl<R: Read + Seek> FrameSource for KernelFrames<R> {
    fn frame_word(&mut self, table: FrameTable, pfn: u64) -> io::Result<Option<u64>> {
        let reader = match table {
            FrameTable::Count => self.count.as_mut(),
            FrameTable::Flags => self.flags.as_mut(),
        };
        let Some(reader) = reader else {
            return Ok(None);
        };

        reader.seek(SeekFrom::Start(pfn * ENTRY_SIZE as u64))?;
        let mut buffer = [0u8; ENTRY_SIZE];
        if read_full(reader, &mut buffer)? < ENTRY_SIZE {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(Some(NativeEndian::read_u64(&buffer)))
    }
}

/// Reader for one process's pagemap.
pub struct PageMap<R = File> {
    path: PathBuf,
    reader: R,
    frames: Option<Box<dyn FrameSource>>,
    diagnostics: Diagnostics,
}

impl PageMap<File> {
    pub fn open(procfs: &ProcFs, pid: u32) -> Result<Self, Error> {
        let path = procfs.pagemap(pid);
        let file = File::open(&path).map_err(|source| Error::io(&path, source))?;
        Ok(Self::new(path, file))
    }
}

impl<R: Read + Seek> PageMap<R> {
    /// `path` only names the reader in errors.
    pub fn new(path: impl Into<PathBuf>, reader: R) -> Self {
        Self {
            path: path.into(),
            reader,
            frames: None,
            diagnostics: Diagnostics::new(),
        }
    }

    /// Joins every page that has a frame with `frames`.
    pub fn with_frames(mut self, frames: impl FrameSource + 'static) -> Self {
        self.frames = Some(Box::new(frames));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Decodes every page in `range`, in address order.
    ///
    /// The whole range is read in one batch. If the kernel returns fewer bytes
    /// than the range needs, nothing is decoded and [`Error::ShortRead`] is
    /// returned.
    pub fn read(&mut self, range: Range<u64>, page_size: u64) -> Result<Vec<PageState>, Error> {
        let Range { start, end } = range;
        let invalid = || Error::InvalidRange {
            start,
            stop: end,
            page_size,
        };
        if page_size == 0 || end < start {
            return Err(invalid());
        }

        let first = start / page_size;
        let count = usize::try_from(end / page_size - first).map_err(|_| invalid())?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let expected = count.checked_mul(ENTRY_SIZE).ok_or_else(invalid)?;
        let offset = first.checked_mul(ENTRY_SIZE as u64).ok_or_else(invalid)?;

        debug!(
            "reading {count} pagemap entries for {start:#x}-{end:#x} from '{}'",
            self.path.display()
        );

        let mut buffer = vec![0u8; expected];
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|source| Error::io(&self.path, source))?;
        let got = read_full(&mut self.reader, &mut buffer)
            .map_err(|source| Error::io(&self.path, source))?;
        if got != expected {
            error!(
                "only read {got} bytes from '{}', expected {expected}",
                self.path.display()
            );
            return Err(Error::ShortRead {
                path: self.path.clone(),
                start,
                stop: end,
                expected,
                got,
            });
        }

        let mut words = vec![0u64; count];
        NativeEndian::read_u64_into(&buffer, &mut words);

        let mut pages = Vec::with_capacity(count);
        for (index, word) in words.into_iter().enumerate() {
            let address = (first + index as u64) * page_size;
            let mut page = PageState::decode(address, word);
            if let (Some(pfn), Some(frames)) = (page.pfn(), self.frames.as_mut()) {
                let diagnostics = &mut self.diagnostics;
                page.map_count = frame_word(&mut **frames, FrameTable::Count, pfn, diagnostics);
                page.flags = frame_word(&mut **frames, FrameTable::Flags, pfn, diagnostics)
                    .map(FrameFlags::from_bits_truncate);
            }
            pages.push(page);
        }

        Ok(pages)
    }
}

fn frame_word(
    frames: &mut dyn FrameSource,
    table: FrameTable,
    pfn: u64,
    diagnostics: &mut Diagnostics,
) -> Option<u64> {
    match frames.frame_word(table, pfn) {
        Ok(word) => word,
        Err(_) => {
            diagnostics.record(Diagnostic::FrameUnreadable { table, pfn });
            None
        }
    }
}

/// Like `read_exact`, but reports how much was read instead of failing on EOF.
fn read_full<R: Read + ?Sized>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}
