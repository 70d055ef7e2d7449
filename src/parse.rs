use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::error;

use crate::Device;
use crate::Diagnostic;
use crate::Diagnostics;
use crate::Error;
use crate::Mapping;
use crate::Permissions;
use crate::ProcFs;
use crate::Usage;
use crate::VmFlags;

/// Reader for one process's `smaps` file.
#[derive(Debug)]
pub struct Smaps {
    path: PathBuf,
    diagnostics: Diagnostics,
}

impl Smaps {
    pub fn new(procfs: &ProcFs, pid: u32) -> Self {
        Self::from_path(procfs.smaps(pid))
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            diagnostics: Diagnostics::new(),
        }
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

    pub fn read_all(&mut self) -> Result<Vec<Mapping>, Error> {
        self.read_filter(|_| true)
    }

    /// Parses the whole table, then keeps the mappings `filter` accepts.
    ///
    /// An empty table is an error even when the filter would have rejected
    /// everything anyway: it means the file did not look like smaps at all.
    pub fn read_filter<F: FnMut(&Mapping) -> bool>(
        &mut self,
        mut filter: F,
    ) -> Result<Vec<Mapping>, Error> {
        let mut reader = File::open(&self.path)
            .map(BufReader::new)
            .map_err(|source| Error::io(&self.path, source))?;

        let mut parser = Parser::new();
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            let read = reader
                .read_until(b'\n', &mut buffer)
                .map_err(|source| Error::io(&self.path, source))?;
            if read == 0 {
                break;
            }
            // Paths in mapping names are not guaranteed to be UTF-8.
            let line = String::from_utf8_lossy(&buffer);
            parser.feed(line.trim_end_matches(['\n', '\r']));
        }

        let (mappings, mut diagnostics) = parser.finish();
        self.diagnostics.absorb(&mut diagnostics);

        if mappings.is_empty() {
            error!("no mapping found in '{}'", self.path.display());
            return Err(Error::EmptyResult {
                path: self.path.clone(),
            });
        }

        debug!(
            "parsed {} mappings from '{}'",
            mappings.len(),
            self.path.display()
        );
        Ok(mappings.into_iter().filter(|mapping| filter(mapping)).collect())
    }
}

/// Line-at-a-time smaps parser.
///
/// Header lines start a new [`Mapping`]; field lines update the most recent
/// one. Anything else is recorded as a diagnostic and skipped.
#[derive(Debug, Default)]
pub struct Parser {
    mappings: Vec<Mapping>,
    line: usize,
    diagnostics: Diagnostics,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> (Vec<Mapping>, Diagnostics) {
        let mut parser = Self::new();
        for line in text.lines() {
            parser.feed(line);
        }
        parser.finish()
    }

    pub fn feed(&mut self, line: &str) {
        self.line += 1;

        if let Some(mapping) = Mapping::parse(line) {
            self.mappings.push(mapping);
            return;
        }

        let Some(field) = Field::parse(line) else {
            self.diagnostics.record(Diagnostic::MalformedLine {
                line: self.line,
                text: line.trim().to_owned(),
            });
            return;
        };

        match self.mappings.last_mut() {
            Some(current) => current
                .usage
                .apply(field, self.line, &mut self.diagnostics),
            None => self.diagnostics.record(Diagnostic::OrphanField {
                line: self.line,
                text: line.trim().to_owned(),
            }),
        }
    }

    pub fn finish(self) -> (Vec<Mapping>, Diagnostics) {
        (self.mappings, self.diagnostics)
    }
}

enum Field<'a> {
    /// `<Name>: <n> kB`, already scaled to bytes.
    Bytes(&'a str, u64),
    /// `<Name>: <n>` without a unit.
    Count(&'a str, u64),
    VmFlags(&'a str),
}

impl<'a> Field<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let (key, rest) = line.split_once(':')?;
        if key.is_empty() || key.contains(|c: char| c.is_ascii_whitespace()) {
            return None;
        }

        if key == "VmFlags" {
            return Some(Field::VmFlags(rest));
        }

        let mut iter = rest.split_ascii_whitespace();
        let value = iter.next()?.parse::<u64>().ok()?;
        let field = match iter.next() {
            Some("kB") => Field::Bytes(key, value.checked_mul(1 << 10)?),
            Some(_) => return None,
            None => Field::Count(key, value),
        };

        match iter.next() {
            Some(_) => None,
            None => Some(field),
        }
    }
}

impl Usage {
    fn apply(&mut self, field: Field<'_>, line: usize, diagnostics: &mut Diagnostics) {
        match field {
            Field::Bytes(key, bytes) => {
                let slot = match key {
                    "Size" => &mut self.size,
                    "KernelPageSize" => &mut self.kernel_page_size,
                    "MMUPageSize" => &mut self.mmu_page_size,
                    "Rss" => &mut self.rss,
                    "Pss" => &mut self.pss,
                    "Pss_Dirty" => &mut self.pss_dirty,
                    "Shared_Clean" => &mut self.shared_clean,
                    "Shared_Dirty" => &mut self.shared_dirty,
                    "Private_Clean" => &mut self.private_clean,
                    "Private_Dirty" => &mut self.private_dirty,
                    "Referenced" => &mut self.referenced,
                    "Anonymous" => &mut self.anonymous,
                    "KSM" => &mut self.ksm,
                    "LazyFree" => &mut self.lazy_free,
                    "AnonHugePages" => &mut self.anon_huge_pages,
                    "ShmemPmdMapped" => &mut self.shmem_pmd_mapped,
                    "FilePmdMapped" => &mut self.file_pmd_mapped,
                    "Shared_Hugetlb" => &mut self.shared_hugetlb,
                    "Private_Hugetlb" => &mut self.private_hugetlb,
                    "Swap" => &mut self.swap,
                    "SwapPss" => &mut self.swap_pss,
                    "Locked" => &mut self.locked,
                    name => {
                        diagnostics.record(Diagnostic::UnknownField {
                            line,
                            name: name.to_owned(),
                        });
                        return;
                    }
                };
                *slot = Some(bytes);
            }
            Field::Count("THPeligible", value) => self.thp_eligible = Some(value != 0),
            Field::Count("ProtectionKey", value) => self.protection_key = Some(value),
            Field::Count(name, _) => diagnostics.record(Diagnostic::UnknownField {
                line,
                name: name.to_owned(),
            }),
            Field::VmFlags(data) => self.vm_flags = Some(VmFlags::parse(data, line, diagnostics)),
        }
    }
}

impl VmFlags {
    fn parse(data: &str, line: usize, diagnostics: &mut Diagnostics) -> Self {
        data.split_ascii_whitespace()
            .filter_map(|flag| {
                let known = match flag {
                    "rd" => Self::RD,
                    "wr" => Self::WR,
                    "ex" => Self::EX,
                    "sh" => Self::SH,
                    "mr" => Self::MR,
                    "mw" => Self::MW,
                    "me" => Self::ME,
                    "ms" => Self::MS,
                    "gd" => Self::GD,
                    "pf" => Self::PF,
                    "dw" => Self::DW,
                    "lo" => Self::LO,
                    "io" => Self::IO,
                    "sr" => Self::SR,
                    "rr" => Self::RR,
                    "dc" => Self::DC,
                    "de" => Self::DE,
                    "ac" => Self::AC,
                    "nr" => Self::NR,
                    "ht" => Self::HT,
                    "sf" => Self::SF,
                    "nl" => Self::NL,
                    "ar" => Self::AR,
                    "wf" => Self::WF,
                    "dd" => Self::DD,
                    "sd" => Self::SD,
                    "mm" => Self::MM,
                    "hg" => Self::HG,
                    "nh" => Self::NH,
                    "mg" => Self::MG,
                    "um" => Self::UM,
                    "uw" => Self::UW,
                    flag => {
                        diagnostics.record(Diagnostic::UnknownVmFlag {
                            line,
                            flag: flag.to_owned(),
                        });
                        return None;
                    }
                };
                Some(known)
            })
            .fold(VmFlags::empty(), |flags, flag| flags | flag)
    }
}

impl Mapping {
    /// `<start>-<end> <perms> <offset> <major>:<minor> <inode> [name]`
    fn parse(line: &str) -> Option<Self> {
        let mut rest = line;
        let (start, end) = next_field(&mut rest)?.split_once('-')?;
        let permissions = next_field(&mut rest).and_then(Permissions::parse)?;
        let offset = next_field(&mut rest)?;
        let device = next_field(&mut rest).and_then(Device::parse)?;
        let inode = next_field(&mut rest)?;

        let start = parse_hex(start)?;
        let end = parse_hex(end)?;
        if start >= end {
            return None;
        }

        Some(Self {
            start,
            end,
            permissions,
            offset: parse_hex(offset)?,
            device,
            inode: inode.parse().ok()?,
            // Names may contain spaces, e.g. "/tmp/a b (deleted)".
            name: rest.trim().to_owned(),
            usage: Usage::default(),
        })
    }
}

impl Permissions {
    fn parse(data: &str) -> Option<Self> {
        let data: [u8; 4] = data.as_bytes().try_into().ok()?;
        let read = match data[0] {
            b'-' => Permissions::empty(),
            b'r' => Permissions::READ,
            _ => return None,
        };

        let write = match data[1] {
            b'-' => Permissions::empty(),
            b'w' => Permissions::WRITE,
            _ => return None,
        };

        let execute = match data[2] {
            b'-' => Permissions::empty(),
            b'x' => Permissions::EXECUTE,
            _ => return None,
        };

        let shared = match data[3] {
            b's' => Permissions::MAY_SHARE,
            b'p' | b'-' => Permissions::empty(),
            _ => return None,
        };

        Some(read | write | execute | shared)
    }
}

impl Device {
    fn parse(data: &str) -> Option<Self> {
        let (major, minor) = data.split_once(':')?;
        Some(Self {
            major: u32::from_str_radix(major, 16).ok()?,
            minor: u32::from_str_radix(minor, 16).ok()?,
        })
    }
}

/// Splits off the next whitespace-separated token, leaving the remainder in `rest`.
fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    let end = trimmed
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    (!field.is_empty()).then_some(field)
}

fn parse_hex(data: &str) -> Option<u64> {
    if !data.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(data, 16).ok()
}
