//! `memview`: prints which pages of one mapping of a process are resident,
//! swapped out, or not mapped.

use std::fmt::Write as _;
use std::ops::Range;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use memview::{Inspection, Inspector, Mapping, ProcFs, Selector};
use tracing::{debug, Level};

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(
    name = "memview",
    about = "Show which pages of a process mapping are resident, swapped or not mapped",
    version
)]
struct Args {
    /// Process id (defaults to memview itself)
    pid: Option<u32>,

    /// Name of the mapping to inspect
    #[arg(short = 'm', long, default_value = "[heap]")]
    mapping: String,

    /// Inspect an explicit hex range <start>-<end> instead of a named mapping
    #[arg(short = 'r', long, value_parser = parse_range)]
    range: Option<Range<u64>>,

    /// List all mappings and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// Print every decoded page after the bitmap
    #[arg(long)]
    pages: bool,

    /// Pages per bitmap row
    #[arg(short = 'w', long, default_value_t = 80, value_parser = clap::value_parser!(u16).range(1..))]
    width: u16,

    /// procfs mount point
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Do not try /proc/kpagecount and /proc/kpageflags
    #[arg(long)]
    no_frames: bool,

    /// Mapping names that are never looked up in the page table
    #[arg(long, default_value = "[vsyscall]")]
    skip: Vec<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,
}

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) -> anyhow::Result<()> {
    let log_level = match args.log_level {
        LogLevel::Off => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    debug!("Logging initialized with level: {:?}", args.log_level);
    Ok(())
}

fn parse_range(data: &str) -> Result<Range<u64>, String> {
    let (start, end) = data
        .split_once('-')
        .ok_or_else(|| format!("expected <start>-<end>, got '{data}'"))?;
    let parse = |hex: &str| {
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|error| format!("invalid address '{hex}': {error}"))
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start >= end {
        return Err(format!("empty range {start:x}-{end:x}"));
    }
    Ok(start..end)
}

/// Human readable size with two decimals, kByte up to TByte.
fn format_size(bytes: u64) -> String {
    let size = bytes as f64;
    if bytes <= 1 << 20 {
        format!("{:.2} kByte", size / (1u64 << 10) as f64)
    } else if bytes <= 1 << 30 {
        format!("{:.2} MByte", size / (1u64 << 20) as f64)
    } else if bytes <= 1 << 40 {
        format!("{:.2} GByte", size / (1u64 << 30) as f64)
    } else {
        format!("{:.2} TByte", size / (1u64 << 40) as f64)
    }
}

fn format_mapping(mapping: &Mapping) -> String {
    format!(
        "{:x}-{:x} {} {:08x} {:02x}:{:02x} {:<10} {:>14} {}",
        mapping.start,
        mapping.end,
        mapping.permissions,
        mapping.offset,
        mapping.device.major,
        mapping.device.minor,
        mapping.inode,
        format_size(mapping.usage.size.unwrap_or_else(|| mapping.len())),
        mapping.name,
    )
}

fn render(inspection: &Inspection, width: usize) -> String {
    let mut out = String::new();
    let mapping = &inspection.mapping;
    let _ = writeln!(
        out,
        "mapping {:x}-{:x} '{}' {}:",
        mapping.start,
        mapping.end,
        mapping.name,
        format_size(mapping.usage.size.unwrap_or_else(|| mapping.len())),
    );
    let _ = writeln!(
        out,
        "  {} pages ({}), {} present ({}), {} not mapped ({}), {} swapped ({})",
        inspection.total_pages,
        format_size(inspection.total_bytes()),
        inspection.present_pages,
        format_size(inspection.present_bytes()),
        inspection.not_mapped_pages(),
        format_size(inspection.not_mapped_bytes()),
        inspection.swapped_pages,
        format_size(inspection.swapped_bytes()),
    );

    let row_bytes = width as u64 * inspection.page_size;
    for (row, classes) in inspection.classes.chunks(width).enumerate() {
        let line: String = classes.iter().map(|class| class.symbol()).collect();
        let address = inspection.range.start + row as u64 * row_bytes;
        let _ = writeln!(out, "0x{address:08x}: {line}");
    }
    out
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;

    let pid = args.pid.unwrap_or_else(std::process::id);
    let mut inspector = Inspector::new(pid)
        .procfs(ProcFs::new(&args.proc_root))
        .augment(!args.no_frames);
    for name in &args.skip {
        inspector = inspector.skip_name(name.as_str());
    }

    if args.list {
        let mappings = inspector
            .mappings()
            .with_context(|| format!("reading mappings of pid {pid}"))?;
        for mapping in &mappings {
            println!("{}", format_mapping(mapping));
        }
        return Ok(());
    }

    let selector = match &args.range {
        Some(range) => Selector::Range(range.clone()),
        None => Selector::Name(args.mapping.clone()),
    };
    let inspection = inspector
        .inspect(&selector)
        .with_context(|| format!("inspecting {selector} of pid {pid}"))?;

    print!("{}", render(&inspection, usize::from(args.width)));
    if args.pages {
        for page in &inspection.pages {
            println!("  {page}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memview::{Device, PageState, Permissions, Usage};

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("1000-3000"), Ok(0x1000..0x3000));
        assert_eq!(parse_range("0x1000-0x3000"), Ok(0x1000..0x3000));
        assert!(parse_range("3000-1000").is_err());
        assert!(parse_range("1000").is_err());
        assert!(parse_range("zz-1000").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(4096), "4.00 kByte");
        assert_eq!(format_size(1 << 20), "1024.00 kByte");
        assert_eq!(format_size(3 << 20), "3.00 MByte");
        assert_eq!(format_size(5 << 30), "5.00 GByte");
        assert_eq!(format_size(2 << 40), "2.00 TByte");
    }

    #[test]
    fn test_render_rows() {
        let mapping = Mapping {
            start: 0x10000,
            end: 0x15000,
            permissions: Permissions::READ | Permissions::WRITE,
            offset: 0,
            device: Device::default(),
            inode: 0,
            name: "[heap]".to_owned(),
            usage: Usage::default(),
        };
        let words = [1u64 << 63, 0, 1 << 63 | 1 << 62, 0, 1 << 63];
        let pages = words
            .iter()
            .enumerate()
            .map(|(index, &word)| PageState::decode(0x10000 + index as u64 * 0x1000, word))
            .collect();
        let inspection = Inspection::from_pages(mapping, 0x10000..0x15000, 0x1000, pages);

        let out = render(&inspection, 2);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "mapping 10000-15000 '[heap]' 20.00 kByte:");
        assert_eq!(
            lines[1],
            "  5 pages (20.00 kByte), 3 present (12.00 kByte), 2 not mapped (8.00 kByte), 1 swapped (4.00 kByte)"
        );
        assert_eq!(&lines[2..], ["0x00010000: x.", "0x00012000: s.", "0x00014000: x"]);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["memview", "42"]);
        assert_eq!(args.pid, Some(42));
        assert_eq!(args.mapping, "[heap]");
        assert_eq!(args.skip, vec!["[vsyscall]".to_owned()]);
        assert_eq!(args.width, 80);
        assert!(args.range.is_none());
    }
}
