//! Session configuration.
//!
//! A client sends one command line per connection:
//!
//! ```text
//! [-p physaddrbase [-d device]] <mem>[B|K|M|G] [loops]
//! ```
//!
//! It is tokenised here, parsed with clap and validated into a
//! [`SessionConfig`] together with the process environment captured for the
//! connection.

use std::env;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use clap::Parser;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::SetupError;
use crate::patterns::TestMask;

/// Command used when a client connects and sends an empty line.
pub const DEFAULT_COMMAND: &str = "-p 10M";
pub const DEFAULT_DEVICE: &str = "/dev/mem";
pub const USAGE: &str = "Usage: memtester [-p physaddrbase [-d device]] <mem>[B|K|M|G] [loops]";

/// Smallest request, in pages: one page per half plus one page that may be
/// lost when aligning a heap allocation.
pub const MIN_TEST_PAGES: usize = 3;

pub const TEST_MASK_VAR: &str = "MEMTESTER_TEST_MASK";
pub const SEED_VAR: &str = "MEMTESTER_SEED";

lazy_static! {
    // strtoul(..., 0) syntax: 0x hex, leading-0 octal, decimal.
    static ref NUMBER_REGEX: Regex =
        Regex::new(r"^(0[xX][0-9a-fA-F]+|0[0-7]*|[1-9][0-9]*)$").unwrap();
    static ref SIZE_REGEX: Regex =
        Regex::new(r"^(0[xX][0-9a-fA-F]+|0[0-7]*|[1-9][0-9]*)([bBkKmMgG]?)$").unwrap();
    static ref HEX_ADDRESS_REGEX: Regex = Regex::new(r"^(0[xX])?[0-9a-fA-F]+$").unwrap();
}

#[derive(Parser, Debug)]
#[command(
    name = "memtester",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CommandArgs {
    /// Physical base address (hex) to map from the memory device
    #[arg(short = 'p', value_name = "PHYSADDR")]
    physaddr: Option<String>,

    /// Character device to map physical memory from
    #[arg(short = 'd', value_name = "DEVICE")]
    device: Option<PathBuf>,

    #[arg(value_name = "MEM [LOOPS]")]
    positionals: Vec<String>,
}

/// Where to map memory from in physical mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalTarget {
    pub device: PathBuf,
    pub base: u64,
}

/// Process-level settings captured once per connection.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// `None` when the page size could not be queried.
    pub page_size: Option<usize>,
    pub test_mask: Option<String>,
    pub seed: Option<String>,
}

impl Environment {
    pub fn capture() -> Self {
        Environment {
            page_size: system_page_size(),
            test_mask: env::var(TEST_MASK_VAR).ok(),
            seed: env::var(SEED_VAR).ok(),
        }
    }

    /// An environment with a fixed page size and no overrides.
    pub fn with_page_size(page_size: usize) -> Self {
        Environment {
            page_size: Some(page_size),
            ..Environment::default()
        }
    }
}

fn system_page_size() -> Option<usize> {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub page_size: usize,
    pub requested_bytes: usize,
    /// Zero runs until aborted.
    pub loops: u64,
    pub physical: Option<PhysicalTarget>,
    pub test_mask: TestMask,
    pub seed: Option<u64>,
}

impl SessionConfig {
    pub fn from_command(line: &str, env: &Environment) -> Result<Self, SetupError> {
        let line = if line.trim().is_empty() {
            DEFAULT_COMMAND
        } else {
            line
        };
        Self::from_args(&split_command(line), env)
    }

    pub fn from_args(args: &[String], env: &Environment) -> Result<Self, SetupError> {
        let page_size = env
            .page_size
            .ok_or_else(|| SetupError::PageSize("sysconf(_SC_PAGESIZE) failed".to_string()))?;

        let test_mask = match env.test_mask.as_deref() {
            Some(value) => TestMask::from_env_value(value)?,
            None => TestMask::ALL,
        };
        let seed = match env.seed.as_deref() {
            Some(value) => {
                Some(parse_c_number(value.trim()).ok_or_else(|| SetupError::Seed(value.to_string()))?)
            }
            None => None,
        };

        let parsed = CommandArgs::try_parse_from(args).map_err(|e| {
            let message = e.to_string();
            SetupError::Usage(message.lines().next().unwrap_or_default().to_string())
        })?;

        let mut positionals = parsed.positionals;
        let mut physical_base = None;
        if let Some(value) = parsed.physaddr {
            if let Some(base) = parse_hex_address(&value) {
                if base % page_size as u64 != 0 {
                    return Err(SetupError::UnalignedPhysicalAddress(base));
                }
                physical_base = Some(base);
            } else if SIZE_REGEX.is_match(&value) {
                // Older clients send `-p <size>`: the value is the memory size.
                crate::log_debug_fmt!("treating -p {value} as the memory argument");
                positionals.insert(0, value);
            } else {
                return Err(SetupError::PhysicalAddress(value));
            }
        }

        if let Some(device) = &parsed.device {
            check_char_device(device)?;
        }

        let physical = match (physical_base, parsed.device) {
            (Some(base), device) => Some(PhysicalTarget {
                device: device.unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE)),
                base,
            }),
            (None, Some(_)) => return Err(SetupError::DeviceWithoutAddress),
            (None, None) => None,
        };

        let mut positionals = positionals.into_iter();
        let mem = positionals
            .next()
            .ok_or_else(|| SetupError::Usage("need memory argument, in MB".to_string()))?;
        let requested_bytes = parse_memory_size(&mem)?;

        let minimum = page_size * MIN_TEST_PAGES;
        if requested_bytes < minimum {
            return Err(SetupError::TooSmall {
                bytes: requested_bytes,
                minimum,
                pages: MIN_TEST_PAGES,
                page_size,
            });
        }

        let loops = match positionals.next() {
            Some(value) => parse_c_number(&value).ok_or(SetupError::Loops(value))?,
            None => 0,
        };

        if let Some(extra) = positionals.next() {
            return Err(SetupError::Usage(format!("unexpected argument '{extra}'")));
        }

        Ok(SessionConfig {
            page_size,
            requested_bytes,
            loops,
            physical,
            test_mask,
            seed,
        })
    }
}

/// Splits a command line on whitespace into owned arguments.
pub fn split_command(line: &str) -> Vec<String> {
    line.trim_matches(char::from(0))
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Parses an unsigned number the way `strtoul(s, NULL, 0)` does, rejecting
/// trailing characters and overflow.
pub fn parse_c_number(s: &str) -> Option<u64> {
    if !NUMBER_REGEX.is_match(s) {
        return None;
    }
    split_radix(s).and_then(|(digits, radix)| u64::from_str_radix(digits, radix).ok())
}

fn split_radix(s: &str) -> Option<(&str, u32)> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some((hex, 16))
    } else if s == "0" {
        Some((s, 10))
    } else if let Some(octal) = s.strip_prefix('0') {
        Some((octal, 8))
    } else {
        Some((s, 10))
    }
}

fn parse_hex_address(s: &str) -> Option<u64> {
    if !HEX_ADDRESS_REGEX.is_match(s) {
        return None;
    }
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Parses `<n>[B|K|M|G]`; no suffix means megabytes.
pub fn parse_memory_size(s: &str) -> Result<usize, SetupError> {
    let caps = SIZE_REGEX
        .captures(s)
        .ok_or_else(|| SetupError::MemoryArgument(s.to_string()))?;
    let raw = split_radix(&caps[1])
        .and_then(|(digits, radix)| u64::from_str_radix(digits, radix).ok())
        .ok_or_else(|| SetupError::MemoryArgument(s.to_string()))?;
    let shift = match &caps[2] {
        "G" | "g" => 30,
        "M" | "m" | "" => 20,
        "K" | "k" => 10,
        _ => 0,
    };

    let max_mb = (usize::MAX as u64 >> 20) + 1;
    raw.checked_mul(1u64 << shift)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or(SetupError::TooLarge { max_mb })
}

fn check_char_device(path: &Path) -> Result<(), SetupError> {
    let metadata = fs::metadata(path).map_err(|e| SetupError::DeviceStat {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !metadata.file_type().is_char_device() {
        return Err(SetupError::NotCharDevice(path.to_path_buf()));
    }
    Ok(())
}
