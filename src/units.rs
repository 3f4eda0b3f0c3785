// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shared grammar for the two unit expressions accepted on the CLI:
//! durations (`7d`, `90s`, `2h`) and byte sizes (`512MiB`, `64KiB`).
//!
//! Both parsers are hand-rolled rather than pulled from a crate: no single
//! published crate covers exactly `s m h d w y` for durations and
//! `B KiB MiB GiB` for sizes together, and the grammar is small enough that
//! reaching for a dependency would just be another thing to keep in sync.
//! Unknown units are a configuration error, not a panic.

use std::time::Duration;

use crate::error::{BackupError, Result};

/// Parse a duration expression like `7d`, `90s`, `5m`, `2h`, `1w`, `1y`.
///
/// A bare numeric prefix followed by exactly one unit suffix; no
/// compound expressions (`1d2h`) are accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split_at = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| BackupError::Config(format!("duration '{input}' has no unit suffix")))?;
    let (num, unit) = input.split_at(split_at);
    let n: u64 = num
        .parse()
        .map_err(|_| BackupError::Config(format!("duration '{input}' has an invalid number")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3_600,
        "d" => n * 86_400,
        "w" => n * 604_800,
        "y" => n * 31_536_000,
        other => {
            return Err(BackupError::Config(format!(
                "duration '{input}' has unknown unit '{other}' (expected one of s m h d w y)"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Parse a byte-size expression like `512MiB`, `64KiB`, `1GiB`, `100B`.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let split_at = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| BackupError::Config(format!("byte size '{input}' has no unit suffix")))?;
    let (num, unit) = input.split_at(split_at);
    let n: u64 = num
        .parse()
        .map_err(|_| BackupError::Config(format!("byte size '{input}' has an invalid number")))?;
    let bytes = match unit {
        "B" => n,
        "KiB" => n * 1_024,
        "MiB" => n * 1_024 * 1_024,
        "GiB" => n * 1_024 * 1_024 * 1_024,
        other => {
            return Err(BackupError::Config(format!(
                "byte size '{input}' has unknown unit '{other}' (expected one of B KiB MiB GiB)"
            )))
        }
    };
    Ok(bytes)
}
