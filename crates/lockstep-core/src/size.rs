//! Size threshold parsing.
//!
//! Accepts a whole number, an optional space, and a unit: `"10 GB"`,
//! `"10gigabyte"`, `"512 MiB"`. Units are matched case-insensitively and only in
//! singular form; `"10 gigabytes"` is rejected.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*([A-Za-z]+)\s*$").expect("size regex pattern is invalid - this is a bug")
});

const KB: u64 = 1_000;
const KIB: u64 = 1_024;

fn unit_multiplier(unit: &str) -> Option<u64> {
    let m = match unit.to_ascii_lowercase().as_str() {
        "b" | "byte" => 1,
        "kb" | "kilobyte" => KB,
        "mb" | "megabyte" => KB.pow(2),
        "gb" | "gigabyte" => KB.pow(3),
        "tb" | "terabyte" => KB.pow(4),
        "kib" | "kibibyte" => KIB,
        "mib" | "mebibyte" => KIB.pow(2),
        "gib" | "gibibyte" => KIB.pow(3),
        "tib" | "tebibyte" => KIB.pow(4),
        _ => return None,
    };
    Some(m)
}

/// Parse a size string into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let caps = SIZE_REGEX.captures(input).ok_or_else(|| {
        Error::config(format!(
            "invalid size '{}': expected a number followed by a unit, e.g. '10 GB'",
            input
        ))
    })?;

    let magnitude: u64 = caps[1]
        .parse()
        .map_err(|_| Error::config(format!("invalid size '{}': number out of range", input)))?;

    let unit = &caps[2];
    let multiplier = unit_multiplier(unit).ok_or_else(|| {
        Error::config(format!(
            "invalid size '{}': unknown unit '{}' (use singular forms such as 'GB' or 'gigabyte')",
            input, unit
        ))
    })?;

    magnitude
        .checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("invalid size '{}': overflows u64 bytes", input)))
}
