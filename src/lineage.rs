//! Round key naming and ordering.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::Result;

lazy_static! {
    static ref ROUND_KEY: Regex = Regex::new(r"^.*_Round(\d+)$").expect("round key pattern is valid");
}

pub fn round_key(prefix: &str, round: usize) -> String {
    format!("{}_Round{}", prefix, round)
}

pub fn result_key(prefix: &str) -> String {
    format!("{}_result", prefix)
}

/// Round number embedded in a `<prefix>_Round<N>` key.
pub fn round_number(key: &str) -> Option<u64> {
    ROUND_KEY
        .captures(key)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Order round keys by their embedded round number.
///
/// Keys that do not look like `<prefix>_Round<N>` (or whose number does not
/// fit in a u64) come after all numbered keys, sorted as plain strings.
pub fn order_rounds<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    let mut numbered: Vec<(u64, &str)> = Vec::new();
    let mut other: Vec<&str> = Vec::new();
    for key in keys {
        let key = key.as_ref();
        match round_number(key) {
            Some(n) => numbered.push((n, key)),
            None => other.push(key),
        }
    }
    numbered.sort();
    other.sort();

    numbered
        .into_iter()
        .map(|(_, key)| key)
        .chain(other)
        .map(str::to_string)
        .collect()
}

/// Write `keys` one per line, in round order.
pub fn write_rounds<S: AsRef<str>>(path: &Path, keys: &[S]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for key in order_rounds(keys) {
        writeln!(writer, "{}", key)?;
    }
    writer.flush()?;
    Ok(())
}
