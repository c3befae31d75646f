//! Filesystem-safe naming.
//!
//! Database (and other catalog object) names may contain characters that are
//! unsafe in a directory name. `obj2fs` escapes every byte outside
//! `[A-Za-z0-9_]` as `@` followed by four lowercase hex digits; `fs2obj`
//! reverses it. The mapping is unambiguous because `@` itself is never left
//! unescaped by the encoder.
//!
//! This module also owns the naming of partitioned chunk files: one file per
//! (table, chunk, extension), plus the overlap variant of each table.

use std::fmt::Write as _;

use crate::catalog::DatabaseInfo;
use crate::error::{Error, Result};

/// Extensions of the files backing one (table, chunk) pair.
const FILE_EXTENSIONS: [&str; 3] = ["frm", "MYD", "MYI"];

/// Tables carrying the chunk overlap data use this name suffix.
const OVERLAP_SUFFIX: &str = "FullOverlap";

/// Translate an object name into its filesystem-safe form.
pub fn obj2fs(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::InvalidParam("empty object name".to_string()));
    }
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            // The write into a String cannot fail.
            let _ = write!(out, "@{b:04x}");
        }
    }
    Ok(out)
}

/// Reverse translation of [`obj2fs`].
///
/// The decoder is lenient: an `@` that is not followed by exactly four hex
/// digits encoding a byte value passes through verbatim. Every output of
/// `obj2fs` decodes back to the original name.
pub fn fs2obj(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::InvalidParam("empty file system name".to_string()));
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' && i + 4 < bytes.len() {
            let digits = &bytes[i + 1..i + 5];
            if digits.iter().all(|b| b.is_ascii_hexdigit()) {
                let value = digits.iter().fold(0_u32, |acc, &b| {
                    acc * 16 + u32::from((b as char).to_digit(16).unwrap_or(0))
                });
                if value <= 0xFF {
                    out.push(value as u8);
                    i += 5;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out)
        .map_err(|_| Error::InvalidParam(format!("file system name '{name}' decodes to invalid UTF-8")))
}

/// Check if a name is usable as a catalog object name: printable, no control
/// characters. The empty name is a hard error, not merely invalid.
pub fn is_valid_object_name(name: &str) -> Result<bool> {
    if name.is_empty() {
        return Err(Error::InvalidParam("empty object name".to_string()));
    }
    Ok(name.bytes().all(|b| b >= 0x20 && b != 0x7F))
}

/// The exact on-disk file names of all partitioned files of a chunk, in
/// deterministic order.
pub fn partitioned_files(database: &DatabaseInfo, chunk: u32) -> Vec<String> {
    let mut files = Vec::new();
    for table in database.partitioned_tables() {
        for ext in FILE_EXTENSIONS {
            files.push(format!("{}_{chunk}.{ext}", table.name));
        }
        for ext in FILE_EXTENSIONS {
            files.push(format!("{}{OVERLAP_SUFFIX}_{chunk}.{ext}", table.name));
        }
    }
    files
}

/// Parse a directory entry into (table, chunk, extension) if it names a
/// partitioned file of the given database. Overlap files report the base
/// table name. Temporary files (leading `_`) never match since no table name
/// starts with an underscore followed by its own name.
pub fn parse_partitioned_file(
    database: &DatabaseInfo,
    file_name: &str,
) -> Option<(String, u32, String)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if !FILE_EXTENSIONS.contains(&ext) {
        return None;
    }
    let (base, chunk_str) = stem.rsplit_once('_')?;
    if chunk_str.is_empty() || !chunk_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let chunk: u32 = chunk_str.parse().ok()?;
    for table in database.partitioned_tables() {
        if base == table.name
            || (base.len() == table.name.len() + OVERLAP_SUFFIX.len()
                && base.starts_with(table.name.as_str())
                && base.ends_with(OVERLAP_SUFFIX))
        {
            return Some((table.name.clone(), chunk, ext.to_string()));
        }
    }
    None
}
