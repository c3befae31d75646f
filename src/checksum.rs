//! File checksums.
//!
//! Replica files carry a cheap control sum: the wrap-around sum of all byte
//! values as an unsigned 64-bit integer. The incremental engine below spreads
//! the work of summing a set of files over many small slices so a request can
//! stay responsive to cancellation between slices.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Extend a running wrap-around sum with a block of bytes.
pub fn wraparound_sum(seed: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(seed, |sum, &b| sum.wrapping_add(u64::from(b)))
}

/// Per-file outcome of the incremental engine.
#[derive(Debug, Clone, Default)]
pub struct FileSum {
    pub bytes: u64,
    pub sum: u64,
}

/// Re-entrant checksum engine over a list of files.
///
/// Each call to [`execute`](Self::execute) reads at most one slice from the
/// current file and returns `false` until every file has been fully summed.
pub struct MultiFileSumEngine {
    files: Vec<PathBuf>,
    slice_size: usize,
    current: usize,
    open: Option<File>,
    results: Vec<FileSum>,
    buf: Vec<u8>,
}

impl MultiFileSumEngine {
    pub fn new(files: Vec<PathBuf>, slice_size: usize) -> Self {
        let results = vec![FileSum::default(); files.len()];
        Self {
            files,
            slice_size: slice_size.max(1),
            current: 0,
            open: None,
            results,
            buf: Vec::new(),
        }
    }

    pub fn file_names(&self) -> &[PathBuf] {
        &self.files
    }

    /// Process one bounded slice. Returns `true` once all files are done.
    pub fn execute(&mut self) -> Result<bool> {
        if self.current >= self.files.len() {
            return Ok(true);
        }
        if self.open.is_none() {
            self.open = Some(File::open(&self.files[self.current])?);
            if self.buf.is_empty() {
                self.buf.resize(self.slice_size, 0);
            }
        }
        let file = match self.open.as_mut() {
            Some(f) => f,
            None => return Ok(true),
        };
        let num = file.read(&mut self.buf)?;
        if num == 0 {
            self.open = None;
            self.current += 1;
            return Ok(self.current >= self.files.len());
        }
        let entry = &mut self.results[self.current];
        entry.bytes += num as u64;
        entry.sum = wraparound_sum(entry.sum, &self.buf[..num]);
        Ok(false)
    }

    /// Result for one of the input files, by path.
    pub fn result(&self, file: &Path) -> Option<&FileSum> {
        self.files.iter().position(|f| f == file).map(|i| &self.results[i])
    }
}
