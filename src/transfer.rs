//! File transfer strategies for replica creation.
//!
//! Replica creation needs two operations against the source worker: stat a
//! file and stream its content. The strategy implementing them is selected
//! by the factory from the configured technology: `FS` goes through the
//! file-server protocol, `POSIX` expects the source worker's data directory
//! to be mounted locally. (The `TEST` technology short-circuits replica
//! creation entirely and never reaches this layer.)

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};
use crate::fileclient::FileClient;
use crate::fsname;

#[derive(Debug, Clone, Copy)]
pub struct RemoteFileStat {
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch.
    pub mtime: u64,
}

/// An open source file being streamed to this worker.
pub trait TransferSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn size(&self) -> u64;
    fn mtime(&self) -> u64;
}

/// Access to the partitioned files of a database on the source worker.
/// `Ok(None)` uniformly means "file not present at the source".
pub trait FileTransfer: Send {
    fn stat(&self, database: &str, file: &str) -> Result<Option<RemoteFileStat>>;
    fn open(&self, database: &str, file: &str) -> Result<Option<Box<dyn TransferSource>>>;
}

/// Streams files from the source worker's file server.
pub struct FsTransfer {
    host: String,
    port: u16,
}

impl FsTransfer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl FileTransfer for FsTransfer {
    fn stat(&self, database: &str, file: &str) -> Result<Option<RemoteFileStat>> {
        Ok(FileClient::stat(&self.host, self.port, database, file)?
            .map(|client| RemoteFileStat { size: client.size(), mtime: client.mtime() }))
    }

    fn open(&self, database: &str, file: &str) -> Result<Option<Box<dyn TransferSource>>> {
        Ok(FileClient::open(&self.host, self.port, database, file)?
            .map(|client| Box::new(client) as Box<dyn TransferSource>))
    }
}

impl TransferSource for FileClient {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        FileClient::read(self, buf)
    }

    fn size(&self) -> u64 {
        FileClient::size(self)
    }

    fn mtime(&self) -> u64 {
        FileClient::mtime(self)
    }
}

/// Reads files straight out of the source worker's data directory, which
/// must be visible on the local filesystem.
pub struct PosixTransfer {
    source_data_dir: PathBuf,
}

impl PosixTransfer {
    pub fn new(source_data_dir: impl Into<PathBuf>) -> Self {
        Self { source_data_dir: source_data_dir.into() }
    }

    fn path_of(&self, database: &str, file: &str) -> Result<PathBuf> {
        Ok(self.source_data_dir.join(fsname::obj2fs(database)?).join(file))
    }
}

fn mtime_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FileTransfer for PosixTransfer {
    fn stat(&self, database: &str, file: &str) -> Result<Option<RemoteFileStat>> {
        let path = self.path_of(database, file)?;
        match std::fs::metadata(&path) {
            Ok(metadata) => Ok(Some(RemoteFileStat {
                size: metadata.len(),
                mtime: mtime_secs(&metadata),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn open(&self, database: &str, file: &str) -> Result<Option<Box<dyn TransferSource>>> {
        let path = self.path_of(database, file)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let metadata = file.metadata()?;
        Ok(Some(Box::new(PosixSource {
            file,
            size: metadata.len(),
            mtime: mtime_secs(&metadata),
        })))
    }
}

struct PosixSource {
    file: File,
    size: u64,
    mtime: u64,
}

impl TransferSource for PosixSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> u64 {
        self.mtime
    }
}
