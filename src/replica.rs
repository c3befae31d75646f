//! Replica descriptors: the immutable values describing one chunk replica
//! and its backing files, as reported to the controller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    NotFound,
    Incomplete,
    Complete,
}

impl ReplicaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Incomplete => "INCOMPLETE",
            Self::Complete => "COMPLETE",
        }
    }
}

/// One file backing a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Short name within the database directory.
    pub name: String,
    /// Size on this worker.
    pub size: u64,
    /// Modification time (seconds since the UNIX epoch).
    pub mtime: u64,
    /// Control sum of the file content; empty when it was not computed.
    pub cs: String,
    /// When the transfer of this file started (µs since epoch, 0 if never).
    pub begin_transfer_time: u64,
    /// When the transfer of this file ended (µs since epoch, 0 if never).
    pub end_transfer_time: u64,
    /// Size at the source worker.
    pub in_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub status: ReplicaStatus,
    pub worker: String,
    pub database: String,
    pub chunk: u32,
    /// When this view of the replica was captured (µs since epoch).
    pub verify_time: u64,
    pub files: Vec<FileInfo>,
}

impl ReplicaInfo {
    pub fn new(
        status: ReplicaStatus,
        worker: impl Into<String>,
        database: impl Into<String>,
        chunk: u32,
        verify_time: u64,
        files: Vec<FileInfo>,
    ) -> Self {
        Self {
            status,
            worker: worker.into(),
            database: database.into(),
            chunk,
            verify_time,
            files,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
