//! Controller-facing protocol values: request statuses, SQL request types,
//! service states and the queued-request header.
//!
//! All enums here are closed sets. Their numeric codes are part of the wire
//! contract with the controller and must not be reordered.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Primary status of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Created = 0,
    Success = 1,
    Queued = 2,
    InProgress = 3,
    IsCancelling = 4,
    Bad = 5,
    Failed = 6,
    Cancelled = 7,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Created,
            1 => Self::Success,
            2 => Self::Queued,
            3 => Self::InProgress,
            4 => Self::IsCancelling,
            5 => Self::Bad,
            6 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Success => "SUCCESS",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::IsCancelling => "IS_CANCELLING",
            Self::Bad => "BAD",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// A terminal status never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Bad | Self::Failed | Self::Cancelled)
    }
}

/// Refinement of a failure, meaningful only when the primary status is
/// FAILED or BAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusExt {
    None = 0,
    InvalidParam = 1,
    InvalidId = 2,
    FolderStat = 4,
    FolderCreate = 5,
    FileStat = 6,
    FileSize = 7,
    FolderRead = 8,
    FileRead = 9,
    FileRemoteOpen = 10,
    FileCreate = 11,
    FileOpen = 12,
    FileResize = 13,
    FileWrite = 14,
    FileCopy = 15,
    FileDelete = 16,
    FileRename = 17,
    FileExists = 18,
    SpaceRequest = 19,
    NoFolder = 20,
    NoFile = 21,
    NoAccess = 22,
    NoSpace = 23,
    FileMtime = 24,
    MysqlError = 25,
    LargeResult = 26,
    NoSuchTable = 27,
    NotPartitionedTable = 28,
    NoSuchPartition = 29,
    Multiple = 30,
    OtherException = 31,
    ForeignInstance = 32,
    DuplicateKey = 33,
    CantDropKey = 34,
}

impl StatusExt {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            1 => Self::InvalidParam,
            2 => Self::InvalidId,
            4 => Self::FolderStat,
            5 => Self::FolderCreate,
            6 => Self::FileStat,
            7 => Self::FileSize,
            8 => Self::FolderRead,
            9 => Self::FileRead,
            10 => Self::FileRemoteOpen,
            11 => Self::FileCreate,
            12 => Self::FileOpen,
            13 => Self::FileResize,
            14 => Self::FileWrite,
            15 => Self::FileCopy,
            16 => Self::FileDelete,
            17 => Self::FileRename,
            18 => Self::FileExists,
            19 => Self::SpaceRequest,
            20 => Self::NoFolder,
            21 => Self::NoFile,
            22 => Self::NoAccess,
            23 => Self::NoSpace,
            24 => Self::FileMtime,
            25 => Self::MysqlError,
            26 => Self::LargeResult,
            27 => Self::NoSuchTable,
            28 => Self::NotPartitionedTable,
            29 => Self::NoSuchPartition,
            30 => Self::Multiple,
            31 => Self::OtherException,
            32 => Self::ForeignInstance,
            33 => Self::DuplicateKey,
            34 => Self::CantDropKey,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::InvalidParam => "INVALID_PARAM",
            Self::InvalidId => "INVALID_ID",
            Self::FolderStat => "FOLDER_STAT",
            Self::FolderCreate => "FOLDER_CREATE",
            Self::FileStat => "FILE_STAT",
            Self::FileSize => "FILE_SIZE",
            Self::FolderRead => "FOLDER_READ",
            Self::FileRead => "FILE_READ",
            Self::FileRemoteOpen => "FILE_ROPEN",
            Self::FileCreate => "FILE_CREATE",
            Self::FileOpen => "FILE_OPEN",
            Self::FileResize => "FILE_RESIZE",
            Self::FileWrite => "FILE_WRITE",
            Self::FileCopy => "FILE_COPY",
            Self::FileDelete => "FILE_DELETE",
            Self::FileRename => "FILE_RENAME",
            Self::FileExists => "FILE_EXISTS",
            Self::SpaceRequest => "SPACE_REQ",
            Self::NoFolder => "NO_FOLDER",
            Self::NoFile => "NO_FILE",
            Self::NoAccess => "NO_ACCESS",
            Self::NoSpace => "NO_SPACE",
            Self::FileMtime => "FILE_MTIME",
            Self::MysqlError => "MYSQL_ERROR",
            Self::LargeResult => "LARGE_RESULT",
            Self::NoSuchTable => "NO_SUCH_TABLE",
            Self::NotPartitionedTable => "NOT_PARTITIONED_TABLE",
            Self::NoSuchPartition => "NO_SUCH_PARTITION",
            Self::Multiple => "MULTIPLE",
            Self::OtherException => "OTHER_EXCEPTION",
            Self::ForeignInstance => "FOREIGN_INSTANCE",
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::CantDropKey => "CANT_DROP_KEY",
        }
    }
}

/// State of the request-processing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    SuspendInProgress = 0,
    Suspended = 1,
    Running = 2,
}

impl ServiceState {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuspendInProgress => "SUSPEND_IN_PROGRESS",
            Self::Suspended => "SUSPENDED",
            Self::Running => "RUNNING",
        }
    }
}

/// Subtypes of the SQL management requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlRequestType {
    Query,
    CreateDatabase,
    DropDatabase,
    EnableDatabase,
    DisableDatabase,
    GrantAccess,
    CreateTable,
    DropTable,
    RemoveTablePartitioning,
    DropTablePartition,
    GetTableIndex,
    CreateTableIndex,
    DropTableIndex,
    AlterTable,
    TableRowStats,
}

impl SqlRequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::CreateDatabase => "CREATE_DATABASE",
            Self::DropDatabase => "DROP_DATABASE",
            Self::EnableDatabase => "ENABLE_DATABASE",
            Self::DisableDatabase => "DISABLE_DATABASE",
            Self::GrantAccess => "GRANT_ACCESS",
            Self::CreateTable => "CREATE_TABLE",
            Self::DropTable => "DROP_TABLE",
            Self::RemoveTablePartitioning => "REMOVE_TABLE_PARTITIONING",
            Self::DropTablePartition => "DROP_TABLE_PARTITION",
            Self::GetTableIndex => "GET_TABLE_INDEX",
            Self::CreateTableIndex => "CREATE_TABLE_INDEX",
            Self::DropTableIndex => "DROP_TABLE_INDEX",
            Self::AlterTable => "ALTER_TABLE",
            Self::TableRowStats => "TABLE_ROW_STATS",
        }
    }
}

/// Common parameters of every queued request submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequestHdr {
    /// Caller-chosen identifier, unique within the process.
    pub id: String,
    /// Higher priority requests are scheduled first.
    pub priority: i32,
    /// Request expiration timeout in seconds, 0 selects the configured default.
    pub timeout_sec: u32,
}

impl QueuedRequestHdr {
    pub fn new(id: impl Into<String>, priority: i32, timeout_sec: u32) -> Self {
        Self { id: id.into(), priority, timeout_sec }
    }

    pub fn to_json(&self) -> Value {
        json!({"id": self.id, "priority": self.priority, "timeout": self.timeout_sec})
    }
}

/// Microseconds since the UNIX epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// The response object for operations rejected at the service surface.
pub(crate) fn rejected(status: Status, ext: StatusExt) -> Value {
    json!({
        "status": status.code(),
        "status_str": status.as_str(),
        "status_ext": ext.code(),
        "status_ext_str": ext.as_str(),
    })
}
