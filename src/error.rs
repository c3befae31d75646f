use thiserror::Error;

pub use color_eyre::eyre::eyre;

pub type Result<T> = core::result::Result<T, Error>;

/// An error reported by the database server together with the server's
/// numeric error code. The code is what lets request implementations decide
/// whether a failure is recoverable (e.g. a missing table in batch mode).
#[derive(Debug, Clone, Error)]
#[error("Server error {code}: {message}")]
pub struct ServerError {
    pub code: u16,
    pub message: String,
}

/// Classification of the server errors the engine reacts to specifically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    NoSuchTable,
    NotPartitionedTable,
    NoSuchPartition,
    DuplicateKey,
    CantDropKey,
    Other,
}

impl ServerError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn kind(&self) -> ServerErrorKind {
        // MySQL/MariaDB error numbers
        match self.code {
            1146 => ServerErrorKind::NoSuchTable,
            1505 => ServerErrorKind::NotPartitionedTable,
            1735 => ServerErrorKind::NoSuchPartition,
            1061 => ServerErrorKind::DuplicateKey,
            1091 => ServerErrorKind::CantDropKey,
            _ => ServerErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfig(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("result set exceeds the configured cap: {0}")]
    LargeResult(String),

    #[error("file server error: {0}")]
    FileServer(String),

    #[error("A bug in replica-worker: {0}")]
    Logic(color_eyre::Report),
}

impl Error {
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(eyre!(msg.into()))
    }

    /// The server-error classification, `None` for every other error kind.
    pub fn server_kind(&self) -> Option<ServerErrorKind> {
        match self {
            Self::Server(err) => Some(err.kind()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
