//! Shared environment of all requests of one worker process.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::catalog::{DatabaseInfo, DatabaseRegistry};
use crate::config::Config;
use crate::db::Connector;
use crate::error::{Error, Result};
use crate::fsname;
use crate::namedlock::NamedMutexRegistry;

type SpaceProbe = Box<dyn Fn(&Path) -> Result<u64> + Send + Sync>;

/// The environment a request executes in: configuration, catalog, the
/// process-wide mutexes and the database connector. Owned behind an `Arc`
/// by the processor and every task.
pub struct EngineContext {
    worker: String,
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    pub databases: DatabaseRegistry,
    pub named_mutexes: NamedMutexRegistry,
    /// Serializes mutations of the data-directory namespace. Held only for
    /// the phases that rename, delete or enumerate canonical file names.
    pub data_folder_lock: Mutex<()>,
    pub connector: Connector,
    space_probe: SpaceProbe,
}

impl EngineContext {
    pub fn new(
        worker: impl Into<String>,
        config: Config,
        databases: impl IntoIterator<Item = DatabaseInfo>,
        connector: Connector,
    ) -> Self {
        Self {
            worker: worker.into(),
            config: RwLock::new(config),
            config_path: None,
            databases: DatabaseRegistry::new(databases),
            named_mutexes: NamedMutexRegistry::new(),
            data_folder_lock: Mutex::new(()),
            connector,
            space_probe: Box::new(available_space_of),
        }
    }

    /// Remember where the configuration was loaded from so `reconfig` can
    /// reload it.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Replace the filesystem space probe (used by tests to simulate a full
    /// disk).
    pub fn with_space_probe(
        mut self,
        probe: impl Fn(&Path) -> Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.space_probe = Box::new(probe);
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn config(&self) -> Config {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reload the configuration from its file, if one was recorded.
    pub fn reload_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let fresh = Config::from_file(path)?;
        let mut guard = self
            .config
            .write()
            .map_err(|_| Error::logic("config lock poisoned"))?;
        *guard = fresh;
        Ok(())
    }

    /// `<data-dir>/<database-fs-safe>`, the directory holding the chunk
    /// files of one database.
    pub fn database_data_dir(&self, database: &str) -> Result<PathBuf> {
        Ok(self.config().worker.data_dir.join(fsname::obj2fs(database)?))
    }

    /// Bytes available to unprivileged writers on the filesystem of `path`.
    pub fn available_space(&self, path: &Path) -> Result<u64> {
        (self.space_probe)(path)
    }
}

/// Query the filesystem for its available space.
#[cfg(unix)]
fn available_space_of(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidParam(format!("path contains NUL: {}", path.display())))?;
    // SAFETY: statvfs writes into the zero-initialized out-parameter and
    // reads only the NUL-terminated path.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_space_of(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
