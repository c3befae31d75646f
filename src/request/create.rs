//! Replica creation: copy all partitioned files of one chunk from a source
//! worker into the local data directory.
//!
//! The copy is staged through temporary names (`_<name>`) that replica scans
//! never match, so only the final rename sweep needs the data-folder mutex.
//! Disk space for every file is reserved up front by resizing the temporary
//! files to their final size, keeping mid-transfer writes from failing with
//! a full disk.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::debug;

use crate::checksum::wraparound_sum;
use crate::context::EngineContext;
use crate::error::Result;
use crate::fsname;
use crate::proto::{Status, StatusExt, now_micros};
use crate::replica::{FileInfo, ReplicaInfo, ReplicaStatus};
use crate::transfer::{FileTransfer, TransferSource};

use super::payload::CreateReplicaSpec;
use super::{ErrorContext, RequestCore, RequestTask, lock_or_recover};

#[derive(Debug, Default, Clone)]
struct FileDescr {
    name: String,
    in_size: u64,
    out_size: u64,
    mtime: u64,
    cs: u64,
    tmp_path: PathBuf,
    out_path: PathBuf,
    begin_transfer_time: u64,
    end_transfer_time: u64,
}

pub struct CreateReplicaTask {
    ctx: Arc<EngineContext>,
    spec: CreateReplicaSpec,
    /// `None` selects the dry-run mode of the TEST technology: no file or
    /// network side effects, immediate completion.
    transfer: Option<Box<dyn FileTransfer>>,
    files: Vec<String>,
    descr: Vec<FileDescr>,
    initialized: bool,
    file_idx: usize,
    source: Option<Box<dyn TransferSource>>,
    tmp_file: Option<File>,
    buf: Vec<u8>,
    replica_info: Option<ReplicaInfo>,
}

impl CreateReplicaTask {
    pub fn new(
        ctx: Arc<EngineContext>,
        spec: CreateReplicaSpec,
        transfer: Option<Box<dyn FileTransfer>>,
    ) -> Result<Self> {
        let database = ctx.databases.database(&spec.database)?;
        let files = fsname::partitioned_files(&database, spec.chunk);
        Ok(Self {
            ctx,
            spec,
            transfer,
            files,
            descr: Vec::new(),
            initialized: false,
            file_idx: 0,
            source: None,
            tmp_file: None,
            buf: Vec::new(),
            replica_info: None,
        })
    }

    fn release_resources(&mut self) {
        self.source = None;
        if let Some(file) = self.tmp_file.take() {
            let _ = file.sync_all();
        }
        self.buf = Vec::new();
    }

    /// Stat inputs, sanitize the destination, reserve disk space and open
    /// the first file pair. Runs exactly once.
    fn init(&mut self, core: &RequestCore) -> Result<bool> {
        self.initialized = true;

        let out_dir = self.ctx.database_data_dir(&self.spec.database)?;
        self.descr = self
            .files
            .iter()
            .map(|file| FileDescr {
                name: file.clone(),
                tmp_path: out_dir.join(format!("_{file}")),
                out_path: out_dir.join(file),
                ..FileDescr::default()
            })
            .collect();

        let transfer = match &self.transfer {
            Some(transfer) => transfer,
            None => return Err(crate::error::Error::logic("init without a transfer strategy")),
        };

        let mut errcx = ErrorContext::default();
        {
            let _folder = lock_or_recover(&self.ctx.data_folder_lock);

            // Learn the size and mtime of every input file and the total
            // space requirement.
            let mut total_bytes: u64 = 0;
            for descr in &mut self.descr {
                let stat = match transfer.stat(&self.spec.database, &descr.name) {
                    Ok(Some(stat)) => stat,
                    Ok(None) | Err(_) => {
                        errcx.merge(core.report_error_if(
                            true,
                            StatusExt::FileRemoteOpen,
                            format!(
                                "failed to open input file on worker '{}', database: {}, file: {}",
                                self.spec.source_worker, self.spec.database, descr.name
                            ),
                        ));
                        core.set_status(Status::Failed, errcx.ext)?;
                        return Ok(true);
                    }
                };
                descr.in_size = stat.size;
                descr.mtime = stat.mtime;
                total_bytes += stat.size;
            }

            // The output directory must exist.
            errcx.merge(core.report_error_if(
                !out_dir.is_dir(),
                StatusExt::NoFolder,
                format!("the output directory doesn't exist: {}", out_dir.display()),
            ));

            // Files with canonical names must not exist yet.
            for descr in &self.descr {
                errcx.merge(core.report_error_if(
                    descr.out_path.exists(),
                    StatusExt::FileExists,
                    format!("the output file already exists: {}", descr.out_path.display()),
                ));
            }

            // Remove leftovers of earlier attempts.
            for descr in &self.descr {
                if descr.tmp_path.exists() {
                    errcx.merge(core.report_error_if(
                        fs::remove_file(&descr.tmp_path).is_err(),
                        StatusExt::FileDelete,
                        format!("failed to remove temporary file: {}", descr.tmp_path.display()),
                    ));
                }
            }

            // The destination filesystem must accommodate all new files.
            // This runs after the temporary-file cleanup.
            match self.ctx.available_space(&out_dir) {
                Ok(available) => {
                    errcx.merge(core.report_error_if(
                        available < total_bytes,
                        StatusExt::NoSpace,
                        format!(
                            "not enough free space at the output folder: {} \
                             (required {total_bytes}, available {available})",
                            out_dir.display()
                        ),
                    ));
                }
                Err(e) => {
                    errcx.merge(core.report_error_if(
                        true,
                        StatusExt::SpaceRequest,
                        format!(
                            "failed to obtain space information at the output folder: {}: {e}",
                            out_dir.display()
                        ),
                    ));
                }
            }

            // Reserve the final size of each temporary file so later writes
            // cannot run out of space mid-transfer.
            if !errcx.failed {
                for descr in &self.descr {
                    let created = File::create(&descr.tmp_path);
                    match created {
                        Ok(file) => {
                            errcx.merge(core.report_error_if(
                                file.set_len(descr.in_size).and_then(|()| file.sync_all()).is_err(),
                                StatusExt::FileResize,
                                format!(
                                    "failed to resize the temporary file: {}",
                                    descr.tmp_path.display()
                                ),
                            ));
                        }
                        Err(e) => {
                            errcx.merge(core.report_error_if(
                                true,
                                StatusExt::FileCreate,
                                format!(
                                    "failed to create temporary file: {}: {e}",
                                    descr.tmp_path.display()
                                ),
                            ));
                        }
                    }
                }
            }
        }
        if errcx.failed {
            core.set_status(Status::Failed, errcx.ext)?;
            return Ok(true);
        }

        let buf_size = self.ctx.config().worker.fs_buf_size_bytes as usize;
        self.buf = vec![0; buf_size.max(1)];

        self.file_idx = 0;
        if !self.open_files(core)? {
            self.release_resources();
            return Ok(true);
        }
        Ok(false)
    }

    /// Open the next (source, temporary) file pair.
    fn open_files(&mut self, core: &RequestCore) -> Result<bool> {
        let descr = &mut self.descr[self.file_idx];
        debug!(
            id = core.id(),
            database = %self.spec.database,
            chunk = self.spec.chunk,
            file = %descr.name,
            "opening file pair"
        );
        let transfer = match &self.transfer {
            Some(transfer) => transfer,
            None => return Err(crate::error::Error::logic("open without a transfer strategy")),
        };
        match transfer.open(&self.spec.database, &descr.name) {
            Ok(Some(source)) => self.source = Some(source),
            Ok(None) | Err(_) => {
                let errcx = core.report_error_if(
                    true,
                    StatusExt::FileRemoteOpen,
                    format!(
                        "failed to open input file on worker '{}', database: {}, file: {}",
                        self.spec.source_worker, self.spec.database, descr.name
                    ),
                );
                core.set_status(Status::Failed, errcx.ext)?;
                return Ok(false);
            }
        }
        match OpenOptions::new().write(true).truncate(true).open(&descr.tmp_path) {
            Ok(file) => self.tmp_file = Some(file),
            Err(e) => {
                let errcx = core.report_error_if(
                    true,
                    StatusExt::FileOpen,
                    format!("failed to open temporary file: {}: {e}", descr.tmp_path.display()),
                );
                core.set_status(Status::Failed, errcx.ext)?;
                return Ok(false);
            }
        }
        descr.begin_transfer_time = now_micros();
        Ok(true)
    }

    /// Refresh the replica descriptor from the per-file transfer state.
    fn update_info(&mut self) {
        let mut total_in: u64 = 0;
        let mut total_out: u64 = 0;
        let files: Vec<FileInfo> = self
            .descr
            .iter()
            .map(|d| {
                total_in += d.in_size;
                total_out += d.out_size;
                FileInfo {
                    name: d.name.clone(),
                    size: d.out_size,
                    mtime: d.mtime,
                    cs: d.cs.to_string(),
                    begin_transfer_time: d.begin_transfer_time,
                    end_transfer_time: d.end_transfer_time,
                    in_size: d.in_size,
                }
            })
            .collect();
        let status = if total_in == total_out {
            ReplicaStatus::Complete
        } else {
            ReplicaStatus::Incomplete
        };
        self.replica_info = Some(ReplicaInfo::new(
            status,
            self.ctx.worker(),
            &self.spec.database,
            self.spec.chunk,
            now_micros(),
            files,
        ));
    }

    /// Rename the sweep of temporary files into their canonical names and
    /// restore the source mtimes, atomically with respect to replica scans.
    fn finalize(&mut self, core: &RequestCore) -> Result<bool> {
        self.release_resources();

        let mut errcx = ErrorContext::default();
        {
            let _folder = lock_or_recover(&self.ctx.data_folder_lock);
            for descr in &self.descr {
                errcx.merge(core.report_error_if(
                    fs::rename(&descr.tmp_path, &descr.out_path).is_err(),
                    StatusExt::FileRename,
                    format!("failed to rename file: {}", descr.tmp_path.display()),
                ));
                if errcx.failed {
                    break;
                }
                let restored = OpenOptions::new()
                    .write(true)
                    .open(&descr.out_path)
                    .and_then(|f| f.set_modified(UNIX_EPOCH + Duration::from_secs(descr.mtime)));
                errcx.merge(core.report_error_if(
                    restored.is_err(),
                    StatusExt::FileMtime,
                    format!("failed to change mtime of file: {}", descr.out_path.display()),
                ));
            }
        }
        if errcx.failed {
            core.set_status(Status::Failed, errcx.ext)?;
            return Ok(true);
        }
        self.update_info();
        core.set_status(Status::Success, StatusExt::None)?;
        Ok(true)
    }
}

impl RequestTask for CreateReplicaTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(
            id = core.id(),
            database = %self.spec.database,
            chunk = self.spec.chunk,
            source = %self.spec.source_worker,
            "replica creation step"
        );
        if let Err(e) = core.check_if_cancelling() {
            self.release_resources();
            return Err(e);
        }

        // The TEST technology simulates the request without side effects.
        if self.transfer.is_none() {
            self.replica_info = Some(ReplicaInfo::new(
                ReplicaStatus::Complete,
                self.ctx.worker(),
                &self.spec.database,
                self.spec.chunk,
                now_micros(),
                Vec::new(),
            ));
            core.set_status(Status::Success, StatusExt::None)?;
            return Ok(true);
        }

        if !self.initialized {
            let finished = self.init(core)?;
            if finished {
                return Ok(true);
            }
        }

        // Copy the next record of the currently open source file. The loop
        // exists to skip over empty files within a single step.
        while self.file_idx < self.files.len() {
            let num = {
                let source = match self.source.as_mut() {
                    Some(source) => source,
                    None => return Err(crate::error::Error::logic("copy loop without a source")),
                };
                source.read(&mut self.buf)
            };
            let descr = &mut self.descr[self.file_idx];
            match num {
                Ok(num) if num > 0 => {
                    let written = self
                        .tmp_file
                        .as_mut()
                        .map(|f| f.write_all(&self.buf[..num]))
                        .unwrap_or_else(|| Err(std::io::Error::other("no open temporary file")));
                    if let Err(e) = written {
                        let errcx = core.report_error_if(
                            true,
                            StatusExt::FileWrite,
                            format!(
                                "failed to write into temporary file: {}: {e}",
                                descr.tmp_path.display()
                            ),
                        );
                        core.set_status(Status::Failed, errcx.ext)?;
                        self.release_resources();
                        return Ok(true);
                    }
                    descr.out_size += num as u64;
                    descr.cs = wraparound_sum(descr.cs, &self.buf[..num]);
                    descr.end_transfer_time = now_micros();
                    self.update_info();
                    return Ok(false);
                }
                Ok(_) => {
                    // End of the source stream: sizes must match.
                    if descr.in_size != descr.out_size {
                        let errcx = core.report_error_if(
                            true,
                            StatusExt::FileRead,
                            format!(
                                "short read of the input file from worker '{}', database: {}, \
                                 file: {} ({} of {} bytes)",
                                self.spec.source_worker,
                                self.spec.database,
                                descr.name,
                                descr.out_size,
                                descr.in_size
                            ),
                        );
                        core.set_status(Status::Failed, errcx.ext)?;
                        self.release_resources();
                        return Ok(true);
                    }
                    self.source = None;
                    if let Some(file) = self.tmp_file.take() {
                        let flushed = file.sync_all();
                        if let Err(e) = flushed {
                            let errcx = core.report_error_if(
                                true,
                                StatusExt::FileWrite,
                                format!(
                                    "failed to flush temporary file: {}: {e}",
                                    descr.tmp_path.display()
                                ),
                            );
                            core.set_status(Status::Failed, errcx.ext)?;
                            self.release_resources();
                            return Ok(true);
                        }
                    }
                    descr.end_transfer_time = now_micros();
                    self.update_info();

                    self.file_idx += 1;
                    if self.file_idx < self.files.len() {
                        if !self.open_files(core)? {
                            self.release_resources();
                            return Ok(true);
                        }
                    }
                }
                Err(e) => {
                    let errcx = core.report_error_if(
                        true,
                        StatusExt::FileRead,
                        format!(
                            "failed to read input file from worker '{}', database: {}, \
                             file: {}: {e}",
                            self.spec.source_worker, self.spec.database, descr.name
                        ),
                    );
                    core.set_status(Status::Failed, errcx.ext)?;
                    self.release_resources();
                    return Ok(true);
                }
            }
        }

        self.finalize(core)
    }

    fn result(&self) -> Value {
        match &self.replica_info {
            Some(info) => json!({"replica_info": info.to_json()}),
            None => json!({}),
        }
    }
}
