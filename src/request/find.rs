//! Replica lookup: report which partitioned files of one chunk are present,
//! optionally computing their control sums incrementally.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde_json::{Value, json};
use tracing::debug;

use crate::checksum::MultiFileSumEngine;
use crate::context::EngineContext;
use crate::error::Result;
use crate::fsname;
use crate::proto::{Status, StatusExt, now_micros};
use crate::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

use super::payload::FindReplicaSpec;
use super::{ErrorContext, RequestCore, RequestTask, lock_or_recover};

pub struct FindReplicaTask {
    ctx: Arc<EngineContext>,
    spec: FindReplicaSpec,
    expected_files: Vec<String>,
    engine: Option<MultiFileSumEngine>,
    replica_info: Option<ReplicaInfo>,
}

impl FindReplicaTask {
    pub fn new(ctx: Arc<EngineContext>, spec: FindReplicaSpec) -> Result<Self> {
        let database = ctx.databases.database(&spec.database)?;
        let expected_files = fsname::partitioned_files(&database, spec.chunk);
        Ok(Self { ctx, spec, expected_files, engine: None, replica_info: None })
    }

    fn grade(&self, found: usize) -> ReplicaStatus {
        if found == 0 {
            ReplicaStatus::NotFound
        } else if found == self.expected_files.len() {
            ReplicaStatus::Complete
        } else {
            ReplicaStatus::Incomplete
        }
    }

    /// Enumerate the present files. In the fast mode the result is complete;
    /// in the checksum mode the file list seeds the incremental engine.
    fn scan(&mut self, core: &RequestCore) -> Result<Option<bool>> {
        let data_dir = self.ctx.database_data_dir(&self.spec.database)?;
        let mut errcx = ErrorContext::default();
        let mut file_infos: Vec<FileInfo> = Vec::new();
        let mut present: Vec<PathBuf> = Vec::new();
        {
            let _folder = lock_or_recover(&self.ctx.data_folder_lock);
            errcx.merge(core.report_error_if(
                !data_dir.is_dir(),
                StatusExt::NoFolder,
                format!("the directory does not exist: {}", data_dir.display()),
            ));
            if errcx.failed {
                core.set_status(Status::Failed, errcx.ext)?;
                return Ok(Some(true));
            }

            // A missing file is not a failure; only filesystem errors are.
            for name in &self.expected_files {
                let path = data_dir.join(name);
                let metadata = match std::fs::metadata(&path) {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        errcx.merge(core.report_error_if(
                            true,
                            StatusExt::FileStat,
                            format!("failed to check the status of file: {}: {e}", path.display()),
                        ));
                        continue;
                    }
                };
                if self.spec.compute_cs {
                    present.push(path);
                } else {
                    let mtime = metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    file_infos.push(FileInfo {
                        name: name.clone(),
                        size: metadata.len(),
                        mtime,
                        cs: String::new(),
                        begin_transfer_time: 0,
                        end_transfer_time: 0,
                        in_size: metadata.len(),
                    });
                }
            }
        }
        if errcx.failed {
            core.set_status(Status::Failed, errcx.ext)?;
            return Ok(Some(true));
        }

        if !self.spec.compute_cs {
            let status = self.grade(file_infos.len());
            self.replica_info = Some(ReplicaInfo::new(
                status,
                self.ctx.worker(),
                &self.spec.database,
                self.spec.chunk,
                now_micros(),
                file_infos,
            ));
            core.set_status(Status::Success, StatusExt::None)?;
            return Ok(Some(true));
        }

        let slice = self.ctx.config().worker.fs_buf_size_bytes as usize;
        self.engine = Some(MultiFileSumEngine::new(present, slice));
        Ok(None)
    }

    /// Collect the per-file statistics once the engine has drained.
    fn finish_checksums(&mut self, core: &RequestCore) -> Result<bool> {
        let engine = match self.engine.as_ref() {
            Some(engine) => engine,
            None => return Err(crate::error::Error::logic("finish without an engine")),
        };
        let mut errcx = ErrorContext::default();
        let mut file_infos: Vec<FileInfo> = Vec::new();
        for path in engine.file_names() {
            let sum = engine.result(path).cloned().unwrap_or_default();
            let mtime = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            errcx.merge(core.report_error_if(
                mtime.is_none(),
                StatusExt::FileMtime,
                format!("failed to read file mtime: {}", path.display()),
            ));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            file_infos.push(FileInfo {
                name,
                size: sum.bytes,
                mtime: mtime.unwrap_or(0),
                cs: sum.sum.to_string(),
                begin_transfer_time: 0,
                end_transfer_time: 0,
                in_size: sum.bytes,
            });
        }
        if errcx.failed {
            core.set_status(Status::Failed, errcx.ext)?;
            return Ok(true);
        }
        let status = self.grade(file_infos.len());
        self.replica_info = Some(ReplicaInfo::new(
            status,
            self.ctx.worker(),
            &self.spec.database,
            self.spec.chunk,
            now_micros(),
            file_infos,
        ));
        core.set_status(Status::Success, StatusExt::None)?;
        Ok(true)
    }
}

impl RequestTask for FindReplicaTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(
            id = core.id(),
            database = %self.spec.database,
            chunk = self.spec.chunk,
            compute_cs = self.spec.compute_cs,
            "replica lookup step"
        );
        if let Err(e) = core.check_if_cancelling() {
            self.engine = None;
            return Err(e);
        }

        if self.engine.is_none() {
            if let Some(finished) = self.scan(core)? {
                return Ok(finished);
            }
        }

        // One bounded slice of checksum work per step.
        let step = match self.engine.as_mut() {
            Some(engine) => engine.execute(),
            None => return Err(crate::error::Error::logic("lookup step without an engine")),
        };
        let done = match step {
            Ok(done) => done,
            Err(e) => {
                let errcx = core.report_error_if(
                    true,
                    StatusExt::FileRead,
                    format!("checksum computation failed: {e}"),
                );
                core.set_status(Status::Failed, errcx.ext)?;
                self.engine = None;
                return Ok(true);
            }
        };
        if !done {
            return Ok(false);
        }
        let finished = self.finish_checksums(core)?;
        // The engine may still hold buffers; drop it as soon as it drained.
        self.engine = None;
        Ok(finished)
    }

    fn result(&self) -> Value {
        match &self.replica_info {
            Some(info) => json!({"replica_info": info.to_json()}),
            None => json!({}),
        }
    }
}
