//! Multi-replica lookup: scan one database's directory and grade every
//! chunk found there.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde_json::{Value, json};
use tracing::debug;

use crate::context::EngineContext;
use crate::error::Result;
use crate::fsname;
use crate::proto::{Status, StatusExt, now_micros};
use crate::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

use super::payload::FindAllReplicasSpec;
use super::{ErrorContext, RequestCore, RequestTask, lock_or_recover};

pub struct FindAllReplicasTask {
    ctx: Arc<EngineContext>,
    spec: FindAllReplicasSpec,
    replicas: Vec<ReplicaInfo>,
}

impl FindAllReplicasTask {
    pub fn new(ctx: Arc<EngineContext>, spec: FindAllReplicasSpec) -> Result<Self> {
        // The database must be known before the request is enqueued.
        let _ = ctx.databases.database(&spec.database)?;
        Ok(Self { ctx, spec, replicas: Vec::new() })
    }
}

impl RequestTask for FindAllReplicasTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(id = core.id(), database = %self.spec.database, "multi-replica lookup");
        core.check_if_cancelling()?;

        let database = self.ctx.databases.database(&self.spec.database)?;
        let data_dir = self.ctx.database_data_dir(&self.spec.database)?;

        let mut errcx = ErrorContext::default();
        let mut chunk_files: BTreeMap<u32, Vec<FileInfo>> = BTreeMap::new();
        {
            let _folder = lock_or_recover(&self.ctx.data_folder_lock);
            errcx.merge(core.report_error_if(
                !data_dir.is_dir(),
                StatusExt::NoFolder,
                format!("the directory does not exist: {}", data_dir.display()),
            ));
            if !errcx.failed {
                let entries = std::fs::read_dir(&data_dir);
                match entries {
                    Ok(entries) => {
                        for entry in entries {
                            let entry = match entry {
                                Ok(entry) => entry,
                                Err(e) => {
                                    errcx.merge(core.report_error_if(
                                        true,
                                        StatusExt::FolderRead,
                                        format!(
                                            "failed to read the directory: {}: {e}",
                                            data_dir.display()
                                        ),
                                    ));
                                    break;
                                }
                            };
                            let file_name = entry.file_name().to_string_lossy().into_owned();
                            let Some((_table, chunk, _ext)) =
                                fsname::parse_partitioned_file(&database, &file_name)
                            else {
                                continue;
                            };
                            let metadata = match entry.metadata() {
                                Ok(metadata) => metadata,
                                Err(e) => {
                                    errcx.merge(core.report_error_if(
                                        true,
                                        StatusExt::FileSize,
                                        format!(
                                            "failed to read file size: {}: {e}",
                                            entry.path().display()
                                        ),
                                    ));
                                    continue;
                                }
                            };
                            let mtime = metadata
                                .modified()
                                .ok()
                                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                                .map(|d| d.as_secs())
                                .unwrap_or(0);
                            chunk_files.entry(chunk).or_default().push(FileInfo {
                                name: file_name,
                                size: metadata.len(),
                                mtime,
                                // Never computed by this type of request.
                                cs: String::new(),
                                begin_transfer_time: 0,
                                end_transfer_time: 0,
                                in_size: metadata.len(),
                            });
                        }
                    }
                    Err(e) => {
                        errcx.merge(core.report_error_if(
                            true,
                            StatusExt::FolderRead,
                            format!("failed to read the directory: {}: {e}", data_dir.display()),
                        ));
                    }
                }
            }
        }
        if errcx.failed {
            core.set_status(Status::Failed, errcx.ext)?;
            return Ok(true);
        }

        // Chunk 0 defines the canonical number of files per chunk.
        let files_per_chunk = fsname::partitioned_files(&database, 0).len();
        let verify_time = now_micros();
        self.replicas = chunk_files
            .into_iter()
            .map(|(chunk, files)| {
                let status = if files.len() < files_per_chunk {
                    ReplicaStatus::Incomplete
                } else {
                    ReplicaStatus::Complete
                };
                ReplicaInfo::new(
                    status,
                    self.ctx.worker(),
                    &self.spec.database,
                    chunk,
                    verify_time,
                    files,
                )
            })
            .collect();
        core.set_status(Status::Success, StatusExt::None)?;
        Ok(true)
    }

    fn result(&self) -> Value {
        let many: Vec<Value> = self.replicas.iter().map(ReplicaInfo::to_json).collect();
        json!({"replica_info_many": many})
    }
}
