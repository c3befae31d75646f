//! Replica deletion: remove all partitioned files of one chunk.

use std::fs;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::context::EngineContext;
use crate::error::Result;
use crate::fsname;
use crate::proto::{Status, StatusExt, now_micros};
use crate::replica::{ReplicaInfo, ReplicaStatus};

use super::payload::DeleteReplicaSpec;
use super::{ErrorContext, RequestCore, RequestTask, lock_or_recover};

pub struct DeleteReplicaTask {
    ctx: Arc<EngineContext>,
    spec: DeleteReplicaSpec,
    files: Vec<String>,
    /// NOT_FOUND is the legitimate terminal description of a deleted
    /// replica, reported in every outcome.
    replica_info: ReplicaInfo,
}

impl DeleteReplicaTask {
    pub fn new(ctx: Arc<EngineContext>, spec: DeleteReplicaSpec) -> Result<Self> {
        let database = ctx.databases.database(&spec.database)?;
        let files = fsname::partitioned_files(&database, spec.chunk);
        let replica_info = ReplicaInfo::new(
            ReplicaStatus::NotFound,
            ctx.worker(),
            &spec.database,
            spec.chunk,
            now_micros(),
            Vec::new(),
        );
        Ok(Self { ctx, spec, files, replica_info })
    }
}

impl RequestTask for DeleteReplicaTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(
            id = core.id(),
            database = %self.spec.database,
            chunk = self.spec.chunk,
            "replica deletion"
        );
        core.check_if_cancelling()?;

        let data_dir = self.ctx.database_data_dir(&self.spec.database)?;
        let mut errcx = ErrorContext::default();
        let mut num_deleted = 0_usize;
        {
            let _folder = lock_or_recover(&self.ctx.data_folder_lock);
            errcx.merge(core.report_error_if(
                !data_dir.is_dir(),
                StatusExt::NoFolder,
                format!("the directory does not exist: {}", data_dir.display()),
            ));
            if !errcx.failed {
                for name in &self.files {
                    let path = data_dir.join(name);
                    match fs::remove_file(&path) {
                        Ok(()) => num_deleted += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            errcx.merge(core.report_error_if(
                                true,
                                StatusExt::FileDelete,
                                format!("failed to delete file: {}: {e}", path.display()),
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
        debug!(id = core.id(), num_deleted, "replica deletion done");
        core.set_status(Status::Success, StatusExt::None)?;
        Ok(true)
    }

    fn result(&self) -> Value {
        json!({"replica_info": self.replica_info.to_json()})
    }
}
