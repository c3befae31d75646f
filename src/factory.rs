//! Request construction.
//!
//! The factory validates a submission's payload and assembles the request
//! object, choosing the replica-transfer strategy from the configured
//! technology. Validation failures surface here, before anything is
//! enqueued.

use std::sync::Arc;

use crate::config::Technology;
use crate::context::EngineContext;
use crate::db::pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::proto::QueuedRequestHdr;
use crate::request::create::CreateReplicaTask;
use crate::request::delete::DeleteReplicaTask;
use crate::request::echo::EchoTask;
use crate::request::find::FindReplicaTask;
use crate::request::find_all::FindAllReplicasTask;
use crate::request::index::DirectorIndexTask;
use crate::request::payload::{CreateReplicaSpec, RequestSpec};
use crate::request::sql::SqlTask;
use crate::request::{Request, RequestTask};
use crate::transfer::{FileTransfer, FsTransfer, PosixTransfer};

pub struct RequestFactory {
    ctx: Arc<EngineContext>,
    pool: Arc<ConnectionPool>,
    technology: Technology,
}

impl RequestFactory {
    pub fn new(ctx: Arc<EngineContext>, pool: Arc<ConnectionPool>) -> Self {
        let technology = ctx.config().worker.technology;
        Self { ctx, pool, technology }
    }

    pub fn technology(&self) -> Technology {
        self.technology
    }

    /// Build a request from a validated submission.
    pub fn create(&self, hdr: QueuedRequestHdr, spec: RequestSpec) -> Result<Arc<Request>> {
        if hdr.id.is_empty() {
            return Err(Error::InvalidParam("empty request id".to_string()));
        }
        let kind = spec.kind();
        let req_json = spec.to_json();
        let expiration_timeout_sec = if hdr.timeout_sec == 0 {
            self.ctx.config().controller.request_timeout_sec
        } else {
            hdr.timeout_sec
        };

        let task: Box<dyn RequestTask> = match spec {
            RequestSpec::Echo(spec) => {
                spec.validate()?;
                Box::new(EchoTask::new(spec.delay_ms, spec.data))
            }
            RequestSpec::CreateReplica(spec) => {
                spec.validate(self.ctx.worker())?;
                let transfer = self.transfer_for(&spec)?;
                Box::new(CreateReplicaTask::new(Arc::clone(&self.ctx), spec, transfer)?)
            }
            RequestSpec::DeleteReplica(spec) => {
                Box::new(DeleteReplicaTask::new(Arc::clone(&self.ctx), spec)?)
            }
            RequestSpec::FindReplica(spec) => {
                Box::new(FindReplicaTask::new(Arc::clone(&self.ctx), spec)?)
            }
            RequestSpec::FindAllReplicas(spec) => {
                Box::new(FindAllReplicasTask::new(Arc::clone(&self.ctx), spec)?)
            }
            RequestSpec::Sql(spec) => {
                spec.validate()?;
                Box::new(SqlTask::new(Arc::clone(&self.ctx), spec)?)
            }
            RequestSpec::DirectorIndex(spec) => Box::new(DirectorIndexTask::new(
                Arc::clone(&self.ctx),
                spec,
                Arc::clone(&self.pool),
                &hdr.id,
            )?),
        };

        let worker = self.ctx.worker().to_string();
        Ok(Arc::new(Request::new(hdr, kind, worker, req_json, expiration_timeout_sec, task)))
    }

    /// The transfer strategy of a replica-creation request. `None` selects
    /// the TEST dry run.
    fn transfer_for(&self, spec: &CreateReplicaSpec) -> Result<Option<Box<dyn FileTransfer>>> {
        match self.technology {
            Technology::Test => Ok(None),
            Technology::Posix => {
                let dir = spec.source_data_dir.as_ref().ok_or_else(|| {
                    Error::InvalidParam(
                        "POSIX replica creation requires the source data directory".to_string(),
                    )
                })?;
                Ok(Some(Box::new(PosixTransfer::new(dir))))
            }
            Technology::Fs => {
                if spec.source_host.is_empty() || spec.source_port == 0 {
                    return Err(Error::InvalidParam(
                        "replica creation requires the source worker's file-server \
                         host and port"
                            .to_string(),
                    ));
                }
                Ok(Some(Box::new(FsTransfer::new(&spec.source_host, spec.source_port))))
            }
        }
    }
}
