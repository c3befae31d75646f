//! The request object.
//!
//! A request combines an immutable identity (id, type, priority, payload)
//! with a two-layer status and a type-specific state machine executed in
//! bounded steps by a worker thread. Status transitions follow a fixed
//! matrix; every other transition is an internal logic error.
//!
//! Cancellation is cooperative: `cancel` flips an in-progress request to
//! IS_CANCELLING and the executing task observes it at its next safe point
//! through `check_if_cancelling`, which finalizes the status and raises
//! [`Error::Cancelled`]. Only the worker-thread loop handles that error.

pub mod create;
pub mod delete;
pub mod echo;
pub mod find;
pub mod find_all;
pub mod index;
pub mod payload;
pub mod sql;

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Value, json};
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::proto::{QueuedRequestHdr, Status, StatusExt, now_micros};

static NUM_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Start/finish timestamps of a request, µs since the UNIX epoch, readable
/// without locks.
#[derive(Debug, Default)]
pub struct Performance {
    start_time: AtomicU64,
    finish_time: AtomicU64,
}

impl Performance {
    pub fn start_time(&self) -> u64 {
        self.start_time.load(Ordering::Relaxed)
    }

    pub fn finish_time(&self) -> u64 {
        self.finish_time.load(Ordering::Relaxed)
    }

    fn set_start(&self) {
        self.start_time.store(now_micros(), Ordering::Relaxed);
    }

    fn set_finish(&self) {
        self.finish_time.store(now_micros(), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.start_time.store(0, Ordering::Relaxed);
        self.finish_time.store(0, Ordering::Relaxed);
    }

    fn reset_finish(&self) {
        self.finish_time.store(0, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> Value {
        json!({"start_time": self.start_time(), "finish_time": self.finish_time()})
    }
}

/// Accumulator mapping the first triggered failure of a request to its
/// (FAILED, extended-status) pair. The first error usually causes a
/// downstream cascade, so later reports are ignored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorContext {
    pub failed: bool,
    pub ext: StatusExt,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self { failed: false, ext: StatusExt::None }
    }
}

impl ErrorContext {
    pub fn merge(&mut self, other: ErrorContext) {
        if other.failed && !self.failed {
            *self = other;
        }
    }
}

/// Identity and status shared by every request type.
pub struct RequestCore {
    hdr: QueuedRequestHdr,
    kind: String,
    worker: String,
    req: Value,
    expiration_timeout_sec: u32,
    status: AtomicU32,
    status_ext: AtomicU32,
    performance: Performance,
    /// Serializes status transitions; status reads stay lock-free.
    state_lock: Mutex<()>,
}

impl RequestCore {
    fn new(
        hdr: QueuedRequestHdr,
        kind: String,
        worker: String,
        req: Value,
        expiration_timeout_sec: u32,
    ) -> Self {
        Self {
            hdr,
            kind,
            worker,
            req,
            expiration_timeout_sec,
            status: AtomicU32::new(Status::Created.code()),
            status_ext: AtomicU32::new(StatusExt::None.code()),
            performance: Performance::default(),
            state_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.hdr.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn priority(&self) -> i32 {
        self.hdr.priority
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// The caller-supplied payload, echoed back in every response.
    pub fn req(&self) -> &Value {
        &self.req
    }

    pub fn expiration_timeout_sec(&self) -> u32 {
        self.expiration_timeout_sec
    }

    pub fn performance(&self) -> &Performance {
        &self.performance
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.status.load(Ordering::Acquire))
    }

    pub fn extended_status(&self) -> StatusExt {
        StatusExt::from_code(self.status_ext.load(Ordering::Relaxed))
    }

    fn context(&self, func: &str) -> String {
        format!("{} {} {} {func}", self.id(), self.kind(), self.status().as_str())
    }

    /// CREATED -> IN_PROGRESS, recording the start time.
    pub fn start(&self) -> Result<()> {
        let guard = self.lock_state();
        match self.status() {
            Status::Created => self.set_status_locked(&guard, Status::InProgress, StatusExt::None),
            other => Err(Error::logic(format!(
                "{}: start is not allowed while in status {}",
                self.context("start"),
                other.as_str()
            ))),
        }
    }

    /// Return the request to CREATED from any state. Used when a worker
    /// thread is told to stop mid-request and the request goes back to the
    /// input queue.
    pub fn stop(&self) -> Result<()> {
        let guard = self.lock_state();
        self.set_status_locked(&guard, Status::Created, StatusExt::None)
    }

    /// Cancellation matrix:
    /// {CREATED, QUEUED, CANCELLED} -> CANCELLED;
    /// {IN_PROGRESS, IS_CANCELLING} -> IS_CANCELLING;
    /// terminal states are no-ops.
    pub fn cancel(&self) -> Result<()> {
        let guard = self.lock_state();
        match self.status() {
            Status::Created | Status::Queued | Status::Cancelled => {
                self.set_status_locked(&guard, Status::Cancelled, StatusExt::None)
            }
            Status::InProgress | Status::IsCancelling => {
                self.set_status_locked(&guard, Status::IsCancelling, StatusExt::None)
            }
            Status::Success | Status::Failed | Status::Bad => Ok(()),
        }
    }

    /// Roll the request back into CREATED, or finalize a pending
    /// cancellation:
    /// {CREATED, IN_PROGRESS} -> CREATED;
    /// {IS_CANCELLING} -> CANCELLED, raising the cancelled sentinel.
    pub fn rollback(&self) -> Result<()> {
        let guard = self.lock_state();
        match self.status() {
            Status::Created | Status::InProgress => {
                self.set_status_locked(&guard, Status::Created, StatusExt::None)
            }
            Status::IsCancelling => {
                self.set_status_locked(&guard, Status::Cancelled, StatusExt::None)?;
                Err(Error::Cancelled)
            }
            other => Err(Error::logic(format!(
                "{}: rollback is not allowed while in status {}",
                self.context("rollback"),
                other.as_str()
            ))),
        }
    }

    /// To be called by tasks at every safe point of `execute`:
    /// IN_PROGRESS passes, IS_CANCELLING finalizes to CANCELLED and raises
    /// the cancelled sentinel.
    pub fn check_if_cancelling(&self) -> Result<()> {
        let guard = self.lock_state();
        match self.status() {
            Status::InProgress => Ok(()),
            Status::IsCancelling => {
                self.set_status_locked(&guard, Status::Cancelled, StatusExt::None)?;
                Err(Error::Cancelled)
            }
            other => Err(Error::logic(format!(
                "{}: execution is not allowed while in status {}",
                self.context("check_if_cancelling"),
                other.as_str()
            ))),
        }
    }

    /// Set the two-layer status, with the performance-counter bookkeeping
    /// tied to each transition.
    pub fn set_status(&self, status: Status, ext: StatusExt) -> Result<()> {
        let guard = self.lock_state();
        self.set_status_locked(&guard, status, ext)
    }

    fn set_status_locked(
        &self,
        _guard: &std::sync::MutexGuard<'_, ()>,
        status: Status,
        ext: StatusExt,
    ) -> Result<()> {
        trace!(
            id = self.id(),
            from = self.status().as_str(),
            to = status.as_str(),
            ext = ext.as_str(),
            "status transition"
        );
        match status {
            Status::Created => self.performance.reset(),
            Status::InProgress => {
                self.performance.set_start();
                self.performance.reset_finish();
            }
            Status::IsCancelling => {}
            Status::Cancelled => {
                // Give the start time a meaningful value in case the request
                // was cancelled while still sitting in the input queue.
                if self.performance.start_time() == 0 {
                    self.performance.set_start();
                }
                self.performance.set_finish();
            }
            Status::Success | Status::Failed => self.performance.set_finish(),
            Status::Queued | Status::Bad => {
                return Err(Error::logic(format!(
                    "{}: unhandled status {}",
                    self.context("set_status"),
                    status.as_str()
                )));
            }
        }
        // The primary status is modified last so that a client observing a
        // terminal status reads the matching extended status.
        self.status_ext.store(ext.code(), Ordering::Relaxed);
        self.status.store(status.code(), Ordering::Release);
        Ok(())
    }

    /// Record a failure condition into a fresh [`ErrorContext`], logging it.
    pub(crate) fn report_error_if(
        &self,
        condition: bool,
        ext: StatusExt,
        message: impl AsRef<str>,
    ) -> ErrorContext {
        if condition {
            error!(id = self.id(), kind = self.kind(), ext = ext.as_str(), "{}", message.as_ref());
            ErrorContext { failed: true, ext }
        } else {
            ErrorContext::default()
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.state_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Lock a plain mutex, recovering from poisoning.
pub(crate) fn lock_or_recover(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Type-specific behavior of a request, executed in bounded steps.
pub(crate) trait RequestTask: Send {
    /// One step. `Ok(true)` means the request reached a terminal status
    /// (success or failure). [`Error::Cancelled`] aborts the request after
    /// the status was finalized to CANCELLED.
    fn execute(&mut self, core: &RequestCore) -> Result<bool>;

    /// The type-specific result. Only meaningful once the status is SUCCESS.
    fn result(&self) -> Value;
}

/// A queued request: shared identity plus the exclusive task state.
pub struct Request {
    core: RequestCore,
    task: Mutex<Box<dyn RequestTask>>,
}

impl Request {
    pub(crate) fn new(
        hdr: QueuedRequestHdr,
        kind: impl Into<String>,
        worker: impl Into<String>,
        req: Value,
        expiration_timeout_sec: u32,
        task: Box<dyn RequestTask>,
    ) -> Self {
        NUM_INSTANCES.fetch_add(1, Ordering::Relaxed);
        Self {
            core: RequestCore::new(hdr, kind.into(), worker.into(), req, expiration_timeout_sec),
            task: Mutex::new(task),
        }
    }

    /// Live request objects in this process, for leak diagnostics.
    pub fn num_instances() -> usize {
        NUM_INSTANCES.load(Ordering::Relaxed)
    }

    /// Run one step of the request. Called repeatedly by a worker thread
    /// until it returns `true` or raises the cancelled sentinel.
    pub fn execute(&self) -> Result<bool> {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        task.execute(&self.core)
    }

    /// Serialize the externally visible state of the request. The result
    /// object is populated only when requested and the request succeeded.
    pub fn to_json(&self, include_result_if_finished: bool) -> Value {
        let mut response = self.core.hdr.to_json();
        response["req"] = self.core.req.clone();
        response["type"] = json!(self.core.kind);
        let status = self.core.status();
        let ext = self.core.extended_status();
        response["status"] = json!(status.code());
        response["status_str"] = json!(status.as_str());
        response["status_ext"] = json!(ext.code());
        response["status_ext_str"] = json!(ext.as_str());
        response["expiration_timeout_sec"] = json!(self.core.expiration_timeout_sec);
        response["performance"] = self.core.performance.to_json();
        response["result"] = json!({});
        if include_result_if_finished && status == Status::Success {
            let task = match self.task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            response["result"] = task.result();
        }
        response
    }
}

impl Deref for Request {
    type Target = RequestCore;
    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        NUM_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn core() -> RequestCore {
        RequestCore::new(
            QueuedRequestHdr::new("r1", 0, 0),
            "TEST_ECHO".to_string(),
            "worker-A".to_string(),
            json!({}),
            600,
        )
    }

    #[test]
    fn start_is_only_allowed_from_created() {
        let core = core();
        assert_eq!(core.status(), Status::Created);
        core.start().expect("start");
        assert_eq!(core.status(), Status::InProgress);
        assert!(core.performance().start_time() > 0);
        assert!(core.start().is_err());
    }

    #[test]
    fn cancelling_a_created_request_is_terminal() {
        let core = core();
        core.cancel().expect("cancel");
        assert_eq!(core.status(), Status::Cancelled);
        // Cancelled requests got both timestamps.
        assert!(core.performance().start_time() > 0);
        assert!(core.performance().finish_time() > 0);
        // Idempotent.
        core.cancel().expect("cancel again");
        assert_eq!(core.status(), Status::Cancelled);
    }

    #[test]
    fn cancelling_a_running_request_starts_the_protocol() {
        let core = core();
        core.start().expect("start");
        core.cancel().expect("cancel");
        assert_eq!(core.status(), Status::IsCancelling);
        // The executing side observes and finalizes.
        assert!(core.check_if_cancelling().expect_err("sentinel").is_cancelled());
        assert_eq!(core.status(), Status::Cancelled);
    }

    #[test]
    fn terminal_statuses_ignore_further_cancels() {
        let core = core();
        core.start().expect("start");
        core.set_status(Status::Success, StatusExt::None).expect("success");
        core.cancel().expect("cancel is a no-op");
        assert_eq!(core.status(), Status::Success);
    }

    #[test]
    fn rollback_returns_a_running_request_to_created() {
        let core = core();
        core.start().expect("start");
        core.rollback().expect("rollback");
        assert_eq!(core.status(), Status::Created);
        assert_eq!(core.performance().start_time(), 0);
    }

    #[test]
    fn rollback_finalizes_a_pending_cancellation() {
        let core = core();
        core.start().expect("start");
        core.cancel().expect("cancel");
        assert!(core.rollback().expect_err("sentinel").is_cancelled());
        assert_eq!(core.status(), Status::Cancelled);
    }

    #[test]
    fn a_failure_always_carries_its_extended_status() {
        let core = core();
        core.start().expect("start");
        core.set_status(Status::Failed, StatusExt::NoSpace).expect("fail");
        assert_eq!(core.status(), Status::Failed);
        assert_eq!(core.extended_status(), StatusExt::NoSpace);
        assert!(core.performance().finish_time() >= core.performance().start_time());
    }

    #[test]
    fn the_error_context_keeps_the_first_failure() {
        let mut errcx = ErrorContext::default();
        errcx.merge(ErrorContext { failed: false, ext: StatusExt::None });
        assert!(!errcx.failed);
        errcx.merge(ErrorContext { failed: true, ext: StatusExt::NoFile });
        errcx.merge(ErrorContext { failed: true, ext: StatusExt::NoSpace });
        assert!(errcx.failed);
        assert_eq!(errcx.ext, StatusExt::NoFile);
    }
}
