//! The request processor: priority scheduling, the worker thread pool and
//! the uniform submit/status/track/stop/dispose surface.
//!
//! A request lives in exactly one of three containers: the priority queue of
//! new requests, the by-id map of in-progress requests, or the by-id map of
//! finished requests. All moves between them happen under one mutex, and
//! `dispose` (which only touches the finished map) is the sole point where
//! a request leaves the processor.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::expiry::ExpiryService;
use crate::factory::RequestFactory;
use crate::db::pool::ConnectionPool;
use crate::proto::{QueuedRequestHdr, ServiceState, Status, StatusExt, now_micros, rejected};
use crate::request::Request;
use crate::request::payload::{
    CreateReplicaSpec, DeleteReplicaSpec, DirectorIndexSpec, EchoSpec, FindAllReplicasSpec,
    FindReplicaSpec, RequestSpec, SqlSpec,
};

/// How long a worker thread waits for new work before re-checking its stop
/// flag.
const FETCH_TIMEOUT: Duration = Duration::from_millis(1000);

struct PriorityEntry {
    priority: i32,
    seq: u64,
    request: Arc<Request>,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; FIFO among equals.
        self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    new_requests: BinaryHeap<PriorityEntry>,
    in_progress: HashMap<String, Arc<Request>>,
    finished: HashMap<String, Arc<Request>>,
}

struct ServiceCtl {
    state: ServiceState,
    num_running_threads: usize,
}

struct Shared {
    ctx: Arc<EngineContext>,
    queues: Mutex<Queues>,
    cv: Condvar,
    ctl: Mutex<ServiceCtl>,
    stop_flag: AtomicBool,
    seq: AtomicU64,
}

impl Shared {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ctl(&self) -> MutexGuard<'_, ServiceCtl> {
        match self.ctl.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pop the highest-priority new request, mark it in-progress and hand it
    /// to the calling worker thread. Blocks up to `timeout`, staying
    /// responsive to the stop signal.
    fn fetch_next_for_processing(&self, timeout: Duration) -> Option<Arc<Request>> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.lock_queues();
        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                return None;
            }
            if let Some(entry) = queues.new_requests.pop() {
                match entry.request.start() {
                    Ok(()) => {
                        queues
                            .in_progress
                            .insert(entry.request.id().to_string(), Arc::clone(&entry.request));
                        return Some(entry.request);
                    }
                    Err(e) => {
                        // The queue only holds CREATED requests; anything
                        // else indicates a lost race with a cancellation.
                        error!(id = entry.request.id(), "cannot start request: {e}");
                        queues
                            .finished
                            .insert(entry.request.id().to_string(), entry.request);
                        continue;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queues = match self.cv.wait_timeout(queues, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// A worker thread was told to stop mid-request: the request goes back
    /// to the input queue with a fresh CREATED status.
    fn processing_refused(&self, request: &Arc<Request>) {
        debug!(id = request.id(), "processing refused");
        let mut queues = self.lock_queues();
        if let Some(request) = queues.in_progress.remove(request.id()) {
            if let Err(e) = request.stop() {
                error!(id = request.id(), "cannot return request to the queue: {e}");
            }
            let entry = PriorityEntry {
                priority: request.priority(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                request,
            };
            queues.new_requests.push(entry);
        }
        drop(queues);
        self.cv.notify_one();
    }

    /// A request finished (or was cancelled): move it to the finished map.
    /// Disposed requests are no longer found and stay out.
    fn processing_finished(&self, request: &Arc<Request>) {
        debug!(id = request.id(), status = request.status().as_str(), "processing finished");
        let mut queues = self.lock_queues();
        if let Some(request) = queues.in_progress.remove(request.id()) {
            queues.finished.insert(request.id().to_string(), request);
        }
    }

    /// The worker thread loop: fetch, execute to completion, report.
    fn worker_loop(self: &Arc<Self>, thread_idx: usize) {
        debug!(thread_idx, "worker thread started");
        while !self.stop_flag.load(Ordering::Acquire) {
            let Some(request) = self.fetch_next_for_processing(FETCH_TIMEOUT) else {
                continue;
            };
            debug!(thread_idx, id = request.id(), "begin processing");
            loop {
                match request.execute() {
                    Ok(true) => {
                        self.processing_finished(&request);
                        break;
                    }
                    Ok(false) => {
                        if self.stop_flag.load(Ordering::Acquire) {
                            match request.rollback() {
                                Ok(()) => self.processing_refused(&request),
                                Err(Error::Cancelled) => self.processing_finished(&request),
                                Err(e) => {
                                    error!(id = request.id(), "rollback failed: {e}");
                                    self.processing_finished(&request);
                                }
                            }
                            break;
                        }
                    }
                    Err(Error::Cancelled) => {
                        debug!(thread_idx, id = request.id(), "cancelled");
                        self.processing_finished(&request);
                        break;
                    }
                    Err(e) => {
                        // Tasks map their own failures; an error here is an
                        // internal defect. Fail the request rather than lose
                        // it.
                        error!(id = request.id(), "request execution error: {e}");
                        let _ = request.set_status(Status::Failed, StatusExt::OtherException);
                        self.processing_finished(&request);
                        break;
                    }
                }
            }
        }
        debug!(thread_idx, "worker thread stopped");
        self.thread_stopped();
    }

    /// Flip the service to SUSPENDED once the last thread reports in.
    fn thread_stopped(&self) {
        let mut ctl = self.lock_ctl();
        ctl.num_running_threads = ctl.num_running_threads.saturating_sub(1);
        if ctl.state == ServiceState::SuspendInProgress && ctl.num_running_threads == 0 {
            ctl.state = ServiceState::Suspended;
        }
    }

    /// Remove a finished request. In-progress and queued requests must be
    /// stopped first; unknown ids are a no-op.
    fn dispose_impl(&self, id: &str) -> bool {
        let mut queues = self.lock_queues();
        queues.finished.remove(id).is_some()
    }
}

/// The per-worker request engine front end.
pub struct Processor {
    shared: Arc<Shared>,
    factory: RequestFactory,
    expiry: ExpiryService,
    threads: Mutex<Vec<JoinHandle<()>>>,
    start_time: u64,
}

impl Processor {
    pub fn new(ctx: Arc<EngineContext>) -> Result<Self> {
        let config = ctx.config();
        config.validate()?;
        let pool = ConnectionPool::new(
            config.db_params()?,
            Arc::clone(&ctx.connector),
            config.database.services_pool_size,
        );
        let factory = RequestFactory::new(Arc::clone(&ctx), pool);
        let shared = Arc::new(Shared {
            ctx,
            queues: Mutex::new(Queues::default()),
            cv: Condvar::new(),
            ctl: Mutex::new(ServiceCtl {
                state: ServiceState::Suspended,
                num_running_threads: 0,
            }),
            stop_flag: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        // Expired requests are garbage-collected through the ordinary
        // disposal path; the timer only ever carries the id.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let expiry = ExpiryService::new(move |id| {
            if let Some(shared) = weak.upgrade() {
                shared.dispose_impl(id);
            }
        });
        Ok(Self { shared, factory, expiry, threads: Mutex::new(Vec::new()), start_time: now_micros() })
    }

    pub fn state(&self) -> ServiceState {
        self.shared.lock_ctl().state
    }

    /// When the processor was created, µs since the UNIX epoch.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Begin processing requests: SUSPENDED -> RUNNING.
    pub fn run(&self) -> Result<()> {
        let mut ctl = self.shared.lock_ctl();
        if ctl.state != ServiceState::Suspended {
            return Ok(());
        }
        let num_threads = self.shared.ctx.config().worker.num_svc_processing_threads;
        if num_threads == 0 {
            return Err(Error::BadConfig(
                "worker.num-svc-processing-threads must be greater than 0".to_string(),
            ));
        }
        self.shared.stop_flag.store(false, Ordering::Release);
        let mut threads = match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Threads of an earlier run have all terminated by now.
        threads.clear();
        for thread_idx in 0..num_threads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("request-worker-{thread_idx}"))
                .spawn(move || shared.worker_loop(thread_idx))?;
            threads.push(handle);
        }
        ctl.num_running_threads = num_threads;
        ctl.state = ServiceState::Running;
        Ok(())
    }

    /// Signal all threads to stop: RUNNING -> SUSPEND_IN_PROGRESS. The state
    /// becomes SUSPENDED when the last thread is observed terminated.
    pub fn stop(&self) {
        let mut ctl = self.shared.lock_ctl();
        if ctl.state != ServiceState::Running {
            return;
        }
        self.shared.stop_flag.store(true, Ordering::Release);
        ctl.state = ServiceState::SuspendInProgress;
        drop(ctl);
        self.shared.cv.notify_all();
    }

    /// Stop and join every worker thread.
    pub fn shutdown(&self) {
        self.stop();
        let handles: Vec<JoinHandle<()>> = {
            let mut threads = match self.threads.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            threads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Cancel every queued and in-progress request.
    pub fn drain(&self) {
        let mut queues = self.shared.lock_queues();
        let ids: Vec<String> = queues
            .new_requests
            .iter()
            .map(|entry| entry.request.id().to_string())
            .chain(queues.in_progress.keys().cloned())
            .collect();
        for id in &ids {
            if let Err(e) = self.stop_request_impl(&mut queues, id) {
                error!(id, "drain failed to stop request: {e}");
            }
        }
    }

    /// Reload the configuration.
    pub fn reconfig(&self) -> Result<()> {
        self.shared.ctx.reload_config()
    }

    // Per-type submission endpoints.

    pub fn echo(&self, hdr: QueuedRequestHdr, spec: EchoSpec) -> Value {
        self.submit(hdr, RequestSpec::Echo(spec))
    }

    pub fn create_replica(&self, hdr: QueuedRequestHdr, spec: CreateReplicaSpec) -> Value {
        self.submit(hdr, RequestSpec::CreateReplica(spec))
    }

    pub fn delete_replica(&self, hdr: QueuedRequestHdr, spec: DeleteReplicaSpec) -> Value {
        self.submit(hdr, RequestSpec::DeleteReplica(spec))
    }

    pub fn find_replica(&self, hdr: QueuedRequestHdr, spec: FindReplicaSpec) -> Value {
        self.submit(hdr, RequestSpec::FindReplica(spec))
    }

    pub fn find_all_replicas(&self, hdr: QueuedRequestHdr, spec: FindAllReplicasSpec) -> Value {
        self.submit(hdr, RequestSpec::FindAllReplicas(spec))
    }

    pub fn sql(&self, hdr: QueuedRequestHdr, spec: SqlSpec) -> Value {
        self.submit(hdr, RequestSpec::Sql(spec))
    }

    pub fn index(&self, hdr: QueuedRequestHdr, spec: DirectorIndexSpec) -> Value {
        self.submit(hdr, RequestSpec::DirectorIndex(spec))
    }

    /// Validate and enqueue a submission. Returns the request's initial
    /// snapshot, or a BAD / INVALID_PARAM response without enqueuing.
    pub fn submit(&self, hdr: QueuedRequestHdr, spec: RequestSpec) -> Value {
        let id = hdr.id.clone();
        debug!(id, "submit");
        match self.try_submit(hdr, spec) {
            Ok(response) => response,
            Err(e) => {
                error!(id, "submission rejected: {e}");
                rejected(Status::Bad, StatusExt::InvalidParam)
            }
        }
    }

    fn try_submit(&self, hdr: QueuedRequestHdr, spec: RequestSpec) -> Result<Value> {
        let request = self.factory.create(hdr, spec)?;
        {
            let mut queues = self.shared.lock_queues();
            if queues.new_requests.iter().any(|e| e.request.id() == request.id())
                || queues.in_progress.contains_key(request.id())
                || queues.finished.contains_key(request.id())
            {
                return Err(Error::InvalidParam(format!(
                    "request id '{}' is already in use",
                    request.id()
                )));
            }
            let entry = PriorityEntry {
                priority: request.priority(),
                seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
                request: Arc::clone(&request),
            };
            queues.new_requests.push(entry);
        }
        let timeout = request.expiration_timeout_sec();
        if timeout > 0 {
            self.expiry.schedule(request.id(), Duration::from_secs(u64::from(timeout)));
        }
        self.shared.cv.notify_one();
        Ok(request.to_json(false))
    }

    /// A status snapshot of a request, without results.
    pub fn request_status(&self, id: &str) -> Value {
        debug!(id, "status");
        let queues = self.shared.lock_queues();
        let found = queues
            .new_requests
            .iter()
            .find(|entry| entry.request.id() == id)
            .map(|entry| Arc::clone(&entry.request))
            .or_else(|| queues.in_progress.get(id).cloned())
            .or_else(|| queues.finished.get(id).cloned());
        match found {
            Some(request) => request.to_json(false),
            None => rejected(Status::Bad, StatusExt::InvalidId),
        }
    }

    /// Tracking info of a request, including its result once finished.
    pub fn track_request(&self, id: &str) -> Value {
        debug!(id, "track");
        let queues = self.shared.lock_queues();
        match self.track_request_impl(&queues, id) {
            Ok(Some(request)) => request.to_json(true),
            Ok(None) => rejected(Status::Bad, StatusExt::InvalidId),
            Err(e) => {
                error!(id, "track failed: {e}");
                rejected(Status::Bad, StatusExt::None)
            }
        }
    }

    /// Cancel a request wherever it is. A queued request is finalized
    /// immediately; an in-progress one enters the cancelling protocol and
    /// is moved by its worker thread later; a finished one just reports its
    /// terminal status.
    pub fn stop_request(&self, id: &str) -> Value {
        debug!(id, "stop");
        let mut queues = self.shared.lock_queues();
        match self.stop_request_impl(&mut queues, id) {
            Ok(Some(request)) => request.to_json(false),
            Ok(None) => rejected(Status::Bad, StatusExt::InvalidId),
            Err(e) => {
                error!(id, "stop failed: {e}");
                rejected(Status::Bad, StatusExt::None)
            }
        }
    }

    /// Release a finished request. Unknown ids are a no-op.
    pub fn dispose_request(&self, id: &str) -> bool {
        debug!(id, "dispose");
        self.expiry.cancel(id);
        self.shared.dispose_impl(id)
    }

    fn stop_request_impl(
        &self,
        queues: &mut Queues,
        id: &str,
    ) -> Result<Option<Arc<Request>>> {
        // Still waiting in the input queue? Cancel it and move it to the
        // finished map right away so a client that missed the response can
        // still fetch the final status.
        if let Some(request) = queues
            .new_requests
            .iter()
            .find(|entry| entry.request.id() == id)
            .map(|entry| Arc::clone(&entry.request))
        {
            request.cancel()?;
            match request.status() {
                Status::Cancelled => {
                    let remaining = std::mem::take(&mut queues.new_requests);
                    queues.new_requests = remaining
                        .into_iter()
                        .filter(|entry| entry.request.id() != id)
                        .collect();
                    queues.finished.insert(id.to_string(), Arc::clone(&request));
                    return Ok(Some(request));
                }
                other => {
                    return Err(Error::logic(format!(
                        "unexpected status {} of request '{id}' in the input queue",
                        other.as_str()
                    )));
                }
            }
        }

        // Being processed? The worker thread completes the cancellation and
        // moves the request later.
        if let Some(request) = queues.in_progress.get(id).cloned() {
            request.cancel()?;
            return match request.status() {
                Status::Cancelled
                | Status::IsCancelling
                // In-progress requests may reach a terminal status just
                // before their worker thread reports them finished.
                | Status::Success
                | Status::Failed => Ok(Some(request)),
                other => Err(Error::logic(format!(
                    "unexpected status {} of request '{id}' among in-progress requests",
                    other.as_str()
                ))),
            };
        }

        // Finished already? Nothing to do beyond reporting.
        if let Some(request) = queues.finished.get(id).cloned() {
            return match request.status() {
                Status::Cancelled | Status::Success | Status::Failed => Ok(Some(request)),
                other => Err(Error::logic(format!(
                    "unexpected status {} of request '{id}' among finished requests",
                    other.as_str()
                ))),
            };
        }
        Ok(None)
    }

    fn track_request_impl(&self, queues: &Queues, id: &str) -> Result<Option<Arc<Request>>> {
        if let Some(request) = queues
            .new_requests
            .iter()
            .find(|entry| entry.request.id() == id)
            .map(|entry| Arc::clone(&entry.request))
        {
            return match request.status() {
                Status::Created => Ok(Some(request)),
                other => Err(Error::logic(format!(
                    "unexpected status {} of request '{id}' in the input queue",
                    other.as_str()
                ))),
            };
        }
        if let Some(request) = queues.in_progress.get(id).cloned() {
            return match request.status() {
                Status::InProgress
                | Status::IsCancelling
                | Status::Cancelled
                | Status::Success
                | Status::Failed => Ok(Some(request)),
                other => Err(Error::logic(format!(
                    "unexpected status {} of request '{id}' among in-progress requests",
                    other.as_str()
                ))),
            };
        }
        if let Some(request) = queues.finished.get(id).cloned() {
            return match request.status() {
                Status::Cancelled | Status::Success | Status::Failed => Ok(Some(request)),
                other => Err(Error::logic(format!(
                    "unexpected status {} of request '{id}' among finished requests",
                    other.as_str()
                ))),
            };
        }
        Ok(None)
    }

    pub fn num_new_requests(&self) -> usize {
        self.shared.lock_queues().new_requests.len()
    }

    pub fn num_in_progress_requests(&self) -> usize {
        self.shared.lock_queues().in_progress.len()
    }

    pub fn num_finished_requests(&self) -> usize {
        self.shared.lock_queues().finished.len()
    }

    /// A snapshot of the service state and counters, optionally with the
    /// full request dumps.
    pub fn to_json(&self, include_requests: bool) -> Value {
        let state = self.state();
        let queues = self.shared.lock_queues();
        let mut response = json!({
            "service_state": state.code(),
            "service_state_str": state.as_str(),
            "start_time": self.start_time,
            "technology": format!("{:?}", self.factory.technology()).to_uppercase(),
            "num_new_requests": queues.new_requests.len(),
            "num_in_progress_requests": queues.in_progress.len(),
            "num_finished_requests": queues.finished.len(),
            "new_requests": [],
            "in_progress_requests": [],
            "finished_requests": [],
        });
        if include_requests {
            response["new_requests"] = Value::Array(
                queues.new_requests.iter().map(|e| e.request.to_json(false)).collect(),
            );
            response["in_progress_requests"] = Value::Array(
                queues.in_progress.values().map(|r| r.to_json(false)).collect(),
            );
            response["finished_requests"] = Value::Array(
                queues.finished.values().map(|r| r.to_json(false)).collect(),
            );
        }
        response
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("state", &self.state().as_str())
            .field("num_new", &self.num_new_requests())
            .field("num_in_progress", &self.num_in_progress_requests())
            .field("num_finished", &self.num_finished_requests())
            .finish()
    }
}

// Warn on dangling in-progress requests when the engine goes away while
// requests are still being executed.
impl Drop for Shared {
    fn drop(&mut self) {
        let queues = self.lock_queues();
        if !queues.in_progress.is_empty() {
            warn!(
                num_in_progress = queues.in_progress.len(),
                "processor dropped with in-progress requests"
            );
        }
    }
}
