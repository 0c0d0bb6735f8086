//! Request/response front for the UI layer.
//!
//! Every submission gets a [`RequestToken`] and is handed to a single worker
//! thread, so classifications never interleave. At most one request waits
//! behind the running one; submitting after a cancel replaces it. Only the
//! response carrying the currently active token is delivered; anything else
//! arrived after a cancel and is dropped.

use crate::error::{ClassifyError, ServiceError, SourceError};
use crate::models::{ClassificationReport, ClassificationResult, ImageOrigin, RawImage, RequestToken};
use crate::pipeline::ClassificationPipeline;
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started(RequestToken),
    /// Nothing was selected; prior state is untouched.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Completed(ClassificationReport),
    Failed {
        token: RequestToken,
        error: ClassifyError,
    },
}

impl Delivery {
    pub fn token(&self) -> RequestToken {
        match self {
            Self::Completed(report) => report.token,
            Self::Failed { token, .. } => *token,
        }
    }
}

struct ClassifyRequest {
    token: RequestToken,
    image: RawImage,
    submitted_at: Instant,
}

struct ClassifyResponse {
    token: RequestToken,
    origin: ImageOrigin,
    outcome: Result<ClassificationResult, ClassifyError>,
    elapsed: Duration,
}

#[derive(Default)]
struct ServiceState {
    active: Option<RequestToken>,
    /// Submitted but not yet picked up by the worker. Always the active request.
    pending: Option<ClassifyRequest>,
    last: Option<ClassificationReport>,
    closed: bool,
}

type SharedState = Arc<Mutex<ServiceState>>;

fn lock(state: &Mutex<ServiceState>) -> MutexGuard<'_, ServiceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ClassificationService {
    pipeline: Arc<ClassificationPipeline>,
    wake: Option<Sender<()>>,
    responses: Receiver<ClassifyResponse>,
    state: SharedState,
    worker: Option<thread::JoinHandle<()>>,
}

impl ClassificationService {
    /// Spawns the worker and starts loading the model in the background.
    pub fn start(pipeline: Arc<ClassificationPipeline>) -> Self {
        pipeline.session().start_loading();
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (response_tx, response_rx) = unbounded::<ClassifyResponse>();
        let state = SharedState::default();
        let worker = {
            let pipeline = pipeline.clone();
            let state = state.clone();
            thread::spawn(move || run_worker(pipeline, state, wake_rx, response_tx))
        };
        Self {
            pipeline,
            wake: Some(wake_tx),
            responses: response_rx,
            state,
            worker: Some(worker),
        }
    }

    pub fn pipeline(&self) -> &Arc<ClassificationPipeline> {
        &self.pipeline
    }

    pub fn is_busy(&self) -> bool {
        self.lock_state().active.is_some()
    }

    pub fn active_request(&self) -> Option<RequestToken> {
        self.lock_state().active
    }

    pub fn last_result(&self) -> Option<ClassificationReport> {
        self.lock_state().last.clone()
    }

    /// Queues `image` for classification. A second submission while one is
    /// active is rejected with [`ServiceError::Busy`].
    pub fn submit(&self, image: RawImage) -> Result<RequestToken, ServiceError> {
        let mut state = self.lock_state();
        if let Some(active) = state.active {
            log::debug!("Ignoring submission while {active} is in flight");
            return Err(ServiceError::Busy);
        }
        let wake = match (&self.wake, state.closed) {
            (Some(wake), false) => wake,
            _ => return Err(ServiceError::Stopped),
        };
        let token = RequestToken::new();
        state.pending = Some(ClassifyRequest {
            token,
            image,
            submitted_at: Instant::now(),
        });
        state.active = Some(token);
        match wake.try_send(()) {
            // A full channel means the worker already has a wake-up queued.
            Ok(()) | Err(TrySendError::Full(())) => {
                log::debug!("Submitted classification {token}");
                Ok(token)
            }
            Err(TrySendError::Disconnected(())) => {
                state.pending = None;
                state.active = None;
                Err(ServiceError::Stopped)
            }
        }
    }

    /// Submits the outcome of a camera capture or gallery pick.
    pub fn submit_acquired(
        &self,
        acquired: Result<RawImage, SourceError>,
    ) -> Result<Submission, ServiceError> {
        match acquired {
            Ok(image) => self.submit(image).map(Submission::Started),
            Err(SourceError::SelectionCancelled) => Ok(Submission::Unchanged),
            Err(err) => Err(ServiceError::Source(err)),
        }
    }

    /// Forgets the active request. A request the worker has not started is
    /// dropped; a running one finishes and its result is discarded.
    pub fn cancel(&self) -> Option<RequestToken> {
        let mut state = self.lock_state();
        let cancelled = state.active.take();
        state.pending = None;
        if let Some(token) = cancelled {
            log::debug!("Cancelled classification {token}");
        }
        cancelled
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        while let Ok(response) = self.responses.try_recv() {
            if let Some(delivery) = self.accept(response) {
                return Some(delivery);
            }
        }
        None
    }

    /// Waits for the active request to resolve. Returns `None` right away when
    /// nothing is active.
    pub fn recv(&self) -> Option<Delivery> {
        loop {
            if !self.is_busy() {
                return self.try_recv();
            }
            let response = self.responses.recv().ok()?;
            if let Some(delivery) = self.accept(response) {
                return Some(delivery);
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`. A timeout too
    /// large to represent waits without a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.recv();
        };
        loop {
            if !self.is_busy() {
                return self.try_recv();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) => {
                    if let Some(delivery) = self.accept(response) {
                        return Some(delivery);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Stops accepting work and waits for the running classification, if any.
    /// Requests that were not started yet are dropped.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.close() {
            if worker.join().is_err() {
                log::warn!("Classification worker panicked during shutdown");
            }
        }
    }

    fn close(&mut self) -> Option<thread::JoinHandle<()>> {
        {
            let mut state = self.lock_state();
            state.closed = true;
            state.active = None;
            state.pending = None;
        }
        self.wake.take();
        self.worker.take()
    }

    fn accept(&self, response: ClassifyResponse) -> Option<Delivery> {
        let mut state = self.lock_state();
        if state.active != Some(response.token) {
            log::debug!("Discarding stale result for {}", response.token);
            return None;
        }
        state.active = None;
        match response.outcome {
            Ok(result) => {
                let report = ClassificationReport {
                    token: response.token,
                    origin: response.origin,
                    result,
                    elapsed: response.elapsed,
                    completed_at: Utc::now(),
                };
                state.last = Some(report.clone());
                Some(Delivery::Completed(report))
            }
            Err(error) => Some(Delivery::Failed {
                token: response.token,
                error,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        lock(&self.state)
    }
}

impl Drop for ClassificationService {
    /// Detaches the worker. A classification still running finishes on its
    /// own thread and its result is dropped.
    fn drop(&mut self) {
        if self.close().is_some() {
            log::debug!("Classification service dropped; worker detached");
        }
    }
}

fn run_worker(
    pipeline: Arc<ClassificationPipeline>,
    state: SharedState,
    wake: Receiver<()>,
    responses: Sender<ClassifyResponse>,
) {
    for () in wake.iter() {
        let request = {
            let mut state = lock(&state);
            if state.closed {
                break;
            }
            match state.pending.take() {
                Some(request) => request,
                None => continue,
            }
        };
        let token = request.token;
        let origin = request.image.origin();
        let image = request.image;
        let outcome = match catch_unwind(AssertUnwindSafe(|| pipeline.classify(image))) {
            Ok(outcome) => outcome,
            Err(_) => Err(ClassifyError::InferenceFailed(
                "classification panicked".into(),
            )),
        };
        if let Err(err) = &outcome {
            log::warn!("Classification {token} failed: {err}");
        }
        let response = ClassifyResponse {
            token,
            origin,
            outcome,
            elapsed: request.submitted_at.elapsed(),
        };
        if responses.send(response).is_err() {
            break;
        }
    }
    log::debug!("Classification worker stopped");
}
