//! Lifecycle of the on-device model.
//!
//! A [`ModelSession`] moves `Unloaded -> Loading -> Ready | Failed` exactly once
//! unless [`ModelSession::reload`] is called after a failure. Loading runs on a
//! blocking worker; inference is a synchronous call that refuses to run until
//! the session is `Ready`.

use crate::error::{Error, ModelError, Result};
use crate::models::{InputTensor, ModelState, OutputProbabilities};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// A loaded model that maps one input tensor to raw class scores.
///
/// The tensor is handed over by value so a backend can move its buffer into
/// the runtime's input value.
pub trait InferenceBackend: Send {
    fn run(&mut self, input: InputTensor) -> Result<Vec<f32>>;

    fn describe(&self) -> String {
        "inference backend".to_string()
    }
}

/// Produces a backend from the model artifact. Called at most once per load attempt.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Box<dyn InferenceBackend>>;
}

struct Slot {
    state: ModelState,
    backend: Option<Box<dyn InferenceBackend>>,
}

pub struct ModelSession {
    loader: Arc<dyn ModelLoader>,
    num_classes: usize,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ModelState>,
}

impl ModelSession {
    pub fn new(loader: Arc<dyn ModelLoader>, num_classes: usize) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ModelState::Unloaded);
        Arc::new(Self {
            loader,
            num_classes,
            slot: Mutex::new(Slot {
                state: ModelState::Unloaded,
                backend: None,
            }),
            state_tx,
        })
    }

    pub fn state(&self) -> ModelState {
        self.state_tx.borrow().clone()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Starts loading in the background if nothing has been attempted yet.
    /// Returns whether this call started the load.
    pub fn start_loading(self: &Arc<Self>) -> bool {
        self.begin_load(|state| matches!(state, ModelState::Unloaded))
    }

    /// Retries a failed load. No-op in every other state.
    pub fn reload(self: &Arc<Self>) -> bool {
        let started = self.begin_load(|state| matches!(state, ModelState::Failed(_)));
        if started {
            log::info!("Reloading model after failure");
        }
        started
    }

    /// Waits until the model is `Ready` or `Failed`, starting the load if needed.
    /// Concurrent callers share the same in-flight load.
    pub async fn ensure_loaded(self: &Arc<Self>) -> ModelState {
        self.start_loading();
        let mut rx = self.state_tx.subscribe();
        let settled = rx.wait_for(ModelState::is_settled).await.map(|s| s.clone());
        match settled {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Runs the model on `input`. Never waits for a pending load.
    pub fn infer(&self, input: InputTensor) -> std::result::Result<OutputProbabilities, ModelError> {
        let mut slot = self.lock_slot();
        if !slot.state.is_ready() {
            return Err(ModelError::NotReady(slot.state.clone()));
        }
        let backend = slot
            .backend
            .as_mut()
            .ok_or_else(|| ModelError::NotReady(ModelState::Unloaded))?;
        let started = Instant::now();
        let scores = match catch_unwind(AssertUnwindSafe(|| backend.run(input))) {
            Ok(Ok(scores)) => scores,
            Ok(Err(err)) => return Err(ModelError::InferenceFailed(err.to_string())),
            Err(_) => {
                return Err(ModelError::InferenceFailed(
                    "inference backend panicked".into(),
                ))
            }
        };
        drop(slot);
        log::debug!("Inference took {:?}", started.elapsed());

        if scores.len() != self.num_classes {
            return Err(ModelError::InferenceFailed(format!(
                "model returned {} scores, expected {}",
                scores.len(),
                self.num_classes
            )));
        }
        if scores.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InferenceFailed(
                "model returned non-finite scores".into(),
            ));
        }
        Ok(OutputProbabilities::new(scores))
    }

    pub fn backend_description(&self) -> Option<String> {
        self.lock_slot().backend.as_ref().map(|b| b.describe())
    }

    fn begin_load(self: &Arc<Self>, allowed: impl Fn(&ModelState) -> bool) -> bool {
        {
            let mut slot = self.lock_slot();
            if !allowed(&slot.state) {
                return false;
            }
            slot.state = ModelState::Loading;
            self.state_tx.send_replace(ModelState::Loading);
        }
        let session = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || session.run_load());
            }
            Err(_) => {
                std::thread::spawn(move || session.run_load());
            }
        }
        true
    }

    fn run_load(&self) {
        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.loader.load())) {
            Ok(res) => res,
            Err(_) => Err(Error::Init("model loader panicked".into())),
        };
        let (state, backend) = match outcome {
            Ok(backend) => {
                log::info!(
                    "Model ready ({}) in {:?}",
                    backend.describe(),
                    started.elapsed()
                );
                (ModelState::Ready, Some(backend))
            }
            Err(err) => {
                log::warn!("Model failed to load: {err}");
                (ModelState::Failed(err.to_string()), None)
            }
        };
        let mut slot = self.lock_slot();
        slot.backend = backend;
        slot.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::models::{TensorLayout, TensorShape};
    use crossbeam_channel::bounded;

    fn tensor() -> InputTensor {
        let shape = TensorShape::new(2, 2, 3);
        InputTensor::new(vec![0.5; shape.len()], shape, TensorLayout::Nhwc)
    }

    #[test]
    fn infer_before_load_is_not_ready() {
        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![0.1, 0.8, 0.1])), 3);
        assert_eq!(session.state(), ModelState::Unloaded);
        assert_eq!(
            session.infer(tensor()),
            Err(ModelError::NotReady(ModelState::Unloaded))
        );
    }

    #[tokio::test]
    async fn infer_while_loading_is_not_ready_then_succeeds() {
        let (tx, rx) = bounded(0);
        let loader = FakeLoader {
            gate: Some(rx),
            ..FakeLoader::ready(vec![0.1, 0.8, 0.1])
        };
        let session = ModelSession::new(Arc::new(loader), 3);
        assert!(session.start_loading());
        assert_eq!(session.state(), ModelState::Loading);
        assert_eq!(
            session.infer(tensor()),
            Err(ModelError::NotReady(ModelState::Loading))
        );

        tx.send(()).unwrap();
        assert_eq!(session.ensure_loaded().await, ModelState::Ready);
        let probs = session.infer(tensor()).unwrap();
        assert_eq!(probs.as_slice(), &[0.1, 0.8, 0.1]);
        assert_eq!(session.backend_description().as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn concurrent_ensure_loaded_loads_once() {
        let loader = Arc::new(FakeLoader::ready(vec![1.0, 0.0, 0.0]));
        let session = ModelSession::new(loader.clone(), 3);
        let (a, b, c) = tokio::join!(
            session.ensure_loaded(),
            session.ensure_loaded(),
            session.ensure_loaded()
        );
        assert!(a.is_ready() && b.is_ready() && c.is_ready());
        assert_eq!(session.ensure_loaded().await, ModelState::Ready);
        assert!(!session.start_loading());
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn failed_load_is_terminal_until_reload() {
        let loader = Arc::new(FakeLoader {
            fail_first: 1,
            ..FakeLoader::ready(vec![0.2, 0.2, 0.6])
        });
        let session = ModelSession::new(loader.clone(), 3);
        let state = session.ensure_loaded().await;
        assert!(matches!(state, ModelState::Failed(ref reason) if reason.contains("corrupt")));
        assert!(matches!(
            session.infer(tensor()),
            Err(ModelError::NotReady(ModelState::Failed(_)))
        ));
        assert!(!session.start_loading());
        assert_eq!(session.ensure_loaded().await, state);
        assert_eq!(loader.calls(), 1);

        assert!(session.reload());
        assert_eq!(session.ensure_loaded().await, ModelState::Ready);
        assert!(!session.reload());
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn loader_panic_becomes_failed_state() {
        let session = ModelSession::new(Arc::new(PanickingLoader), 3);
        assert!(matches!(
            session.ensure_loaded().await,
            ModelState::Failed(reason) if reason.contains("panicked")
        ));
    }

    #[tokio::test]
    async fn output_length_must_match_label_table() {
        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![0.5, 0.5])), 3);
        session.ensure_loaded().await;
        assert!(matches!(
            session.infer(tensor()),
            Err(ModelError::InferenceFailed(reason)) if reason.contains("expected 3")
        ));
    }

    #[tokio::test]
    async fn backend_errors_and_nan_scores_are_inference_failures() {
        let session = ModelSession::new(
            Arc::new(BackendLoader(|| -> Box<dyn InferenceBackend> { Box::new(FailingBackend) })),
            3,
        );
        session.ensure_loaded().await;
        assert!(matches!(
            session.infer(tensor()),
            Err(ModelError::InferenceFailed(reason)) if reason.contains("device lost")
        ));

        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![0.1, f32::NAN, 0.2])), 3);
        session.ensure_loaded().await;
        assert!(matches!(
            session.infer(tensor()),
            Err(ModelError::InferenceFailed(_))
        ));
    }

    struct EchoBackend;

    impl InferenceBackend for EchoBackend {
        fn run(&mut self, input: InputTensor) -> Result<Vec<f32>> {
            let data = input.into_array().map_err(|e| Error::Inference(e.to_string()))?;
            Ok(vec![data.len() as f32, data[[0, 0, 0, 0]], 0.0])
        }
    }

    #[tokio::test]
    async fn backend_takes_ownership_of_the_tensor() {
        let session = ModelSession::new(
            Arc::new(BackendLoader(|| -> Box<dyn InferenceBackend> { Box::new(EchoBackend) })),
            3,
        );
        session.ensure_loaded().await;
        let probs = session.infer(tensor()).unwrap();
        assert_eq!(probs.as_slice(), &[12.0, 0.5, 0.0]);
    }

    #[test]
    fn loads_without_a_tokio_runtime() {
        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![0.0, 1.0, 0.0])), 3);
        assert!(session.start_loading());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(rt.block_on(session.ensure_loaded()), ModelState::Ready);
    }
}
