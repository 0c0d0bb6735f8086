use crate::config::{ClassifierConfig, OutputActivation};
use crate::decision;
use crate::error::{ClassifyError, Error, Result};
use crate::models::{ClassificationResult, RawImage, TensorLayout, TensorShape};
use crate::onnx::OnnxLoader;
use crate::preprocess::{self, ResizeStrategy};
use crate::session::ModelSession;
use std::sync::Arc;
use std::time::Instant;

/// Preprocess, infer and decide for one image at a time.
pub struct ClassificationPipeline {
    session: Arc<ModelSession>,
    labels: Vec<String>,
    threshold: f32,
    shape: TensorShape,
    strategy: ResizeStrategy,
    layout: TensorLayout,
    activation: OutputActivation,
}

impl ClassificationPipeline {
    pub fn new(config: &ClassifierConfig, session: Arc<ModelSession>) -> Result<Self> {
        config.validate()?;
        if config.labels.len() != session.num_classes() {
            return Err(Error::Config(format!(
                "{} labels configured but the session expects {} classes",
                config.labels.len(),
                session.num_classes()
            )));
        }
        Ok(Self {
            session,
            labels: config.labels.clone(),
            threshold: config.threshold,
            shape: config.tensor_shape(),
            strategy: config.resize,
            layout: config.layout,
            activation: config.activation,
        })
    }

    /// Pipeline over the ONNX model named in `config`. Loading is not started.
    pub fn with_onnx(config: &ClassifierConfig) -> Result<Self> {
        let loader = OnnxLoader::from_config(config);
        let session = ModelSession::new(Arc::new(loader), config.labels.len());
        Self::new(config, session)
    }

    pub fn session(&self) -> &Arc<ModelSession> {
        &self.session
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classifies `image`, failing fast if the model is not ready yet.
    pub fn classify(&self, image: RawImage) -> std::result::Result<ClassificationResult, ClassifyError> {
        let started = Instant::now();
        let tensor = preprocess::to_tensor(&image, self.shape, self.strategy, self.layout)?;
        drop(image);

        let state = self.session.state();
        if !state.is_ready() {
            return Err(ClassifyError::ModelNotReady(state));
        }
        let probs = self.session.infer(tensor)?;
        let scores = decision::activate(probs, self.activation);
        let result = decision::decide(&scores, &self.labels, self.threshold);
        log::debug!(
            "Classified as {} ({:.2}) in {:?}",
            result.label(),
            result.score(),
            started.elapsed()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreprocessError;
    use crate::models::{ImageOrigin, ModelState};
    use crate::session::fakes::{BackendLoader, FailingBackend, FakeLoader};
    use crate::session::InferenceBackend;
    use crossbeam_channel::bounded;

    fn byte_cycle_config() -> ClassifierConfig {
        ClassifierConfig {
            resize: ResizeStrategy::ByteCycle,
            input_width: 8,
            input_height: 8,
            ..ClassifierConfig::default()
        }
    }

    fn image() -> RawImage {
        RawImage::encoded(vec![12, 200, 33, 7], ImageOrigin::Gallery)
    }

    async fn ready_pipeline(scores: Vec<f32>, config: ClassifierConfig) -> ClassificationPipeline {
        let session = ModelSession::new(Arc::new(FakeLoader::ready(scores)), config.labels.len());
        assert_eq!(session.ensure_loaded().await, ModelState::Ready);
        ClassificationPipeline::new(&config, session).unwrap()
    }

    #[tokio::test]
    async fn confident_scores_produce_label() {
        let pipeline = ready_pipeline(vec![0.2, 0.75, 0.05], byte_cycle_config()).await;
        let res = pipeline.classify(image()).unwrap();
        assert_eq!(res.label(), "Paper");
        assert_eq!(res.score(), 0.75);
    }

    #[tokio::test]
    async fn weak_scores_produce_other() {
        let pipeline = ready_pipeline(vec![0.4, 0.3, 0.3], byte_cycle_config()).await;
        assert_eq!(
            pipeline.classify(image()).unwrap(),
            ClassificationResult::Other { score: 0.4 }
        );
    }

    #[tokio::test]
    async fn softmax_activation_applies_to_logits() {
        let config = ClassifierConfig {
            activation: OutputActivation::Softmax,
            ..byte_cycle_config()
        };
        let pipeline = ready_pipeline(vec![0.1, 0.2, 4.0], config).await;
        assert_eq!(pipeline.classify(image()).unwrap().label(), "Daily Disposals");
    }

    #[tokio::test]
    async fn loading_model_fails_fast() {
        let (tx, rx) = bounded(0);
        let loader = FakeLoader {
            gate: Some(rx),
            ..FakeLoader::ready(vec![0.0, 1.0, 0.0])
        };
        let config = byte_cycle_config();
        let session = ModelSession::new(Arc::new(loader), 3);
        session.start_loading();
        let pipeline = ClassificationPipeline::new(&config, session.clone()).unwrap();
        assert_eq!(
            pipeline.classify(image()),
            Err(ClassifyError::ModelNotReady(ModelState::Loading))
        );
        tx.send(()).unwrap();
        session.ensure_loaded().await;
        assert_eq!(pipeline.classify(image()).unwrap().label(), "Paper");
    }

    #[test]
    fn unloaded_model_is_not_ready() {
        let config = byte_cycle_config();
        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![1.0, 0.0, 0.0])), 3);
        let pipeline = ClassificationPipeline::new(&config, session).unwrap();
        assert_eq!(
            pipeline.classify(image()),
            Err(ClassifyError::ModelNotReady(ModelState::Unloaded))
        );
    }

    #[tokio::test]
    async fn preprocess_failure_stops_before_inference() {
        let config = ClassifierConfig::default();
        let pipeline = ready_pipeline(vec![1.0, 0.0, 0.0], config).await;
        let garbage = RawImage::encoded(vec![0xde, 0xad], ImageOrigin::Camera);
        assert!(matches!(
            pipeline.classify(garbage),
            Err(ClassifyError::PreprocessFailed(PreprocessError::Decode(_)))
        ));
        let empty = RawImage::encoded(Vec::new(), ImageOrigin::Camera);
        assert_eq!(
            pipeline.classify(empty),
            Err(ClassifyError::PreprocessFailed(PreprocessError::EmptyImage))
        );
    }

    #[tokio::test]
    async fn backend_failure_is_inference_failed() {
        let config = byte_cycle_config();
        let session = ModelSession::new(
            Arc::new(BackendLoader(|| -> Box<dyn InferenceBackend> { Box::new(FailingBackend) })),
            3,
        );
        session.ensure_loaded().await;
        let pipeline = ClassificationPipeline::new(&config, session).unwrap();
        let err = pipeline.classify(image()).unwrap_err();
        assert!(matches!(err, ClassifyError::InferenceFailed(_)));
        assert_eq!(err.user_message(), "Failed to classify image");
    }

    #[test]
    fn label_count_must_match_session() {
        let session = ModelSession::new(Arc::new(FakeLoader::ready(vec![1.0, 0.0])), 2);
        assert!(matches!(
            ClassificationPipeline::new(&ClassifierConfig::default(), session),
            Err(Error::Config(_))
        ));
    }
}
