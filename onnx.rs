use crate::config::ClassifierConfig;
use crate::error::{Error, Result};
use crate::models::{InputTensor, TensorLayout, TensorShape};
use crate::session::{InferenceBackend, ModelLoader};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, ValueType};

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

lazy_static! {
    // ONNX Runtime keeps one environment per process. Only a successful commit
    // is remembered so a later reload can retry after a failure.
    static ref ORT_ENV: Mutex<bool> = Mutex::new(false);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChoice {
    #[default]
    Auto,
    CpuOnly,
    DirectmlOnly,
}

/// Builds an [`OnnxBackend`] from the bundled model file.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    model_path: PathBuf,
    provider: ProviderChoice,
    device_id: u32,
    shape: TensorShape,
    layout: TensorLayout,
}

impl OnnxLoader {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            provider: config.provider,
            device_id: config.device_id.unwrap_or(0),
            shape: config.tensor_shape(),
            layout: config.layout,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self) -> Result<Box<dyn InferenceBackend>> {
        let (session, provider) = build_session(&self.model_path, self.provider, self.device_id)?;
        let dims = input_dims(&session);
        if let Some(detected) = detect_layout(&dims, self.shape.channels) {
            if detected != self.layout {
                log::warn!(
                    "Model input {:?} looks like {:?} but {:?} is configured",
                    dims,
                    detected,
                    self.layout
                );
            }
        }
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Init("model declares no outputs".into()))?;
        log::info!(
            "Loaded model {} on {} (input {:?}, output {})",
            self.model_path.display(),
            provider.label(),
            dims,
            output_name
        );
        Ok(Box::new(OnnxBackend {
            session,
            provider,
            output_name,
            expected_len: static_len(&dims),
        }))
    }
}

pub struct OnnxBackend {
    session: Session,
    provider: InferenceProvider,
    output_name: String,
    expected_len: Option<usize>,
}

impl InferenceBackend for OnnxBackend {
    fn run(&mut self, input: InputTensor) -> Result<Vec<f32>> {
        if let Some(expected) = self.expected_len {
            if expected != input.len() {
                return Err(Error::Inference(format!(
                    "model expects {expected} input values, got {}",
                    input.len()
                )));
            }
        }
        let array = input
            .into_array()
            .map_err(|e| Error::Inference(format!("Invalid input tensor shape: {e}")))?;
        let value = Tensor::from_array(array).map_err(|e| Error::Inference(format!("{e}")))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| Error::Inference(format!("Failed to run model: {e}")))?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| Error::Inference(format!("missing output {}", self.output_name)))?;
        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("{e}")))?;
        Ok(data.to_vec())
    }

    fn describe(&self) -> String {
        format!("onnx/{}", self.provider.label())
    }
}

fn commit_environment() -> std::result::Result<(), String> {
    let committed = ort::init()
        .with_name("waste-classifier")
        .commit()
        .map_err(|e| format!("Failed to init ORT environment: {e}"))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
        log::debug!("ONNX Runtime environment committed");
    }
    Ok(())
}

fn ensure_environment() -> Result<()> {
    commit_once(&ORT_ENV, commit_environment)
}

fn commit_once(
    committed: &Mutex<bool>,
    commit: impl FnOnce() -> std::result::Result<(), String>,
) -> Result<()> {
    let mut committed = committed.lock().unwrap_or_else(PoisonError::into_inner);
    if *committed {
        return Ok(());
    }
    commit().map_err(Error::Init)?;
    *committed = true;
    Ok(())
}

pub fn build_session(
    model_path: &Path,
    provider: ProviderChoice,
    device_id: u32,
) -> Result<(Session, InferenceProvider)> {
    if !model_path.exists() {
        return Err(Error::Init(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    ensure_environment()?;

    let try_build = |use_dml: bool| -> Result<Session> {
        let mut builder = Session::builder()
            .map_err(|e| Error::Init(format!("{e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(|e| Error::Init(format!("{e}")))?
            .with_parallel_execution(false)
            .map_err(|e| Error::Init(format!("{e}")))?;
        if use_dml {
            #[cfg(target_os = "windows")]
            {
                builder = builder
                    .with_memory_pattern(false)
                    .map_err(|e| Error::Init(format!("{e}")))?;
                let ep = DirectMLExecutionProvider::default()
                    .with_device_id(device_id as i32)
                    .build();
                builder = builder
                    .with_execution_providers([ep])
                    .map_err(|e| Error::Init(format!("{e}")))?;
            }
        }
        builder
            .commit_from_file(model_path)
            .map_err(|e| Error::Init(format!("{e}")))
    };

    let wants_dml = matches!(provider, ProviderChoice::Auto | ProviderChoice::DirectmlOnly);
    #[cfg(target_os = "windows")]
    {
        if wants_dml && DirectMLExecutionProvider::default().is_available().unwrap_or(false) {
            match try_build(true) {
                Ok(session) => return Ok((session, InferenceProvider::DirectML { device_id })),
                Err(err) => log::warn!("DirectML session failed: {err}"),
            }
        }
    }
    if provider == ProviderChoice::DirectmlOnly {
        return Err(Error::Init(format!(
            "DirectML unavailable for device {device_id}"
        )));
    }
    if wants_dml {
        log::debug!(
            "DirectML unavailable; using CPU for {}",
            model_path.display()
        );
    }

    let session = try_build(false)?;
    Ok((session, InferenceProvider::Cpu))
}

fn input_dims(session: &Session) -> Vec<i64> {
    match session.inputs.first().map(|i| &i.input_type) {
        Some(ValueType::Tensor { shape, .. }) => shape.iter().copied().collect(),
        _ => Vec::new(),
    }
}

/// Guesses NCHW vs NHWC from a 4-d input declaration.
fn detect_layout(dims: &[i64], channels: u32) -> Option<TensorLayout> {
    if dims.len() != 4 {
        return None;
    }
    let c = channels as i64;
    match (dims[1], dims[3]) {
        (a, b) if a == c && b != c => Some(TensorLayout::Nchw),
        (a, b) if b == c && a != c => Some(TensorLayout::Nhwc),
        _ => None,
    }
}

/// Element count of one batch item, when every non-batch dimension is fixed.
fn static_len(dims: &[i64]) -> Option<usize> {
    let rest = dims.get(1..)?;
    if rest.is_empty() || rest.iter().any(|d| *d <= 0) {
        return None;
    }
    Some(rest.iter().map(|d| *d as usize).product())
}
