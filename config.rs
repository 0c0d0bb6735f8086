use crate::error::{Error, Result};
use crate::labels;
use crate::models::{TensorLayout, TensorShape};
use crate::onnx::ProviderChoice;
use crate::preprocess::ResizeStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_THRESHOLD: f32 = 0.5;

const MODEL_ENV: &str = "WASTE_CLASSIFIER_MODEL";
const THRESHOLD_ENV: &str = "WASTE_CLASSIFIER_THRESHOLD";

/// How raw model outputs are turned into scores before the threshold is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    /// The model already emits probabilities.
    #[default]
    Identity,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "labels::default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_input_side")]
    pub input_width: u32,
    #[serde(default = "default_input_side")]
    pub input_height: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub resize: ResizeStrategy,
    #[serde(default)]
    pub layout: TensorLayout,
    #[serde(default)]
    pub activation: OutputActivation,
    #[serde(default)]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub device_id: Option<u32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            labels: labels::default_labels(),
            threshold: DEFAULT_THRESHOLD,
            input_width: default_input_side(),
            input_height: default_input_side(),
            channels: default_channels(),
            resize: ResizeStrategy::default(),
            layout: TensorLayout::default(),
            activation: OutputActivation::default(),
            provider: ProviderChoice::default(),
            device_id: None,
        }
    }
}

fn default_model_path() -> PathBuf {
    Path::new("models").join("waste_classifier.onnx")
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_input_side() -> u32 {
    224
}

fn default_channels() -> u32 {
    3
}

impl ClassifierConfig {
    /// Reads a JSON config file; absent fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Loaded classifier config from {}", path.display());
        Ok(config)
    }

    /// Defaults with `WASTE_CLASSIFIER_MODEL` / `WASTE_CLASSIFIER_THRESHOLD` applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup(MODEL_ENV) {
            if !path.trim().is_empty() {
                self.model_path = PathBuf::from(path);
            }
        }
        if let Some(raw) = lookup(THRESHOLD_ENV) {
            self.threshold = raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{THRESHOLD_ENV}={raw:?}: {e}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Replaces the configured labels with the model's sidecar label file, if any.
    pub fn with_sidecar_labels(mut self) -> Self {
        if let Some(labels) = labels::load_labels_for_model(&self.model_path) {
            self.labels = labels;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(Error::Config("label table is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Config(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(Error::Config(format!(
                "input size {}x{} has a zero dimension",
                self.input_width, self.input_height
            )));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(Error::Config(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        Ok(())
    }

    pub fn tensor_shape(&self) -> TensorShape {
        TensorShape::new(self.input_width, self.input_height, self.channels)
    }

    pub fn resolve_model(&self, models_dir: &Path) -> PathBuf {
        if self.model_path.is_absolute() {
            self.model_path.clone()
        } else {
            models_dir.join(&self.model_path)
        }
    }
}
