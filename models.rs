use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const OTHER_LABEL: &str = "Other";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOrigin {
    Camera,
    Gallery,
}

/// Dimensions of a packed, row-major pixel buffer (1, 3 or 4 bytes per pixel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelLayout {
    pub width: u32,
    pub height: u32,
}

/// Image payload handed over by a camera or gallery picker.
///
/// Without a [`PixelLayout`] the bytes are an encoded image (PNG, JPEG, ...).
/// The buffer is never modified after construction.
pub struct RawImage {
    bytes: Vec<u8>,
    origin: ImageOrigin,
    pixels: Option<PixelLayout>,
}

impl RawImage {
    pub fn encoded(bytes: Vec<u8>, origin: ImageOrigin) -> Self {
        Self {
            bytes,
            origin,
            pixels: None,
        }
    }

    pub fn from_pixels(bytes: Vec<u8>, layout: PixelLayout, origin: ImageOrigin) -> Self {
        Self {
            bytes,
            origin,
            pixels: Some(layout),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn origin(&self) -> ImageOrigin {
        self.origin
    }

    pub fn pixel_layout(&self) -> Option<PixelLayout> {
        self.pixels
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("len", &self.bytes.len())
            .field("origin", &self.origin)
            .field("pixels", &self.pixels)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// `Ready` and `Failed` are the states a load attempt settles in.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl TensorShape {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TensorShape {
    fn default() -> Self {
        Self::new(224, 224, 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

/// Normalized model input owned by a single classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Vec<f32>,
    shape: TensorShape,
    layout: TensorLayout,
}

impl InputTensor {
    pub(crate) fn new(data: Vec<f32>, shape: TensorShape, layout: TensorLayout) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Self {
            data,
            shape,
            layout,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    /// Batch-of-one dimensions in the tensor's layout.
    pub fn batch_dims(&self) -> [usize; 4] {
        let (w, h, c) = (
            self.shape.width as usize,
            self.shape.height as usize,
            self.shape.channels as usize,
        );
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, c],
            TensorLayout::Nchw => [1, c, h, w],
        }
    }

    pub fn into_array(self) -> std::result::Result<ndarray::Array4<f32>, ndarray::ShapeError> {
        let [n, a, b, c] = self.batch_dims();
        ndarray::Array4::from_shape_vec((n, a, b, c), self.data)
    }
}

/// Per-class scores in label-table order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProbabilities(Vec<f32>);

impl OutputProbabilities {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationResult {
    Labeled {
        index: usize,
        label: String,
        score: f32,
    },
    /// The best score fell below the confidence threshold.
    Other { score: f32 },
}

impl ClassificationResult {
    pub fn label(&self) -> &str {
        match self {
            Self::Labeled { label, .. } => label,
            Self::Other { .. } => OTHER_LABEL,
        }
    }

    pub fn score(&self) -> f32 {
        match self {
            Self::Labeled { score, .. } | Self::Other { score } => *score,
        }
    }

    pub fn is_other(&self) -> bool {
        matches!(self, Self::Other { .. })
    }

    /// MaterialCommunityIcons name the result card shows for this category.
    pub fn icon_name(&self) -> &'static str {
        match self.label().to_lowercase().as_str() {
            "plastic" => "bottle-soda",
            "paper" => "newspaper",
            "daily disposals" => "trash-can",
            _ => "help-circle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken(Uuid);

impl RequestToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub token: RequestToken,
    pub origin: ImageOrigin,
    pub result: ClassificationResult,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_result_uses_fallback_label_and_icon() {
        let res = ClassificationResult::Other { score: 0.4 };
        assert_eq!(res.label(), "Other");
        assert_eq!(res.icon_name(), "help-circle");
        assert!(res.is_other());
    }

    #[test]
    fn labeled_result_maps_icons() {
        let label = |name: &str| ClassificationResult::Labeled {
            index: 0,
            label: name.to_string(),
            score: 0.9,
        };
        assert_eq!(label("Plastic").icon_name(), "bottle-soda");
        assert_eq!(label("Paper").icon_name(), "newspaper");
        assert_eq!(label("Daily Disposals").icon_name(), "trash-can");
        assert_eq!(label("Glass").icon_name(), "help-circle");
    }

    #[test]
    fn batch_dims_follow_layout() {
        let shape = TensorShape::new(4, 2, 3);
        let nhwc = InputTensor::new(vec![0.0; shape.len()], shape, TensorLayout::Nhwc);
        assert_eq!(nhwc.batch_dims(), [1, 2, 4, 3]);
        let nchw = InputTensor::new(vec![0.0; shape.len()], shape, TensorLayout::Nchw);
        assert_eq!(nchw.batch_dims(), [1, 3, 2, 4]);
        assert_eq!(nchw.into_array().unwrap().shape(), &[1, 3, 2, 4]);
    }

    #[test]
    fn report_serializes_elapsed_in_millis() {
        let report = ClassificationReport {
            token: RequestToken::new(),
            origin: ImageOrigin::Gallery,
            result: ClassificationResult::Other { score: 0.1 },
            elapsed: Duration::from_millis(42),
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed_ms"], 42);
        assert_eq!(json["result"]["kind"], "other");
        assert_eq!(json["origin"], "gallery");
    }

    #[test]
    fn model_state_display() {
        assert_eq!(ModelState::Loading.to_string(), "loading");
        assert_eq!(
            ModelState::Failed("missing file".into()).to_string(),
            "failed: missing file"
        );
    }
}
