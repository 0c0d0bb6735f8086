//! On-device waste image classification.
//!
//! Images come from an [`source::ImageSource`], are turned into tensors by
//! [`preprocess`], scored by a [`session::ModelSession`] and mapped to a
//! category by [`decision`]. [`pipeline::ClassificationPipeline`] runs those
//! steps for one image; [`service::ClassificationService`] is what a UI talks to.

pub mod config;
pub mod decision;
pub mod error;
pub mod labels;
pub mod models;
pub mod onnx;
pub mod pipeline;
pub mod preprocess;
pub mod service;
pub mod session;
pub mod source;

pub use crate::config::ClassifierConfig;
pub use crate::error::{ClassifyError, Error, Result, ServiceError, SourceError};
pub use crate::models::{ClassificationReport, ClassificationResult, ImageOrigin, RawImage};
pub use crate::pipeline::ClassificationPipeline;
pub use crate::service::{ClassificationService, Delivery, Submission};
pub use crate::session::ModelSession;

/// Installs `env_logger` (filtered by `RUST_LOG`). Safe to call more than once.
pub fn init_logging() {
    if env_logger::try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
