use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the segmentation pipeline.
///
/// Shape, alignment and configuration problems are fatal for the current
/// batch or run and are never repaired by reshaping. Collaborator failures
/// (filesystem, image decoding, model runtime) carry the path or operation
/// they failed on and are passed through without retry.
#[derive(Error, Debug)]
pub enum DelamSegError {
    #[error("Shape error: {context}: expected {expected}, got {actual}")]
    Shape {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Alignment error: sample {sample}: {reason}")]
    Alignment { sample: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Data exhausted: requested {requested} more batch(es) from a non-cyclic stream of {samples} samples")]
    DataExhaustion { requested: usize, samples: usize },

    #[error("Invalid label {label} in sample {sample}: dataset declares {num_classes} classes")]
    InvalidLabel {
        sample: String,
        label: u8,
        num_classes: usize,
    },

    #[error("Invalid input {input:?}: {expected}")]
    InvalidInput { input: String, expected: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, DelamSegError>;

impl DelamSegError {
    pub fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::Shape {
            context: context.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn alignment(sample: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Alignment {
            sample: sample.into(),
            reason: reason.into(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Callers that know the path and operation should build
/// `DelamSegError::FileSystem` directly; this is the fallback for `?`.
impl From<std::io::Error> for DelamSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for DelamSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for DelamSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors.
///
/// ndarray only raises these when a buffer does not fit the requested
/// dimensions, which is a tensor shape problem in this crate.
impl From<ndarray::ShapeError> for DelamSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape {
            context: "tensor shape conversion".to_string(),
            expected: "compatible dimensions".to_string(),
            actual: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DelamSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Model {
            operation: "json (de)serialization".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<json5::Error> for DelamSegError {
    fn from(err: json5::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}
