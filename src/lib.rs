pub mod augment;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod label;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod source;
pub mod stream;
pub mod train;
pub mod traits;

pub mod mocks;

use std::path::Path;

pub use augment::{AugmentationEnvelope, AugmentationParams, FillMode, Interpolation};
pub use classifier::{PixelClassifier, SgdConfig};
pub use config::{Cli, Command, RunConfig};
pub use errors::{DelamSegError, Result};
pub use label::{LabelGenerator, PngLabelWriter};
pub use metrics::{LossKind, MetricContext, MetricKind};
pub use model::OnnxModel;
pub use source::{dataset_dirs, ColorMode, DirectorySource, InMemorySource};
pub use stream::{PairedBatch, PairedStream, StreamConfig, StreamState};
pub use train::{evaluate, should_persist, EvaluationSummary, History, PersistDecision, Trainer};
pub use traits::*;

/// Open a dense predictor by file extension: `.onnx` through onnxruntime,
/// `.json` as a [`PixelClassifier`] checkpoint.
pub fn open_predictor(path: &Path, device_id: i32) -> Result<Box<dyn DensePredictor>> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("onnx") => Ok(Box::new(OnnxModel::new(path, device_id)?)),
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Box::new(PixelClassifier::open(path)?)),
        _ => Err(DelamSegError::InvalidInput {
            input: path.display().to_string(),
            expected: "a .onnx model or a .json checkpoint".to_string(),
        }),
    }
}

/// Image and mask sources below `<root>/images` and `<root>/masks`, resized to
/// the configured canvas.
pub fn dataset_sources(root: &Path, config: &RunConfig) -> (DirectorySource, DirectorySource) {
    let (images, masks) = dataset_dirs(root);
    let images = DirectorySource::new(images)
        .with_color_mode(config.color_mode)
        .with_target_size(config.target_height, config.target_width);
    let masks = DirectorySource::new(masks)
        .with_color_mode(ColorMode::Grayscale)
        .with_target_size(config.target_height, config.target_width);
    (images, masks)
}
