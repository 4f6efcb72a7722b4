use std::path::Path;

use crate::{
    errors::{DelamSegError, Result},
    traits::{DensePredictor, InputShape},
};
use log::info;
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

/// Exported segmentation network served through onnxruntime.
///
/// Expects a single NHWC `f32` input with fixed spatial size and a single
/// NHWC output holding per-pixel class probabilities.
pub struct OnnxModel {
    input_shape: InputShape,
    num_classes: usize,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxModel {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| DelamSegError::Model {
                operation: "session builder initialization".to_string(),
                source: Box::new(e),
            })?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| DelamSegError::Model {
                operation: "execution provider registration".to_string(),
                source: Box::new(e),
            })?
            .with_memory_pattern(true)
            .map_err(|e| DelamSegError::Model {
                operation: "memory pattern configuration".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| DelamSegError::Model {
                operation: format!("model loading: {}", model_path.display()),
                source: Box::new(e),
            })?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| missing_metadata("model input"))?;
        let input_dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| missing_metadata("model input shape"))?
            .iter()
            .copied()
            .collect();
        let output = session
            .outputs
            .first()
            .ok_or_else(|| missing_metadata("model output"))?;
        let output_dims: Vec<i64> = output
            .output_type
            .tensor_shape()
            .ok_or_else(|| missing_metadata("model output shape"))?
            .iter()
            .copied()
            .collect();

        let [height, width, channels] = fixed_trailing_dims("model input", &input_dims)?;
        let [_, _, num_classes] = fixed_trailing_dims("model output", &output_dims)?;
        let input_name = input.name.clone();
        let output_name = output.name.clone();

        // initialize model
        let data = Array4::<f32>::zeros((1, height, width, channels));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data).map_err(|e| DelamSegError::Model {
                operation: "warm-up tensor creation".to_string(),
                source: Box::new(e),
            })?])
            .map_err(|e| DelamSegError::Model {
                operation: "warm-up inference".to_string(),
                source: Box::new(e),
            })?;

        info!(
            "loaded {} with input {height}x{width}x{channels} and {num_classes} classes",
            model_path.display()
        );

        Ok(Self {
            input_shape: InputShape::new(height, width, channels),
            num_classes,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }
}

impl DensePredictor for OnnxModel {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.input_shape.check_batch(&images)?;
        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&images.as_standard_layout())?],
        )?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

fn missing_metadata(what: &str) -> DelamSegError {
    DelamSegError::Model {
        operation: format!("{what} lookup"),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "tensor metadata is unavailable",
        )),
    }
}

/// `(h, w, c)` of an NHWC tensor; dynamic spatial or channel axes are rejected.
fn fixed_trailing_dims(context: &str, dims: &[i64]) -> Result<[usize; 3]> {
    match dims {
        [_, h, w, c] if *h > 0 && *w > 0 && *c > 0 => Ok([*h as usize, *w as usize, *c as usize]),
        _ => Err(DelamSegError::shape(
            context,
            "[batch, height, width, channels] with fixed trailing axes",
            dims,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_dims_accept_dynamic_batch() -> Result<()> {
        assert_eq!(fixed_trailing_dims("input", &[-1, 512, 640, 3])?, [512, 640, 3]);
        Ok(())
    }

    #[test]
    fn trailing_dims_reject_dynamic_spatial_axes() {
        assert!(matches!(
            fixed_trailing_dims("input", &[1, -1, -1, 3]),
            Err(DelamSegError::Shape { .. })
        ));
        assert!(matches!(
            fixed_trailing_dims("input", &[1, 3, 512]),
            Err(DelamSegError::Shape { .. })
        ));
    }
}
