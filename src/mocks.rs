use std::fs;
use std::path::Path;

use ndarray::prelude::*;

use crate::errors::{DelamSegError, Result};
use crate::metrics::LossKind;
use crate::traits::{DensePredictor, InputShape, StepOutput, TrainableModel};

/// Test model that labels a pixel as the defect class when its first channel
/// is brighter than mid-gray.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub input_shape: InputShape,
}

impl MockSegmentationModel {
    pub const fn new(input_shape: InputShape) -> Self {
        Self { input_shape }
    }
}

impl DensePredictor for MockSegmentationModel {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn num_classes(&self) -> usize {
        2
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.input_shape.check_batch(&images)?;
        let (n, h, w, _) = images.dim();
        // rescaled intensity in [-1, 1] mapped to a defect probability
        Ok(Array4::from_shape_fn((n, h, w, 2), |(i, y, x, k)| {
            let defect = ((images[[i, y, x, 0]] + 1.0) / 2.0).clamp(0.0, 1.0);
            if k == 1 {
                defect
            } else {
                1.0 - defect
            }
        }))
    }
}

/// Test model that records how it was driven. Its loss shrinks with every
/// optimization step and never changes during evaluation.
#[derive(Debug, Clone)]
pub struct MockTrainableModel {
    pub inner: MockSegmentationModel,
    pub train_steps: usize,
    pub seen_batch_sizes: Vec<usize>,
}

impl MockTrainableModel {
    pub const fn new(input_shape: InputShape) -> Self {
        Self {
            inner: MockSegmentationModel::new(input_shape),
            train_steps: 0,
            seen_batch_sizes: Vec::new(),
        }
    }

    fn current_loss(&self) -> f64 {
        1.0 / (1.0 + self.train_steps as f64)
    }
}

impl DensePredictor for MockTrainableModel {
    fn input_shape(&self) -> InputShape {
        self.inner.input_shape()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.inner.predict(images)
    }
}

impl TrainableModel for MockTrainableModel {
    fn loss(&self) -> LossKind {
        LossKind::SparseCategoricalCrossentropy
    }

    fn train_step(
        &mut self,
        images: ArrayView4<f32>,
        labels: ArrayView3<u8>,
    ) -> Result<StepOutput> {
        if images.len_of(Axis(0)) != labels.len_of(Axis(0)) {
            return Err(DelamSegError::shape(
                "mock batch",
                images.len_of(Axis(0)),
                labels.len_of(Axis(0)),
            ));
        }
        let probabilities = self.predict(images)?;
        let loss = self.current_loss();
        self.train_steps += 1;
        self.seen_batch_sizes.push(images.len_of(Axis(0)));
        Ok(StepOutput {
            loss,
            probabilities,
        })
    }

    fn evaluate_step(&self, images: ArrayView4<f32>, _labels: ArrayView3<u8>) -> Result<StepOutput> {
        Ok(StepOutput {
            loss: self.current_loss(),
            probabilities: self.predict(images)?,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.train_steps.to_string()).map_err(|e| DelamSegError::FileSystem {
            path: path.to_path_buf(),
            operation: "mock checkpoint write".to_string(),
            source: e,
        })
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        self.train_steps = content
            .trim()
            .parse()
            .map_err(|_| DelamSegError::InvalidInput {
                input: content.clone(),
                expected: "a step count".to_string(),
            })?;
        Ok(())
    }
}

/// Factory for tests with a small canvas.
pub const fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(InputShape::new(8, 8, 1))
}
