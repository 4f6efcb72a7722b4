use std::path::Path;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{DelamSegError, Result};
use crate::metrics::LossKind;

/// Fixed `(height, width, channels)` input a dense predictor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Reject an `(n, h, w, c)` batch that does not match this shape.
    pub fn check_batch(&self, images: &ArrayView4<f32>) -> Result<()> {
        let (_, height, width, channels) = images.dim();
        if (height, width, channels) != (self.height, self.width, self.channels) {
            return Err(DelamSegError::shape(
                "model input",
                (self.height, self.width, self.channels),
                (height, width, channels),
            ));
        }
        Ok(())
    }
}

/// Output of a single optimization or evaluation step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    /// `(n, h, w, num_classes)`
    pub probabilities: Array4<f32>,
}

/// Dense-prediction model in inference mode.
///
/// The layer graph behind it is opaque; only the fixed input shape and the
/// per-pixel class-probability output are part of the contract.
pub trait DensePredictor: Send + Sync {
    fn input_shape(&self) -> InputShape;

    fn num_classes(&self) -> usize;

    /// Rescaled `(n, h, w, c)` batch to `(n, h, w, num_classes)` probabilities.
    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>>;
}

impl<T: DensePredictor + ?Sized> DensePredictor for Box<T> {
    fn input_shape(&self) -> InputShape {
        (**self).input_shape()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        (**self).predict(images)
    }
}

/// Dense predictor that can also be optimized and persisted.
pub trait TrainableModel: DensePredictor {
    /// Objective minimized by [`TrainableModel::train_step`].
    fn loss(&self) -> LossKind;

    /// One optimization step. The returned loss is measured before the update.
    fn train_step(&mut self, images: ArrayView4<f32>, labels: ArrayView3<u8>)
        -> Result<StepOutput>;

    /// Loss and probabilities without touching parameters.
    fn evaluate_step(&self, images: ArrayView4<f32>, labels: ArrayView3<u8>) -> Result<StepOutput> {
        let probabilities = self.predict(images)?;
        let loss = self.loss().compute(labels, probabilities.view())?;
        Ok(StepOutput {
            loss,
            probabilities,
        })
    }

    fn save(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;
}

/// One entry of a sample source: a stable id and its tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    pub id: String,
    /// `(h, w, c)`
    pub data: Array3<T>,
}

impl<T> Sample<T> {
    pub fn new(id: impl Into<String>, data: Array3<T>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn spatial_dim(&self) -> (usize, usize) {
        let (height, width, _) = self.data.dim();
        (height, width)
    }
}

/// Ordered collection of raw image or mask samples.
///
/// Implementations must enumerate in a stable order; image and mask sources
/// are paired by position.
pub trait SampleSource<T> {
    fn enumerate(&self) -> Result<Vec<Sample<T>>>;
}

/// Receiver of predicted label maps.
pub trait LabelSink {
    fn write(&mut self, id: &str, labels: ArrayView2<u8>) -> Result<()>;
}
