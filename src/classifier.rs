//! Per-pixel softmax regression trained with momentum SGD.

use std::fs;
use std::path::Path;

use log::debug;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::errors::{DelamSegError, Result};
use crate::metrics::LossKind;
use crate::traits::{DensePredictor, InputShape, StepOutput, TrainableModel};

/// Stochastic gradient descent with momentum and inverse-time decay:
/// `lr_t = lr / (1 + decay * t)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            momentum: 0.9,
            decay: 0.005 / 200.0,
        }
    }
}

impl SgdConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(DelamSegError::configuration(
                "learning rate must be positive and finite",
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(DelamSegError::configuration("momentum must lie in [0, 1)"));
        }
        if !self.decay.is_finite() || self.decay < 0.0 {
            return Err(DelamSegError::configuration(
                "decay must be finite and not negative",
            ));
        }
        Ok(())
    }

    fn learning_rate_at(&self, iteration: u64) -> f32 {
        (self.learning_rate / (1.0 + self.decay * iteration as f64)) as f32
    }
}

/// On-disk form of a [`PixelClassifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    input_shape: InputShape,
    num_classes: usize,
    loss: LossKind,
    optimizer: SgdConfig,
    iterations: u64,
    /// `(channels, classes)` row-major.
    weights: Vec<f32>,
    bias: Vec<f32>,
}

/// Linear map from pixel intensities to class logits followed by a softmax,
/// shared across all pixels.
#[derive(Debug, Clone)]
pub struct PixelClassifier {
    input_shape: InputShape,
    num_classes: usize,
    loss: LossKind,
    optimizer: SgdConfig,
    iterations: u64,
    weights: Array2<f32>,
    bias: Array1<f32>,
    weight_velocity: Array2<f32>,
    bias_velocity: Array1<f32>,
}

impl PixelClassifier {
    /// Fresh model with small random weights drawn from `seed`.
    pub fn new(
        input_shape: InputShape,
        num_classes: usize,
        loss: LossKind,
        optimizer: SgdConfig,
        seed: u64,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(DelamSegError::configuration(
                "a pixel classifier needs at least two classes",
            ));
        }
        if input_shape.channels == 0 {
            return Err(DelamSegError::configuration("input must have channels"));
        }
        optimizer.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_simple_fn((input_shape.channels, num_classes), || {
            rng.gen_range(-0.05_f32..0.05)
        });

        Ok(Self {
            input_shape,
            num_classes,
            loss,
            optimizer,
            iterations: 0,
            weight_velocity: Array2::zeros(weights.raw_dim()),
            bias_velocity: Array1::zeros(num_classes),
            bias: Array1::zeros(num_classes),
            weights,
        })
    }

    /// Restore a model written by [`TrainableModel::save`].
    pub fn open(path: &Path) -> Result<Self> {
        let checkpoint = read_checkpoint(path)?;
        let mut model = Self::new(
            checkpoint.input_shape,
            checkpoint.num_classes,
            checkpoint.loss,
            checkpoint.optimizer.clone(),
            0,
        )?;
        model.restore(checkpoint)?;
        Ok(model)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn weights(&self) -> ArrayView2<f32> {
        self.weights.view()
    }

    /// Flattened inputs `(pixels, c)` and softmax outputs `(pixels, k)`.
    fn forward(&self, images: &ArrayView4<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        self.input_shape.check_batch(images)?;
        let (n, h, w, c) = images.dim();
        let inputs = images.to_shape((n * h * w, c))?.into_owned();

        let mut probabilities = inputs.dot(&self.weights);
        probabilities += &self.bias;
        for mut row in probabilities.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }
        Ok((inputs, probabilities))
    }

    fn unflatten(&self, images: &ArrayView4<f32>, flat: Array2<f32>) -> Result<Array4<f32>> {
        let (n, h, w, _) = images.dim();
        Ok(flat.into_shape_with_order((n, h, w, self.num_classes))?)
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let expected = (self.input_shape.channels, self.num_classes);
        self.weights = Array2::from_shape_vec(expected, checkpoint.weights)?;
        self.bias = Array1::from_vec(checkpoint.bias);
        if self.bias.len() != self.num_classes {
            return Err(DelamSegError::shape(
                "checkpoint bias",
                self.num_classes,
                self.bias.len(),
            ));
        }
        self.iterations = checkpoint.iterations;
        self.weight_velocity.fill(0.0);
        self.bias_velocity.fill(0.0);
        Ok(())
    }
}

impl DensePredictor for PixelClassifier {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (_, probabilities) = self.forward(&images)?;
        self.unflatten(&images, probabilities)
    }
}

impl TrainableModel for PixelClassifier {
    fn loss(&self) -> LossKind {
        self.loss
    }

    fn train_step(
        &mut self,
        images: ArrayView4<f32>,
        labels: ArrayView3<u8>,
    ) -> Result<StepOutput> {
        let (inputs, flat) = self.forward(&images)?;
        let probabilities = self.unflatten(&images, flat.clone())?;

        let loss = self.loss.compute(labels, probabilities.view())?;
        let gradient = self
            .loss
            .probability_gradient(labels, probabilities.view())?
            .into_shape_with_order(flat.raw_dim())?;

        // softmax backward: dz = p * (g - sum(p * g))
        let weighted = &flat * &gradient;
        let dot = weighted.sum_axis(Axis(1)).insert_axis(Axis(1));
        let logits_gradient = weighted - &flat * &dot;

        let weight_gradient = inputs.t().dot(&logits_gradient);
        let bias_gradient = logits_gradient.sum_axis(Axis(0));

        let lr = self.optimizer.learning_rate_at(self.iterations);
        let momentum = self.optimizer.momentum as f32;
        self.weight_velocity *= momentum;
        self.weight_velocity.scaled_add(-lr, &weight_gradient);
        self.bias_velocity *= momentum;
        self.bias_velocity.scaled_add(-lr, &bias_gradient);
        self.weights += &self.weight_velocity;
        self.bias += &self.bias_velocity;
        self.iterations += 1;

        Ok(StepOutput {
            loss,
            probabilities,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint {
            input_shape: self.input_shape,
            num_classes: self.num_classes,
            loss: self.loss,
            optimizer: self.optimizer.clone(),
            iterations: self.iterations,
            weights: self.weights.iter().copied().collect(),
            bias: self.bias.to_vec(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| DelamSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "checkpoint directory creation".to_string(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(&checkpoint)?;
        fs::write(path, json).map_err(|e| DelamSegError::FileSystem {
            path: path.to_path_buf(),
            operation: "checkpoint write".to_string(),
            source: e,
        })?;
        debug!("saved pixel classifier to {}", path.display());
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let checkpoint = read_checkpoint(path)?;
        if checkpoint.input_shape != self.input_shape || checkpoint.num_classes != self.num_classes {
            return Err(DelamSegError::shape(
                format!("checkpoint {}", path.display()),
                (self.input_shape, self.num_classes),
                (checkpoint.input_shape, checkpoint.num_classes),
            ));
        }
        self.restore(checkpoint)
    }
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let json = fs::read_to_string(path).map_err(|e| DelamSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "checkpoint read".to_string(),
        source: e,
    })?;
    Ok(serde_json::from_str(&json)?)
}
