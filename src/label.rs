//! Inference-time label map generation.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::prelude::*;

use crate::errors::{DelamSegError, Result};
use crate::metrics::argmax_labels;
use crate::preprocess::{crop_padding, rescale, zero_pad_to, PadAmount, PadKind};
use crate::traits::{DensePredictor, LabelSink, SampleSource};

/// Runs a dense predictor over raw images and produces label maps in the
/// images' own resolution.
pub struct LabelGenerator<M: DensePredictor> {
    model: M,
    show_progress: bool,
}

impl<M: DensePredictor> LabelGenerator<M> {
    pub const fn new(model: M) -> Self {
        Self {
            model,
            show_progress: false,
        }
    }

    pub const fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Label map for one raw `(h, w, c)` image.
    ///
    /// Images smaller than the model canvas are zero-padded on the bottom and
    /// right before rescaling, and the prediction is cropped back afterwards.
    pub fn predict_labels(&self, image: ArrayView3<f32>) -> Result<Array2<u8>> {
        let shape = self.model.input_shape();
        let (height, width, channels) = image.dim();
        if channels != shape.channels {
            return Err(DelamSegError::shape(
                "image channels",
                shape.channels,
                channels,
            ));
        }

        let (canvas, pad) = if (height, width) == (shape.height, shape.width) {
            (image.to_owned(), PadAmount::NONE)
        } else {
            zero_pad_to(image, (shape.height, shape.width), PadKind::Image)?
        };

        let batch = rescale(canvas.view())?.insert_axis(Axis(0));
        let probabilities = self.model.predict(batch.view())?;
        let expected = (1, shape.height, shape.width, self.model.num_classes());
        if probabilities.dim() != expected {
            return Err(DelamSegError::shape(
                "model output",
                expected,
                probabilities.dim(),
            ));
        }

        let labels = argmax_labels(probabilities.index_axis(Axis(0), 0));
        crop_padding(labels.view(), pad)
    }

    /// Predict every sample of `source` and hand the label maps to `sink`.
    /// Returns the number of maps written.
    pub fn run<S, W>(&self, source: &S, sink: &mut W) -> Result<usize>
    where
        S: SampleSource<f32> + ?Sized,
        W: LabelSink + ?Sized,
    {
        let samples = source.enumerate()?;
        if samples.is_empty() {
            warn!("no images to label");
            return Ok(0);
        }

        let pb = if self.show_progress {
            let pb = ProgressBar::new(samples.len() as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        for sample in &samples {
            let labels = self.predict_labels(sample.data.view())?;
            sink.write(&sample.id, labels.view())?;
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!("wrote {} label maps", samples.len());
        Ok(samples.len())
    }
}

/// Writes `<output_dir>/<id>.png` with classes spread over the gray range,
/// so class 0 is black and the last class is white.
#[derive(Debug, Clone)]
pub struct PngLabelWriter {
    output_dir: PathBuf,
    num_classes: usize,
}

impl PngLabelWriter {
    pub fn new(output_dir: impl Into<PathBuf>, num_classes: usize) -> Result<Self> {
        if num_classes < 2 {
            return Err(DelamSegError::configuration(
                "label images need at least two classes",
            ));
        }
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|e| DelamSegError::FileSystem {
            path: output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;
        Ok(Self {
            output_dir,
            num_classes,
        })
    }

    pub fn output_path(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{id}.png"))
    }

    pub fn gray_level(&self, class: u8) -> u8 {
        let top = (self.num_classes - 1) as u32;
        (u32::from(class).min(top) * 255 / top) as u8
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl LabelSink for PngLabelWriter {
    fn write(&mut self, id: &str, labels: ArrayView2<u8>) -> Result<()> {
        let (height, width) = labels.dim();
        let pixels: Vec<u8> = labels.iter().map(|&c| self.gray_level(c)).collect();
        let image = GrayImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
            DelamSegError::shape("label image buffer", (height, width), labels.len())
        })?;

        let output_path = self.output_path(id);
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).map_err(|e| DelamSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        image
            .save_with_format(&output_path, ImageFormat::Png)
            .map_err(|e| DelamSegError::ImageProcessing {
                path: output_path.display().to_string(),
                operation: "label image write".to_string(),
                source: Box::new(e),
            })
    }
}

/// In-memory sink collecting `(id, labels)` pairs in arrival order.
impl LabelSink for Vec<(String, Array2<u8>)> {
    fn write(&mut self, id: &str, labels: ArrayView2<u8>) -> Result<()> {
        self.push((id.to_string(), labels.to_owned()));
        Ok(())
    }
}
