use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::augment::{AugmentationEnvelope, FillMode, Interpolation};
use crate::classifier::SgdConfig;
use crate::errors::{DelamSegError, Result};
use crate::metrics::{LossKind, MetricContext, MetricKind};
use crate::source::ColorMode;
use crate::stream::StreamConfig;
use crate::train::TrainingConfig;
use crate::traits::InputShape;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON5 run configuration; built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Train a pixel classifier on `<train_dir>/{images,masks}`.
    Train {
        train_dir: PathBuf,

        val_dir: PathBuf,

        #[arg(short, long, default_value = "model.json")]
        output: PathBuf,

        /// Continue from an existing checkpoint.
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Write the per-epoch history as JSON.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Save without asking.
        #[arg(short, long)]
        yes: bool,
    },

    /// Report loss and metrics of a model on `<data_dir>/{images,masks}`.
    Evaluate {
        data_dir: PathBuf,

        /// `.onnx` network or `.json` pixel classifier checkpoint.
        #[arg(short, long)]
        model_path: PathBuf,

        #[arg(short, long, default_value_t = 50)]
        steps: usize,

        #[arg(short, long, default_value_t = 0)]
        device_id: i32,

        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Write predicted label maps for every image below `input_dir`.
    Predict {
        input_dir: PathBuf,

        #[arg(default_value = "predictions")]
        output_dir: PathBuf,

        /// `.onnx` network or `.json` pixel classifier checkpoint.
        #[arg(short, long)]
        model_path: PathBuf,

        #[arg(short, long, default_value_t = 0)]
        device_id: i32,
    },
}

/// Every tunable of a run. No value is read from globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub seed: u64,
    pub batch_size: usize,
    pub target_height: u32,
    pub target_width: u32,
    pub color_mode: ColorMode,
    /// Class names; a class id is its position in this list.
    pub classes: Vec<String>,
    pub background_class: u8,
    pub defect_class: u8,
    pub augmentation: AugmentationEnvelope,
    pub training: TrainingConfig,
    pub optimizer: SgdConfig,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 1000,
            batch_size: 4,
            target_height: 512,
            target_width: 640,
            color_mode: ColorMode::Rgb,
            classes: vec!["background".to_string(), "delamination".to_string()],
            background_class: 0,
            defect_class: 1,
            augmentation: AugmentationEnvelope {
                horizontal_flip: true,
                vertical_flip: true,
                width_shift_range: 0.2,
                height_shift_range: 0.2,
                zoom_range: 0.2,
                rotation_range: 45.0,
                fill_mode: FillMode::Nearest,
                interpolation: Interpolation::Bilinear,
            },
            training: TrainingConfig::default(),
            optimizer: SgdConfig::default(),
            loss: LossKind::SparseCategoricalCrossentropy,
            metrics: MetricKind::ALL.to_vec(),
        }
    }
}

impl RunConfig {
    pub fn open(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DelamSegError::FileSystem {
            path: path.to_path_buf(),
            operation: "config read".to_string(),
            source: e,
        })?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DelamSegError::configuration("batch_size must be positive"));
        }
        if self.target_height == 0 || self.target_width == 0 {
            return Err(DelamSegError::configuration("target size must be positive"));
        }
        if self.classes.len() < 2 || self.classes.len() > 256 {
            return Err(DelamSegError::configuration(format!(
                "{} classes declared, expected 2..=256",
                self.classes.len()
            )));
        }
        for (name, class) in [
            ("background_class", self.background_class),
            ("defect_class", self.defect_class),
        ] {
            if usize::from(class) >= self.classes.len() {
                return Err(DelamSegError::configuration(format!(
                    "{name} {class} is not one of the {} classes",
                    self.classes.len()
                )));
            }
        }
        self.augmentation.validate()?;
        self.training.validate()?;
        self.optimizer.validate()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn input_shape(&self) -> InputShape {
        InputShape::new(
            self.target_height as usize,
            self.target_width as usize,
            self.color_mode.channels(),
        )
    }

    pub fn metric_context(&self) -> MetricContext {
        MetricContext {
            classes: (0..self.classes.len()).map(|c| c as u8).collect(),
            defect_class: self.defect_class,
        }
    }

    pub fn train_stream(&self) -> StreamConfig {
        StreamConfig {
            seed: self.seed,
            batch_size: self.batch_size,
            shuffle: true,
            cyclic: true,
            background: self.background_class,
        }
    }

    /// `None` when validation is disabled by `training.validation_steps == 0`.
    pub fn validation_stream(&self) -> Option<StreamConfig> {
        (self.training.validation_steps > 0).then(|| StreamConfig {
            batch_size: self.training.validation_batch_size,
            ..self.train_stream()
        })
    }

    /// Keeps file order and wraps around to fill the `steps` budget.
    pub fn evaluation_stream(&self) -> StreamConfig {
        StreamConfig {
            shuffle: false,
            ..self.train_stream()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = RunConfig::default();
        config.validate()?;
        assert_eq!(config.input_shape(), InputShape::new(512, 640, 3));
        assert_eq!(config.metric_context().classes, vec![0, 1]);
        assert_eq!(config.validation_stream().map(|s| s.batch_size), Some(2));
        Ok(())
    }

    #[test]
    fn disabled_validation_needs_no_stream() {
        let config = RunConfig {
            training: TrainingConfig {
                validation_steps: 0,
                validation_batch_size: 0,
                ..TrainingConfig::default()
            },
            ..RunConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.validation_stream().is_none());
    }

    #[test]
    fn evaluation_stream_keeps_order_and_wraps() {
        let stream = RunConfig::default().evaluation_stream();
        assert!(!stream.shuffle);
        assert!(stream.cyclic);
        assert_eq!(stream.batch_size, 4);
    }

    #[test]
    fn json5_overrides_merge_with_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("run.json5");
        fs::write(
            &path,
            r#"{
                // smaller canvas for a quick run
                seed: 7,
                target_height: 64,
                target_width: 64,
                metrics: ["mIOU", "perDelam"],
                augmentation: { horizontal_flip: true, rotation_range: 10 },
                training: { epochs: 2 },
            }"#,
        )?;

        let config = RunConfig::open(&path)?;
        assert_eq!(config.seed, 7);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.metrics, vec![MetricKind::MeanIou, MetricKind::PerDelam]);
        assert!(!config.augmentation.vertical_flip);
        assert_eq!(config.augmentation.rotation_range, 10.0);
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.steps_per_epoch, 100);
        Ok(())
    }

    #[test]
    fn unknown_metric_names_are_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("run.json5");
        fs::write(&path, r#"{ metrics: ["accuracy"] }"#)?;
        assert!(matches!(
            RunConfig::open(&path),
            Err(DelamSegError::Configuration { .. })
        ));
        Ok(())
    }

    #[test]
    fn defect_class_outside_classes_is_rejected() {
        let config = RunConfig {
            defect_class: 2,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DelamSegError::Configuration { .. })
        ));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "delam-seg",
            "--config",
            "run.json5",
            "predict",
            "scans",
            "--model-path",
            "model.onnx",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("run.json5")));
        match cli.command {
            Command::Predict {
                input_dir,
                output_dir,
                ..
            } => {
                assert_eq!(input_dir, PathBuf::from("scans"));
                assert_eq!(output_dir, PathBuf::from("predictions"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
