//! Epoch/step training loop, evaluation-only mode and the persistence gate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::{DelamSegError, Result};
use crate::metrics::{evaluate_metrics, LossKind, MetricContext, MetricKind};
use crate::stream::{PairedBatch, PairedStream};
use crate::traits::{DensePredictor, StepOutput, TrainableModel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    /// Zero disables the validation pass.
    pub validation_steps: usize,
    pub validation_batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            steps_per_epoch: 100,
            validation_steps: 25,
            validation_batch_size: 2,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.steps_per_epoch == 0 {
            return Err(DelamSegError::configuration(
                "epochs and steps per epoch must be positive",
            ));
        }
        if self.validation_steps > 0 && self.validation_batch_size == 0 {
            return Err(DelamSegError::configuration(
                "validation batch size must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub batch_size: usize,
    pub loss: f64,
    pub metrics: BTreeMap<MetricKind, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub steps: Vec<StepRecord>,
    /// Mean over `steps`.
    pub loss: f64,
    pub metrics: BTreeMap<MetricKind, f64>,
    pub validation: Option<EvaluationSummary>,
}

/// Append-only record of a training run, one entry per completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    epochs: Vec<EpochRecord>,
}

impl History {
    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    fn push(&mut self, record: EpochRecord) {
        debug_assert_eq!(record.epoch, self.epochs.len());
        self.epochs.push(record);
    }

    /// Per-epoch training loss.
    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    /// Per-epoch training value of `kind`; epochs that did not track it are
    /// skipped.
    pub fn series(&self, kind: MetricKind) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|e| e.metrics.get(&kind).copied())
            .collect()
    }

    /// Per-epoch validation value of `kind`.
    pub fn validation_series(&self, kind: MetricKind) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|e| e.validation.as_ref())
            .filter_map(|v| v.metrics.get(&kind).copied())
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub steps: usize,
    pub samples: usize,
    pub loss: f64,
    pub metrics: BTreeMap<MetricKind, f64>,
}

impl EvaluationSummary {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

pub struct Trainer {
    config: TrainingConfig,
    metrics: Vec<MetricKind>,
    context: MetricContext,
    show_progress: bool,
}

impl Trainer {
    pub fn new(config: TrainingConfig, metrics: Vec<MetricKind>, context: MetricContext) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics,
            context,
            show_progress: false,
        })
    }

    pub const fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run `epochs` x `steps_per_epoch` optimization steps, each followed by
    /// a validation pass when a validation stream is given.
    pub fn fit<M>(
        &self,
        model: &mut M,
        train: &mut PairedStream,
        mut validation: Option<&mut PairedStream>,
    ) -> Result<History>
    where
        M: TrainableModel + ?Sized,
    {
        let mut history = History::default();

        for epoch in 0..self.config.epochs {
            let progress = self.progress_bar(self.config.steps_per_epoch, epoch);
            let steps = collect_steps(
                self.config.steps_per_epoch,
                train,
                &self.metrics,
                &self.context,
                &progress,
                |batch| model.train_step(batch.images.view(), batch.labels()),
            )?;
            progress.finish_and_clear();

            let validation = match validation.as_deref_mut() {
                Some(stream) if self.config.validation_steps > 0 => {
                    let records = collect_steps(
                        self.config.validation_steps,
                        stream,
                        &self.metrics,
                        &self.context,
                        &ProgressBar::hidden(),
                        |batch| model.evaluate_step(batch.images.view(), batch.labels()),
                    )?;
                    Some(summarize(&records))
                }
                _ => None,
            };

            let record = EpochRecord {
                epoch,
                loss: mean(steps.iter().map(|s| s.loss)),
                metrics: mean_metrics(&steps),
                steps,
                validation,
            };
            log_epoch(&record, self.config.epochs);
            history.push(record);
        }

        Ok(history)
    }

    fn progress_bar(&self, steps: usize, epoch: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(steps as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(format!("epoch {}/{}", epoch + 1, self.config.epochs));
        pb
    }
}

/// Evaluation-only mode: `steps` batches, no parameter updates.
pub fn evaluate<M>(
    model: &M,
    stream: &mut PairedStream,
    steps: usize,
    loss: LossKind,
    metrics: &[MetricKind],
    context: &MetricContext,
) -> Result<EvaluationSummary>
where
    M: DensePredictor + ?Sized,
{
    if steps == 0 {
        return Err(DelamSegError::configuration("evaluation needs at least one step"));
    }
    let records = collect_steps(steps, stream, metrics, context, &ProgressBar::hidden(), |batch| {
        let probabilities = model.predict(batch.images.view())?;
        let loss = loss.compute(batch.labels(), probabilities.view())?;
        Ok(StepOutput {
            loss,
            probabilities,
        })
    })?;
    let summary = summarize(&records);
    info!("evaluation over {} samples: loss {:.4}", summary.samples, summary.loss);
    Ok(summary)
}

fn collect_steps<F>(
    steps: usize,
    stream: &mut PairedStream,
    metrics: &[MetricKind],
    context: &MetricContext,
    progress: &ProgressBar,
    mut run: F,
) -> Result<Vec<StepRecord>>
where
    F: FnMut(&PairedBatch) -> Result<StepOutput>,
{
    let mut records = Vec::with_capacity(steps);
    for step in 0..steps {
        let batch = stream.next_batch()?;
        let output = run(&batch)?;
        let values = evaluate_metrics(metrics, context, batch.labels(), output.probabilities.view())?;
        debug!("step {step}: loss {:.5}", output.loss);
        records.push(StepRecord {
            step,
            batch_size: batch.len(),
            loss: output.loss,
            metrics: values,
        });
        progress.inc(1);
    }
    Ok(records)
}

fn summarize(records: &[StepRecord]) -> EvaluationSummary {
    EvaluationSummary {
        steps: records.len(),
        samples: records.iter().map(|r| r.batch_size).sum(),
        loss: mean(records.iter().map(|r| r.loss)),
        metrics: mean_metrics(records),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn mean_metrics(records: &[StepRecord]) -> BTreeMap<MetricKind, f64> {
    let mut totals: BTreeMap<MetricKind, (f64, usize)> = BTreeMap::new();
    for record in records {
        for (&kind, &value) in &record.metrics {
            let entry = totals.entry(kind).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    totals
        .into_iter()
        .map(|(kind, (sum, count))| (kind, sum / count as f64))
        .collect()
}

fn log_epoch(record: &EpochRecord, epochs: usize) {
    let metrics: Vec<_> = record
        .metrics
        .iter()
        .map(|(kind, value)| format!("{kind} {value:.4}"))
        .collect();
    info!(
        "epoch {}/{}: loss {:.4} {}",
        record.epoch + 1,
        epochs,
        record.loss,
        metrics.join(" ")
    );
    if let Some(validation) = &record.validation {
        info!("  validation loss {:.4}", validation.loss);
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| DelamSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "json write".to_string(),
        source: e,
    })
}

/// Interpret an answer to the save prompt. Only `y` and `n` are accepted,
/// case-insensitively and ignoring surrounding whitespace.
pub fn should_persist(input: &str) -> Result<bool> {
    match input.trim() {
        answer if answer.eq_ignore_ascii_case("y") => Ok(true),
        answer if answer.eq_ignore_ascii_case("n") => Ok(false),
        answer => Err(DelamSegError::InvalidInput {
            input: answer.to_string(),
            expected: "y or n".to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistDecision {
    Save(PathBuf),
    Discard,
}

impl PersistDecision {
    /// Save the model when the decision says so; returns whether it did.
    pub fn apply<M: TrainableModel + ?Sized>(&self, model: &M) -> Result<bool> {
        match self {
            PersistDecision::Save(path) => {
                model.save(path)?;
                info!("model saved to {}", path.display());
                Ok(true)
            }
            PersistDecision::Discard => {
                info!("model discarded");
                Ok(false)
            }
        }
    }
}
