//! Segmentation quality metrics.
//!
//! Hard metrics compare integer label maps; the soft IoU loss compares
//! per-pixel probability tensors and is differentiable in the prediction.
//! A class that appears in neither the ground truth nor the prediction has an
//! IoU of exactly `1.0`; that is a defined value, not an error.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use ndarray::prelude::*;
use ndarray::{RemoveAxis, Zip};
use serde::{Deserialize, Serialize};

use crate::errors::{DelamSegError, Result};

/// Floor applied to probabilities before taking a logarithm.
const PROBABILITY_FLOOR: f32 = 1e-7;

/// Pixel confusion counts for a single class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub false_negative: u64,
}

impl ClassCounts {
    /// `tp / (tp + fp + fn)`, or `1.0` when the class is absent from both maps.
    pub fn iou(&self) -> f64 {
        let denominator = self.true_positive + self.false_positive + self.false_negative;
        if denominator == 0 {
            1.0
        } else {
            self.true_positive as f64 / denominator as f64
        }
    }
}

fn ensure_same_shape<A, B, D>(
    context: &str,
    expected: &ArrayView<A, D>,
    actual: &ArrayView<B, D>,
) -> Result<()>
where
    D: Dimension,
{
    if expected.shape() != actual.shape() {
        return Err(DelamSegError::shape(
            context,
            expected.shape(),
            actual.shape(),
        ));
    }
    Ok(())
}

pub fn class_counts<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    class_id: u8,
) -> Result<ClassCounts> {
    ensure_same_shape("label map comparison", &ground_truth, &predicted)?;

    let mut counts = ClassCounts::default();
    Zip::from(ground_truth)
        .and(predicted)
        .for_each(|&truth, &guess| match (truth == class_id, guess == class_id) {
            (true, true) => counts.true_positive += 1,
            (false, true) => counts.false_positive += 1,
            (true, false) => counts.false_negative += 1,
            (false, false) => {}
        });
    Ok(counts)
}

pub fn iou<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    class_id: u8,
) -> Result<f64> {
    Ok(class_counts(ground_truth, predicted, class_id)?.iou())
}

/// Mean of [`iou`] over `class_set`.
///
/// Every listed class contributes, including classes absent from both maps
/// (which score `1.0`). Pass [`observed_classes`] as the class set to average
/// only over classes that actually occur.
pub fn mean_iou<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    class_set: &[u8],
) -> Result<f64> {
    if class_set.is_empty() {
        return Err(DelamSegError::configuration(
            "mean IoU needs at least one class",
        ));
    }

    let mut total = 0.0;
    for &class_id in class_set {
        total += iou(ground_truth.view(), predicted.view(), class_id)?;
    }
    Ok(total / class_set.len() as f64)
}

/// Classes present in either label map, ascending.
pub fn observed_classes<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
) -> Vec<u8> {
    ground_truth
        .iter()
        .chain(predicted.iter())
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Soft relaxation of `1 - IoU` over probability tensors.
///
/// Intersection is `Σ g·p` and union `Σ g + Σ p - Σ g·p`. An empty soft union
/// means both tensors are all zero, which scores a loss of `0.0`.
pub fn iou_loss<D: Dimension>(
    ground_truth: ArrayView<f32, D>,
    predicted: ArrayView<f32, D>,
) -> Result<f64> {
    ensure_same_shape("soft IoU inputs", &ground_truth, &predicted)?;
    let (intersection, union) = soft_intersection_union(&ground_truth, &predicted);
    if union <= f64::EPSILON {
        return Ok(0.0);
    }
    Ok(1.0 - intersection / union)
}

/// Gradient of [`iou_loss`] with respect to `predicted`.
pub fn iou_loss_gradient<D: Dimension>(
    ground_truth: ArrayView<f32, D>,
    predicted: ArrayView<f32, D>,
) -> Result<Array<f32, D>> {
    ensure_same_shape("soft IoU inputs", &ground_truth, &predicted)?;
    let (intersection, union) = soft_intersection_union(&ground_truth, &predicted);
    if union <= f64::EPSILON {
        return Ok(Array::zeros(predicted.raw_dim()));
    }

    let union_sq = union * union;
    Ok(ground_truth.mapv(|g| {
        let g = g as f64;
        (-(g * union - intersection * (1.0 - g)) / union_sq) as f32
    }))
}

fn soft_intersection_union<D: Dimension>(
    ground_truth: &ArrayView<f32, D>,
    predicted: &ArrayView<f32, D>,
) -> (f64, f64) {
    let mut intersection = 0.0_f64;
    let mut total = 0.0_f64;
    Zip::from(ground_truth).and(predicted).for_each(|&g, &p| {
        intersection += (g * p) as f64;
        total += (g + p) as f64;
    });
    (intersection, total - intersection)
}

/// Mean negative log-likelihood of the true class.
///
/// `labels` is `(n, h, w)`, `probabilities` is `(n, h, w, classes)`.
pub fn sparse_categorical_crossentropy(
    labels: ArrayView3<u8>,
    probabilities: ArrayView4<f32>,
) -> Result<f64> {
    let num_classes = check_label_batch(&labels, &probabilities)?;
    let pixels = labels.len().max(1) as f64;

    let mut total = 0.0_f64;
    for ((n, y, x), &label) in labels.indexed_iter() {
        let label = checked_label(label, num_classes)?;
        let p = probabilities[[n, y, x, label]].max(PROBABILITY_FLOOR);
        total -= (p as f64).ln();
    }
    Ok(total / pixels)
}

fn sparse_categorical_crossentropy_gradient(
    labels: ArrayView3<u8>,
    probabilities: ArrayView4<f32>,
) -> Result<Array4<f32>> {
    let num_classes = check_label_batch(&labels, &probabilities)?;
    let pixels = labels.len().max(1) as f32;

    let mut gradient = Array4::<f32>::zeros(probabilities.raw_dim());
    for ((n, y, x), &label) in labels.indexed_iter() {
        let label = checked_label(label, num_classes)?;
        let p = probabilities[[n, y, x, label]].max(PROBABILITY_FLOOR);
        gradient[[n, y, x, label]] = -1.0 / (pixels * p);
    }
    Ok(gradient)
}

fn check_label_batch(labels: &ArrayView3<u8>, probabilities: &ArrayView4<f32>) -> Result<usize> {
    let (n, h, w, classes) = probabilities.dim();
    if labels.dim() != (n, h, w) {
        return Err(DelamSegError::shape(
            "labels vs. probabilities",
            (n, h, w),
            labels.dim(),
        ));
    }
    Ok(classes)
}

fn checked_label(label: u8, num_classes: usize) -> Result<usize> {
    let index = label as usize;
    if index >= num_classes {
        return Err(DelamSegError::InvalidLabel {
            sample: "batch".to_string(),
            label,
            num_classes,
        });
    }
    Ok(index)
}

/// One-hot encode `(n, h, w)` labels into `(n, h, w, num_classes)`.
pub fn one_hot(labels: ArrayView3<u8>, num_classes: usize) -> Result<Array4<f32>> {
    let (n, h, w) = labels.dim();
    let mut encoded = Array4::<f32>::zeros((n, h, w, num_classes));
    for ((i, y, x), &label) in labels.indexed_iter() {
        encoded[[i, y, x, checked_label(label, num_classes)?]] = 1.0;
    }
    Ok(encoded)
}

/// Collapse the trailing class axis to the index of its largest value.
///
/// Ties resolve to the lowest class index.
pub fn argmax_labels<D: RemoveAxis>(probabilities: ArrayView<f32, D>) -> Array<u8, D::Smaller> {
    let class_axis = Axis(probabilities.ndim() - 1);
    probabilities.map_axis(class_axis, |lane| {
        let mut best = (0usize, f32::NEG_INFINITY);
        for (index, &value) in lane.iter().enumerate() {
            if value > best.1 {
                best = (index, value);
            }
        }
        best.0 as u8
    })
}

/// IoU of the defect class.
pub fn per_delam<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    defect_class: u8,
) -> Result<f64> {
    iou(ground_truth, predicted, defect_class)
}

/// Fraction of all pixels predicted as defect.
pub fn pred_delam<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    defect_class: u8,
) -> Result<f64> {
    let counts = class_counts(ground_truth, predicted.view(), defect_class)?;
    Ok(pixel_fraction(
        counts.true_positive + counts.false_positive,
        predicted.len(),
    ))
}

/// Fraction of all pixels that truly are defect.
pub fn real_delam<D: Dimension>(
    ground_truth: ArrayView<u8, D>,
    predicted: ArrayView<u8, D>,
    defect_class: u8,
) -> Result<f64> {
    let pixels = ground_truth.len();
    let counts = class_counts(ground_truth, predicted, defect_class)?;
    Ok(pixel_fraction(
        counts.true_positive + counts.false_negative,
        pixels,
    ))
}

fn pixel_fraction(count: u64, pixels: usize) -> f64 {
    if pixels == 0 {
        0.0
    } else {
        count as f64 / pixels as f64
    }
}

/// Tracked metrics that can be requested by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum MetricKind {
    MeanIou,
    IouLoss,
    PerDelam,
    PredDelam,
    RealDelam,
}

const METRIC_NAMES: &[(&str, MetricKind)] = &[
    ("mIOU", MetricKind::MeanIou),
    ("iou_loss", MetricKind::IouLoss),
    ("perDelam", MetricKind::PerDelam),
    ("predDelam", MetricKind::PredDelam),
    ("realDelam", MetricKind::RealDelam),
];

/// Class layout the metrics are evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricContext {
    pub classes: Vec<u8>,
    pub defect_class: u8,
}

impl MetricContext {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::MeanIou,
        MetricKind::IouLoss,
        MetricKind::PerDelam,
        MetricKind::PredDelam,
        MetricKind::RealDelam,
    ];

    pub fn name(self) -> &'static str {
        METRIC_NAMES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn lookup(name: &str) -> Result<Self> {
        METRIC_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                let known: Vec<_> = METRIC_NAMES.iter().map(|(n, _)| *n).collect();
                DelamSegError::configuration(format!(
                    "unknown metric `{name}`, expected one of {}",
                    known.join(", ")
                ))
            })
    }

    /// Evaluate on a batch. `predicted` must be the arg-max of `probabilities`.
    pub fn evaluate(
        self,
        context: &MetricContext,
        ground_truth: ArrayView3<u8>,
        probabilities: ArrayView4<f32>,
        predicted: ArrayView3<u8>,
    ) -> Result<f64> {
        match self {
            MetricKind::MeanIou => mean_iou(ground_truth, predicted, &context.classes),
            MetricKind::IouLoss => {
                let target = one_hot(ground_truth, probabilities.len_of(Axis(3)))?;
                iou_loss(target.view(), probabilities)
            }
            MetricKind::PerDelam => per_delam(ground_truth, predicted, context.defect_class),
            MetricKind::PredDelam => pred_delam(ground_truth, predicted, context.defect_class),
            MetricKind::RealDelam => real_delam(ground_truth, predicted, context.defect_class),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = DelamSegError;

    fn from_str(s: &str) -> Result<Self> {
        Self::lookup(s)
    }
}

impl TryFrom<String> for MetricKind {
    type Error = DelamSegError;

    fn try_from(value: String) -> Result<Self> {
        Self::lookup(&value)
    }
}

impl From<MetricKind> for &'static str {
    fn from(kind: MetricKind) -> Self {
        kind.name()
    }
}

/// Evaluate every requested metric on one batch, sharing the arg-max.
pub fn evaluate_metrics(
    kinds: &[MetricKind],
    context: &MetricContext,
    ground_truth: ArrayView3<u8>,
    probabilities: ArrayView4<f32>,
) -> Result<BTreeMap<MetricKind, f64>> {
    check_label_batch(&ground_truth, &probabilities)?;
    let predicted = argmax_labels(probabilities);

    kinds
        .iter()
        .map(|&kind| {
            let value = kind.evaluate(context, ground_truth, probabilities, predicted.view())?;
            Ok((kind, value))
        })
        .collect()
}

/// Training objectives a trainable model can optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum LossKind {
    SparseCategoricalCrossentropy,
    IouLoss,
}

const LOSS_NAMES: &[(&str, LossKind)] = &[
    (
        "sparse_categorical_crossentropy",
        LossKind::SparseCategoricalCrossentropy,
    ),
    ("iou_loss", LossKind::IouLoss),
];

impl LossKind {
    pub fn name(self) -> &'static str {
        LOSS_NAMES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn lookup(name: &str) -> Result<Self> {
        LOSS_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| DelamSegError::configuration(format!("unknown loss `{name}`")))
    }

    pub fn compute(self, labels: ArrayView3<u8>, probabilities: ArrayView4<f32>) -> Result<f64> {
        match self {
            LossKind::SparseCategoricalCrossentropy => {
                sparse_categorical_crossentropy(labels, probabilities)
            }
            LossKind::IouLoss => {
                check_label_batch(&labels, &probabilities)?;
                let target = one_hot(labels, probabilities.len_of(Axis(3)))?;
                iou_loss(target.view(), probabilities)
            }
        }
    }

    /// Gradient of [`LossKind::compute`] with respect to the probabilities.
    pub fn probability_gradient(
        self,
        labels: ArrayView3<u8>,
        probabilities: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        match self {
            LossKind::SparseCategoricalCrossentropy => {
                sparse_categorical_crossentropy_gradient(labels, probabilities)
            }
            LossKind::IouLoss => {
                check_label_batch(&labels, &probabilities)?;
                let target = one_hot(labels, probabilities.len_of(Axis(3)))?;
                iou_loss_gradient(target.view(), probabilities)
            }
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = DelamSegError;

    fn from_str(s: &str) -> Result<Self> {
        Self::lookup(s)
    }
}

impl TryFrom<String> for LossKind {
    type Error = DelamSegError;

    fn try_from(value: String) -> Result<Self> {
        Self::lookup(&value)
    }
}

impl From<LossKind> for &'static str {
    fn from(kind: LossKind) -> Self {
        kind.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square_mask(offset: (usize, usize)) -> Array2<u8> {
        let mut mask = Array2::<u8>::zeros((4, 4));
        mask.slice_mut(s![offset.0..offset.0 + 2, offset.1..offset.1 + 2])
            .fill(1);
        mask
    }

    #[test]
    fn identical_maps_score_one() -> Result<()> {
        let mask = array![[0, 1, 2], [2, 1, 0], [1, 1, 1]];
        for class_id in 0..3 {
            assert_eq!(iou(mask.view(), mask.view(), class_id)?, 1.0);
        }
        Ok(())
    }

    #[test]
    fn disjoint_class_scores_zero() -> Result<()> {
        let truth = array![[1, 1], [0, 0]];
        let guess = array![[0, 0], [1, 1]];
        assert_eq!(iou(truth.view(), guess.view(), 1)?, 0.0);
        Ok(())
    }

    #[test]
    fn absent_class_scores_one() -> Result<()> {
        let truth = array![[0, 1], [0, 0]];
        let guess = array![[0, 0], [1, 0]];
        assert_eq!(iou(truth.view(), guess.view(), 5)?, 1.0);
        Ok(())
    }

    #[test]
    fn all_background_scenario() -> Result<()> {
        let truth = Array2::<u8>::zeros((4, 4));
        let guess = Array2::<u8>::zeros((4, 4));
        assert_eq!(mean_iou(truth.view(), guess.view(), &[0])?, 1.0);
        Ok(())
    }

    #[test]
    fn shifted_square_scenario() -> Result<()> {
        let truth = square_mask((1, 1));
        let guess = square_mask((1, 2));

        let counts = class_counts(truth.view(), guess.view(), 1)?;
        assert_eq!(
            counts,
            ClassCounts {
                true_positive: 2,
                false_positive: 2,
                false_negative: 2,
            }
        );
        assert_abs_diff_eq!(iou(truth.view(), guess.view(), 1)?, 2.0 / 6.0);
        Ok(())
    }

    #[test]
    fn mean_iou_ignores_pixel_order() -> Result<()> {
        let truth = array![0, 0, 1, 1, 0, 1, 0, 0];
        let guess = array![0, 1, 1, 0, 0, 1, 0, 1];
        let before = mean_iou(truth.view(), guess.view(), &[0, 1])?;

        let order = [7, 2, 5, 0, 3, 6, 1, 4];
        let permuted_truth = Array1::from_iter(order.iter().map(|&i| truth[i]));
        let permuted_guess = Array1::from_iter(order.iter().map(|&i| guess[i]));
        let after = mean_iou(permuted_truth.view(), permuted_guess.view(), &[0, 1])?;

        assert_abs_diff_eq!(before, after);
        Ok(())
    }

    #[test]
    fn absent_class_policy_inflates_mean() -> Result<()> {
        let truth = array![[0, 0], [0, 1]];
        let guess = array![[0, 0], [0, 0]];

        let declared = mean_iou(truth.view(), guess.view(), &[0, 1, 2])?;
        let observed_set = observed_classes(truth.view(), guess.view());
        let observed = mean_iou(truth.view(), guess.view(), &observed_set)?;

        assert_eq!(observed_set, vec![0, 1]);
        assert_abs_diff_eq!(declared, (0.75 + 0.0 + 1.0) / 3.0);
        assert_abs_diff_eq!(observed, (0.75 + 0.0) / 2.0);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_shape_errors() {
        let truth = Array2::<u8>::zeros((2, 3));
        let guess = Array2::<u8>::zeros((3, 2));
        assert!(matches!(
            iou(truth.view(), guess.view(), 0),
            Err(DelamSegError::Shape { .. })
        ));
    }

    #[test]
    fn soft_iou_loss_bounds() -> Result<()> {
        let target = array![[1.0_f32, 0.0], [0.0, 1.0]];
        assert_abs_diff_eq!(iou_loss(target.view(), target.view())?, 0.0);

        let inverse = target.mapv(|v| 1.0 - v);
        assert_abs_diff_eq!(iou_loss(target.view(), inverse.view())?, 1.0);

        let empty = Array2::<f32>::zeros((2, 2));
        assert_eq!(iou_loss(empty.view(), empty.view())?, 0.0);
        Ok(())
    }

    #[test]
    fn soft_iou_gradient_matches_finite_difference() -> Result<()> {
        let target = array![0.0_f32, 1.0, 1.0, 0.0];
        let predicted = array![0.2_f32, 0.7, 0.4, 0.1];
        let gradient = iou_loss_gradient(target.view(), predicted.view())?;

        let step = 1e-3_f32;
        for i in 0..predicted.len() {
            let mut plus = predicted.clone();
            plus[i] += step;
            let mut minus = predicted.clone();
            minus[i] -= step;
            let numeric = (iou_loss(target.view(), plus.view())?
                - iou_loss(target.view(), minus.view())?)
                / (2.0 * step as f64);
            assert_abs_diff_eq!(gradient[i] as f64, numeric, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn crossentropy_of_confident_correct_prediction_is_small() -> Result<()> {
        let labels = Array3::<u8>::from_shape_vec((1, 1, 2), vec![0, 1])?;
        let probabilities =
            Array4::<f32>::from_shape_vec((1, 1, 2, 2), vec![0.99, 0.01, 0.01, 0.99])?;
        let loss = sparse_categorical_crossentropy(labels.view(), probabilities.view())?;
        assert_abs_diff_eq!(loss, -(0.99_f64).ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn out_of_range_label_is_rejected() {
        let labels = Array3::<u8>::from_elem((1, 1, 1), 3);
        let probabilities = Array4::<f32>::from_elem((1, 1, 1, 2), 0.5);
        assert!(matches!(
            sparse_categorical_crossentropy(labels.view(), probabilities.view()),
            Err(DelamSegError::InvalidLabel { label: 3, .. })
        ));
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        let probabilities = array![[[0.5_f32, 0.5], [0.1, 0.9]], [[0.8, 0.2], [0.3, 0.7]]];
        let labels = argmax_labels(probabilities.view());
        assert_eq!(labels, array![[0, 1], [0, 1]]);
    }

    #[test]
    fn defect_fractions() -> Result<()> {
        let truth = array![[1, 1, 0, 0], [0, 0, 0, 0]];
        let guess = array![[0, 1, 1, 1], [0, 0, 0, 0]];

        assert_abs_diff_eq!(per_delam(truth.view(), guess.view(), 1)?, 1.0 / 4.0);
        assert_abs_diff_eq!(pred_delam(truth.view(), guess.view(), 1)?, 3.0 / 8.0);
        assert_abs_diff_eq!(real_delam(truth.view(), guess.view(), 1)?, 2.0 / 8.0);
        Ok(())
    }

    #[test]
    fn metric_names_resolve_through_lookup_table() -> Result<()> {
        for kind in MetricKind::ALL {
            assert_eq!(kind.name().parse::<MetricKind>()?, kind);
        }
        assert_eq!(MetricKind::lookup("mIOU")?, MetricKind::MeanIou);
        assert!(matches!(
            MetricKind::lookup("accuracy"),
            Err(DelamSegError::Configuration { .. })
        ));
        Ok(())
    }

    #[test]
    fn metric_kinds_serialize_by_name() -> Result<()> {
        let json = serde_json::to_string(&vec![MetricKind::MeanIou, MetricKind::PerDelam])?;
        assert_eq!(json, r#"["mIOU","perDelam"]"#);
        let parsed: Vec<MetricKind> = serde_json::from_str(&json)?;
        assert_eq!(parsed, vec![MetricKind::MeanIou, MetricKind::PerDelam]);
        assert!(serde_json::from_str::<MetricKind>(r#""bogus""#).is_err());
        Ok(())
    }

    #[test]
    fn batch_metrics_share_one_argmax() -> Result<()> {
        let truth = Array3::<u8>::from_shape_vec((1, 2, 2), vec![0, 1, 0, 1])?;
        let probabilities = Array4::<f32>::from_shape_vec(
            (1, 2, 2, 2),
            vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4, 0.7, 0.3],
        )?;
        let context = MetricContext {
            classes: vec![0, 1],
            defect_class: 1,
        };

        let values = evaluate_metrics(
            &[MetricKind::PerDelam, MetricKind::RealDelam],
            &context,
            truth.view(),
            probabilities.view(),
        )?;

        assert_abs_diff_eq!(values[&MetricKind::PerDelam], 0.5);
        assert_abs_diff_eq!(values[&MetricKind::RealDelam], 0.5);
        Ok(())
    }
}
