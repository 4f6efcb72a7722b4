//! Stateless tensor preparation shared by training and inference.
//!
//! Intensities are mapped with a fixed affine rescale. Padding only ever grows
//! the trailing (bottom and right) edges so the original content stays anchored
//! at the origin and [`crop_padding`] can undo it exactly.

use ndarray::prelude::*;
use ndarray::Slice;
use num_traits::{AsPrimitive, NumCast, Zero};

use crate::errors::{DelamSegError, Result};

/// Half of the 8-bit source range; `x / 127.5 - 1` maps `0..=255` onto `-1..=1`.
pub const RESCALE_HALF_RANGE: f32 = 127.5;

/// Symmetric range produced by [`rescale`] for 8-bit sources.
pub const RESCALED_RANGE: (f32, f32) = (-1.0, 1.0);

/// Fill policy for [`zero_pad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadKind {
    /// Intensity tensors are padded with zero.
    Image,
    /// Label tensors are padded with the background class.
    Mask { background: u8 },
}

/// Rows and columns appended by [`zero_pad`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadAmount {
    pub bottom: usize,
    pub right: usize,
}

impl PadAmount {
    pub const NONE: Self = Self {
        bottom: 0,
        right: 0,
    };

    pub const fn is_empty(&self) -> bool {
        self.bottom == 0 && self.right == 0
    }
}

/// Map raw intensities onto `[-1, 1]` with `x / 127.5 - 1`.
///
/// The map is identical for every image: there is no per-image min/max
/// normalization and no clamping. Only 2D `(h, w)` and 3D `(h, w, c)`
/// tensors are accepted.
pub fn rescale<S, D>(image: ArrayView<S, D>) -> Result<Array<f32, D>>
where
    S: AsPrimitive<f32>,
    D: Dimension,
{
    if !matches!(image.ndim(), 2 | 3) {
        return Err(DelamSegError::shape(
            "rescale input rank",
            "2 or 3 axes",
            image.shape(),
        ));
    }
    Ok(image.mapv(|v| v.as_() / RESCALE_HALF_RANGE - 1.0))
}

/// Pad `tensor` onto a `target_size` x `target_size` canvas.
pub fn zero_pad<T>(
    tensor: ArrayView3<T>,
    target_size: usize,
    kind: PadKind,
) -> Result<(Array3<T>, PadAmount)>
where
    T: Copy + Zero + NumCast,
{
    zero_pad_to(tensor, (target_size, target_size), kind)
}

/// Pad `tensor` onto a `(height, width)` canvas, filling the bottom and right
/// edges only.
///
/// Fails with a configuration error when the source is already larger than the
/// canvas in either spatial dimension.
pub fn zero_pad_to<T>(
    tensor: ArrayView3<T>,
    (target_height, target_width): (usize, usize),
    kind: PadKind,
) -> Result<(Array3<T>, PadAmount)>
where
    T: Copy + Zero + NumCast,
{
    let (height, width, channels) = tensor.dim();
    if height > target_height || width > target_width {
        return Err(DelamSegError::configuration(format!(
            "padding target {target_height}x{target_width} is smaller than source {height}x{width}"
        )));
    }

    let fill = match kind {
        PadKind::Image => T::zero(),
        PadKind::Mask { background } => <T as NumCast>::from(background).ok_or_else(|| {
            DelamSegError::configuration(format!(
                "background class {background} is not representable in the mask element type"
            ))
        })?,
    };

    let mut canvas = Array3::from_elem((target_height, target_width, channels), fill);
    canvas.slice_mut(s![..height, ..width, ..]).assign(&tensor);

    let pad = PadAmount {
        bottom: target_height - height,
        right: target_width - width,
    };
    Ok((canvas, pad))
}

/// Remove the rows and columns recorded in `pad`.
///
/// Works on any tensor whose first two axes are `(height, width)`, so the same
/// pad amount crops both padded images and the label maps predicted from them.
pub fn crop_padding<T, D>(tensor: ArrayView<T, D>, pad: PadAmount) -> Result<Array<T, D>>
where
    T: Clone,
    D: Dimension,
{
    if tensor.ndim() < 2 {
        return Err(DelamSegError::shape(
            "crop input rank",
            "at least 2 axes",
            tensor.shape(),
        ));
    }
    let height = tensor.len_of(Axis(0));
    let width = tensor.len_of(Axis(1));
    if pad.bottom > height || pad.right > width {
        return Err(DelamSegError::shape(
            "crop amount",
            (height, width),
            (pad.bottom, pad.right),
        ));
    }

    let mut view = tensor;
    view.slice_axis_inplace(Axis(0), Slice::from(..height - pad.bottom));
    view.slice_axis_inplace(Axis(1), Slice::from(..width - pad.right));
    Ok(view.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rescale_covers_symmetric_range() -> Result<()> {
        let image = Array2::from_shape_fn((16, 16), |(y, x)| (y * 16 + x) as u8);
        let rescaled = rescale(image.view())?;

        let (low, high) = RESCALED_RANGE;
        assert!(rescaled.iter().all(|v| (low..=high).contains(v)));
        assert_abs_diff_eq!(rescaled[[0, 0]], -1.0);
        assert_abs_diff_eq!(rescaled[[15, 15]], 1.0);
        Ok(())
    }

    #[test]
    fn rescale_is_content_independent_affine_map() -> Result<()> {
        let base = array![[[10.0_f32], [40.0]], [[60.0], [120.0]]];
        let doubled = base.mapv(|v| v * 2.0);

        let a = rescale(base.view())?;
        let b = rescale(doubled.view())?;

        // (x / 127.5 - 1) + 1 scales linearly with x
        for (lhs, rhs) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!((lhs + 1.0) * 2.0, rhs + 1.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn rescale_rejects_other_ranks() {
        let flat = Array1::<u8>::zeros(8);
        assert!(matches!(
            rescale(flat.view()),
            Err(DelamSegError::Shape { .. })
        ));
    }

    #[test]
    fn pad_then_crop_round_trips() -> Result<()> {
        let tensor = Array3::from_shape_fn((3, 5, 2), |(y, x, c)| (y * 10 + x + c * 100) as f32);
        let (padded, pad) = zero_pad(tensor.view(), 8, PadKind::Image)?;

        assert_eq!(padded.dim(), (8, 8, 2));
        assert_eq!(pad, PadAmount { bottom: 5, right: 3 });
        assert_eq!(padded.slice(s![3.., .., ..]).sum(), 0.0);

        let cropped = crop_padding(padded.view(), pad)?;
        assert_eq!(cropped, tensor);
        Ok(())
    }

    #[test]
    fn mask_padding_uses_background_class() -> Result<()> {
        let mask = Array3::<u8>::from_elem((2, 2, 1), 1);
        let (padded, pad) = zero_pad_to(mask.view(), (3, 4), PadKind::Mask { background: 7 })?;

        assert_eq!(pad, PadAmount { bottom: 1, right: 2 });
        assert_eq!(padded[[0, 0, 0]], 1);
        assert_eq!(padded[[2, 0, 0]], 7);
        assert_eq!(padded[[0, 3, 0]], 7);
        Ok(())
    }

    #[test]
    fn padding_smaller_than_source_is_configuration_error() {
        let tensor = Array3::<f32>::zeros((10, 4, 1));
        let result = zero_pad(tensor.view(), 8, PadKind::Image);
        assert!(matches!(result, Err(DelamSegError::Configuration { .. })));
    }

    #[test]
    fn exact_fit_records_no_padding() -> Result<()> {
        let tensor = Array3::<u8>::ones((4, 4, 3));
        let (padded, pad) = zero_pad(tensor.view(), 4, PadKind::Image)?;
        assert!(pad.is_empty());
        assert_eq!(padded, tensor);
        Ok(())
    }

    #[test]
    fn crop_applies_to_label_maps() -> Result<()> {
        let labels = Array2::<u8>::from_shape_fn((6, 6), |(y, x)| (y < 4 && x < 5) as u8);
        let cropped = crop_padding(labels.view(), PadAmount { bottom: 2, right: 1 })?;
        assert_eq!(cropped, Array2::<u8>::ones((4, 5)));
        Ok(())
    }
}
