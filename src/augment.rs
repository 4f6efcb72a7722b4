//! Random geometric augmentation with explicit, shareable parameters.
//!
//! An [`AugmentationEnvelope`] describes the allowed transform ranges. Each
//! draw yields one [`AugmentationParams`] value, which is then applied to an
//! image and to its mask through the same output-to-source coordinate map.
//! Images may be sampled bilinearly; masks are always sampled with the nearest
//! neighbour so no new label values appear.

use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{DelamSegError, Result};

/// Out-of-bounds policy when a transform samples outside the source tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Images take `0`, masks take the background class.
    Constant,
    /// Repeat the closest edge pixel.
    #[default]
    Nearest,
    /// Mirror across the edge (`d c b a | a b c d | d c b a`).
    Reflect,
    /// Tile the source periodically.
    Wrap,
}

/// Resampling used for intensity tensors. Masks ignore this and use nearest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

/// Allowed ranges for random geometric transforms.
///
/// Shift ranges are fractions of the image extent, `zoom_range` draws
/// per-axis zoom factors from `[1 - zoom_range, 1 + zoom_range]` and
/// `rotation_range` is in degrees, drawn from `[-range, range]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AugmentationEnvelope {
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    pub width_shift_range: f64,
    pub height_shift_range: f64,
    pub zoom_range: f64,
    pub rotation_range: f64,
    pub fill_mode: FillMode,
    pub interpolation: Interpolation,
}

impl Default for AugmentationEnvelope {
    fn default() -> Self {
        Self {
            horizontal_flip: false,
            vertical_flip: false,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
            rotation_range: 0.0,
            fill_mode: FillMode::default(),
            interpolation: Interpolation::default(),
        }
    }
}

/// One sampled transform, applied identically to an image and its mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentationParams {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    /// Fraction of the width.
    pub shift_x: f64,
    /// Fraction of the height.
    pub shift_y: f64,
    pub zoom_x: f64,
    pub zoom_y: f64,
    pub rotation_degrees: f64,
}

impl AugmentationParams {
    pub const IDENTITY: Self = Self {
        flip_horizontal: false,
        flip_vertical: false,
        shift_x: 0.0,
        shift_y: 0.0,
        zoom_x: 1.0,
        zoom_y: 1.0,
        rotation_degrees: 0.0,
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Source coordinate `(row, col)` sampled for output pixel `(y, x)`.
    ///
    /// Flips act on the output grid; zoom, shift and rotation are composed
    /// about the image centre, in that order.
    pub fn source_coordinate(&self, y: usize, x: usize, height: usize, width: usize) -> (f64, f64) {
        let y = if self.flip_vertical { height - 1 - y } else { y };
        let x = if self.flip_horizontal { width - 1 - x } else { x };

        let center_y = (height as f64 - 1.0) / 2.0;
        let center_x = (width as f64 - 1.0) / 2.0;

        let dy = (y as f64 - center_y) * self.zoom_y + self.shift_y * height as f64;
        let dx = (x as f64 - center_x) * self.zoom_x + self.shift_x * width as f64;

        if self.rotation_degrees == 0.0 {
            return (dy + center_y, dx + center_x);
        }
        let (sin, cos) = self.rotation_degrees.to_radians().sin_cos();
        (
            cos * dy - sin * dx + center_y,
            sin * dy + cos * dx + center_x,
        )
    }
}

impl AugmentationEnvelope {
    /// Fail fast on ranges that cannot describe a valid transform.
    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("width_shift_range", self.width_shift_range, 1.0),
            ("height_shift_range", self.height_shift_range, 1.0),
            ("zoom_range", self.zoom_range, 1.0),
            ("rotation_range", self.rotation_range, 180.0),
        ];
        for (name, value, upper) in ranges {
            if !value.is_finite() || value < 0.0 || value >= upper {
                return Err(DelamSegError::configuration(format!(
                    "{name} must lie in [0, {upper}), got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        !self.horizontal_flip
            && !self.vertical_flip
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && self.zoom_range == 0.0
            && self.rotation_range == 0.0
    }

    /// Draw one parameter set.
    ///
    /// Disabled ranges consume no randomness, so the draw sequence depends
    /// only on the seed and the envelope.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> AugmentationParams {
        let mut params = AugmentationParams::IDENTITY;

        if self.rotation_range > 0.0 {
            params.rotation_degrees = rng.gen_range(-self.rotation_range..=self.rotation_range);
        }
        if self.height_shift_range > 0.0 {
            params.shift_y = rng.gen_range(-self.height_shift_range..=self.height_shift_range);
        }
        if self.width_shift_range > 0.0 {
            params.shift_x = rng.gen_range(-self.width_shift_range..=self.width_shift_range);
        }
        if self.zoom_range > 0.0 {
            let (low, high) = (1.0 - self.zoom_range, 1.0 + self.zoom_range);
            params.zoom_x = rng.gen_range(low..=high);
            params.zoom_y = rng.gen_range(low..=high);
        }
        if self.horizontal_flip {
            params.flip_horizontal = rng.gen_bool(0.5);
        }
        if self.vertical_flip {
            params.flip_vertical = rng.gen_bool(0.5);
        }

        params
    }

    /// Warp an intensity tensor `(h, w, c)`.
    pub fn apply_image(&self, params: &AugmentationParams, image: ArrayView3<f32>) -> Array3<f32> {
        if params.is_identity() {
            return image.to_owned();
        }
        let (height, width, channels) = image.dim();
        let mut output = Array3::<f32>::zeros((height, width, channels));

        for y in 0..height {
            for x in 0..width {
                let (sy, sx) = params.source_coordinate(y, x, height, width);
                let mut pixel = output.slice_mut(s![y, x, ..]);
                match self.interpolation {
                    Interpolation::Nearest => {
                        if let Some((iy, ix)) = nearest_index(sy, sx, height, width, self.fill_mode)
                        {
                            pixel.assign(&image.slice(s![iy, ix, ..]));
                        }
                    }
                    Interpolation::Bilinear => {
                        bilinear_sample(&image, sy, sx, self.fill_mode, &mut pixel);
                    }
                }
            }
        }
        output
    }

    /// Warp a label tensor `(h, w, c)` with nearest-neighbour sampling only.
    pub fn apply_mask(
        &self,
        params: &AugmentationParams,
        mask: ArrayView3<u8>,
        background: u8,
    ) -> Array3<u8> {
        if params.is_identity() {
            return mask.to_owned();
        }
        let (height, width, channels) = mask.dim();
        let mut output = Array3::<u8>::from_elem((height, width, channels), background);

        for y in 0..height {
            for x in 0..width {
                let (sy, sx) = params.source_coordinate(y, x, height, width);
                if let Some((iy, ix)) = nearest_index(sy, sx, height, width, self.fill_mode) {
                    output
                        .slice_mut(s![y, x, ..])
                        .assign(&mask.slice(s![iy, ix, ..]));
                }
            }
        }
        output
    }
}

fn resolve_index(index: i64, len: usize, mode: FillMode) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let n = len as i64;
    let resolved = match mode {
        FillMode::Constant => {
            if (0..n).contains(&index) {
                index
            } else {
                return None;
            }
        }
        FillMode::Nearest => index.clamp(0, n - 1),
        FillMode::Reflect => {
            let folded = index.rem_euclid(2 * n);
            if folded < n {
                folded
            } else {
                2 * n - 1 - folded
            }
        }
        FillMode::Wrap => index.rem_euclid(n),
    };
    Some(resolved as usize)
}

fn nearest_index(
    sy: f64,
    sx: f64,
    height: usize,
    width: usize,
    mode: FillMode,
) -> Option<(usize, usize)> {
    let iy = resolve_index(sy.round() as i64, height, mode)?;
    let ix = resolve_index(sx.round() as i64, width, mode)?;
    Some((iy, ix))
}

fn bilinear_sample(
    image: &ArrayView3<f32>,
    sy: f64,
    sx: f64,
    mode: FillMode,
    pixel: &mut ArrayViewMut1<f32>,
) {
    let (height, width, _) = image.dim();
    let (y0, x0) = (sy.floor(), sx.floor());
    let (fy, fx) = ((sy - y0) as f32, (sx - x0) as f32);
    let (y0, x0) = (y0 as i64, x0 as i64);

    let taps = [
        (y0, x0, (1.0 - fy) * (1.0 - fx)),
        (y0, x0 + 1, (1.0 - fy) * fx),
        (y0 + 1, x0, fy * (1.0 - fx)),
        (y0 + 1, x0 + 1, fy * fx),
    ];
    for (ty, tx, weight) in taps {
        if weight == 0.0 {
            continue;
        }
        // constant fill contributes zero, so unresolved taps are skipped
        if let (Some(iy), Some(ix)) = (
            resolve_index(ty, height, mode),
            resolve_index(tx, width, mode),
        ) {
            pixel.scaled_add(weight, &image.slice(s![iy, ix, ..]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn full_envelope() -> AugmentationEnvelope {
        AugmentationEnvelope {
            horizontal_flip: true,
            vertical_flip: true,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            zoom_range: 0.2,
            rotation_range: 45.0,
            fill_mode: FillMode::Constant,
            interpolation: Interpolation::Nearest,
        }
    }

    fn ramp(height: usize, width: usize) -> Array3<f32> {
        Array3::from_shape_fn((height, width, 1), |(y, x, _)| (y * width + x) as f32)
    }

    #[test]
    fn disabled_envelope_samples_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let envelope = AugmentationEnvelope::default();
        assert!(envelope.is_identity());
        for _ in 0..8 {
            assert!(envelope.sample(&mut rng).is_identity());
        }
    }

    #[test]
    fn samples_stay_inside_envelope() {
        let mut rng = StdRng::seed_from_u64(1000);
        let envelope = full_envelope();
        for _ in 0..500 {
            let p = envelope.sample(&mut rng);
            assert!(p.rotation_degrees.abs() <= 45.0);
            assert!(p.shift_x.abs() <= 0.2 && p.shift_y.abs() <= 0.2);
            assert!((0.8..=1.2).contains(&p.zoom_x) && (0.8..=1.2).contains(&p.zoom_y));
        }
    }

    #[test]
    fn same_seed_draws_same_sequence() {
        let envelope = full_envelope();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..16 {
            assert_eq!(envelope.sample(&mut a), envelope.sample(&mut b));
        }
    }

    #[test]
    fn whole_pixel_shift_is_exact_for_both_interpolations() {
        let image = ramp(4, 8);
        let params = AugmentationParams {
            shift_x: 0.25,
            ..AugmentationParams::IDENTITY
        };
        for interpolation in [Interpolation::Nearest, Interpolation::Bilinear] {
            let envelope = AugmentationEnvelope {
                interpolation,
                ..full_envelope()
            };
            let shifted = envelope.apply_image(&params, image.view());
            for y in 0..4 {
                for x in 0..8 {
                    let expected = if x + 2 < 8 { image[[y, x + 2, 0]] } else { 0.0 };
                    assert_eq!(shifted[[y, x, 0]], expected);
                }
            }
        }
    }

    #[test]
    fn horizontal_flip_mirrors_columns() {
        let image = ramp(3, 4);
        let params = AugmentationParams {
            flip_horizontal: true,
            ..AugmentationParams::IDENTITY
        };
        let flipped = AugmentationEnvelope::default().apply_image(&params, image.view());
        assert_eq!(flipped[[1, 0, 0]], image[[1, 3, 0]]);
        assert_eq!(flipped[[2, 3, 0]], image[[2, 0, 0]]);
    }

    #[test]
    fn image_and_mask_share_geometry() {
        let envelope = full_envelope();
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..20 {
            let mut image = Array3::<f32>::zeros((12, 12, 3));
            let mut mask = Array3::<u8>::zeros((12, 12, 1));
            image.slice_mut(s![4, 7, ..]).fill(255.0);
            mask[[4, 7, 0]] = 1;

            let params = envelope.sample(&mut rng);
            let warped_image = envelope.apply_image(&params, image.view());
            let warped_mask = envelope.apply_mask(&params, mask.view(), 0);

            for ((y, x, _), &label) in warped_mask.indexed_iter() {
                let marked = warped_image[[y, x, 0]] > 0.0;
                assert_eq!(marked, label == 1, "pixel ({y}, {x}) diverged: {params:?}");
            }
        }
    }

    #[test]
    fn mask_warp_never_invents_labels() {
        let envelope = AugmentationEnvelope {
            interpolation: Interpolation::Bilinear,
            ..full_envelope()
        };
        let mask = Array3::from_shape_fn((9, 9, 1), |(y, x, _)| if (y + x) % 3 == 0 { 2 } else { 1 });
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            let params = envelope.sample(&mut rng);
            let warped = envelope.apply_mask(&params, mask.view(), 0);
            assert!(warped.iter().all(|&v| v <= 2));
        }
    }

    #[test]
    fn fill_modes_resolve_out_of_range_indices() {
        assert_eq!(resolve_index(-1, 4, FillMode::Constant), None);
        assert_eq!(resolve_index(-1, 4, FillMode::Nearest), Some(0));
        assert_eq!(resolve_index(5, 4, FillMode::Nearest), Some(3));
        assert_eq!(resolve_index(-1, 4, FillMode::Reflect), Some(0));
        assert_eq!(resolve_index(4, 4, FillMode::Reflect), Some(3));
        assert_eq!(resolve_index(-1, 4, FillMode::Wrap), Some(3));
        assert_eq!(resolve_index(9, 4, FillMode::Wrap), Some(1));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let envelope = AugmentationEnvelope {
            zoom_range: -0.1,
            ..AugmentationEnvelope::default()
        };
        assert!(matches!(
            envelope.validate(),
            Err(DelamSegError::Configuration { .. })
        ));
        assert!(full_envelope().validate().is_ok());
    }

    #[test]
    fn unknown_options_fail_to_parse() {
        let parsed = serde_json::from_str::<AugmentationEnvelope>(r#"{"shear_range": 0.1}"#);
        assert!(parsed.is_err());
    }
}
