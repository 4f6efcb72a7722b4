//! Synchronized image/mask batch stream.
//!
//! One seeded generator drives both the per-pass permutation and the
//! augmentation draw, so an image and its mask always receive the same
//! parameters no matter how the stream is consumed.

use std::cmp::min;

use log::{debug, warn};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::augment::{AugmentationEnvelope, AugmentationParams};
use crate::errors::{DelamSegError, Result};
use crate::preprocess::rescale;
use crate::traits::{Sample, SampleSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub seed: u64,
    pub batch_size: usize,
    /// Reshuffle sample order at the start of every pass.
    pub shuffle: bool,
    /// Wrap around instead of becoming exhausted.
    pub cyclic: bool,
    /// Label written where a mask warp samples outside the source.
    pub background: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            seed: 1000,
            batch_size: 4,
            shuffle: true,
            cyclic: true,
            background: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Exhausted,
}

/// One step worth of aligned training data.
#[derive(Debug, Clone)]
pub struct PairedBatch {
    pub ids: Vec<String>,
    /// Rescaled `(n, h, w, c)`.
    pub images: Array4<f32>,
    /// `(n, h, w, 1)`
    pub masks: Array4<u8>,
    pub params: Vec<AugmentationParams>,
}

impl PairedBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Masks without the channel axis, `(n, h, w)`.
    pub fn labels(&self) -> ArrayView3<u8> {
        self.masks.index_axis(Axis(3), 0)
    }
}

pub struct PairedStream {
    images: Vec<Sample<f32>>,
    masks: Vec<Sample<u8>>,
    envelope: Option<AugmentationEnvelope>,
    config: StreamConfig,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    passes: usize,
    state: StreamState,
}

impl PairedStream {
    /// Load both sources and validate every pair up front.
    pub fn new<I, M>(
        images: &I,
        masks: &M,
        envelope: Option<AugmentationEnvelope>,
        config: StreamConfig,
        num_classes: usize,
    ) -> Result<Self>
    where
        I: SampleSource<f32> + ?Sized,
        M: SampleSource<u8> + ?Sized,
    {
        if config.batch_size == 0 {
            return Err(DelamSegError::configuration("batch size must be positive"));
        }
        if num_classes == 0 || num_classes > usize::from(u8::MAX) + 1 {
            return Err(DelamSegError::configuration(format!(
                "class count {num_classes} is outside 1..=256"
            )));
        }
        if usize::from(config.background) >= num_classes {
            return Err(DelamSegError::configuration(format!(
                "background class {} is not one of the {num_classes} classes",
                config.background
            )));
        }
        if let Some(envelope) = &envelope {
            envelope.validate()?;
        }

        let images = images.enumerate()?;
        let masks = masks.enumerate()?;
        validate_pairs(&images, &masks, num_classes)?;

        let envelope = envelope.filter(|e| !e.is_identity());
        debug!(
            "paired stream over {} samples, batch size {}, augmentation {}",
            images.len(),
            config.batch_size,
            if envelope.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            order: Vec::new(),
            cursor: 0,
            passes: 0,
            state: StreamState::Idle,
            images,
            masks,
            envelope,
            config,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Batches in one pass, counting a trailing partial batch.
    pub fn batches_per_pass(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    /// Completed passes over the data.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Back to `Idle` with the generator reseeded; the next pull replays the
    /// stream from the start.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.order.clear();
        self.cursor = 0;
        self.passes = 0;
        self.state = StreamState::Idle;
    }

    pub fn next_batch(&mut self) -> Result<PairedBatch> {
        match self.state {
            StreamState::Exhausted => return Err(self.exhausted()),
            StreamState::Idle => {
                self.begin_pass();
                self.state = StreamState::Streaming;
            }
            StreamState::Streaming => {}
        }

        if self.cursor >= self.order.len() {
            self.passes += 1;
            if !self.config.cyclic {
                self.state = StreamState::Exhausted;
                return Err(self.exhausted());
            }
            self.begin_pass();
        }

        let end = min(self.cursor + self.config.batch_size, self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        // strictly sequential so the draw order only depends on the seed
        let mut params = Vec::with_capacity(indices.len());
        for _ in &indices {
            params.push(match &self.envelope {
                Some(envelope) => envelope.sample(&mut self.rng),
                None => AugmentationParams::IDENTITY,
            });
        }

        self.assemble(&indices, params)
    }

    fn begin_pass(&mut self) {
        self.order = (0..self.images.len()).collect();
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        debug!("paired stream starting pass {}", self.passes);
    }

    fn assemble(&self, indices: &[usize], params: Vec<AugmentationParams>) -> Result<PairedBatch> {
        let background = self.config.background;
        let warped: Vec<(Array3<f32>, Array3<u8>)> = indices
            .par_iter()
            .zip(params.par_iter())
            .map(|(&index, params)| {
                let image = self.images[index].data.view();
                let mask = self.masks[index].data.view();
                match &self.envelope {
                    Some(envelope) => (
                        envelope.apply_image(params, image),
                        envelope.apply_mask(params, mask, background),
                    ),
                    None => (image.to_owned(), mask.to_owned()),
                }
            })
            .collect();

        let mut images = Vec::with_capacity(warped.len());
        let mut ids = Vec::with_capacity(warped.len());
        for (&index, (image, mask)) in indices.iter().zip(&warped) {
            let id = &self.images[index].id;
            if image.dim().0 != mask.dim().0 || image.dim().1 != mask.dim().1 {
                return Err(DelamSegError::alignment(
                    id.clone(),
                    format!(
                        "image is {:?} but mask is {:?} after augmentation",
                        image.dim(),
                        mask.dim()
                    ),
                ));
            }
            images.push(rescale(image.view())?);
            ids.push(id.clone());
        }

        let image_views: Vec<_> = images.iter().map(|a| a.view()).collect();
        let mask_views: Vec<_> = warped.iter().map(|(_, m)| m.view()).collect();

        Ok(PairedBatch {
            ids,
            images: ndarray::stack(Axis(0), &image_views)?,
            masks: ndarray::stack(Axis(0), &mask_views)?,
            params,
        })
    }

    fn exhausted(&self) -> DelamSegError {
        DelamSegError::DataExhaustion {
            requested: 1,
            samples: self.images.len(),
        }
    }
}

fn validate_pairs(images: &[Sample<f32>], masks: &[Sample<u8>], num_classes: usize) -> Result<()> {
    if images.len() != masks.len() {
        return Err(DelamSegError::alignment(
            "<source>",
            format!(
                "{} images but {} masks",
                images.len(),
                masks.len()
            ),
        ));
    }
    let Some(first) = images.first() else {
        return Err(DelamSegError::configuration("sample sources are empty"));
    };
    let expected = first.data.dim();
    if !matches!(expected.2, 1 | 3) {
        return Err(DelamSegError::shape(
            format!("image channels of {}", first.id),
            "1 or 3",
            expected.2,
        ));
    }

    for (image, mask) in images.iter().zip(masks) {
        if image.id != mask.id {
            warn!("pairing image {} with mask {} by position", image.id, mask.id);
        }
        if image.data.dim() != expected {
            return Err(DelamSegError::shape(
                format!("image {}", image.id),
                expected,
                image.data.dim(),
            ));
        }
        let (height, width, channels) = mask.data.dim();
        if channels != 1 {
            return Err(DelamSegError::shape(
                format!("mask channels of {}", mask.id),
                1,
                channels,
            ));
        }
        if image.spatial_dim() != (height, width) {
            return Err(DelamSegError::alignment(
                image.id.clone(),
                format!(
                    "image is {:?} but mask {} is {:?}",
                    image.spatial_dim(),
                    mask.id,
                    (height, width)
                ),
            ));
        }
        if let Some(&label) = mask.data.iter().find(|&&v| usize::from(v) >= num_classes) {
            return Err(DelamSegError::InvalidLabel {
                sample: mask.id.clone(),
                label,
                num_classes,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;

    fn sources(count: usize) -> (InMemorySource<f32>, InMemorySource<u8>) {
        let mut images = InMemorySource::default();
        let mut masks = InMemorySource::default();
        for i in 0..count {
            images.push(Sample::new(
                format!("s{i}"),
                Array3::from_elem((4, 6, 1), i as f32 * 10.0),
            ));
            masks.push(Sample::new(format!("s{i}"), Array3::from_elem((4, 6, 1), (i % 2) as u8)));
        }
        (images, masks)
    }

    fn config(batch_size: usize, cyclic: bool) -> StreamConfig {
        StreamConfig {
            seed: 7,
            batch_size,
            shuffle: false,
            cyclic,
            background: 0,
        }
    }

    #[test]
    fn batches_are_rescaled_and_stacked() -> Result<()> {
        let (images, masks) = sources(3);
        let mut stream = PairedStream::new(&images, &masks, None, config(2, true), 2)?;
        assert_eq!(stream.state(), StreamState::Idle);

        let batch = stream.next_batch()?;
        assert_eq!(stream.state(), StreamState::Streaming);
        assert_eq!(batch.images.dim(), (2, 4, 6, 1));
        assert_eq!(batch.masks.dim(), (2, 4, 6, 1));
        assert_eq!(batch.ids, vec!["s0", "s1"]);
        assert_eq!(batch.images[[0, 0, 0, 0]], -1.0);
        assert_eq!(batch.labels().dim(), (2, 4, 6));
        Ok(())
    }

    #[test]
    fn partial_final_batch_then_exhaustion() -> Result<()> {
        let (images, masks) = sources(3);
        let mut stream = PairedStream::new(&images, &masks, None, config(2, false), 2)?;
        assert_eq!(stream.batches_per_pass(), 2);

        assert_eq!(stream.next_batch()?.len(), 2);
        assert_eq!(stream.next_batch()?.len(), 1);
        assert!(matches!(
            stream.next_batch(),
            Err(DelamSegError::DataExhaustion { samples: 3, .. })
        ));
        assert_eq!(stream.state(), StreamState::Exhausted);
        assert!(stream.next_batch().is_err());
        Ok(())
    }

    #[test]
    fn cyclic_stream_wraps_around() -> Result<()> {
        let (images, masks) = sources(2);
        let mut stream = PairedStream::new(&images, &masks, None, config(2, true), 2)?;
        for _ in 0..5 {
            assert_eq!(stream.next_batch()?.len(), 2);
        }
        assert_eq!(stream.passes(), 4);
        Ok(())
    }

    #[test]
    fn construction_rejects_bad_inputs() {
        let (images, masks) = sources(3);
        let (_, fewer_masks) = sources(2);

        assert!(matches!(
            PairedStream::new(&images, &fewer_masks, None, config(2, true), 2),
            Err(DelamSegError::Alignment { .. })
        ));
        assert!(matches!(
            PairedStream::new(&images, &masks, None, config(0, true), 2),
            Err(DelamSegError::Configuration { .. })
        ));
        assert!(matches!(
            PairedStream::new(&images, &masks, None, config(2, true), 1),
            Err(DelamSegError::InvalidLabel { label: 1, .. })
        ));

        let empty_images = InMemorySource::<f32>::default();
        let empty_masks = InMemorySource::<u8>::default();
        assert!(matches!(
            PairedStream::new(&empty_images, &empty_masks, None, config(2, true), 2),
            Err(DelamSegError::Configuration { .. })
        ));
    }

    #[test]
    fn mismatched_spatial_dims_are_alignment_errors() {
        let images = InMemorySource::new(vec![Sample::new("a", Array3::<f32>::zeros((4, 4, 3)))]);
        let masks = InMemorySource::new(vec![Sample::new("a", Array3::<u8>::zeros((4, 5, 1)))]);
        assert!(matches!(
            PairedStream::new(&images, &masks, None, config(1, true), 2),
            Err(DelamSegError::Alignment { .. })
        ));

        let multi_channel_masks =
            InMemorySource::new(vec![Sample::new("a", Array3::<u8>::zeros((4, 4, 3)))]);
        assert!(matches!(
            PairedStream::new(&images, &multi_channel_masks, None, config(1, true), 2),
            Err(DelamSegError::Shape { .. })
        ));
    }

    #[test]
    fn reset_replays_the_same_batches() -> Result<()> {
        let (images, masks) = sources(5);
        let envelope = AugmentationEnvelope {
            horizontal_flip: true,
            rotation_range: 30.0,
            ..Default::default()
        };
        let stream_config = StreamConfig {
            shuffle: true,
            ..config(2, true)
        };
        let mut stream = PairedStream::new(&images, &masks, Some(envelope), stream_config, 2)?;

        let first: Vec<_> = (0..4).map(|_| stream.next_batch()).collect::<Result<_>>()?;
        stream.reset();
        let second: Vec<_> = (0..4).map(|_| stream.next_batch()).collect::<Result<_>>()?;

        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.ids, b.ids);
            assert_eq!(a.params, b.params);
            assert_eq!(a.images, b.images);
            assert_eq!(a.masks, b.masks);
        }
        Ok(())
    }
}
