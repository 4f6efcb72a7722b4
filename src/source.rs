//! Sample sources backed by directories or memory.

use std::path::{Path, PathBuf};

use image::{imageops::FilterType, ColorType, DynamicImage, ImageFormat};
use log::debug;
use ndarray::prelude::*;
use nshare::AsNdarray3;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::{DelamSegError, Result};
use crate::traits::{Sample, SampleSource};

/// Channel layout images are decoded into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Rgb,
    Grayscale,
}

impl ColorMode {
    pub const fn channels(self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Grayscale => 1,
        }
    }
}

/// `<root>/images` and `<root>/masks` of a dataset split.
pub fn dataset_dirs(root: &Path) -> (PathBuf, PathBuf) {
    (root.join("images"), root.join("masks"))
}

/// Image files below a directory, ordered by relative path.
///
/// Ids are the relative path without extension, `/`-separated, so an image
/// `images/required/ir_0001.png` pairs with `masks/required/ir_0001.png`.
/// Implements `SampleSource<f32>` (intensities, decoded per [`ColorMode`]) and
/// `SampleSource<u8>` (single-channel label values, decoded as-is).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    color_mode: ColorMode,
    target_size: Option<(u32, u32)>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            color_mode: ColorMode::default(),
            target_size: None,
        }
    }

    pub const fn with_color_mode(mut self, color_mode: ColorMode) -> Self {
        self.color_mode = color_mode;
        self
    }

    /// Resize every file to `(height, width)` with nearest-neighbour sampling.
    pub const fn with_target_size(mut self, height: u32, width: u32) -> Self {
        self.target_size = Some((height, width));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(DelamSegError::FileSystem {
                path: self.root.clone(),
                operation: "directory existence check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source directory does not exist",
                ),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| DelamSegError::FileSystem {
                path: self.root.clone(),
                operation: "directory traversal".to_string(),
                source: e.into(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            match ImageFormat::from_path(path) {
                Ok(format) if format.reading_enabled() => files.push(path.to_path_buf()),
                Ok(format) => debug!("skipping {}: no {format:?} decoder", path.display()),
                Err(_) => debug!("skipping {}: not an image", path.display()),
            }
        }
        Ok(files)
    }

    fn sample_id(&self, path: &Path) -> Result<String> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| DelamSegError::FileSystem {
                path: path.to_path_buf(),
                operation: "relative path extraction".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file is not inside the source directory",
                ),
            })?
            .with_extension("");
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    fn open(&self, path: &Path) -> Result<DynamicImage> {
        let image = image::open(path).map_err(|e| DelamSegError::ImageProcessing {
            path: path.display().to_string(),
            operation: "image decoding".to_string(),
            source: Box::new(e),
        })?;
        Ok(match self.target_size {
            Some((height, width)) if image.height() != height || image.width() != width => {
                image.resize_exact(width, height, FilterType::Nearest)
            }
            _ => image,
        })
    }

    fn load_all<T>(
        &self,
        decode: impl Fn(&Path, DynamicImage) -> Result<Array3<T>>,
    ) -> Result<Vec<Sample<T>>> {
        let files = self.files()?;
        debug!("{} files found below {}", files.len(), self.root.display());

        files
            .iter()
            .map(|path| {
                let image = self.open(path)?;
                Ok(Sample::new(self.sample_id(path)?, decode(path, image)?))
            })
            .collect()
    }
}

impl SampleSource<f32> for DirectorySource {
    fn enumerate(&self) -> Result<Vec<Sample<f32>>> {
        let color_mode = self.color_mode;
        self.load_all(|_, image| {
            Ok(match color_mode {
                ColorMode::Rgb => channels_last(image.into_rgb8().as_ndarray3()).mapv(f32::from),
                ColorMode::Grayscale => {
                    channels_last(image.into_luma8().as_ndarray3()).mapv(f32::from)
                }
            })
        })
    }
}

impl SampleSource<u8> for DirectorySource {
    fn enumerate(&self) -> Result<Vec<Sample<u8>>> {
        self.load_all(|path, image| {
            // labels are stored values, wider pixels would be rescaled rather than kept
            match image.color() {
                ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
                    Ok(channels_last(image.into_luma8().as_ndarray3()))
                }
                other => Err(DelamSegError::shape(
                    format!("mask {}", path.display()),
                    "8-bit pixels",
                    other,
                )),
            }
        })
    }
}

/// nshare yields `(c, h, w)`; samples are `(h, w, c)`.
fn channels_last<T: Clone>(planar: ArrayView3<T>) -> Array3<T> {
    planar.permuted_axes([1, 2, 0]).as_standard_layout().into_owned()
}

/// Samples held in memory, enumerated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource<T> {
    samples: Vec<Sample<T>>,
}

impl<T> InMemorySource<T> {
    pub fn new(samples: Vec<Sample<T>>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: Sample<T>) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<T: Clone> SampleSource<T> for InMemorySource<T> {
    fn enumerate(&self) -> Result<Vec<Sample<T>>> {
        Ok(self.samples.clone())
    }
}
