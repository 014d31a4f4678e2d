use std::path::{Path, PathBuf};

use candle_core::{Device, Result, Tensor};
use image::GenericImageView;
use ndarray::{Array3, Axis};

use crate::{array2_to_tensor, luma_to_tensor};

/// Source of `[H, W]` f32 frames for a video predictor.
pub trait FrameLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor>;
    /// `(height, width)`
    fn frame_size(&self) -> (usize, usize);
    fn total_frames(&self) -> usize;
}

/// Frames stored as image files in one directory, ordered by numeric file stem
/// (`0001.jpg`, `0002.jpg`, ...). Non-numeric stems sort after, by name.
pub struct ImageLoader {
    image_paths: Vec<PathBuf>,
    base_dimensions: (u32, u32),
}

impl ImageLoader {
    pub fn new<P: AsRef<Path>>(folder_path: P) -> Result<Self> {
        let mut image_paths = Vec::new();
        let supported_extensions = ["jpg", "jpeg", "png"];

        let entries = std::fs::read_dir(folder_path)
            .map_err(|e| candle_core::Error::msg(format!("read dir fail: {e}")))?;

        for entry in entries {
            let entry = entry.map_err(|e| candle_core::Error::msg(format!("item error: {e}")))?;
            let path = entry.path();

            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    let ext = ext.to_lowercase();
                    if supported_extensions.contains(&ext.as_str()) {
                        image_paths.push(path);
                    }
                }
            }
        }

        if image_paths.is_empty() {
            return Err(candle_core::Error::msg("no image found"));
        }

        image_paths.sort_by_key(|p| {
            let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            (stem.parse::<u64>().unwrap_or(u64::MAX), p.clone())
        });

        let first_img = image::open(&image_paths[0])
            .map_err(|e| candle_core::Error::msg(format!("load first frame fail: {e}")))?;
        let base_dimensions = first_img.dimensions();

        Ok(Self {
            image_paths,
            base_dimensions,
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }
}

impl FrameLoader for ImageLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        let path = self.image_paths.get(index).ok_or_else(|| {
            candle_core::Error::msg(format!("index {index} out of bound (total: {})", self.len()))
        })?;

        let img = image::open(path)
            .map_err(|e| candle_core::Error::msg(format!("frame load fail: {e}")))?;

        let current_dims = img.dimensions();
        if current_dims != self.base_dimensions {
            return Err(candle_core::Error::msg(format!(
                "frame size not match first frame: current {:?} != base {:?}",
                current_dims, self.base_dimensions
            )));
        }

        luma_to_tensor(&img, device)
    }

    fn frame_size(&self) -> (usize, usize) {
        let width = self.base_dimensions.0 as usize;
        let height = self.base_dimensions.1 as usize;
        (height, width)
    }

    fn total_frames(&self) -> usize {
        self.len()
    }
}

/// Frames taken directly from an in-memory `[H, W, D]` volume.
pub struct VolumeFrameLoader {
    volume: Array3<f32>,
}

impl VolumeFrameLoader {
    pub fn new(volume: Array3<f32>) -> Self {
        Self { volume }
    }
}

impl FrameLoader for VolumeFrameLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        if index >= self.total_frames() {
            return Err(candle_core::Error::msg(format!(
                "index {index} out of bound (total: {})",
                self.total_frames()
            )));
        }
        array2_to_tensor(self.volume.index_axis(Axis(2), index), device)
    }

    fn frame_size(&self) -> (usize, usize) {
        let (h, w, _) = self.volume.dim();
        (h, w)
    }

    fn total_frames(&self) -> usize {
        self.volume.dim().2
    }
}
