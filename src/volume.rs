use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use ndarray::prelude::*;

use crate::error::{Error, Result};

/// Image/label pair of one scan, both `[H, W, D]` with frames on the last axis.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Source image filename, unique per volume.
    pub id: String,
    pub image: Array3<f32>,
    pub label: Array3<f32>,
}

impl Volume {
    pub fn new(id: impl Into<String>, image: Array3<f32>, label: Array3<f32>) -> Result<Self> {
        if image.dim() != label.dim() {
            return Err(Error::Data(format!(
                "image shape {:?} does not match label shape {:?}",
                image.dim(),
                label.dim()
            )));
        }
        Ok(Self {
            id: id.into(),
            image,
            label,
        })
    }

    /// Loads `image` and `label` tensors from two safetensors files.
    pub fn load(image_path: &Path, label_path: &Path) -> Result<Self> {
        let image = load_array3(image_path, "image")?;
        let label = load_array3(label_path, "label")?;
        Self::new(image_path.display().to_string(), image, label)
    }

    pub fn num_frames(&self) -> usize {
        self.image.dim().2
    }

    /// Voxels carrying `label_value`.
    pub fn object_mask(&self, label_value: u32) -> Array3<bool> {
        let target = label_value as f32;
        self.label.mapv(|v| v.round() == target)
    }

    /// Name of the per-volume frame directory: `<parent dir>_<file stem>`.
    pub fn frame_dir_name(&self) -> String {
        let path = Path::new(&self.id);
        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or_default();
        format!("{parent}_{stem}")
    }

    /// Writes every frame as `NNNN.jpg` (1-based) into `dir`, keeping frames
    /// that already exist. Intensities are clamped into `0..=255`.
    pub fn export_frames(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let (h, w, d) = self.image.dim();

        for k in 0..d {
            let save_name = dir.join(format!("{:04}.jpg", k + 1));
            if save_name.exists() {
                continue;
            }
            let frame = self.image.index_axis(Axis(2), k);
            let pixels: Vec<u8> = frame.iter().map(|&v| v.clamp(0.0, 255.0) as u8).collect();
            let img = image::GrayImage::from_raw(w as u32, h as u32, pixels)
                .ok_or_else(|| Error::Data(format!("frame {k} of {} has a bad size", self.id)))?;
            img.save(&save_name)?;
        }

        log::debug!("exported {d} frames of {} to {}", self.id, dir.display());
        Ok(dir.to_path_buf())
    }
}

/// Reads the tensor called `key` (or the only tensor in the file), squeezes
/// leading unit axes and converts it to an f32 `[H, W, D]` array.
pub fn load_array3(path: &Path, key: &str) -> Result<Array3<f32>> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let tensor = match tensors.remove(key) {
        Some(t) => t,
        None if tensors.len() == 1 => tensors.into_values().next().ok_or_else(|| {
            Error::Data(format!("{} holds no tensor", path.display()))
        })?,
        None => {
            return Err(Error::Data(format!(
                "{} has no tensor named '{key}'",
                path.display()
            )))
        }
    };
    tensor_to_array3(&tensor)
}

pub fn tensor_to_array3(tensor: &Tensor) -> Result<Array3<f32>> {
    let mut t = tensor.to_dtype(DType::F32)?;
    while t.rank() > 3 && t.dim(0)? == 1 {
        t = t.squeeze(0)?;
    }
    let (h, w, d) = t.dims3()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array3::from_shape_vec((h, w, d), data)?)
}

/// Writes a volume as the `image`/`label` safetensors pair [`Volume::load`] reads.
pub fn save_volume(volume: &Volume, image_path: &Path, label_path: &Path) -> Result<()> {
    for (array, key, path) in [
        (&volume.image, "image", image_path),
        (&volume.label, "label", label_path),
    ] {
        let data: Vec<f32> = array.iter().copied().collect();
        let tensor = Tensor::from_vec(data, array.dim(), &Device::Cpu)?;
        let tensors = HashMap::from([(key.to_string(), tensor)]);
        candle_core::safetensors::save(&tensors, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_volume(id: &str) -> Volume {
        let image = Array3::from_shape_fn((4, 5, 3), |(i, j, k)| (i * 60 + j + k) as f32);
        let label = Array3::from_shape_fn((4, 5, 3), |(i, _, k)| ((i + k) % 3) as f32);
        Volume::new(id, image, label).unwrap()
    }

    #[test]
    fn volume_round_trips_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let volume = small_volume("unused");
        let (image_path, label_path) = (dir.path().join("img.safetensors"), dir.path().join("lbl.safetensors"));
        save_volume(&volume, &image_path, &label_path).unwrap();

        let loaded = Volume::load(&image_path, &label_path).unwrap();
        assert_eq!(loaded.image, volume.image);
        assert_eq!(loaded.label, volume.label);
        assert_eq!(loaded.id, image_path.display().to_string());
    }

    #[test]
    fn leading_unit_axes_are_squeezed() {
        let t = Tensor::arange(0u8, 24, &Device::Cpu).unwrap().reshape((1, 1, 2, 3, 4)).unwrap();
        let a = tensor_to_array3(&t).unwrap();
        assert_eq!(a.dim(), (2, 3, 4));
        assert_eq!(a[[1, 2, 3]], 23.0);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let err = Volume::new("x", Array3::zeros((2, 2, 2)), Array3::zeros((2, 2, 3)));
        assert!(matches!(err, Err(Error::Data(_))));
    }

    #[test]
    fn object_mask_selects_label_value() {
        let volume = small_volume("v");
        let mask = volume.object_mask(2);
        assert!(mask[[2, 0, 0]]);
        assert!(!mask[[0, 0, 0]]);
    }

    #[test]
    fn frame_dir_uses_parent_and_stem() {
        let volume = small_volume("/data/task03/liver_12.nii.gz");
        assert_eq!(volume.frame_dir_name(), "task03_liver_12");
    }

    #[test]
    fn frames_export_once_as_numbered_jpegs() {
        let dir = tempfile::tempdir().unwrap();
        let volume = small_volume("v");
        volume.export_frames(dir.path()).unwrap();

        for name in ["0001.jpg", "0002.jpg", "0003.jpg"] {
            assert!(dir.path().join(name).exists());
        }
        let before = std::fs::metadata(dir.path().join("0001.jpg")).unwrap().modified().unwrap();
        volume.export_frames(dir.path()).unwrap();
        let after = std::fs::metadata(dir.path().join("0001.jpg")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
