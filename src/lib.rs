use candle_core::{DType, Device, Result, Tensor};
use image::DynamicImage;
use ndarray::prelude::*;

pub mod bundle;
pub mod config;
pub mod datalist;
pub mod distributed;
pub mod error;
pub mod evaluator;
pub mod frame_loader;
pub mod metrics;
pub mod prompting;
pub mod refinement;
pub mod region_grow_predictor;
pub mod video_predictor;
pub mod volume;

pub use error::{Error, Result as EvalResult};

/// Foreground threshold applied to predictor mask logits.
pub const MASK_THRESHOLD: f32 = 0.0;

/// Grayscale frame as a `[H, W]` tensor of raw 0..=255 intensities.
fn luma_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let data: Vec<f32> = luma.into_raw().into_iter().map(|v| v as f32).collect();

    Tensor::from_vec(data, (height as usize, width as usize), device)
}

pub fn array2_to_tensor(array: ArrayView2<f32>, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_vec(data, array.dim(), device)
}

pub fn tensor_to_array2(t: &Tensor) -> Result<Array2<f32>> {
    let t = t.to_device(&Device::Cpu)?;
    let t = match t.dtype() {
        DType::F32 => t,
        _ => t.to_dtype(DType::F32)?,
    };
    let (h, w) = t.dims2()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;

    Array2::from_shape_vec((h, w), data)
        .map_err(|e| candle_core::Error::Msg(format!("Failed to convert Tensor to Array2<f32>: {e}")))
}

/// Thresholds `[H, W]` mask logits into a boolean mask.
pub fn mask_from_logits(logits: &Tensor, threshold: f32) -> Result<Array2<bool>> {
    Ok(tensor_to_array2(logits)?.mapv(|v| v > threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_tensor_conversion_keeps_layout() {
        let a = array![[0.0f32, 1.0, 2.0], [3.0, 4.0, 5.0]];
        let t = array2_to_tensor(a.view(), &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        assert_eq!(tensor_to_array2(&t).unwrap(), a);

        // transposed views are read in logical order
        let t = array2_to_tensor(a.t(), &Device::Cpu).unwrap();
        assert_eq!(tensor_to_array2(&t).unwrap(), a.t().to_owned());
    }

    #[test]
    fn logits_are_thresholded_strictly() {
        let t = Tensor::new(&[[-1.0f32, 0.0], [0.5, 3.0]], &Device::Cpu).unwrap();
        let mask = mask_from_logits(&t, MASK_THRESHOLD).unwrap();
        assert_eq!(mask, array![[false, false], [true, true]]);
    }

    #[test]
    fn luma_frame_keeps_raw_intensity() {
        let img = image::GrayImage::from_fn(3, 2, |x, y| image::Luma([(x + 10 * y) as u8]));
        let t = luma_to_tensor(&DynamicImage::ImageLuma8(img), &Device::Cpu).unwrap();
        let a = tensor_to_array2(&t).unwrap();
        assert_eq!(a.dim(), (2, 3));
        assert_eq!(a[[1, 2]], 12.0);
    }
}
