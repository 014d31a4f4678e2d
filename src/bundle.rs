use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use ndarray::prelude::*;

use crate::error::{Error, Result};
use crate::metrics::MetricTable;
use crate::volume::tensor_to_array3;

/// Evaluation results persisted as safetensors: `metric` and `point` are
/// `[volume, object, iteration]`, `best` is `[volume, object]`.
#[derive(Debug, Clone)]
pub struct MetricBundle {
    pub metric: MetricTable,
    pub points: MetricTable,
}

impl MetricBundle {
    pub fn best(&self) -> Array2<f32> {
        self.metric.best()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let best = self.best();
        let mut tensors = HashMap::new();
        tensors.insert("metric".to_string(), array_to_tensor(self.metric.values())?);
        tensors.insert("point".to_string(), array_to_tensor(self.points.values())?);
        tensors.insert("best".to_string(), array_to_tensor(best.view())?);

        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
        let get = |key: &str| -> Result<MetricTable> {
            let tensor = tensors.get(key).ok_or_else(|| {
                Error::Data(format!("{} has no '{key}' tensor", path.as_ref().display()))
            })?;
            Ok(MetricTable::from_array(tensor_to_array3(tensor)?))
        };

        let metric = get("metric")?;
        let points = get("point")?;
        if metric.dim() != points.dim() {
            return Err(Error::Data(format!(
                "metric shape {:?} and point shape {:?} differ",
                metric.dim(),
                points.dim()
            )));
        }
        Ok(Self { metric, points })
    }
}

fn array_to_tensor<D: Dimension>(array: ArrayView<f32, D>) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, array.shape(), &Device::Cpu)?)
}
