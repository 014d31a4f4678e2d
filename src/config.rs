use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datalist::ListKey;
use crate::error::{Error, Result};
use crate::prompting::DEFAULT_EROSION_SIZE;
use crate::region_grow_predictor::DEFAULT_TOLERANCE;
use crate::MASK_THRESHOLD;

/// Settings of one evaluation run, read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    pub data_file_base_dir: PathBuf,
    pub data_list_file_path: PathBuf,
    #[serde(default)]
    pub fold: i64,
    #[serde(default)]
    pub list_key: ListKey,
    #[serde(default = "default_true")]
    pub five_fold: bool,

    /// Label values to evaluate, background first. When absent it is read from
    /// `label_mapping` under `dataset_name`.
    #[serde(default)]
    pub label_set: Option<Vec<u32>>,
    #[serde(default = "default_label_mapping")]
    pub label_mapping: PathBuf,
    #[serde(default)]
    pub dataset_name: Option<String>,

    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_erosion_size")]
    pub erosion_size: usize,
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,

    /// Root for exported frames and, by default, the metric bundle.
    pub output_path: PathBuf,
    /// Write slices as JPEG frames and let the predictor read them back.
    #[serde(default)]
    pub export_frames: bool,
    #[serde(default)]
    pub log_output_file: Option<PathBuf>,
    #[serde(default)]
    pub bundle_path: Option<PathBuf>,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    #[serde(default)]
    pub predictor: PredictorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictorConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_label_mapping() -> PathBuf {
    PathBuf::from("./data/jsons/label_mappings.json")
}

fn default_max_iter() -> usize {
    1
}

fn default_erosion_size() -> usize {
    DEFAULT_EROSION_SIZE
}

fn default_mask_threshold() -> f32 {
    MASK_THRESHOLD
}

fn default_num_workers() -> usize {
    1
}

fn default_tolerance() -> f32 {
    DEFAULT_TOLERANCE
}

impl EvalConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Config("max_iter must be at least 1".into()));
        }
        if self.num_workers == 0 {
            return Err(Error::Config("num_workers must be at least 1".into()));
        }
        if self.export_frames && self.dataset_name.is_none() {
            return Err(Error::Config("export_frames needs dataset_name".into()));
        }
        Ok(())
    }

    /// Label values including the leading background entry.
    pub fn resolve_label_set(&self) -> Result<Vec<u32>> {
        if let Some(set) = &self.label_set {
            return Ok(set.clone());
        }

        let dataset = self.dataset_name.as_deref().ok_or_else(|| {
            Error::Config("either label_set or dataset_name must be given".into())
        })?;
        let text = std::fs::read_to_string(&self.label_mapping)?;
        label_set_from_mapping(&text, dataset)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.bundle_path
            .clone()
            .unwrap_or_else(|| self.output_path.join("metrics.safetensors"))
    }

    /// Directory holding the exported frames of one volume.
    pub fn frame_dir(&self, volume_dir_name: &str) -> PathBuf {
        let dataset = self.dataset_name.as_deref().unwrap_or_default();
        self.output_path.join(dataset).join(volume_dir_name)
    }
}

/// `[0]` followed by the first element of every mapping entry of `dataset`.
/// Mapping files look like `{"dataset": [[1, 3], [2, 7]]}`.
pub fn label_set_from_mapping(text: &str, dataset: &str) -> Result<Vec<u32>> {
    let mapping: HashMap<String, Vec<Vec<u32>>> = serde_json::from_str(text)?;
    let entries = mapping
        .get(dataset)
        .ok_or_else(|| Error::Config(format!("dataset '{dataset}' missing from label mapping")))?;

    let mut set = vec![0];
    for entry in entries {
        let first = entry
            .first()
            .ok_or_else(|| Error::Config(format!("empty mapping entry for '{dataset}'")))?;
        set.push(*first);
    }
    Ok(set)
}
