use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which subset of the data list to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ListKey {
    Training,
    Validation,
    #[default]
    Testing,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ImageField {
    Single(PathBuf),
    Multi(Vec<PathBuf>),
}

#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
    image: ImageField,
    label: PathBuf,
    #[serde(default)]
    fold: Option<i64>,
}

/// One image/label pair with paths resolved against the data base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// A JSON data list: `{"training": [...], "validation": [...], "testing": [...]}`.
/// Other top-level keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataList {
    #[serde(default)]
    training: Vec<RawEntry>,
    #[serde(default)]
    validation: Vec<RawEntry>,
    #[serde(default)]
    testing: Vec<RawEntry>,
}

impl DataList {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Splits `key` by fold: entries whose fold equals `fold` form the second
    /// list, all others the first. A fold of -1 keeps everything in the first.
    pub fn read_fold(&self, base_dir: &Path, key: &str, fold: i64) -> (Vec<DataEntry>, Vec<DataEntry>) {
        let mut train = Vec::new();
        let mut val = Vec::new();

        let section: &[RawEntry] = match key {
            "training" => &self.training,
            "validation" => &self.validation,
            "testing" => &self.testing,
            _ => &[],
        };

        for raw in section {
            let entry = resolve(base_dir, raw);
            if fold >= 0 && raw.fold == Some(fold) {
                val.push(entry);
            } else {
                train.push(entry);
            }
        }

        (train, val)
    }

    /// Entries selected by `list_key`, following the five-fold or the fixed
    /// training/validation/testing layout.
    pub fn select(&self, base_dir: &Path, list_key: ListKey, fold: i64, five_fold: bool) -> Vec<DataEntry> {
        let (train, val) = if five_fold {
            self.read_fold(base_dir, "training", fold)
        } else {
            (
                self.read_fold(base_dir, "training", -1).0,
                self.read_fold(base_dir, "validation", -1).0,
            )
        };
        let (test, _) = self.read_fold(base_dir, "testing", -1);

        match list_key {
            ListKey::Training => train,
            ListKey::Validation => val,
            ListKey::Testing => test,
            ListKey::All => train.into_iter().chain(val).chain(test).collect(),
        }
    }
}

fn resolve(base_dir: &Path, raw: &RawEntry) -> DataEntry {
    let image = match &raw.image {
        ImageField::Single(p) => p.clone(),
        ImageField::Multi(paths) => paths.first().cloned().unwrap_or_default(),
    };
    DataEntry {
        image: base_dir.join(image),
        label: base_dir.join(&raw.label),
    }
}

/// Static interleaved shard of `rank`: items `rank, rank + world, ...`.
pub fn partition<T: Clone>(items: &[T], world_size: usize, rank: usize) -> Result<Vec<T>> {
    if world_size == 0 || rank >= world_size {
        return Err(Error::Config(format!(
            "rank {rank} is outside a world of {world_size} workers"
        )));
    }
    Ok(items.iter().skip(rank).step_by(world_size).cloned().collect())
}
