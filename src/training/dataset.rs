//! Image-folder dataset layout expected by the classifier trainer:
//! `<root>/{train,val}/<label>/*.jpg`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::DatasetError;
use crate::ml::DefectLabel;

pub const SPLITS: [&str; 2] = ["train", "val"];

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, Serialize)]
pub struct SplitSummary {
    pub name: String,
    pub counts: BTreeMap<String, usize>,
    /// Directories that do not name a known label; the trainer would treat
    /// them as extra classes.
    pub unexpected: Vec<String>,
}

impl SplitSummary {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub root: PathBuf,
    pub splits: Vec<SplitSummary>,
}

impl DatasetSummary {
    pub fn total_images(&self) -> usize {
        self.splits.iter().map(SplitSummary::total).sum()
    }
}

pub fn inspect_dataset(root: &Path) -> Result<DatasetSummary, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::NotFound(root.display().to_string()));
    }

    let splits = SPLITS
        .iter()
        .map(|split| inspect_split(root, split))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DatasetSummary {
        root: root.to_path_buf(),
        splits,
    })
}

fn inspect_split(root: &Path, split: &str) -> Result<SplitSummary, DatasetError> {
    let dir = root.join(split);
    if !dir.is_dir() {
        return Err(DatasetError::NotFound(dir.display().to_string()));
    }

    let mut counts = BTreeMap::new();
    let mut unexpected = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if DefectLabel::ALL.iter().any(|label| label.as_str() == name) {
            counts.insert(name, count_images(&entry.path())?);
        } else {
            warn!("Unexpected class directory {}/{}", split, name);
            unexpected.push(name);
        }
    }

    let missing: Vec<&str> = DefectLabel::ALL
        .iter()
        .map(DefectLabel::as_str)
        .filter(|label| !counts.contains_key(*label))
        .collect();
    if !missing.is_empty() {
        return Err(DatasetError::MissingClasses {
            split: split.to_string(),
            missing: missing.join(", "),
        });
    }

    debug!("Split {} has {} images", split, counts.values().sum::<usize>());
    Ok(SplitSummary {
        name: split.to_string(),
        counts,
        unexpected,
    })
}

fn count_images(dir: &Path) -> Result<usize, DatasetError> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            count += 1;
        }
    }
    Ok(count)
}
