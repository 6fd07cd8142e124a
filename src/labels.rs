//! Ordered emotion label set and its on-disk manifest.
//!
//! The label order fixes head output positions and the key order of every
//! calibration artifact. It is derived once from the training data (or pinned
//! in config) and persisted next to the model weights as `labels.json`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AffectError, Result};

pub const LABELS_FILE: &str = "labels.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct LabelManifest {
    labels: Vec<String>,
}

impl LabelSet {
    /// Build from an explicit order. Empty or duplicated names are rejected.
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(AffectError::Configuration(
                "label set must contain at least one label".to_string(),
            ));
        }
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(AffectError::Configuration(format!(
                    "label at index {} is empty",
                    i
                )));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(AffectError::Configuration(format!(
                    "duplicate label '{}'",
                    name
                )));
            }
        }
        Ok(Self { names, index })
    }

    /// Sorted union of every label name that occurs in the data.
    pub fn from_names<'a, I>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let unique: BTreeSet<&str> = names.into_iter().collect();
        Self::new(unique.into_iter().map(str::to_string).collect())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Multi-hot vector over this label set. Unknown names are a data error.
    pub fn encode(&self, active: &[String]) -> Result<Vec<f32>> {
        let mut hot = vec![0.0f32; self.len()];
        for name in active {
            let idx = self
                .index_of(name)
                .ok_or_else(|| AffectError::Data(format!("unknown label '{}'", name)))?;
            hot[idx] = 1.0;
        }
        Ok(hot)
    }

    /// Fail unless `other` lists exactly our labels in our order.
    pub fn ensure_same_order(&self, other: &[String], path: &Path) -> Result<()> {
        if other != self.names.as_slice() {
            return Err(AffectError::artifact(
                path,
                format!(
                    "label order {:?} does not match manifest {:?}",
                    other, self.names
                ),
            ));
        }
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let manifest = LabelManifest {
            labels: self.names.clone(),
        };
        crate::calibration::artifacts::write_json_atomic(&dir.join(LABELS_FILE), &manifest)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(LABELS_FILE);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| AffectError::artifact(&path, format!("failed to read: {}", e)))?;
        let manifest: LabelManifest = serde_json::from_str(&contents)
            .map_err(|e| AffectError::artifact(&path, format!("invalid manifest: {}", e)))?;
        Self::new(manifest.labels).map_err(|e| AffectError::artifact(&path, e.to_string()))
    }
}
