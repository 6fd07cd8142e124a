//! Calibration artifact files and their label-order contract.
//!
//! Every artifact lives next to the model weights and is keyed (or ordered) by
//! the names in `labels.json`. Writes go through a sibling temp file and a
//! rename so an interrupted run never leaves a truncated artifact behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::baselines::Baselines;
use super::temperature::TemperatureParams;
use super::thresholds::Thresholds;
use crate::error::{AffectError, Result};
use crate::labels::LabelSet;

pub const BASELINES_FILE: &str = "baselines.json";
pub const TEMPERATURE_FILE: &str = "temperature.json";
pub const THRESHOLDS_FILE: &str = "thresholds.json";

/// Every artifact derived from a particular set of weights.
pub const CALIBRATION_FILES: [&str; 3] = [BASELINES_FILE, TEMPERATURE_FILE, THRESHOLDS_FILE];

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| AffectError::artifact(&tmp, format!("failed to create: {}", e)))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| AffectError::artifact(&tmp, format!("failed to write: {}", e)))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| AffectError::artifact(path, format!("failed to replace: {}", e)))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AffectError::artifact(path, format!("failed to read: {}", e)))?;
    serde_json::from_str(&contents)
        .map_err(|e| AffectError::artifact(path, format!("invalid JSON: {}", e)))
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AffectError::artifact(path, format!("failed to remove: {}", e))),
    }
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if path.exists() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Label manifest plus whichever calibration artifacts exist for a snapshot.
#[derive(Debug, Clone)]
pub struct CalibrationBundle {
    pub labels: LabelSet,
    pub baselines: Option<Baselines>,
    pub temperature: Option<TemperatureParams>,
    pub thresholds: Option<Thresholds>,
}

impl CalibrationBundle {
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            baselines: None,
            temperature: None,
            thresholds: None,
        }
    }

    /// Load the manifest and every artifact present in `dir`, checking each
    /// against the manifest's label order.
    pub fn load(dir: &Path) -> Result<Self> {
        let labels = LabelSet::load(dir)?;
        let bundle = Self {
            baselines: read_optional(&dir.join(BASELINES_FILE))?,
            temperature: read_optional(&dir.join(TEMPERATURE_FILE))?,
            thresholds: read_optional(&dir.join(THRESHOLDS_FILE))?,
            labels,
        };
        bundle.verify(dir)?;
        info!(
            "Loaded calibration bundle from {} (baselines: {}, temperature: {}, thresholds: {})",
            dir.display(),
            bundle.baselines.is_some(),
            bundle.temperature.is_some(),
            bundle.thresholds.is_some()
        );
        Ok(bundle)
    }

    /// Check label agreement of every present artifact.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        if let Some(baselines) = &self.baselines {
            baselines.check_labels(&self.labels, &dir.join(BASELINES_FILE))?;
        }
        if let Some(temperature) = &self.temperature {
            temperature.check_labels(&self.labels, &dir.join(TEMPERATURE_FILE))?;
        }
        if let Some(thresholds) = &self.thresholds {
            thresholds.check_labels(&self.labels, &dir.join(THRESHOLDS_FILE))?;
        }
        Ok(())
    }

    /// Make `dir` hold exactly this bundle: present artifacts are written,
    /// absent ones are deleted from disk.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.verify(dir)?;
        self.labels.save(dir)?;
        match &self.baselines {
            Some(baselines) => write_json_atomic(&dir.join(BASELINES_FILE), baselines)?,
            None => {
                remove_if_present(&dir.join(BASELINES_FILE))?;
            }
        }
        match &self.temperature {
            Some(temperature) => write_json_atomic(&dir.join(TEMPERATURE_FILE), temperature)?,
            None => {
                remove_if_present(&dir.join(TEMPERATURE_FILE))?;
            }
        }
        match &self.thresholds {
            Some(thresholds) => write_json_atomic(&dir.join(THRESHOLDS_FILE), thresholds)?,
            None => {
                remove_if_present(&dir.join(THRESHOLDS_FILE))?;
            }
        }
        Ok(())
    }

    /// Delete every calibration artifact in `dir`, e.g. before new weights land there.
    ///
    /// Returns how many files were removed.
    pub fn clear(dir: &Path) -> Result<usize> {
        let mut removed = 0;
        for file in CALIBRATION_FILES {
            if remove_if_present(&dir.join(file))? {
                warn!("Removed stale {} from {}", file, dir.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}
