//! Affectus: a dual-head emotion model (multi-label emotions plus intensity),
//! its two-stage trainer, and post-hoc calibration of the trained snapshot.

pub mod calibration;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod labels;
pub mod loss;
pub mod metrics;
pub mod miner;
pub mod model;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use classifier::{ClassifierService, EmotionClassifier, Prediction};
pub use config::Config;
pub use error::{AffectError, Result};
pub use labels::LabelSet;
pub use model::DualHeadModel;
pub use trainer::TwoPhaseTrainer;
