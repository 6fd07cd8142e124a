//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;

use affectus::config::{
    CommonTrainingConfig, LossConfig, SchedulerKind, StageConfig, TrainingConfig,
};
use affectus::data::{Collator, Example};
use affectus::encoder::TokenEmbeddingEncoder;
use affectus::loss::CompositeLoss;
use affectus::model::{DualHeadModel, HeadPriors, Pooling};
use affectus::{LabelSet, TwoPhaseTrainer};
use candle_core::Device;
use tokenizers::Tokenizer;

const WORDS: &[&str] = &[
    "so", "happy", "today", "glad", "and", "joyful", "scared", "of", "the", "dark", "terrified",
    "at", "night", "but", "sun", "shines", "a", "quiet", "day", "afraid", "alone", "angry",
    "furious", "mad", "calm",
];

pub fn labels() -> LabelSet {
    LabelSet::new(vec!["joy".into(), "fear".into(), "anger".into()]).unwrap()
}

/// Lowercasing whitespace word-level tokenizer, `[PAD]` = 0.
pub fn word_level_tokenizer() -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[PAD]".into(), 0.into());
    vocab.insert("[UNK]".into(), 1.into());
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert((*word).into(), (i + 2).into());
    }
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

fn ex(text: &str, labels: [f32; 3], intensity: f32) -> Example {
    Example {
        text: text.into(),
        labels: labels.to_vec(),
        intensity,
    }
}

/// Twelve examples over `[joy, fear, anger]`, every label with both classes.
pub fn examples() -> Vec<Example> {
    vec![
        ex("so happy today", [1.0, 0.0, 0.0], 0.8),
        ex("glad and joyful", [1.0, 0.0, 0.0], 0.7),
        ex("scared of the dark", [0.0, 1.0, 0.0], 0.9),
        ex("terrified at night", [0.0, 1.0, 0.0], 0.6),
        ex("happy but scared", [1.0, 1.0, 0.0], 0.5),
        ex("the sun shines", [0.0, 0.0, 0.0], 0.0),
        ex("a quiet day", [0.0, 0.0, 0.0], 0.0),
        ex("afraid and alone", [0.0, 1.0, 0.0], 0.7),
        ex("so angry today", [0.0, 0.0, 1.0], 0.8),
        ex("furious and mad", [0.0, 0.0, 1.0], 0.9),
        ex("angry but afraid", [0.0, 1.0, 1.0], 0.6),
        ex("calm day", [0.0, 0.0, 0.0], 0.1),
    ]
}

pub fn stage(epochs: usize, lr: f64) -> StageConfig {
    StageConfig {
        learning_rate: lr,
        num_epochs: epochs,
        warmup_ratio: 0.1,
        lr_scheduler_type: SchedulerKind::Linear,
        early_stopping_patience: 3,
        early_stopping_threshold: 0.0,
        max_grad_norm: Some(1.0),
    }
}

pub fn training_config() -> TrainingConfig {
    TrainingConfig {
        common: CommonTrainingConfig {
            seed: 11,
            weight_decay: 0.01,
            train_batch_size: 4,
            eval_batch_size: 8,
            gradient_accumulation_steps: 1,
            intensity_loss_weight: 1.0,
            metric_loss_weight: 0.1,
            pos_weight_cap: 2.0,
            validation_fraction: 0.2,
            test_fraction: 0.0,
        },
        frozen: stage(2, 0.05),
        unfrozen: stage(2, 0.01),
        warm_start: None,
    }
}

pub fn model(priors: Option<&HeadPriors>) -> DualHeadModel {
    let device = Device::Cpu;
    let vocab = word_level_tokenizer().get_vocab_size(true);
    let encoder = TokenEmbeddingEncoder::new(vocab, 8, &device).unwrap();
    DualHeadModel::new(Box::new(encoder), 3, Pooling::Mean, priors, &device).unwrap()
}

pub fn trainer() -> TwoPhaseTrainer {
    let device = Device::Cpu;
    let collator = Collator::new(word_level_tokenizer(), 16, device.clone()).unwrap();
    let loss =
        CompositeLoss::new(&[1.0, 1.0, 1.0], LossConfig::default(), 1.0, 0.1, &device).unwrap();
    TwoPhaseTrainer::new(model(None), loss, collator, training_config())
}

/// Train on [`examples`] and finalize the snapshot into `dir`.
pub fn train_snapshot(dir: &Path) -> LabelSet {
    let data = examples();
    let mut t = trainer();
    t.fit(&data, &data).unwrap();
    let labels = labels();
    t.finalize(dir, &labels, None).unwrap();
    labels
}
