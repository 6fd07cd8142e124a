//! Shared fixtures for unit tests.

use tokenizers::Tokenizer;

use crate::data::Example;

const WORDS: &[&str] = &[
    "so", "happy", "today", "glad", "and", "joyful", "scared", "of", "the", "dark", "terrified",
    "at", "night", "but", "sun", "shines", "a", "quiet", "day", "afraid", "alone",
];

/// Lowercasing whitespace word-level tokenizer over a fixed vocabulary.
pub(crate) fn word_level_tokenizer() -> Tokenizer {
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

fn ex(text: &str, labels: [f32; 2], intensity: f32) -> Example {
    Example {
        text: text.into(),
        labels: labels.to_vec(),
        intensity,
    }
}

/// Eight examples over `[joy, fear]`, both classes present for each label.
pub(crate) fn tiny_examples() -> Vec<Example> {
    vec![
        ex("so happy today", [1.0, 0.0], 0.8),
        ex("glad and joyful", [1.0, 0.0], 0.7),
        ex("scared of the dark", [0.0, 1.0], 0.9),
        ex("terrified at night", [0.0, 1.0], 0.6),
        ex("happy but scared", [1.0, 1.0], 0.5),
        ex("the sun shines", [0.0, 0.0], 0.0),
        ex("a quiet day", [0.0, 0.0], 0.0),
        ex("afraid and alone", [0.0, 1.0], 0.7),
    ]
}
