//! Examples, batches and the dataset plumbing around them.
//!
//! Datasets are JSON Lines files with one `{"text", "labels", "intensity"}`
//! record per line. Tokenization goes through [`Collator`], which pads each
//! batch to its longest sequence and keeps an attention mask so padding never
//! reaches the pooled representation.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info, warn};

use crate::error::{AffectError, Result};
use crate::labels::LabelSet;

/// One labelled text. `labels` is multi-hot over the dataset's [`LabelSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub text: String,
    pub labels: Vec<f32>,
    pub intensity: f32,
}

impl Example {
    pub fn is_neutral(&self) -> bool {
        self.labels.iter().all(|&v| v == 0.0)
    }
}

/// Record layout of a dataset line, before label encoding.
#[derive(Debug, Clone, Deserialize)]
pub struct RawExample {
    pub text: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub intensity: Option<f32>,
}

/// Inclusive bounds on intensity targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntensityRange {
    pub min: f32,
    pub max: f32,
}

impl Default for IntensityRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl IntensityRange {
    pub fn contains(&self, value: f32) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// What `read_jsonl` expects of the `intensity` field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntensityTargets {
    /// Every record carries an intensity inside the range.
    Required(IntensityRange),
    /// Labels only; any intensity present is discarded.
    Ignored,
}

/// Train/validation/test partition of a dataset.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Vec<Example>,
    pub validation: Vec<Example>,
    pub test: Vec<Example>,
}

/// Collated, device-resident batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[N, S]` u32 token ids, right-padded.
    pub input_ids: Tensor,
    /// `[N, S]` u32, 1 for real tokens.
    pub attention_mask: Tensor,
    /// `[N, L]` f32 multi-hot.
    pub labels: Tensor,
    /// `[N]` f32 intensity targets.
    pub intensity: Tensor,
}

impl Batch {
    /// Pad pre-tokenized sequences and stack labels/intensity.
    pub fn from_token_ids(
        token_ids: &[Vec<u32>],
        examples: &[&Example],
        pad_id: u32,
        device: &Device,
    ) -> Result<Self> {
        if token_ids.is_empty() {
            return Err(AffectError::Data("cannot collate an empty batch".into()));
        }
        if token_ids.len() != examples.len() {
            return Err(AffectError::Data(format!(
                "{} token sequences for {} examples",
                token_ids.len(),
                examples.len()
            )));
        }
        let num_labels = examples[0].labels.len();
        if let Some(bad) = examples.iter().find(|e| e.labels.len() != num_labels) {
            return Err(AffectError::Data(format!(
                "label-count mismatch: expected {}, got {} for '{}'",
                num_labels,
                bad.labels.len(),
                bad.text
            )));
        }

        let n = token_ids.len();
        let max_len = token_ids.iter().map(Vec::len).max().unwrap_or(0);
        if max_len == 0 || token_ids.iter().any(Vec::is_empty) {
            return Err(AffectError::Data(
                "every example needs at least one token".into(),
            ));
        }

        let mut ids = Vec::with_capacity(n * max_len);
        let mut mask = Vec::with_capacity(n * max_len);
        for seq in token_ids {
            ids.extend_from_slice(seq);
            ids.extend(std::iter::repeat(pad_id).take(max_len - seq.len()));
            mask.extend(std::iter::repeat(1u32).take(seq.len()));
            mask.extend(std::iter::repeat(0u32).take(max_len - seq.len()));
        }
        let labels: Vec<f32> = examples.iter().flat_map(|e| e.labels.clone()).collect();
        let intensity: Vec<f32> = examples.iter().map(|e| e.intensity).collect();

        Ok(Self {
            input_ids: Tensor::from_vec(ids, (n, max_len), device)?,
            attention_mask: Tensor::from_vec(mask, (n, max_len), device)?,
            labels: Tensor::from_vec(labels, (n, num_labels), device)?,
            intensity: Tensor::from_vec(intensity, n, device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tokenizes and pads examples into [`Batch`]es.
pub struct Collator {
    tokenizer: Tokenizer,
    pad_id: u32,
    device: Device,
}

impl Collator {
    /// Configure `tokenizer` for truncation at `max_length` and longest-in-batch padding.
    pub fn new(mut tokenizer: Tokenizer, max_length: usize, device: Device) -> Result<Self> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| AffectError::Tokenizer(format!("Failed to set truncation: {}", e)))?;
        let padding = tokenizer.get_padding().cloned().unwrap_or_default();
        let pad_id = padding.pad_id;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..padding
        }));
        Ok(Self {
            tokenizer,
            pad_id,
            device,
        })
    }

    pub fn from_file(path: &Path, max_length: usize, device: Device) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            AffectError::Tokenizer(format!("Failed to load {}: {}", path.display(), e))
        })?;
        Self::new(tokenizer, max_length, device)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Tokenize raw strings into `(input_ids, attention_mask)`.
    ///
    /// `encode_batch` fans out across cores and preserves input order.
    pub fn encode_texts(&self, texts: &[&str]) -> Result<(Tensor, Tensor)> {
        if texts.is_empty() {
            return Err(AffectError::Data("no texts to encode".into()));
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| AffectError::Tokenizer(format!("Tokenization failed: {}", e)))?;

        let batch_size = encodings.len();
        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);

        let input_ids: Vec<u32> = encodings
            .iter()
            .flat_map(|e| e.get_ids().to_vec())
            .collect();
        let attention_mask: Vec<u32> = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().to_vec())
            .collect();

        let input_ids = Tensor::from_vec(input_ids, (batch_size, max_len), &self.device)?;
        let attention_mask = Tensor::from_vec(attention_mask, (batch_size, max_len), &self.device)?;
        Ok((input_ids, attention_mask))
    }

    pub fn collate(&self, examples: &[&Example]) -> Result<Batch> {
        let texts: Vec<&str> = examples.iter().map(|e| e.text.as_str()).collect();
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| AffectError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        // Strip tokenizer padding so `from_token_ids` owns the mask layout.
        let token_ids: Vec<Vec<u32>> = encodings
            .iter()
            .map(|e| {
                e.get_ids()
                    .iter()
                    .zip(e.get_attention_mask())
                    .filter(|(_, &m)| m == 1)
                    .map(|(&id, _)| id)
                    .collect()
            })
            .collect();
        Batch::from_token_ids(&token_ids, examples, self.pad_id, &self.device)
    }
}

/// Parse a JSON Lines dataset. Blank lines are skipped; anything else malformed
/// is a [`AffectError::Data`] naming the line.
pub fn read_jsonl(path: &Path, targets: IntensityTargets) -> Result<Vec<RawExample>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        AffectError::Data(format!("Failed to read dataset {}: {}", path.display(), e))
    })?;
    let bad_line = |lineno: usize, msg: String| {
        AffectError::Data(format!("{}:{}: {}", path.display(), lineno + 1, msg))
    };

    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut record: RawExample =
            serde_json::from_str(line).map_err(|e| bad_line(lineno, e.to_string()))?;
        if record.text.trim().is_empty() {
            return Err(bad_line(lineno, "empty text".into()));
        }
        match targets {
            IntensityTargets::Required(range) => match record.intensity {
                None => return Err(bad_line(lineno, "missing intensity".into())),
                Some(v) if !range.contains(v) => {
                    return Err(bad_line(
                        lineno,
                        format!("intensity {} outside [{}, {}]", v, range.min, range.max),
                    ));
                }
                Some(_) => {}
            },
            IntensityTargets::Ignored => record.intensity = None,
        }
        records.push(record);
    }
    if records.is_empty() {
        return Err(AffectError::Data(format!(
            "dataset {} has no records",
            path.display()
        )));
    }
    info!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Resolve the label set: pinned order wins, otherwise the sorted union of names.
pub fn resolve_labels(raw: &[RawExample], pinned: Option<&[String]>) -> Result<LabelSet> {
    match pinned {
        Some(names) => LabelSet::new(names.to_vec()),
        None => LabelSet::from_names(
            raw.iter()
                .flat_map(|r| r.labels.iter().map(String::as_str)),
        ),
    }
}

/// Multi-hot encode raw records against `labels`.
pub fn encode_examples(raw: Vec<RawExample>, labels: &LabelSet) -> Result<Vec<Example>> {
    raw.into_iter()
        .map(|r| {
            Ok(Example {
                labels: labels.encode(&r.labels)?,
                text: r.text,
                intensity: r.intensity.unwrap_or(0.0),
            })
        })
        .collect()
}

const TRAIN: usize = 0;
const VALIDATION: usize = 1;
const TEST: usize = 2;
const SPLIT_NAMES: [&str; 3] = ["train", "validation", "test"];

fn positives(example: &Example) -> impl Iterator<Item = usize> + '_ {
    example
        .labels
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0)
        .map(|(l, _)| l)
}

/// Seeded multi-label stratified split into train/validation/test.
///
/// Sizes are exact: `round(n * fraction)` for validation and test, the rest
/// for train. Positives are dealt out rarest label first, each to the split
/// that still wants the most of that label. Every label with at least two
/// positives ends up in both train and validation whenever a swap can make
/// that happen.
pub fn split_dataset(
    examples: Vec<Example>,
    validation_fraction: f64,
    test_fraction: f64,
    seed: u64,
) -> Result<DatasetSplits> {
    let n = examples.len();
    let n_test = (n as f64 * test_fraction).round() as usize;
    let n_val = (n as f64 * validation_fraction).round() as usize;
    if n_test + n_val >= n {
        return Err(AffectError::Data(format!(
            "{} examples are too few for validation={} test={}",
            n, validation_fraction, test_fraction
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);

    let capacity = [n - n_val - n_test, n_val, n_test];
    let mut fold = stratify(&examples, &order, capacity, &mut rng);
    cover_rare_labels(&examples, &order, &mut fold);

    let mut slots: Vec<Option<Example>> = examples.into_iter().map(Some).collect();
    let mut splits = capacity.map(Vec::with_capacity);
    for &i in &order {
        if let Some(example) = slots[i].take() {
            splits[fold[i]].push(example);
        }
    }
    let [train, validation, test] = splits;
    debug!(
        "Split {} examples into {}/{}/{}",
        n,
        train.len(),
        validation.len(),
        test.len()
    );
    Ok(DatasetSplits {
        train,
        validation,
        test,
    })
}

/// Split index per example, filling each split to exactly `capacity`.
fn stratify(
    examples: &[Example],
    order: &[usize],
    capacity: [usize; 3],
    rng: &mut StdRng,
) -> Vec<usize> {
    let n = examples.len();
    let num_labels = examples.first().map_or(0, |e| e.labels.len());
    let mut totals = vec![0usize; num_labels];
    for example in examples {
        for l in positives(example) {
            totals[l] += 1;
        }
    }

    let ratios = capacity.map(|c| c as f64 / n as f64);
    let mut desired: Vec<[f64; 3]> = totals
        .iter()
        .map(|&total| {
            let mut want = ratios.map(|r| total as f64 * r);
            if total >= 2 {
                for f in [TRAIN, VALIDATION] {
                    if capacity[f] > 0 {
                        want[f] = want[f].max(1.0);
                    }
                }
            }
            want
        })
        .collect();

    let mut remaining = capacity;
    let mut fold: Vec<Option<usize>> = vec![None; n];
    loop {
        let mut pending = vec![0usize; num_labels];
        for &i in order {
            if fold[i].is_none() {
                for l in positives(&examples[i]) {
                    pending[l] += 1;
                }
            }
        }
        let Some(label) = (0..num_labels)
            .filter(|&l| pending[l] > 0)
            .min_by_key(|&l| pending[l])
        else {
            break;
        };

        for &i in order {
            if fold[i].is_some() || examples[i].labels[label] <= 0.0 {
                continue;
            }
            let f = pick_fold(&desired[label], &remaining, rng);
            fold[i] = Some(f);
            remaining[f] -= 1;
            for l in positives(&examples[i]) {
                desired[l][f] -= 1.0;
            }
        }
    }

    // neutral examples fill whatever room is left
    for &i in order {
        if fold[i].is_none() {
            let f = pick_fold(&[0.0; 3], &remaining, rng);
            fold[i] = Some(f);
            remaining[f] -= 1;
        }
    }
    fold.into_iter().map(|f| f.unwrap_or(TRAIN)).collect()
}

/// Open split wanting the label most; ties go to the roomiest, then to chance.
fn pick_fold(desired: &[f64; 3], remaining: &[usize; 3], rng: &mut StdRng) -> usize {
    let open: Vec<usize> = (0..3).filter(|&f| remaining[f] > 0).collect();
    let top = open
        .iter()
        .map(|&f| desired[f])
        .fold(f64::NEG_INFINITY, f64::max);
    let wanted: Vec<usize> = open.into_iter().filter(|&f| desired[f] == top).collect();
    let room = wanted.iter().map(|&f| remaining[f]).max().unwrap_or(0);
    let tied: Vec<usize> = wanted
        .into_iter()
        .filter(|&f| remaining[f] == room)
        .collect();
    tied.choose(rng).copied().unwrap_or(TRAIN)
}

/// Whether moving `example` out of split `from` keeps every multi-positive
/// label it carries present in train and validation.
fn can_leave(example: &Example, from: usize, counts: &[[usize; 3]], totals: &[usize]) -> bool {
    from == TEST || positives(example).all(|l| totals[l] < 2 || counts[l][from] >= 2)
}

/// Swap examples between splits until each label with two or more positives
/// appears in both train and validation.
fn cover_rare_labels(examples: &[Example], order: &[usize], fold: &mut [usize]) {
    let num_labels = examples.first().map_or(0, |e| e.labels.len());
    let mut counts = vec![[0usize; 3]; num_labels];
    for (i, example) in examples.iter().enumerate() {
        for l in positives(example) {
            counts[l][fold[i]] += 1;
        }
    }
    let totals: Vec<usize> = counts.iter().map(|c| c.iter().sum()).collect();

    for label in 0..num_labels {
        if totals[label] < 2 {
            continue;
        }
        for need in [TRAIN, VALIDATION] {
            if counts[label][need] > 0 {
                continue;
            }
            let donor = order.iter().copied().find(|&i| {
                fold[i] != need
                    && examples[i].labels[label] > 0.0
                    && can_leave(&examples[i], fold[i], &counts, &totals)
            });
            let partner = order
                .iter()
                .copied()
                .filter(|&i| {
                    fold[i] == need
                        && examples[i].labels[label] <= 0.0
                        && can_leave(&examples[i], need, &counts, &totals)
                })
                .min_by_key(|&i| positives(&examples[i]).count());

            let (Some(donor), Some(partner)) = (donor, partner) else {
                warn!(
                    "Label {} has {} positives but none can be moved into the {} split",
                    label, totals[label], SPLIT_NAMES[need]
                );
                continue;
            };
            let from = fold[donor];
            for l in positives(&examples[donor]) {
                counts[l][from] -= 1;
                counts[l][need] += 1;
            }
            for l in positives(&examples[partner]) {
                counts[l][need] -= 1;
                counts[l][from] += 1;
            }
            fold[donor] = need;
            fold[partner] = from;
        }
    }
}

/// Per-label log-odds of the empirical positive rate, used to seed the emotion head bias.
pub fn label_prior_logits(examples: &[Example]) -> Result<Vec<f32>> {
    let first = examples
        .first()
        .ok_or_else(|| AffectError::Data("cannot compute priors of an empty dataset".into()))?;
    let num_labels = first.labels.len();
    let mut counts = vec![0.0f64; num_labels];
    for ex in examples {
        for (c, &v) in counts.iter_mut().zip(&ex.labels) {
            *c += v as f64;
        }
    }
    let n = examples.len() as f64;
    Ok(counts
        .into_iter()
        .map(|c| {
            let p = (c / n).max(1e-5);
            (p / (1.0 - p + 1e-5)).ln() as f32
        })
        .collect())
}

/// Lower median of the intensity targets, used to seed the intensity head bias.
pub fn intensity_median(examples: &[Example]) -> Result<f32> {
    if examples.is_empty() {
        return Err(AffectError::Data(
            "cannot compute the intensity median of an empty dataset".into(),
        ));
    }
    let mut values: Vec<f32> = examples.iter().map(|e| e.intensity).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(values[(values.len() - 1) / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn required() -> IntensityTargets {
        IntensityTargets::Required(IntensityRange::default())
    }

    fn ex(labels: &[f32], intensity: f32) -> Example {
        Example {
            text: "some text".into(),
            labels: labels.to_vec(),
            intensity,
        }
    }

    #[test]
    fn test_from_token_ids_pads_and_masks() {
        let a = ex(&[1.0, 0.0], 0.8);
        let b = ex(&[0.0, 0.0], 0.0);
        let batch =
            Batch::from_token_ids(&[vec![5, 6, 7], vec![9]], &[&a, &b], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![9, 0, 0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        assert_eq!(batch.labels.dims(), &[2, 2]);
        assert_eq!(batch.intensity.to_vec1::<f32>().unwrap(), vec![0.8, 0.0]);
    }

    #[test]
    fn test_from_token_ids_rejects_label_mismatch() {
        let a = ex(&[1.0, 0.0], 0.8);
        let b = ex(&[0.0], 0.0);
        let err =
            Batch::from_token_ids(&[vec![1], vec![2]], &[&a, &b], 0, &Device::Cpu).unwrap_err();
        assert!(matches!(err, AffectError::Data(_)));
    }

    #[test]
    fn test_from_token_ids_rejects_empty_batch() {
        assert!(Batch::from_token_ids(&[], &[], 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_read_jsonl_and_encode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"text": "I am thrilled", "labels": ["happy", "excited"], "intensity": 0.9}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"text": "The bus came", "labels": [], "intensity": 0.0}}"#).unwrap();
        let raw = read_jsonl(file.path(), required()).unwrap();
        assert_eq!(raw.len(), 2);

        let labels = resolve_labels(&raw, None).unwrap();
        assert_eq!(labels.names(), &["excited", "happy"]);
        let examples = encode_examples(raw, &labels).unwrap();
        assert_eq!(examples[0].labels, vec![1.0, 1.0]);
        assert!(examples[1].is_neutral());
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "ok", "labels": [], "intensity": 0.1}}"#).unwrap();
        writeln!(file, r#"{{"text": "broken""#).unwrap();
        let err = read_jsonl(file.path(), required()).unwrap_err();
        assert!(err.to_string().contains(":2:"), "got {err}");
    }

    #[test]
    fn test_read_jsonl_rejects_out_of_range_intensity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "fine", "labels": [], "intensity": 1.0}}"#).unwrap();
        writeln!(file, r#"{{"text": "loud", "labels": [], "intensity": 1.5}}"#).unwrap();
        let err = read_jsonl(file.path(), required()).unwrap_err();
        assert!(matches!(err, AffectError::Data(_)));
        assert!(err.to_string().contains(":2: intensity 1.5"), "got {err}");

        let wide = IntensityTargets::Required(IntensityRange {
            min: -2.0,
            max: 2.0,
        });
        assert_eq!(read_jsonl(file.path(), wide).unwrap().len(), 2);
    }

    #[test]
    fn test_read_jsonl_intensity_presence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "no score here", "labels": ["joy"]}}"#).unwrap();
        let err = read_jsonl(file.path(), required()).unwrap_err();
        assert!(err.to_string().contains(":1: missing intensity"), "got {err}");

        let raw = read_jsonl(file.path(), IntensityTargets::Ignored).unwrap();
        assert_eq!(raw[0].intensity, None);
        let labels = resolve_labels(&raw, None).unwrap();
        assert_eq!(encode_examples(raw, &labels).unwrap()[0].intensity, 0.0);
    }

    #[test]
    fn test_pinned_labels_reject_unknown_names() {
        let raw = vec![RawExample {
            text: "hmm".into(),
            labels: vec!["bored".into()],
            intensity: Some(0.3),
        }];
        let labels = resolve_labels(&raw, Some(&["happy".to_string()])).unwrap();
        assert!(encode_examples(raw, &labels).is_err());
    }

    #[test]
    fn test_split_is_deterministic_and_disjoint() {
        let examples: Vec<Example> = (0..100)
            .map(|i| Example {
                text: format!("text {i}"),
                labels: vec![(i % 2) as f32],
                intensity: i as f32 / 100.0,
            })
            .collect();
        let a = split_dataset(examples.clone(), 0.15, 0.15, 7).unwrap();
        let b = split_dataset(examples, 0.15, 0.15, 7).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.validation.len(), 15);
        assert_eq!(a.test.len(), 15);
        assert_eq!(a.train.len(), 70);
        assert!(a
            .test
            .iter()
            .all(|t| !a.train.iter().any(|tr| tr.text == t.text)));
    }

    fn skewed_dataset() -> Vec<Example> {
        // label 0: 12 positives, label 1: 3, label 2: 2, rest neutral
        (0..30)
            .map(|i| Example {
                text: format!("text {i}"),
                labels: vec![
                    if i % 5 < 2 { 1.0 } else { 0.0 },
                    if [3, 11, 22].contains(&i) { 1.0 } else { 0.0 },
                    if [7, 19].contains(&i) { 1.0 } else { 0.0 },
                ],
                intensity: 0.5,
            })
            .collect()
    }

    fn label_count(split: &[Example], label: usize) -> usize {
        split.iter().filter(|e| e.labels[label] > 0.0).count()
    }

    #[test]
    fn test_split_keeps_rare_labels_in_train_and_validation() {
        for seed in 0..20 {
            let splits = split_dataset(skewed_dataset(), 0.2, 0.2, seed).unwrap();
            assert_eq!(splits.train.len(), 18);
            assert_eq!(splits.validation.len(), 6);
            assert_eq!(splits.test.len(), 6);
            for label in 0..3 {
                assert!(label_count(&splits.train, label) > 0, "seed {seed} label {label}");
                assert!(
                    label_count(&splits.validation, label) > 0,
                    "seed {seed} label {label}"
                );
            }
            let texts: HashSet<&str> = splits
                .train
                .iter()
                .chain(&splits.validation)
                .chain(&splits.test)
                .map(|e| e.text.as_str())
                .collect();
            assert_eq!(texts.len(), 30);
        }
    }

    #[test]
    fn test_split_swaps_to_cover_validation() {
        let examples = skewed_dataset();
        let order: Vec<usize> = (0..examples.len()).collect();
        // both label-2 positives (7, 19) start in train
        let mut fold: Vec<usize> = (0..examples.len())
            .map(|i| match i {
                7 | 19 => TRAIN,
                i if i % 5 == 4 => VALIDATION,
                _ => TRAIN,
            })
            .collect();
        fn in_validation(fold: &[usize]) -> usize {
            fold.iter().filter(|&&f| f == VALIDATION).count()
        }
        let before = in_validation(&fold);

        cover_rare_labels(&examples, &order, &mut fold);
        assert!([7, 19].iter().any(|&i| fold[i] == VALIDATION));
        assert!([7, 19].iter().any(|&i| fold[i] == TRAIN));
        assert_eq!(in_validation(&fold), before);
    }

    #[test]
    fn test_prior_logits_and_median() {
        let examples = vec![
            ex(&[1.0, 0.0], 0.2),
            ex(&[1.0, 0.0], 0.9),
            ex(&[0.0, 0.0], 0.4),
            ex(&[1.0, 0.0], 0.6),
        ];
        let priors = label_prior_logits(&examples).unwrap();
        let expected = (0.75f64 / (0.25 + 1e-5)).ln() as f32;
        assert!((priors[0] - expected).abs() < 1e-5);
        assert!(priors[1].is_finite() && priors[1] < -10.0);
        assert_eq!(intensity_median(&examples).unwrap(), 0.4);
    }
}
