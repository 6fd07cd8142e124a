//! Inference and label-manifest handlers.

use anyhow::{Context, Result};

use crate::classifier::{ClassifierService, EmotionClassifier, LocalClassifierService};
use crate::cli::output::{
    fmt_opt, output_json, print_header, print_hint, print_kv, print_table, OutputMode,
};
use crate::config::Config;
use crate::encoder::select_device;
use crate::labels::LabelSet;

pub async fn handle_predict(config: &Config, texts: Vec<String>, mode: OutputMode) -> Result<()> {
    let dir = config.paths.final_model_dir();
    let categories = config.model.categories.clone();
    let batch_size = config.evaluation.eval_batch_size;
    let classifier = tokio::task::spawn_blocking(move || {
        EmotionClassifier::load(&dir, &select_device())
            .and_then(|c| c.with_categories(&categories))
            .map(|c| c.with_batch_size(batch_size))
    })
    .await
    .context("classifier loader panicked")??;

    let service = LocalClassifierService::new(classifier);
    let predictions = service.predict(texts).await?;

    if mode == OutputMode::Json {
        output_json(&predictions)?;
        return Ok(());
    }
    for p in &predictions {
        print_header(&p.text);
        print_kv("dominant", &format!("{} ({:.3})", p.dominant, p.confidence));
        print_kv(
            "intensity",
            &format!("{:.3} (z {})", p.intensity, fmt_opt(p.intensity_z, 2)),
        );
        if let Some(category) = &p.category {
            print_kv("category", &category.primary);
        }
        let rows = p
            .scores
            .iter()
            .map(|s| {
                vec![
                    s.label.clone(),
                    format!("{:.4}", s.score),
                    fmt_opt(s.deviation, 3),
                    match s.notable {
                        Some(true) => "*".to_string(),
                        _ => String::new(),
                    },
                ]
            })
            .collect();
        print_table(&["Label", "Score", "Deviation", ""], rows);
    }
    Ok(())
}

pub fn handle_labels(config: &Config, mode: OutputMode) -> Result<()> {
    let dir = config.paths.final_model_dir();
    let labels = LabelSet::load(&dir)
        .with_context(|| format!("no label manifest in {}", dir.display()))?;

    if mode == OutputMode::Json {
        output_json(&labels.names())?;
        return Ok(());
    }
    let rows = labels
        .names()
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let parents: Vec<&str> = config
                .model
                .categories
                .iter()
                .filter(|(_, members)| members.contains(name))
                .map(|(parent, _)| parent.as_str())
                .collect();
            vec![i.to_string(), name.clone(), parents.join(", ")]
        })
        .collect();
    print_table(&["#", "Label", "Category"], rows);
    if config.model.categories.is_empty() {
        print_hint("No category roll-up configured (model.categories).");
    }
    Ok(())
}
