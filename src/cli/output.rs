//! Terminal rendering for command results.
//!
//! Every handler either prints one JSON document (`--json`) or a mix of
//! section headers, key/value lines and tables built here.

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::metrics::EvalMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

/// Pretty-printed JSON on stdout.
pub fn output_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("rendering JSON output")?;
    println!("{rendered}");
    Ok(())
}

fn rounded_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers);
    table
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    if rows.is_empty() {
        println!("{}", "(nothing to show)".dimmed());
        return;
    }
    let mut table = rounded_table(headers);
    table.add_rows(rows);
    println!("{table}");
}

pub fn print_success(msg: &str) {
    println!("{} {}", "done:".green().bold(), msg);
}

pub fn print_header(title: &str) {
    println!("\n{}", title.bold().underline());
}

/// Aligned `key  value` line under a header.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{:<20}", key).dimmed(), value);
}

pub fn print_hint(msg: &str) {
    println!("{} {}", "hint:".cyan(), msg);
}

/// `-` when absent.
pub fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.*}", precision, v))
}

/// Headline metrics plus one row per label AUC.
pub fn print_metrics(title: &str, metrics: &EvalMetrics, labels: &[String]) {
    print_header(title);
    let loss = metrics.loss;
    let lines = [
        ("examples", metrics.num_examples.to_string()),
        ("macro AUC", format!("{:.4}", metrics.macro_auc)),
        ("micro AUC", format!("{:.4}", metrics.micro_auc)),
        ("intensity Spearman", fmt_opt(metrics.intensity_spearman, 4)),
        ("loss", fmt_opt(loss, 4)),
    ];
    for (key, value) in lines {
        print_kv(key, &value);
    }
    println!();

    let rows = labels
        .iter()
        .zip(&metrics.per_label_auc)
        .map(|(name, auc)| vec![name.clone(), fmt_opt(*auc, 4)])
        .collect();
    print_table(&["Label", "AUC"], rows);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mode_from_flag() {
        assert_eq!(OutputMode::from_json_flag(true), OutputMode::Json);
        assert_eq!(OutputMode::from_json_flag(false), OutputMode::Human);
    }

    #[test]
    fn test_fmt_opt() {
        assert_eq!(fmt_opt(Some(0.123456), 3), "0.123");
        assert_eq!(fmt_opt(None, 3), "-");
    }

    #[test]
    fn test_output_json_accepts_serializable_values() {
        assert!(output_json(&serde_json::json!({"macro_auc": 0.5})).is_ok());
    }
}
