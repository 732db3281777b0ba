//! Dataset profiling: per-column semantic types, null/unique counts and
//! summary statistics, plus the text rendering fed into generation prompts.

use crate::dataset::{CellValue, Column, Dataset};
use serde::Serialize;
use std::collections::HashSet;

/// Semantic column type, inferred from the values rather than declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    Datetime,
    Boolean,
    Text,
}

impl ColumnKind {
    pub fn label(&self) -> &'static str {
        match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Datetime => "datetime",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NumericStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub q25: f64,
    pub q75: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatetimeStats {
    pub min: String,
    pub max: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub null_count: usize,
    pub null_pct: f64,
    pub unique_count: usize,
    pub sample_values: Vec<String>,
    pub numeric: Option<NumericStats>,
    pub datetime: Option<DatetimeStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataProfile {
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<ColumnProfile>,
}

const SAMPLE_VALUES: usize = 5;

pub fn profile_dataset(dataset: &Dataset) -> DataProfile {
    DataProfile {
        row_count: dataset.row_count(),
        column_count: dataset.column_count(),
        columns: dataset.columns().iter().map(profile_column).collect(),
    }
}

fn profile_column(column: &Column) -> ColumnProfile {
    let total = column.values.len().max(1);
    let null_count = column.values.iter().filter(|v| v.is_null()).count();
    let non_null: Vec<&CellValue> = column.values.iter().filter(|v| !v.is_null()).collect();

    let mut unique = HashSet::new();
    for value in &non_null {
        unique.insert(value.to_string());
    }

    let sample_values: Vec<String> = {
        let mut seen = HashSet::new();
        non_null
            .iter()
            .filter(|v| seen.insert(v.to_string()))
            .take(SAMPLE_VALUES)
            .map(|v| v.to_string())
            .collect()
    };

    let kind = infer_column_kind(&non_null, unique.len(), column.values.len());
    let numeric = (kind == ColumnKind::Numeric).then(|| numeric_stats(&non_null));
    let datetime = (kind == ColumnKind::Datetime).then(|| datetime_stats(&non_null));

    ColumnProfile {
        name: column.name.clone(),
        kind,
        null_count,
        null_pct: round1(null_count as f64 * 100.0 / total as f64),
        unique_count: unique.len(),
        sample_values,
        numeric,
        datetime,
    }
}

fn infer_column_kind(non_null: &[&CellValue], unique: usize, total: usize) -> ColumnKind {
    if non_null.is_empty() {
        return ColumnKind::Text;
    }

    let all_bool = non_null.iter().all(|v| matches!(v, CellValue::Bool(_)));
    let zero_one = non_null
        .iter()
        .all(|v| matches!(v, CellValue::Int(0) | CellValue::Int(1)));
    if (all_bool || zero_one) && unique <= 2 {
        return ColumnKind::Boolean;
    }

    if non_null.iter().all(|v| v.as_f64().is_some()) {
        return ColumnKind::Numeric;
    }

    if non_null.iter().all(|v| {
        v.as_text().map(looks_like_date).unwrap_or(false)
    }) {
        return ColumnKind::Datetime;
    }

    // Categorical vs free text: low cardinality reads as categories.
    let unique_ratio = unique as f64 / total.max(1) as f64;
    if unique_ratio < 0.5 || unique <= 50 {
        ColumnKind::Categorical
    } else {
        ColumnKind::Text
    }
}

/// ISO-8601 shaped prefix (`YYYY-MM-DD`), which also makes lexicographic
/// min/max correct for the datetime range.
fn looks_like_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

fn numeric_stats(non_null: &[&CellValue]) -> NumericStats {
    let mut values: Vec<f64> = non_null.iter().filter_map(|v| v.as_f64()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    if values.is_empty() {
        return NumericStats {
            mean: 0.0,
            median: 0.0,
            std: 0.0,
            min: 0.0,
            max: 0.0,
            q25: 0.0,
            q75: 0.0,
        };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    NumericStats {
        mean: round2(mean),
        median: round2(quantile(&values, 0.5)),
        std: round2(variance.sqrt()),
        min: round2(values[0]),
        max: round2(values[values.len() - 1]),
        q25: round2(quantile(&values, 0.25)),
        q75: round2(quantile(&values, 0.75)),
    }
}

fn datetime_stats(non_null: &[&CellValue]) -> DatetimeStats {
    let mut texts: Vec<&str> = non_null.iter().filter_map(|v| v.as_text()).collect();
    texts.sort_unstable();
    DatetimeStats {
        min: texts.first().copied().unwrap_or_default().to_string(),
        max: texts.last().copied().unwrap_or_default().to_string(),
    }
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let position = q * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    let fraction = position - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * fraction
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Render a profile as the compact text block embedded in prompts.
pub fn profile_to_text_summary(profile: &DataProfile) -> String {
    let mut lines = vec![format!(
        "Dataset: {} rows x {} columns",
        profile.row_count, profile.column_count
    )];
    lines.push("Columns:".to_string());

    for column in &profile.columns {
        let mut parts = vec![format!("  - {} ({})", column.name, column.kind.label())];

        let mut null_info = format!("{} nulls", column.null_count);
        if column.null_pct > 0.0 {
            null_info.push_str(&format!(" ({}%)", column.null_pct));
        }
        parts.push(null_info);
        parts.push(format!("{} unique", column.unique_count));

        if let Some(stats) = &column.numeric {
            parts.push(format!(
                "range {}-{}, mean {}",
                stats.min, stats.max, stats.mean
            ));
        }
        if let Some(stats) = &column.datetime {
            parts.push(format!("from {} to {}", stats.min, stats.max));
        }
        if !column.sample_values.is_empty()
            && matches!(column.kind, ColumnKind::Categorical | ColumnKind::Text)
        {
            parts.push(format!("e.g. [{}]", column.sample_values.join(", ")));
        }

        lines.push(parts.join(", "));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    fn text(values: &[&str]) -> Vec<CellValue> {
        values.iter().map(|v| CellValue::Text(v.to_string())).collect()
    }

    #[test]
    fn infers_numeric_with_stats() {
        let ds = Dataset::from_columns(vec![(
            "revenue",
            vec![
                CellValue::Int(10),
                CellValue::Int(20),
                CellValue::Float(30.0),
                CellValue::Null,
            ],
        )]);
        let profile = profile_dataset(&ds);
        let column = &profile.columns[0];
        assert_eq!(column.kind, ColumnKind::Numeric);
        assert_eq!(column.null_count, 1);
        assert_eq!(column.null_pct, 25.0);
        let stats = column.numeric.as_ref().unwrap();
        assert_eq!(stats.mean, 20.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.median, 20.0);
    }

    #[test]
    fn infers_datetime_from_iso_strings() {
        let ds = Dataset::from_columns(vec![(
            "day",
            text(&["2026-01-03", "2026-01-01", "2026-01-02"]),
        )]);
        let column = &profile_dataset(&ds).columns[0];
        assert_eq!(column.kind, ColumnKind::Datetime);
        let stats = column.datetime.as_ref().unwrap();
        assert_eq!(stats.min, "2026-01-01");
        assert_eq!(stats.max, "2026-01-03");
    }

    #[test]
    fn infers_boolean_and_categorical() {
        let ds = Dataset::from_columns(vec![
            (
                "active",
                vec![CellValue::Bool(true), CellValue::Bool(false)],
            ),
            ("region", text(&["North", "South", "North", "East"])),
        ]);
        let profile = profile_dataset(&ds);
        assert_eq!(profile.columns[0].kind, ColumnKind::Boolean);
        assert_eq!(profile.columns[1].kind, ColumnKind::Categorical);
        assert_eq!(profile.columns[1].unique_count, 3);
    }

    #[test]
    fn text_summary_mentions_shape_and_columns() {
        let ds = Dataset::from_columns(vec![
            ("a", vec![CellValue::Int(1), CellValue::Int(2)]),
            ("label", text(&["x", "y"])),
        ]);
        let summary = profile_to_text_summary(&profile_dataset(&ds));
        assert!(summary.starts_with("Dataset: 2 rows x 2 columns"));
        assert!(summary.contains("a (numeric)"));
        assert!(summary.contains("label (categorical)"));
    }
}
