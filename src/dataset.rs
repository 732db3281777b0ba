use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single cell of tabular data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int(i) => Value::from(*i),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => write!(f, ""),
            CellValue::Bool(b) => write!(f, "{b}"),
            CellValue::Int(i) => write!(f, "{i}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A named column of cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<CellValue>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<CellValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// The tabular input a session operates on.
///
/// The orchestrator only ever borrows a `Dataset` read-only; the sandbox
/// builder serializes its own private copy before execution, so code run in
/// the sandbox can never reach this object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<Column>,
}

impl Dataset {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Convenience constructor used heavily by tests and demos.
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<CellValue>)>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, values)| Column::new(name, values))
                .collect(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    /// Export as a `{column: [values...]}` JSON object, the shape injected
    /// into the sandbox and consumed by the frame shim.
    pub fn to_column_map(&self) -> Value {
        let mut map = serde_json::Map::new();
        for column in &self.columns {
            map.insert(
                column.name.clone(),
                Value::Array(column.values.iter().map(CellValue::to_json).collect()),
            );
        }
        Value::Object(map)
    }

    /// First `n` rows rendered as a markdown table for prompt context.
    pub fn head_markdown(&self, n: usize) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        let names: Vec<&str> = self.column_names();
        out.push_str(&format!("| {} |\n", names.join(" | ")));
        out.push_str(&format!(
            "|{}\n",
            names.iter().map(|_| " --- |").collect::<String>()
        ));
        for row in 0..self.row_count().min(n) {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| {
                    c.values
                        .get(row)
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                })
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::from_columns(vec![
            (
                "a",
                vec![CellValue::Int(1), CellValue::Int(2), CellValue::Int(3)],
            ),
            (
                "b",
                vec![
                    CellValue::Float(1.5),
                    CellValue::Null,
                    CellValue::Float(3.5),
                ],
            ),
        ])
    }

    #[test]
    fn shape_accessors() {
        let ds = sample();
        assert_eq!(ds.row_count(), 3);
        assert_eq!(ds.column_count(), 2);
        assert_eq!(ds.column_names(), vec!["a", "b"]);
    }

    #[test]
    fn column_map_preserves_nulls() {
        let map = sample().to_column_map();
        assert_eq!(map["a"][0], serde_json::json!(1));
        assert!(map["b"][1].is_null());
    }

    #[test]
    fn head_markdown_limits_rows() {
        let md = sample().head_markdown(2);
        assert!(md.starts_with("| a | b |"));
        // header + separator + two data rows
        assert_eq!(md.trim_end().lines().count(), 4);
    }
}
