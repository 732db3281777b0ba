use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The visualization artifact a successful execution must bind to the output
/// variable: a Plotly-JSON shaped object with a list of traces and a layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub data: Vec<Value>,
    pub layout: Value,
}

impl Figure {
    /// Build from the `{"data": [...], "layout": {...}}` value the sandbox
    /// hands back. Returns `None` when the value is not figure-shaped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let data = value.get("data")?.as_array()?.clone();
        let layout = value.get("layout").cloned().unwrap_or(Value::Null);
        Some(Self { data, layout })
    }

    pub fn trace_count(&self) -> usize {
        self.data.len()
    }

    /// Serialized form handed to the surrounding application for persistence
    /// and rendering.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"data\":[]}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_figure_shape() {
        let value = json!({"data": [{"type": "bar"}], "layout": {"title": "t"}});
        let fig = Figure::from_value(&value).unwrap();
        assert_eq!(fig.trace_count(), 1);
        assert_eq!(fig.layout["title"], "t");
    }

    #[test]
    fn from_value_rejects_non_figures() {
        assert!(Figure::from_value(&json!(1)).is_none());
        assert!(Figure::from_value(&json!({"layout": {}})).is_none());
    }
}
