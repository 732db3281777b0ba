//! Prompt assembly for the generation client: system prompt, dataset context,
//! few-shot examples, and the refinement message carrying prior code plus the
//! capped error text.

use crate::llm::{ChatMessage, Role};

pub const SYSTEM_PROMPT: &str = "\
You are an expert data analyst and visualization assistant. Your job is to \
generate Python code that creates Plotly visualizations from pandas DataFrames.

RULES:
1. The user's data is already loaded into a pandas DataFrame called `df`. Do NOT load data from files.
2. You MUST create a plotly figure and assign it to a variable called `fig`.
3. Use `plotly.express` (imported as `px`) for simple charts, `plotly.graph_objects` (imported as `go`) for complex ones.
4. Available libraries: pandas (pd), numpy (np), plotly.express (px), plotly.graph_objects (go), make_subplots, datetime, math, statistics, json, re.
5. Do NOT use: os, sys, subprocess, requests, open(), exec(), eval(), or any file I/O.
6. Do NOT use print() statements. The only output should be the `fig` variable.
7. Always add clear titles and axis labels to charts.
8. Use fig.update_layout() to ensure charts are well-formatted and readable.
9. Handle potential data issues gracefully (nulls, type mismatches).
10. If the user asks for multiple charts, use make_subplots to combine them into a single figure.

OUTPUT FORMAT:
Return ONLY valid Python code in a single ```python code block.
After the code block, provide a brief 1-2 sentence explanation of what the chart shows.";

pub struct FewShotExample {
    pub profile_summary: &'static str,
    pub user_prompt: &'static str,
    pub code: &'static str,
}

/// Curated request/response pairs kept short to bound prompt size.
pub const EXAMPLES: &[FewShotExample] = &[
    FewShotExample {
        profile_summary: "Dataset: 1000 rows x 3 columns\nColumns:\n  - product (categorical), 0 nulls, 20 unique\n  - sales (numeric), 0 nulls, range 50-5000\n  - region (categorical), 0 nulls, 4 unique, e.g. [North, South, East, West]",
        user_prompt: "Show total sales per product as a bar chart",
        code: "fig = px.bar(\n    df, x='product', y='sales',\n    title='Total Sales by Product',\n    labels={'product': 'Product', 'sales': 'Sales ($)'}\n)\nfig.update_layout(xaxis_tickangle=-45)",
    },
    FewShotExample {
        profile_summary: "Dataset: 365 rows x 2 columns\nColumns:\n  - date (datetime), 0 nulls, from 2025-01-01 to 2025-12-31\n  - revenue (numeric), 3 nulls, range 100-99999, mean 12345",
        user_prompt: "Plot revenue over time",
        code: "fig = px.line(\n    df, x='date', y='revenue',\n    title='Revenue Over Time',\n    labels={'date': 'Date', 'revenue': 'Revenue ($)'}\n)\nfig.update_layout(hovermode='x unified')",
    },
];

/// Everything the prompt needs to describe one session's dataset and ask.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub user_prompt: String,
    pub profile_text: String,
    pub column_names: Vec<String>,
    pub sample_rows_markdown: String,
    pub refinement: Option<Refinement>,
}

/// Error context replayed when asking the model to fix its own code.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub previous_code: String,
    pub error_text: String,
}

/// System prompt, optionally with per-project instructions appended.
pub fn build_system_prompt(project_instructions: Option<&str>) -> String {
    match project_instructions.map(str::trim) {
        Some(extra) if !extra.is_empty() => format!(
            "{SYSTEM_PROMPT}\n\nPROJECT-SPECIFIC INSTRUCTIONS (always follow these for every chart you generate):\n{extra}\n"
        ),
        _ => SYSTEM_PROMPT.to_string(),
    }
}

/// Build the messages array for a generation or refinement call.
pub fn build_messages(inputs: &PromptInputs) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    let data_context = format!(
        "Here is the dataset you will work with:\n\n\
         DATASET PROFILE:\n{}\n\n\
         COLUMN NAMES: {}\n\n\
         SAMPLE DATA (first 5 rows):\n{}\n\n\
         Remember: the data is already loaded as `df`. Create a plotly figure assigned to `fig`.",
        inputs.profile_text,
        inputs.column_names.join(", "),
        inputs.sample_rows_markdown,
    );
    messages.push(ChatMessage::user(data_context));
    messages.push(ChatMessage::assistant(format!(
        "I understand the dataset with {} columns. I'm ready to generate visualizations. What would you like to see?",
        inputs.column_names.len()
    )));

    for example in EXAMPLES {
        messages.push(ChatMessage::user(format!(
            "Data profile:\n{}\n\nRequest: {}",
            example.profile_summary, example.user_prompt
        )));
        messages.push(ChatMessage::assistant(format!(
            "```python\n{}\n```",
            example.code
        )));
    }

    match &inputs.refinement {
        Some(refinement) => messages.push(ChatMessage::user(format!(
            "The following code failed with an error. Please fix it.\n\n\
             PREVIOUS CODE:\n```python\n{}\n```\n\n\
             ERROR:\n{}\n\n\
             Please return only the corrected Python code.",
            refinement.previous_code, refinement.error_text
        ))),
        None => messages.push(ChatMessage::user(inputs.user_prompt.clone())),
    }

    messages
}
