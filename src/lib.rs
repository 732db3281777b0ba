//! chartsmith — LLM chart-code generation, validation and sandboxed
//! execution.
//!
//! The pipeline: a generation client produces a short Python program that
//! turns a tabular dataset into a Plotly-style figure; a static AST validator
//! gates it; a restricted in-process interpreter executes it under a
//! wall-clock budget; failures drive a bounded self-correction loop; the
//! accumulated token count is handed to cost accounting exactly once.
//!
//! # Example
//! ```no_run
//! use chartsmith::{AnthropicClient, CellValue, Dataset, Orchestrator};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let dataset = Dataset::from_columns(vec![
//!     ("region", vec![CellValue::Text("North".into()), CellValue::Text("South".into())]),
//!     ("revenue", vec![CellValue::Float(1200.0), CellValue::Float(800.0)]),
//! ]);
//!
//! let orchestrator = Orchestrator::new(AnthropicClient::from_env()?);
//! let report = orchestrator
//!     .run_analysis("show revenue by region", &dataset, None)
//!     .await;
//!
//! if report.success {
//!     println!("{}", report.artifact.unwrap().to_json());
//! } else {
//!     eprintln!("failed after {} attempts: {:?}", report.attempts_used, report.error);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod dataset;
mod errors;
mod executor;
mod figure;
mod llm;
mod orchestrator;
mod profiler;
mod prompts;
mod sandbox;
mod session;
mod validator;

pub use config::{PipelineConfig, RuntimePolicy, ValidationPolicy};
pub use dataset::{CellValue, Column, Dataset};
pub use errors::{PipelineError, Result};
pub use executor::execute;
pub use figure::Figure;
pub use llm::{
    AnthropicClient, ChatMessage, Generation, GenerationClient, GenerationRequest,
    RefinementRequest, Role,
};
pub use orchestrator::{AnalysisReport, CostRecorder, Orchestrator};
pub use profiler::{profile_dataset, profile_to_text_summary, ColumnKind, DataProfile};
pub use sandbox::SandboxContext;
pub use session::{
    CodeArtifact, ExecutionOutcome, FailureKind, GenerationAttempt, RejectionKind,
    RequestSession, ValidationVerdict,
};
pub use validator::validate;
