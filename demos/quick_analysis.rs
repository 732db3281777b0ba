//! End-to-end pipeline demo with a canned generation client, so it runs
//! without an API key. Swap in `AnthropicClient::from_env()` for the real
//! thing.

use async_trait::async_trait;
use chartsmith::{
    CellValue, CodeArtifact, Dataset, Generation, GenerationClient, GenerationRequest,
    Orchestrator, RefinementRequest, Result,
};

/// Returns a broken chart on the first call and a fixed one on refinement,
/// exercising the full self-correction loop.
struct CannedClient;

#[async_trait]
impl GenerationClient for CannedClient {
    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
        Ok(Generation {
            code: CodeArtifact::new(
                "import plotly.express as px\nfig = px.bar(df, x='quarter', y='sales')\n",
            ),
            tokens_used: 420,
        })
    }

    async fn refine(&self, request: &RefinementRequest) -> Result<Generation> {
        println!("refining after: {}", request.error_text);
        Ok(Generation {
            code: CodeArtifact::new(
                "import plotly.express as px\nfig = px.bar(df, x='quarter', y='revenue', title='Revenue by Quarter')\n",
            ),
            tokens_used: 380,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dataset = Dataset::from_columns(vec![
        (
            "quarter",
            vec![
                CellValue::Text("Q1".into()),
                CellValue::Text("Q2".into()),
                CellValue::Text("Q3".into()),
                CellValue::Text("Q4".into()),
            ],
        ),
        (
            "revenue",
            vec![
                CellValue::Float(120_000.0),
                CellValue::Float(135_500.0),
                CellValue::Float(128_750.0),
                CellValue::Float(161_200.0),
            ],
        ),
    ]);

    let orchestrator = Orchestrator::new(CannedClient);
    let report = orchestrator
        .run_analysis("show revenue by quarter", &dataset, None)
        .await;

    println!(
        "success={} attempts={} tokens={}",
        report.success, report.attempts_used, report.tokens_used
    );
    match report.artifact {
        Some(figure) => println!("{}", figure.to_json()),
        None => println!("error: {}", report.error.unwrap_or_default()),
    }
    Ok(())
}
