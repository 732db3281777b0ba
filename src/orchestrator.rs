//! The generation–validation–execution loop.
//!
//! States: `GENERATING -> VALIDATING -> EXECUTING -> {SUCCEEDED, REFINING,
//! FAILED}`. A validation rejection consumes a retry slot exactly like an
//! execution failure, but the executor is never invoked for rejected code and
//! the complaint fed back to the model is worded as a safety problem rather
//! than a crash. Attempts within a session are strictly sequential; sessions
//! share no mutable state and may run concurrently.

use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::executor;
use crate::figure::Figure;
use crate::llm::{GenerationClient, GenerationRequest, RefinementRequest};
use crate::profiler;
use crate::sandbox::SandboxContext;
use crate::session::{
    CodeArtifact, FailureKind, GenerationAttempt, RejectionKind, RequestSession,
    ValidationVerdict,
};
use crate::validator;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

/// Billing-side collaborator, invoked exactly once per session with the
/// final token total. This subsystem only supplies the count; it never
/// touches balances.
#[async_trait]
pub trait CostRecorder: Send + Sync {
    async fn record_usage(&self, session_id: Uuid, tokens_used: u64);
}

/// Application-facing result of [`Orchestrator::run_analysis`].
#[derive(Debug)]
pub struct AnalysisReport {
    pub success: bool,
    pub artifact: Option<Figure>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub attempts_used: usize,
    pub tokens_used: u64,
}

/// Error context carried from a failed attempt into the next generation call.
#[derive(Debug)]
struct Feedback {
    previous_code: String,
    complaint: String,
}

/// Loop state. One session walks this machine exactly once, front to back.
enum Phase {
    Generating { feedback: Option<Feedback> },
    Validating { code: CodeArtifact, tokens: u64 },
    Executing { code: CodeArtifact, verdict: ValidationVerdict, tokens: u64 },
    Refining { feedback: Feedback },
    Succeeded,
    Failed,
}

pub struct Orchestrator<C> {
    client: C,
    config: PipelineConfig,
    cost: Option<Box<dyn CostRecorder>>,
}

impl<C: GenerationClient> Orchestrator<C> {
    pub fn new(client: C) -> Self {
        Self::with_config(client, PipelineConfig::default())
    }

    pub fn with_config(client: C, config: PipelineConfig) -> Self {
        Self {
            client,
            config,
            cost: None,
        }
    }

    pub fn with_cost_recorder(mut self, recorder: Box<dyn CostRecorder>) -> Self {
        self.cost = Some(recorder);
        self
    }

    /// Run a full session and reduce it to the caller-facing report.
    ///
    /// Retries are exhausted entirely inside this call; callers must never
    /// re-attempt a failed session automatically.
    pub async fn run_analysis(
        &self,
        instruction: &str,
        dataset: &Dataset,
        project_context: Option<&str>,
    ) -> AnalysisReport {
        let session = self.run(instruction, dataset, project_context).await;
        if let Some(recorder) = &self.cost {
            recorder.record_usage(session.id, session.tokens_total).await;
        }
        into_report(session)
    }

    /// Drive one session through the state machine and return its full
    /// attempt record.
    pub async fn run(
        &self,
        instruction: &str,
        dataset: &Dataset,
        project_context: Option<&str>,
    ) -> RequestSession {
        let profile = profiler::profile_dataset(dataset);
        let base_request = GenerationRequest {
            instruction: instruction.to_string(),
            profile_text: profiler::profile_to_text_summary(&profile),
            column_names: dataset
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            sample_rows_markdown: dataset.head_markdown(5),
            project_context: project_context.map(str::to_string),
        };

        let mut session = RequestSession::new(instruction, self.config.max_retries);
        let total_attempts = self.config.max_retries as usize + 1;
        info!(
            "[ORCHESTRATOR] session {} started ({} rows, {} columns)",
            session.id,
            profile.row_count,
            profile.column_count
        );

        let mut phase = Phase::Generating { feedback: None };
        loop {
            phase = match phase {
                Phase::Generating { feedback } => {
                    let generated = match &feedback {
                        None => self.client.generate(&base_request).await,
                        Some(feedback) => {
                            self.client
                                .refine(&RefinementRequest {
                                    base: base_request.clone(),
                                    previous_code: feedback.previous_code.clone(),
                                    error_text: feedback.complaint.clone(),
                                })
                                .await
                        }
                    };
                    match generated {
                        Ok(generation) => Phase::Validating {
                            code: generation.code,
                            tokens: generation.tokens_used,
                        },
                        Err(err) => {
                            warn!(
                                "[ORCHESTRATOR] session {} aborted, generation unavailable: {err}",
                                session.id
                            );
                            session.failure = Some(FailureKind::GenerationUnavailable);
                            session.generation_error =
                                Some(format!("Code generation is unavailable: {err}"));
                            Phase::Failed
                        }
                    }
                }

                Phase::Validating { code, tokens } => {
                    let verdict = validator::validate(&code, &self.config.validation);
                    if verdict.accepted {
                        Phase::Executing {
                            code,
                            verdict,
                            tokens,
                        }
                    } else {
                        let complaint = self.validation_complaint(&verdict);
                        let previous_code = code.source().to_string();
                        session.record(GenerationAttempt {
                            code,
                            verdict,
                            outcome: None,
                            tokens_used: tokens,
                        });
                        if session.attempts_used() < total_attempts {
                            Phase::Refining {
                                feedback: Feedback {
                                    previous_code,
                                    complaint,
                                },
                            }
                        } else {
                            session.failure = Some(FailureKind::UnsafeCode);
                            Phase::Failed
                        }
                    }
                }

                Phase::Executing {
                    code,
                    verdict,
                    tokens,
                } => {
                    let context = SandboxContext::build(dataset, &self.config);
                    let outcome =
                        executor::execute(&code, context, self.config.exec_timeout).await;
                    let succeeded = outcome.succeeded;
                    let timed_out = outcome.timed_out;
                    let error = outcome.error.clone().unwrap_or_default();
                    let previous_code = code.source().to_string();
                    session.record(GenerationAttempt {
                        code,
                        verdict,
                        outcome: Some(outcome),
                        tokens_used: tokens,
                    });

                    if succeeded {
                        Phase::Succeeded
                    } else if session.attempts_used() < total_attempts {
                        Phase::Refining {
                            feedback: Feedback {
                                previous_code,
                                complaint: self.execution_complaint(timed_out, &error),
                            },
                        }
                    } else {
                        session.failure = Some(if timed_out {
                            FailureKind::Timeout
                        } else {
                            FailureKind::ExecutionFailed
                        });
                        Phase::Failed
                    }
                }

                Phase::Refining { feedback } => {
                    info!(
                        "[ORCHESTRATOR] session {} refining after attempt {}",
                        session.id,
                        session.attempts_used()
                    );
                    Phase::Generating {
                        feedback: Some(feedback),
                    }
                }

                Phase::Succeeded | Phase::Failed => break,
            };
        }

        info!(
            "[ORCHESTRATOR] session {} finished: success={}, attempts={}, tokens={}",
            session.id,
            session.succeeded(),
            session.attempts_used(),
            session.tokens_total
        );
        session
    }

    /// Safety complaint for rejected code, worded apart from runtime errors.
    fn validation_complaint(&self, verdict: &ValidationVerdict) -> String {
        let reason = self.clip(verdict.reason.as_deref().unwrap_or("unspecified"));
        match verdict.kind {
            Some(RejectionKind::Syntax) => {
                format!("The generated code was not valid Python: {reason}")
            }
            _ => format!(
                "The generated code failed safety validation: {reason} \
                 Use only the permitted libraries and assign the figure to 'fig'."
            ),
        }
    }

    /// Execution complaint: performance wording for timeouts, the captured
    /// error for everything else.
    fn execution_complaint(&self, timed_out: bool, error: &str) -> String {
        if timed_out {
            format!(
                "The code did not finish within the {}-second execution budget. \
                 Simplify the approach so it completes quickly.",
                self.config.exec_timeout.as_secs()
            )
        } else {
            format!(
                "The code raised an error during execution: {}",
                self.clip(error)
            )
        }
    }

    /// Bound replayed error text so prompts cannot grow without limit across
    /// retries.
    fn clip(&self, text: &str) -> String {
        let limit = self.config.error_replay_limit;
        if text.chars().count() <= limit {
            text.to_string()
        } else {
            let mut clipped: String = text.chars().take(limit).collect();
            clipped.push_str("...");
            clipped
        }
    }
}

fn into_report(session: RequestSession) -> AnalysisReport {
    let success = session.succeeded();
    let artifact = if success {
        session
            .final_outcome()
            .and_then(|outcome| outcome.artifact.clone())
    } else {
        None
    };
    let error = if success {
        None
    } else {
        session.final_error().map(str::to_string)
    };
    AnalysisReport {
        success,
        artifact,
        error,
        failure: session.failure,
        attempts_used: session.attempts_used(),
        tokens_used: session.tokens_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CellValue;
    use crate::errors::{PipelineError, Result};
    use crate::llm::Generation;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GOOD_CODE: &str = "import plotly.express as px\nfig = px.bar(df, x='a', y='b')\n";

    fn dataset() -> Dataset {
        Dataset::from_columns(vec![
            ("a", vec![CellValue::Int(1), CellValue::Int(2)]),
            ("b", vec![CellValue::Float(3.0), CellValue::Float(4.0)]),
        ])
    }

    /// Hands out canned responses in order and records every refinement
    /// error it was shown.
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Generation>>>,
        refine_errors: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(codes: Vec<Result<Generation>>) -> Self {
            Self {
                responses: Mutex::new(codes.into_iter().collect()),
                refine_errors: Mutex::new(Vec::new()),
            }
        }

        fn ok(code: &str, tokens: u64) -> Result<Generation> {
            Ok(Generation {
                code: CodeArtifact::new(code),
                tokens_used: tokens,
            })
        }

        fn next(&self) -> Result<Generation> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(PipelineError::Internal("script exhausted".to_string()))
                })
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
            self.next()
        }

        async fn refine(&self, request: &RefinementRequest) -> Result<Generation> {
            self.refine_errors
                .lock()
                .unwrap()
                .push(request.error_text.clone());
            self.next()
        }
    }

    struct RecordingCosts {
        calls: Mutex<Vec<(Uuid, u64)>>,
    }

    #[async_trait]
    impl CostRecorder for &'static RecordingCosts {
        async fn record_usage(&self, session_id: Uuid, tokens_used: u64) {
            self.calls.lock().unwrap().push((session_id, tokens_used));
        }
    }

    #[tokio::test]
    async fn clean_first_attempt_uses_one_generation_call() {
        let client = ScriptedClient::new(vec![ScriptedClient::ok(GOOD_CODE, 111)]);
        let orchestrator = Orchestrator::new(client);
        let report = orchestrator.run_analysis("bar of b by a", &dataset(), None).await;

        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.attempts_used, 1);
        assert_eq!(report.tokens_used, 111);
        assert!(report.artifact.is_some());
        assert!(report.failure.is_none());
    }

    #[tokio::test]
    async fn validation_rejection_feeds_refinement_and_skips_executor() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok("import os\nfig = 1\n", 50),
            ScriptedClient::ok(GOOD_CODE, 60),
        ]);
        let orchestrator = Orchestrator::new(client);
        let session = orchestrator.run("plot it", &dataset(), None).await;

        assert!(session.succeeded());
        assert_eq!(session.attempts_used(), 2);
        assert_eq!(session.tokens_total, 110);
        // Rejected attempt never reached the executor.
        assert!(session.attempts[0].outcome.is_none());
        let complaints = orchestrator.client.refine_errors.lock().unwrap();
        assert_eq!(complaints.len(), 1);
        assert!(complaints[0].contains("safety validation"));
        assert!(complaints[0].contains("'os'"));
    }

    #[tokio::test]
    async fn retry_ceiling_reports_only_the_last_error() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok("fig = alpha\n", 10),
            ScriptedClient::ok("fig = beta\n", 20),
            ScriptedClient::ok("fig = gamma\n", 30),
        ]);
        let orchestrator = Orchestrator::new(client);
        let report = orchestrator.run_analysis("plot it", &dataset(), None).await;

        assert!(!report.success);
        assert_eq!(report.attempts_used, 3);
        assert_eq!(report.tokens_used, 60);
        assert_eq!(report.failure, Some(FailureKind::ExecutionFailed));
        let error = report.error.unwrap();
        assert!(error.contains("gamma"), "got: {error}");
        assert!(!error.contains("alpha"));
    }

    #[tokio::test]
    async fn all_attempts_rejected_reports_unsafe_code() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok("import os\nfig = 1\n", 1),
            ScriptedClient::ok("import socket\nfig = 1\n", 2),
            ScriptedClient::ok("import subprocess\nfig = 1\n", 3),
        ]);
        let orchestrator = Orchestrator::new(client);
        let report = orchestrator.run_analysis("plot it", &dataset(), None).await;

        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::UnsafeCode));
        assert_eq!(report.attempts_used, 3);
        // The final error is the last validation reason, not a generic
        // execution error.
        assert!(report.error.unwrap().contains("subprocess"));
    }

    #[tokio::test]
    async fn transport_failure_aborts_the_session_early() {
        let client = ScriptedClient::new(vec![Err(PipelineError::GenerationUnavailable(
            "connection refused".to_string(),
        ))]);
        let orchestrator = Orchestrator::new(client);
        let report = orchestrator.run_analysis("plot it", &dataset(), None).await;

        assert!(!report.success);
        assert_eq!(report.attempts_used, 0);
        assert_eq!(report.failure, Some(FailureKind::GenerationUnavailable));
        assert!(report.error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn cost_recorder_is_invoked_once_with_the_total() {
        static COSTS: RecordingCosts = RecordingCosts {
            calls: Mutex::new(Vec::new()),
        };
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok("import os\nfig = 1\n", 40),
            ScriptedClient::ok(GOOD_CODE, 60),
        ]);
        let orchestrator = Orchestrator::new(client).with_cost_recorder(Box::new(&COSTS));
        let report = orchestrator.run_analysis("plot it", &dataset(), None).await;

        assert!(report.success);
        let calls = COSTS.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 100);
    }

    #[tokio::test]
    async fn long_error_text_is_clipped_before_refinement() {
        let mut config = PipelineConfig::default();
        config.error_replay_limit = 40;
        let long_name = "x".repeat(300);
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok(&format!("fig = {long_name}\n"), 5),
            ScriptedClient::ok(GOOD_CODE, 5),
        ]);
        let orchestrator = Orchestrator::with_config(client, config);
        let session = orchestrator.run("plot it", &dataset(), None).await;

        assert!(session.succeeded());
        let complaints = orchestrator.client.refine_errors.lock().unwrap();
        assert_eq!(complaints.len(), 1);
        // complaint prefix + 40 chars + ellipsis stays well under the raw error
        assert!(complaints[0].len() < 150, "got {} chars", complaints[0].len());
    }
}
