use crate::figure::Figure;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// A candidate program produced by the generation client.
///
/// Immutable once created; refinement rounds supersede it with a new artifact
/// rather than editing it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeArtifact(String);

impl CodeArtifact {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CodeArtifact {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

/// Why the validator refused an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The source failed to parse at all.
    Syntax,
    /// The source parsed but violated the safety rules.
    Policy,
}

/// The validator's accept/reject decision for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub accepted: bool,
    pub kind: Option<RejectionKind>,
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            kind: None,
            reason: None,
        }
    }

    pub fn reject(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            kind: Some(kind),
            reason: Some(reason.into()),
        }
    }
}

/// Terminal result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    pub artifact: Option<Figure>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn success(artifact: Figure, elapsed_ms: u64) -> Self {
        Self {
            succeeded: true,
            artifact: Some(artifact),
            error: None,
            elapsed_ms,
            timed_out: false,
        }
    }

    pub fn failure(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            succeeded: false,
            artifact: None,
            error: Some(error.into()),
            elapsed_ms,
            timed_out: false,
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self {
            succeeded: false,
            artifact: None,
            error: Some(format!(
                "Code execution timed out after {} seconds.",
                budget.as_secs()
            )),
            elapsed_ms: budget.as_millis() as u64,
            timed_out: true,
        }
    }
}

/// One full generate -> validate -> execute cycle.
///
/// `outcome` is `None` when validation rejected the code; the executor is
/// never invoked for rejected artifacts.
#[derive(Debug, Clone)]
pub struct GenerationAttempt {
    pub code: CodeArtifact,
    pub verdict: ValidationVerdict,
    pub outcome: Option<ExecutionOutcome>,
    pub tokens_used: u64,
}

impl GenerationAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().map(|o| o.succeeded).unwrap_or(false)
    }

    /// The text describing why this attempt failed, whichever stage it died in.
    pub fn failure_text(&self) -> Option<&str> {
        if !self.verdict.accepted {
            return self.verdict.reason.as_deref();
        }
        self.outcome.as_ref().and_then(|o| o.error.as_deref())
    }
}

/// Coarse failure classification surfaced to the calling application, so it
/// can word "the model produced unsafe code" differently from "the code
/// crashed on this data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The generation service itself was unreachable; the session aborted
    /// before exhausting retries.
    GenerationUnavailable,
    /// The last attempt died in validation.
    UnsafeCode,
    /// The last attempt raised or produced a wrong-typed/missing artifact.
    ExecutionFailed,
    /// The last attempt exceeded the execution budget.
    Timeout,
}

/// The complete, ordered record of attempts for one analysis request.
///
/// Exclusively owned by the orchestrator while running; handed to the caller
/// as the terminal result and not persisted by this subsystem.
#[derive(Debug)]
pub struct RequestSession {
    pub id: Uuid,
    pub instruction: String,
    pub attempts: Vec<GenerationAttempt>,
    pub max_retries: u32,
    pub tokens_total: u64,
    pub failure: Option<FailureKind>,
    /// Set only when the generation service itself failed and the session
    /// aborted before a full attempt could be recorded.
    pub generation_error: Option<String>,
}

impl RequestSession {
    pub(crate) fn new(instruction: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            instruction: instruction.into(),
            attempts: Vec::new(),
            max_retries,
            tokens_total: 0,
            failure: None,
            generation_error: None,
        }
    }

    pub(crate) fn record(&mut self, attempt: GenerationAttempt) {
        self.tokens_total += attempt.tokens_used;
        self.attempts.push(attempt);
    }

    pub fn attempts_used(&self) -> usize {
        self.attempts.len()
    }

    pub fn succeeded(&self) -> bool {
        self.last_attempt().map(|a| a.succeeded()).unwrap_or(false)
    }

    pub fn last_attempt(&self) -> Option<&GenerationAttempt> {
        self.attempts.last()
    }

    /// The most recent execution outcome, reported to the caller as the final
    /// result.
    pub fn final_outcome(&self) -> Option<&ExecutionOutcome> {
        self.attempts.iter().rev().find_map(|a| a.outcome.as_ref())
    }

    /// The last attempt's failure text (never an aggregate across attempts),
    /// or the transport error that aborted the session early.
    pub fn final_error(&self) -> Option<&str> {
        self.generation_error
            .as_deref()
            .or_else(|| self.last_attempt().and_then(|a| a.failure_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_exec_attempt(error: &str, tokens: u64) -> GenerationAttempt {
        GenerationAttempt {
            code: CodeArtifact::new("fig = 1"),
            verdict: ValidationVerdict::accept(),
            outcome: Some(ExecutionOutcome::failure(error, 5)),
            tokens_used: tokens,
        }
    }

    #[test]
    fn session_accumulates_tokens_in_order() {
        let mut session = RequestSession::new("plot it", 2);
        session.record(failed_exec_attempt("first", 100));
        session.record(failed_exec_attempt("second", 250));
        assert_eq!(session.tokens_total, 350);
        assert_eq!(session.attempts_used(), 2);
        assert_eq!(session.final_error(), Some("second"));
    }

    #[test]
    fn rejected_attempt_reports_validation_reason() {
        let attempt = GenerationAttempt {
            code: CodeArtifact::new("import os"),
            verdict: ValidationVerdict::reject(
                RejectionKind::Policy,
                "Import of 'os' is not allowed.",
            ),
            outcome: None,
            tokens_used: 10,
        };
        assert!(!attempt.succeeded());
        assert_eq!(attempt.failure_text(), Some("Import of 'os' is not allowed."));
    }

    #[test]
    fn timeout_outcome_pins_elapsed_to_budget() {
        let outcome = ExecutionOutcome::timeout(Duration::from_secs(5));
        assert!(outcome.timed_out);
        assert_eq!(outcome.elapsed_ms, 5000);
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    }
}
