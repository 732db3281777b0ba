use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

fn string_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Rules applied by the static validator before any code runs.
///
/// Built once at startup and passed by reference into `validator::validate`;
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Modules generated code may import, matched on the top-level package
    /// name. Dotted entries are kept for the common plotly submodule spellings
    /// so the same set can seed the runtime import guard.
    pub allowed_modules: HashSet<String>,
    /// Dotted call chains whose root segment is banned outright
    /// (`os.system`, `subprocess.run`, ...).
    pub blocked_call_roots: HashSet<String>,
    /// Bare callables banned by exact name (`open`, `eval`, ...).
    pub blocked_callables: HashSet<String>,
    /// Reflective attributes that could be used to climb out of the sandbox.
    pub blocked_attributes: HashSet<String>,
    /// The variable a successful artifact must be bound to.
    pub output_variable: String,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: string_set(&[
                "pandas",
                "numpy",
                "plotly",
                "plotly.express",
                "plotly.graph_objects",
                "plotly.subplots",
                "datetime",
                "math",
                "statistics",
                "json",
                "re",
            ]),
            blocked_call_roots: string_set(&[
                "os",
                "sys",
                "subprocess",
                "shutil",
                "socket",
                "requests",
                "urllib",
                "http",
                "ftplib",
                "pathlib",
            ]),
            blocked_callables: string_set(&[
                "open",
                "exec",
                "eval",
                "compile",
                "__import__",
                "input",
                "breakpoint",
                "exit",
                "quit",
            ]),
            blocked_attributes: string_set(&[
                "__import__",
                "__subclasses__",
                "__bases__",
                "__class__",
                "__globals__",
                "__code__",
                "__func__",
            ]),
            output_variable: "fig".to_string(),
        }
    }
}

impl ValidationPolicy {
    /// Check a module name against the allowlist on its top-level package.
    pub fn allows_module(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.allowed_modules.contains(root) || self.allowed_modules.contains(module)
    }
}

/// Restrictions rendered into the sandbox interpreter prelude.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimePolicy {
    /// Modules the runtime import guard will let through. Mirrors the
    /// validator allowlist so the two gates cannot drift apart.
    pub allowed_imports: HashSet<String>,
    /// Builtins deleted from the interpreter before user code runs.
    pub blocked_builtins: Vec<String>,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            allowed_imports: ValidationPolicy::default().allowed_modules,
            blocked_builtins: [
                "exec",
                "eval",
                "compile",
                "open",
                "input",
                "breakpoint",
                "exit",
                "quit",
                "globals",
                "locals",
                "getattr",
                "setattr",
                "delattr",
                "vars",
                "dir",
                "memoryview",
                "bytearray",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Complete pipeline configuration, assembled once at process start.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub validation: ValidationPolicy,
    pub runtime: RuntimePolicy,
    /// Wall-clock budget for one execution attempt.
    pub exec_timeout: Duration,
    /// Refinement rounds beyond the first attempt (2 -> 3 attempts total).
    pub max_retries: u32,
    /// Cap on error text replayed into refinement prompts, in characters.
    pub error_replay_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validation: ValidationPolicy::default(),
            runtime: RuntimePolicy::default(),
            exec_timeout: Duration::from_secs(30),
            max_retries: 2,
            error_replay_limit: 600,
        }
    }
}

impl PipelineConfig {
    /// Default configuration with environment overrides applied
    /// (`CODE_EXEC_TIMEOUT` in seconds, `CODE_EXEC_MAX_RETRIES`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("CODE_EXEC_TIMEOUT") {
            config.exec_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("CODE_EXEC_MAX_RETRIES") {
            config.max_retries = retries as u32;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allowlist_covers_charting_stack() {
        let policy = ValidationPolicy::default();
        assert!(policy.allows_module("plotly.express"));
        assert!(policy.allows_module("pandas"));
        assert!(policy.allows_module("datetime"));
        assert!(!policy.allows_module("os"));
        assert!(!policy.allows_module("socket"));
    }

    #[test]
    fn submodules_of_allowed_packages_pass() {
        let policy = ValidationPolicy::default();
        assert!(policy.allows_module("plotly.subplots"));
        assert!(policy.allows_module("numpy.linalg"));
    }

    #[test]
    fn runtime_guard_mirrors_validator_allowlist() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.runtime.allowed_imports,
            config.validation.allowed_modules
        );
    }
}
