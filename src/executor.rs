//! Sandboxed executor.
//!
//! Each run gets a fresh interpreter built inside a `spawn_blocking` worker;
//! the async caller enforces the wall-clock budget with `tokio::time::timeout`.
//!
//! Cancellation is soft: RustPython offers no preemption, so on timeout the
//! worker is abandoned, not killed. The caller-visible latency is bounded by
//! the budget, but the abandoned worker may keep burning CPU until its loop
//! finishes. Callers needing hard kill semantics must put a process or WASM
//! boundary around this crate.

use crate::sandbox::{SandboxContext, DATASET_GLOBAL};
use crate::session::{CodeArtifact, ExecutionOutcome};
use rustpython_vm::builtins::{PyBaseExceptionRef, PyDict, PyFloat, PyInt, PyList, PyStr};
use rustpython_vm::compiler::Mode;
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, VirtualMachine};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Run validated code inside the restricted context.
///
/// The caller must already hold an accepting verdict for `code`; this
/// function enforces runtime bounds only and never re-validates. Every
/// failure mode is folded into the returned [`ExecutionOutcome`] — nothing
/// raised by the executed code propagates as an error.
pub async fn execute(
    code: &CodeArtifact,
    context: SandboxContext,
    timeout: Duration,
) -> ExecutionOutcome {
    let code = code.clone();
    let worker = tokio::task::spawn_blocking(move || run_in_vm(&code, &context));

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            ExecutionOutcome::failure(format!("execution worker panicked: {join_err}"), 0)
        }
        Err(_) => {
            warn!(
                "[EXECUTOR] execution exceeded {}s budget, abandoning worker",
                timeout.as_secs()
            );
            ExecutionOutcome::timeout(timeout)
        }
    }
}

/// Fresh interpreter with the Rust-native stdlib modules and the frozen
/// pure-Python stdlib registered. One per execution; never reused.
fn build_interpreter() -> Interpreter {
    Interpreter::with_init(Default::default(), |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
    })
}

fn run_in_vm(code: &CodeArtifact, context: &SandboxContext) -> ExecutionOutcome {
    let start = Instant::now();
    let interpreter = build_interpreter();

    interpreter.enter(|vm| {
        let scope = vm.new_scope_with_builtins();

        // Stage the private dataset copy, then run the prelude that wraps it
        // in the frame shim and locks the environment down.
        let columns = match json_to_pyobject(&context.dataset_columns, vm) {
            Ok(obj) => obj,
            Err(exc) => {
                return ExecutionOutcome::failure(
                    format!(
                        "failed to stage dataset in sandbox: {}",
                        exception_message(vm, &exc)
                    ),
                    elapsed_ms(start),
                )
            }
        };
        if scope
            .globals
            .set_item(DATASET_GLOBAL, columns, vm)
            .is_err()
        {
            return ExecutionOutcome::failure(
                "failed to stage dataset in sandbox",
                elapsed_ms(start),
            );
        }

        let prelude = match vm.compile(&context.prelude, Mode::Exec, "<sandbox>".to_owned()) {
            Ok(compiled) => compiled,
            Err(err) => {
                return ExecutionOutcome::failure(
                    format!("sandbox prelude failed to compile: {err}"),
                    elapsed_ms(start),
                )
            }
        };
        if let Err(exc) = vm.run_code_obj(prelude, scope.clone()) {
            return ExecutionOutcome::failure(
                format!("sandbox prelude failed: {}", exception_message(vm, &exc)),
                elapsed_ms(start),
            );
        }

        let program = match vm.compile(code.source(), Mode::Exec, "<generated>".to_owned()) {
            Ok(compiled) => compiled,
            Err(err) => {
                // Validation catches this first in the normal flow; kept so a
                // direct executor caller still gets a structured failure.
                return ExecutionOutcome::failure(
                    format!("Syntax error: {err}"),
                    elapsed_ms(start),
                );
            }
        };

        debug!("[EXECUTOR] running {} bytes of generated code", code.source().len());
        if let Err(exc) = vm.run_code_obj(program, scope.clone()) {
            return ExecutionOutcome::failure(exception_message(vm, &exc), elapsed_ms(start));
        }

        extract_figure(vm, &scope, &context.output_variable, start)
    })
}

/// Pull the output variable from the scope and convert it to a [`Figure`].
///
/// The type check is nominal against the prelude's `Figure` class: anything
/// else bound to the output variable — including a hand-built dict of the
/// right shape — is a type mismatch.
fn extract_figure(
    vm: &VirtualMachine,
    scope: &rustpython_vm::scope::Scope,
    output_variable: &str,
    start: Instant,
) -> ExecutionOutcome {
    let globals: PyObjectRef = scope.globals.clone().into();
    let bound = match vm.call_method(&globals, "get", (vm.ctx.new_str(output_variable),)) {
        Ok(obj) => obj,
        Err(exc) => {
            return ExecutionOutcome::failure(
                format!(
                    "could not inspect sandbox globals: {}",
                    exception_message(vm, &exc)
                ),
                elapsed_ms(start),
            )
        }
    };

    if vm.is_none(&bound) {
        return ExecutionOutcome::failure(
            format!("Code did not produce a '{output_variable}' variable."),
            elapsed_ms(start),
        );
    }

    let type_name = bound.class().name().to_string();
    if type_name != "Figure" {
        return ExecutionOutcome::failure(
            format!("'{output_variable}' is not a chart Figure (got {type_name})."),
            elapsed_ms(start),
        );
    }

    let as_dict = match vm.call_method(&bound, "to_dict", ()) {
        Ok(dict) => dict,
        Err(exc) => {
            return ExecutionOutcome::failure(
                format!("failed to read figure: {}", exception_message(vm, &exc)),
                elapsed_ms(start),
            )
        }
    };
    let value = match pyobject_to_json(&as_dict, vm) {
        Ok(value) => value,
        Err(exc) => {
            return ExecutionOutcome::failure(
                format!(
                    "failed to serialize figure: {}",
                    exception_message(vm, &exc)
                ),
                elapsed_ms(start),
            )
        }
    };

    match crate::figure::Figure::from_value(&value) {
        Some(figure) => ExecutionOutcome::success(figure, elapsed_ms(start)),
        None => ExecutionOutcome::failure(
            format!("'{output_variable}' did not serialize to a data/layout figure."),
            elapsed_ms(start),
        ),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Format an interpreter exception the way the refinement prompt expects:
/// `ExceptionType: message`.
fn exception_message(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let class = exc.class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
    if message.is_empty() {
        class
    } else {
        format!("{class}: {message}")
    }
}

/// Convert a JSON value into interpreter objects for injection.
fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult<PyObjectRef> {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(items) => {
            let converted: PyResult<Vec<_>> =
                items.iter().map(|v| json_to_pyobject(v, vm)).collect();
            Ok(vm.ctx.new_list(converted?).into())
        }
        Value::Object(map) => {
            let dict = vm.ctx.new_dict();
            for (key, item) in map {
                dict.set_item(key.as_str(), json_to_pyobject(item, vm)?, vm)?;
            }
            Ok(dict.into())
        }
    }
}

/// Convert an interpreter object back to JSON for the figure artifact.
fn pyobject_to_json(obj: &PyObjectRef, vm: &VirtualMachine) -> PyResult<Value> {
    if obj.is(&vm.ctx.none) {
        return Ok(Value::Null);
    }
    // bool subclasses int; check the class first.
    if obj.class().is(vm.ctx.types.bool_type) {
        if let Ok(b) = obj.try_to_value::<bool>(vm) {
            return Ok(Value::Bool(b));
        }
    }
    if let Some(int) = obj.downcast_ref::<PyInt>() {
        if let Ok(n) = int.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
    }
    if let Some(float) = obj.downcast_ref::<PyFloat>() {
        return Ok(serde_json::Number::from_f64(float.to_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }
    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items: PyResult<Vec<Value>> = list
            .borrow_vec()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }
    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, item) in dict {
            let key_str: String = key.str(vm)?.to_string();
            map.insert(key_str, pyobject_to_json(&item, vm)?);
        }
        return Ok(Value::Object(map));
    }
    // Anything exotic degrades to its string form rather than failing the run.
    let s: String = obj.str(vm)?.to_string();
    Ok(Value::String(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dataset::{CellValue, Dataset};

    fn sample_dataset() -> Dataset {
        Dataset::from_columns(vec![
            (
                "a",
                vec![CellValue::Int(1), CellValue::Int(2), CellValue::Int(3)],
            ),
            (
                "b",
                vec![
                    CellValue::Float(10.0),
                    CellValue::Float(20.0),
                    CellValue::Float(30.0),
                ],
            ),
        ])
    }

    fn context() -> SandboxContext {
        SandboxContext::build(&sample_dataset(), &PipelineConfig::default())
    }

    async fn run(code: &str, timeout_secs: u64) -> ExecutionOutcome {
        execute(
            &CodeArtifact::new(code),
            context(),
            Duration::from_secs(timeout_secs),
        )
        .await
    }

    #[tokio::test]
    async fn px_bar_produces_a_figure() {
        let outcome = run(
            "import plotly.express as px\nfig = px.bar(df, x='a', y='b')\n",
            30,
        )
        .await;
        assert!(outcome.succeeded, "error: {:?}", outcome.error);
        let figure = outcome.artifact.unwrap();
        assert_eq!(figure.trace_count(), 1);
        assert_eq!(figure.data[0]["type"], "bar");
        assert_eq!(figure.data[0]["x"], serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn graph_objects_figure_round_trips() {
        let outcome = run(
            "import plotly.graph_objects as go\n\
             fig = go.Figure(data=[go.Bar(x=df['a'], y=df['b'])])\n\
             fig.update_layout(title='Totals')\n",
            30,
        )
        .await;
        assert!(outcome.succeeded, "error: {:?}", outcome.error);
        let figure = outcome.artifact.unwrap();
        assert_eq!(figure.layout["title"], "Totals");
    }

    #[tokio::test]
    async fn wrong_output_type_is_a_descriptive_failure() {
        let outcome = run("fig = 1\n", 30).await;
        assert!(!outcome.succeeded);
        let error = outcome.error.unwrap();
        assert!(error.contains("not a chart Figure"), "got: {error}");
        assert!(error.contains("int"), "got: {error}");
    }

    #[tokio::test]
    async fn missing_column_surfaces_as_runtime_failure() {
        let outcome = run(
            "import plotly.express as px\nfig = px.bar(df, x='missing', y='b')\n",
            30,
        )
        .await;
        assert!(!outcome.succeeded);
        assert!(outcome.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn unreachable_assignment_fails_at_extraction() {
        let outcome = run("if False:\n    fig = 1\n", 30).await;
        assert!(!outcome.succeeded);
        assert!(outcome.error.unwrap().contains("did not produce"));
    }

    #[tokio::test]
    async fn infinite_loop_is_cut_off_at_the_budget() {
        let started = Instant::now();
        let outcome = run("while True:\n    pass\nfig = 1\n", 1).await;
        let wall = started.elapsed();
        assert!(!outcome.succeeded);
        assert!(outcome.timed_out);
        assert_eq!(outcome.elapsed_ms, 1000);
        assert!(wall < Duration::from_millis(1500), "took {wall:?}");
    }

    #[tokio::test]
    async fn sandbox_never_mutates_the_callers_dataset() {
        let dataset = sample_dataset();
        let snapshot = dataset.clone();
        let ctx = SandboxContext::build(&dataset, &PipelineConfig::default());
        let outcome = execute(
            &CodeArtifact::new(
                "import plotly.express as px\n\
                 df['a'] = [9, 9, 9]\n\
                 fig = px.bar(df, x='a', y='b')\n",
            ),
            ctx,
            Duration::from_secs(30),
        )
        .await;
        assert!(outcome.succeeded, "error: {:?}", outcome.error);
        // The sandbox saw its reassignment...
        assert_eq!(
            outcome.artifact.unwrap().data[0]["x"],
            serde_json::json!([9, 9, 9])
        );
        // ...the caller's dataset did not.
        assert_eq!(dataset, snapshot);
    }

    #[tokio::test]
    async fn blocked_builtins_are_gone_at_runtime() {
        let outcome = run("fig = open('/etc/passwd')\n", 30).await;
        assert!(!outcome.succeeded);
        assert!(outcome.error.unwrap().contains("NameError"));
    }

    #[tokio::test]
    async fn runtime_import_guard_backs_up_the_validator() {
        let outcome = run("import os\nfig = 1\n", 30).await;
        assert!(!outcome.succeeded);
        assert!(outcome.error.unwrap().contains("not allowed"));
    }
}
