//! Static safety gate for generated chart code.
//!
//! Deny-by-structure: the candidate source is parsed once and the tree is
//! walked in source order; the first rule violation wins. Nothing here
//! executes anything, so the gate is side-effect-free and a second call on
//! the same artifact always returns the same verdict.

use crate::config::ValidationPolicy;
use crate::session::{CodeArtifact, RejectionKind, ValidationVerdict};
use rustpython_parser::{ast, Parse};

/// Validate one artifact against the policy.
///
/// Rules, in order: parse; imports against the module allowlist; calls
/// against the blocklists (bare names and dotted chains resolved to their
/// root); attribute access against the reflection blocklist; and finally the
/// requirement that the output variable is assigned somewhere in the tree.
pub fn validate(code: &CodeArtifact, policy: &ValidationPolicy) -> ValidationVerdict {
    let suite = match ast::Suite::parse(code.source(), "<generated>") {
        Ok(suite) => suite,
        Err(err) => {
            return ValidationVerdict::reject(RejectionKind::Syntax, format!("Syntax error: {err}"))
        }
    };

    let mut walker = Walker {
        policy,
        violation: None,
        binds_output: false,
    };
    walker.stmts(&suite);

    if let Some(reason) = walker.violation {
        return ValidationVerdict::reject(RejectionKind::Policy, reason);
    }
    if !walker.binds_output {
        return ValidationVerdict::reject(
            RejectionKind::Policy,
            format!(
                "Code must assign a figure to a variable named '{}'.",
                policy.output_variable
            ),
        );
    }
    ValidationVerdict::accept()
}

struct Walker<'a> {
    policy: &'a ValidationPolicy,
    violation: Option<String>,
    binds_output: bool,
}

impl Walker<'_> {
    fn done(&self) -> bool {
        self.violation.is_some()
    }

    fn stmts(&mut self, stmts: &[ast::Stmt]) {
        for stmt in stmts {
            if self.done() {
                return;
            }
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(node) => {
                for alias in &node.names {
                    if !self.policy.allows_module(alias.name.as_str()) {
                        self.violation =
                            Some(format!("Import of '{}' is not allowed.", alias.name.as_str()));
                        return;
                    }
                }
            }
            ast::Stmt::ImportFrom(node) => {
                let level = node.level.as_ref().map(|l| l.to_u32()).unwrap_or(0);
                match (&node.module, level) {
                    (Some(module), 0) if self.policy.allows_module(module.as_str()) => {}
                    (Some(module), _) => {
                        self.violation =
                            Some(format!("Import from '{}' is not allowed.", module.as_str()));
                    }
                    (None, _) => {
                        self.violation = Some("Relative imports are not allowed.".to_string());
                    }
                }
            }
            ast::Stmt::Assign(node) => {
                for target in &node.targets {
                    self.note_binding(target);
                    self.expr(target);
                }
                self.expr(&node.value);
            }
            ast::Stmt::AugAssign(node) => {
                self.note_binding(&node.target);
                self.expr(&node.target);
                self.expr(&node.value);
            }
            ast::Stmt::AnnAssign(node) => {
                self.expr(&node.target);
                self.expr(&node.annotation);
                if let Some(value) = &node.value {
                    self.expr(value);
                }
            }
            ast::Stmt::FunctionDef(node) => {
                self.arguments(&node.args);
                self.exprs(&node.decorator_list);
                if let Some(returns) = &node.returns {
                    self.expr(returns);
                }
                self.stmts(&node.body);
            }
            ast::Stmt::AsyncFunctionDef(node) => {
                self.arguments(&node.args);
                self.exprs(&node.decorator_list);
                if let Some(returns) = &node.returns {
                    self.expr(returns);
                }
                self.stmts(&node.body);
            }
            ast::Stmt::ClassDef(node) => {
                self.exprs(&node.bases);
                for keyword in &node.keywords {
                    self.expr(&keyword.value);
                }
                self.exprs(&node.decorator_list);
                self.stmts(&node.body);
            }
            ast::Stmt::Return(node) => {
                if let Some(value) = &node.value {
                    self.expr(value);
                }
            }
            ast::Stmt::Delete(node) => self.exprs(&node.targets),
            ast::Stmt::For(node) => {
                self.expr(&node.target);
                self.expr(&node.iter);
                self.stmts(&node.body);
                self.stmts(&node.orelse);
            }
            ast::Stmt::AsyncFor(node) => {
                self.expr(&node.target);
                self.expr(&node.iter);
                self.stmts(&node.body);
                self.stmts(&node.orelse);
            }
            ast::Stmt::While(node) => {
                self.expr(&node.test);
                self.stmts(&node.body);
                self.stmts(&node.orelse);
            }
            ast::Stmt::If(node) => {
                self.expr(&node.test);
                self.stmts(&node.body);
                self.stmts(&node.orelse);
            }
            ast::Stmt::With(node) => {
                for item in &node.items {
                    self.expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.expr(vars);
                    }
                }
                self.stmts(&node.body);
            }
            ast::Stmt::AsyncWith(node) => {
                for item in &node.items {
                    self.expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.expr(vars);
                    }
                }
                self.stmts(&node.body);
            }
            ast::Stmt::Match(node) => {
                self.expr(&node.subject);
                for case in &node.cases {
                    self.pattern(&case.pattern);
                    if let Some(guard) = &case.guard {
                        self.expr(guard);
                    }
                    self.stmts(&case.body);
                }
            }
            ast::Stmt::Raise(node) => {
                if let Some(exc) = &node.exc {
                    self.expr(exc);
                }
                if let Some(cause) = &node.cause {
                    self.expr(cause);
                }
            }
            ast::Stmt::Try(node) => {
                self.stmts(&node.body);
                self.handlers(&node.handlers);
                self.stmts(&node.orelse);
                self.stmts(&node.finalbody);
            }
            ast::Stmt::TryStar(node) => {
                self.stmts(&node.body);
                self.handlers(&node.handlers);
                self.stmts(&node.orelse);
                self.stmts(&node.finalbody);
            }
            ast::Stmt::Assert(node) => {
                self.expr(&node.test);
                if let Some(msg) = &node.msg {
                    self.expr(msg);
                }
            }
            ast::Stmt::Expr(node) => self.expr(&node.value),
            ast::Stmt::Global(_)
            | ast::Stmt::Nonlocal(_)
            | ast::Stmt::Pass(_)
            | ast::Stmt::Break(_)
            | ast::Stmt::Continue(_)
            | ast::Stmt::TypeAlias(_) => {}
        }
    }

    fn exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            if self.done() {
                return;
            }
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &ast::Expr) {
        if self.done() {
            return;
        }
        match expr {
            ast::Expr::Call(node) => {
                if let Some(name) = dotted_call_name(&node.func) {
                    let root = name.split('.').next().unwrap_or(&name);
                    if self.policy.blocked_call_roots.contains(root)
                        || self.policy.blocked_callables.contains(name.as_str())
                    {
                        self.violation = Some(format!("Call to '{name}' is not allowed."));
                        return;
                    }
                }
                self.expr(&node.func);
                self.exprs(&node.args);
                for keyword in &node.keywords {
                    self.expr(&keyword.value);
                }
            }
            ast::Expr::Attribute(node) => {
                if self.policy.blocked_attributes.contains(node.attr.as_str()) {
                    self.violation = Some(format!(
                        "Access to attribute '{}' is not allowed.",
                        node.attr.as_str()
                    ));
                    return;
                }
                self.expr(&node.value);
            }
            ast::Expr::BoolOp(node) => self.exprs(&node.values),
            ast::Expr::NamedExpr(node) => {
                self.note_binding(&node.target);
                self.expr(&node.target);
                self.expr(&node.value);
            }
            ast::Expr::BinOp(node) => {
                self.expr(&node.left);
                self.expr(&node.right);
            }
            ast::Expr::UnaryOp(node) => self.expr(&node.operand),
            ast::Expr::Lambda(node) => {
                self.arguments(&node.args);
                self.expr(&node.body);
            }
            ast::Expr::IfExp(node) => {
                self.expr(&node.test);
                self.expr(&node.body);
                self.expr(&node.orelse);
            }
            ast::Expr::Dict(node) => {
                for key in node.keys.iter().flatten() {
                    self.expr(key);
                }
                self.exprs(&node.values);
            }
            ast::Expr::Set(node) => self.exprs(&node.elts),
            ast::Expr::ListComp(node) => {
                self.expr(&node.elt);
                self.comprehensions(&node.generators);
            }
            ast::Expr::SetComp(node) => {
                self.expr(&node.elt);
                self.comprehensions(&node.generators);
            }
            ast::Expr::DictComp(node) => {
                self.expr(&node.key);
                self.expr(&node.value);
                self.comprehensions(&node.generators);
            }
            ast::Expr::GeneratorExp(node) => {
                self.expr(&node.elt);
                self.comprehensions(&node.generators);
            }
            ast::Expr::Await(node) => self.expr(&node.value),
            ast::Expr::Yield(node) => {
                if let Some(value) = &node.value {
                    self.expr(value);
                }
            }
            ast::Expr::YieldFrom(node) => self.expr(&node.value),
            ast::Expr::Compare(node) => {
                self.expr(&node.left);
                self.exprs(&node.comparators);
            }
            ast::Expr::FormattedValue(node) => {
                self.expr(&node.value);
                if let Some(spec) = &node.format_spec {
                    self.expr(spec);
                }
            }
            ast::Expr::JoinedStr(node) => self.exprs(&node.values),
            ast::Expr::Subscript(node) => {
                self.expr(&node.value);
                self.expr(&node.slice);
            }
            ast::Expr::Starred(node) => self.expr(&node.value),
            ast::Expr::List(node) => self.exprs(&node.elts),
            ast::Expr::Tuple(node) => self.exprs(&node.elts),
            ast::Expr::Slice(node) => {
                for part in [&node.lower, &node.upper, &node.step].into_iter().flatten() {
                    self.expr(part);
                }
            }
            ast::Expr::Constant(_) | ast::Expr::Name(_) => {}
        }
    }

    fn comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            if self.done() {
                return;
            }
            self.expr(&generator.target);
            self.expr(&generator.iter);
            self.exprs(&generator.ifs);
        }
    }

    fn handlers(&mut self, handlers: &[ast::ExceptHandler]) {
        for handler in handlers {
            if self.done() {
                return;
            }
            let ast::ExceptHandler::ExceptHandler(node) = handler;
            if let Some(type_) = &node.type_ {
                self.expr(type_);
            }
            self.stmts(&node.body);
        }
    }

    fn pattern(&mut self, pattern: &ast::Pattern) {
        if self.done() {
            return;
        }
        match pattern {
            ast::Pattern::MatchValue(node) => self.expr(&node.value),
            ast::Pattern::MatchMapping(node) => {
                self.exprs(&node.keys);
                for p in &node.patterns {
                    self.pattern(p);
                }
            }
            ast::Pattern::MatchClass(node) => {
                self.expr(&node.cls);
                for p in node.patterns.iter().chain(&node.kwd_patterns) {
                    self.pattern(p);
                }
            }
            ast::Pattern::MatchSequence(node) => {
                for p in &node.patterns {
                    self.pattern(p);
                }
            }
            ast::Pattern::MatchOr(node) => {
                for p in &node.patterns {
                    self.pattern(p);
                }
            }
            ast::Pattern::MatchAs(node) => {
                if let Some(p) = &node.pattern {
                    self.pattern(p);
                }
            }
            ast::Pattern::MatchSingleton(_) | ast::Pattern::MatchStar(_) => {}
        }
    }

    fn arguments(&mut self, args: &ast::Arguments) {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            if let Some(annotation) = &arg.def.annotation {
                self.expr(annotation);
            }
            if let Some(default) = &arg.default {
                self.expr(default);
            }
        }
        for arg in [&args.vararg, &args.kwarg].into_iter().flatten() {
            if let Some(annotation) = &arg.annotation {
                self.expr(annotation);
            }
        }
    }

    /// Record a direct or augmented assignment to the output variable.
    fn note_binding(&mut self, target: &ast::Expr) {
        if let ast::Expr::Name(name) = target {
            if name.id.as_str() == self.policy.output_variable {
                self.binds_output = true;
            }
        }
    }
}

/// Resolve a call's function expression to a dotted name, walking attribute
/// chains back to their root identifier. Calls on anything other than a plain
/// name or attribute chain (subscripts, call results) have no resolvable name.
fn dotted_call_name(func: &ast::Expr) -> Option<String> {
    match func {
        ast::Expr::Name(name) => Some(name.id.as_str().to_owned()),
        ast::Expr::Attribute(_) => {
            let mut parts = Vec::new();
            let mut current = func;
            while let ast::Expr::Attribute(attr) = current {
                parts.push(attr.attr.as_str());
                current = &attr.value;
            }
            if let ast::Expr::Name(name) = current {
                parts.push(name.id.as_str());
                parts.reverse();
                Some(parts.join("."))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationPolicy;

    fn check(source: &str) -> ValidationVerdict {
        validate(&CodeArtifact::new(source), &ValidationPolicy::default())
    }

    #[test]
    fn compliant_chart_code_is_accepted() {
        let verdict = check(
            "import plotly.express as px\n\
             fig = px.bar(df, x='a', y='b')\n",
        );
        assert!(verdict.accepted, "rejected: {:?}", verdict.reason);
    }

    #[test]
    fn accepts_every_allowlisted_module() {
        for module in [
            "pandas",
            "numpy",
            "plotly",
            "plotly.express",
            "datetime",
            "math",
            "statistics",
            "json",
            "re",
        ] {
            let verdict = check(&format!("import {module}\nfig = 1\n"));
            assert!(verdict.accepted, "'{module}' was rejected");
        }
    }

    #[test]
    fn rejects_unsafe_imports_naming_the_module() {
        for module in ["os", "subprocess", "socket", "shutil", "ctypes"] {
            let verdict = check(&format!("import {module}\nfig = 1\n"));
            assert!(!verdict.accepted);
            assert_eq!(verdict.kind, Some(RejectionKind::Policy));
            assert!(verdict.reason.as_deref().unwrap().contains(module));
        }
    }

    #[test]
    fn rejects_import_from_unsafe_module() {
        let verdict = check("from os import path\nfig = 1\n");
        assert!(!verdict.accepted);
        assert!(verdict.reason.as_deref().unwrap().contains("os"));
    }

    #[test]
    fn allows_import_from_allowed_submodule() {
        let verdict = check("from plotly.subplots import make_subplots\nfig = 1\n");
        assert!(verdict.accepted);
    }

    #[test]
    fn rejects_blocked_bare_calls() {
        for call in ["open('x')", "eval('1')", "exec('1')", "__import__('os')"] {
            let verdict = check(&format!("{call}\nfig = 1\n"));
            assert!(!verdict.accepted, "'{call}' was accepted");
        }
    }

    #[test]
    fn rejects_dotted_calls_by_root() {
        let verdict = check("os.system('ls')\nfig = 1\n");
        assert!(!verdict.accepted);
        assert!(verdict.reason.as_deref().unwrap().contains("os.system"));

        let verdict = check("subprocess.run(['ls'])\nfig = 1\n");
        assert!(!verdict.accepted);
    }

    #[test]
    fn rejects_reflective_attribute_access() {
        let verdict = check("x = ().__class__\nfig = 1\n");
        assert!(!verdict.accepted);
        assert!(verdict.reason.as_deref().unwrap().contains("__class__"));

        let verdict = check("y = f.__globals__\nfig = 1\n");
        assert!(!verdict.accepted);
    }

    #[test]
    fn rejects_blocked_calls_nested_in_expressions() {
        let verdict = check("fig = [open(p) for p in paths]\n");
        assert!(!verdict.accepted);
    }

    #[test]
    fn requires_output_binding() {
        let verdict = check("import math\nx = math.sqrt(4)\n");
        assert!(!verdict.accepted);
        assert!(verdict.reason.as_deref().unwrap().contains("'fig'"));
    }

    #[test]
    fn augmented_assignment_counts_as_binding() {
        let verdict = check("fig += 1\n");
        assert!(verdict.accepted);
    }

    #[test]
    fn conditional_binding_satisfies_the_static_check() {
        // Reachability is the executor's problem; the walker only requires
        // that an assignment exists somewhere in the tree.
        let verdict = check("if False:\n    fig = 1\n");
        assert!(verdict.accepted);
    }

    #[test]
    fn syntax_errors_are_distinguished_from_policy_rejections() {
        let verdict = check("def broken(:\n");
        assert!(!verdict.accepted);
        assert_eq!(verdict.kind, Some(RejectionKind::Syntax));
        assert!(verdict.reason.as_deref().unwrap().contains("Syntax error"));
    }

    #[test]
    fn relative_imports_are_rejected() {
        let verdict = check("from . import helpers\nfig = 1\n");
        assert!(!verdict.accepted);
    }

    #[test]
    fn validation_is_idempotent() {
        let code = CodeArtifact::new("import os\nfig = 1\n");
        let policy = ValidationPolicy::default();
        let first = validate(&code, &policy);
        let second = validate(&code, &policy);
        assert_eq!(first, second);
    }

    #[test]
    fn first_violation_wins() {
        // Both an unsafe import and an unsafe call are present; the import
        // appears first in source order and names the reason.
        let verdict = check("import os\nopen('x')\nfig = 1\n");
        assert!(verdict.reason.as_deref().unwrap().contains("Import of 'os'"));
    }
}
