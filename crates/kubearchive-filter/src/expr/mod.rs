//! The policy expression language: compile once, evaluate per event.
//!
//! Expressions are written against three variables — `metadata`, `spec` and
//! `status`, the string-keyed maps of the observed resource — plus a `now()`
//! function. Compilation parses and type-checks; the resulting [`Program`]
//! is immutable and safe to evaluate concurrently.

use serde_json::Value as Json;
use snafu::{ResultExt, Snafu};

mod ast;
mod eval;
mod parser;
mod types;
mod value;

pub use eval::EvalContext;
pub use value::Value;

type Result<T, E = CompileError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CompileError {
    #[snafu(display("cannot compile an empty expression"))]
    EmptySource,

    #[snafu(display("{source}"))]
    Parse { source: parser::Error },

    #[snafu(display("Type error: {source}"))]
    Type { source: types::Error },
}

pub use eval::Error as EvalError;

/// A compiled policy expression.
///
/// Programs are read-only after compilation; evaluation borrows the input
/// document immutably, so a single program can serve any number of
/// concurrent evaluations.
#[derive(Clone, Debug)]
pub struct Program {
    source: String,
    ast: ast::Expr,
}

impl Program {
    /// Parses and type-checks `source`. Both syntactic and typing failures
    /// are compile errors carrying enough position information for admission
    /// messages.
    pub fn compile(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return EmptySourceSnafu.fail();
        }

        let ast = parser::parse(trimmed).context(ParseSnafu)?;
        types::check_program(&ast).context(TypeSnafu)?;

        Ok(Self {
            source: trimmed.to_owned(),
            ast,
        })
    }

    /// Like [`Program::compile`], but without requiring a boolean result.
    /// Used for ordering-key expressions which evaluate to any comparable
    /// value.
    pub fn compile_value(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return EmptySourceSnafu.fail();
        }

        let ast = parser::parse(trimmed).context(ParseSnafu)?;
        types::check_value(&ast).context(TypeSnafu)?;

        Ok(Self {
            source: trimmed.to_owned(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against a resource document. The document is not mutated.
    pub fn evaluate(&self, ctx: &EvalContext, resource: &Json) -> Result<Value, EvalError> {
        eval::evaluate(ctx, &self.ast, resource)
    }

    /// The boolean helper every filter decision goes through: evaluation
    /// errors and non-boolean results are `false`, keeping the archive on
    /// the fail-closed side.
    pub fn matches(&self, ctx: &EvalContext, resource: &Json) -> bool {
        match self.evaluate(ctx, resource) {
            Ok(value) => value.is_true(),
            Err(error) => {
                tracing::debug!(source = %self.source, %error, "expression evaluation failed, treating as false");
                false
            }
        }
    }
}

/// Combines several expression sources into one with logical OR, wrapping
/// each in parentheses. Empty and whitespace-only sources are dropped;
/// returns `None` when nothing remains.
pub fn or_join<'a>(sources: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let parts: Vec<String> = sources
        .into_iter()
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map(|source| format!("({source})"))
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" || "))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn compile_rejects_empty_sources() {
        assert!(matches!(
            Program::compile("   ").unwrap_err(),
            CompileError::EmptySource
        ));
    }

    #[test]
    fn compile_error_messages_name_syntax_errors() {
        let error = Program::compile("status.state *^ Completed'").unwrap_err();
        assert!(error.to_string().contains("Syntax error"), "{error}");
    }

    #[test]
    fn compile_rejects_non_boolean_programs() {
        let error = Program::compile("'a string'").unwrap_err();
        assert!(error.to_string().contains("boolean"), "{error}");
    }

    #[test]
    fn or_join_drops_empties_and_parenthesizes() {
        assert_eq!(
            or_join(["a == 1", "", "  ", "b == 2"]).unwrap(),
            "(a == 1) || (b == 2)"
        );
        assert_eq!(or_join(["", "  "]), None);
        assert_eq!(or_join(std::iter::empty::<&str>()), None);
    }

    #[test]
    fn or_joined_sources_compile_and_evaluate() {
        let source = or_join([
            "status.phase == 'Succeeded'",
            "status.phase == 'Failed'",
        ])
        .unwrap();
        let program = Program::compile(&source).unwrap();

        let ctx = EvalContext::default();
        assert!(program.matches(&ctx, &json!({"status": {"phase": "Failed"}})));
        assert!(!program.matches(&ctx, &json!({"status": {"phase": "Running"}})));
    }

    #[test]
    fn matches_swallows_evaluation_errors() {
        let program = Program::compile("spec.replicas > 'not-a-number'").unwrap();
        let ctx = EvalContext::default();
        assert!(!program.matches(&ctx, &json!({"spec": {"replicas": 3}})));
    }

    #[test]
    fn programs_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Program>();
    }
}
