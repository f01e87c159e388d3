//! Static type checking of parsed expressions.
//!
//! The language is dynamically typed at the leaves (field access on the
//! `metadata`/`spec`/`status` maps yields `Dyn`), so the checker's job is to
//! reject what is *provably* wrong: unknown variables and functions, bad
//! arities, operators applied to impossible operand types and programs whose
//! result cannot be boolean.

use snafu::{Snafu, ensure};

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "unknown variable {name:?}, expected one of \"metadata\", \"spec\", \"status\""
    ))]
    UnknownVariable { name: String },

    #[snafu(display("unknown function {name:?}"))]
    UnknownFunction { name: String },

    #[snafu(display("unknown method {name:?}"))]
    UnknownMethod { name: String },

    #[snafu(display("{function}() takes {expected} argument(s), got {got}"))]
    WrongArity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[snafu(display("has() requires a field access argument"))]
    HasRequiresPath,

    #[snafu(display("cannot access field {field:?} on a value of type {ty}"))]
    FieldOnNonMap { field: String, ty: Ty },

    #[snafu(display("cannot index into a value of type {ty}"))]
    IndexOnNonCollection { ty: Ty },

    #[snafu(display("operator {op} cannot be applied to {lhs} and {rhs}"))]
    BinaryTypeMismatch { op: BinaryOp, lhs: Ty, rhs: Ty },

    #[snafu(display("operator {op} cannot be applied to {ty}"))]
    UnaryTypeMismatch { op: UnaryOp, ty: Ty },

    #[snafu(display("expression must evaluate to a boolean, but returns {ty}"))]
    NonBooleanProgram { ty: Ty },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Ty {
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "float")]
    Float,
    #[strum(serialize = "string")]
    Str,
    #[strum(serialize = "timestamp")]
    Timestamp,
    #[strum(serialize = "duration")]
    Duration,
    #[strum(serialize = "list")]
    List,
    #[strum(serialize = "map")]
    Map,
    #[strum(serialize = "null")]
    Null,
    #[strum(serialize = "dyn")]
    Dyn,
}

impl Ty {
    fn is_dynamic(self) -> bool {
        matches!(self, Self::Dyn | Self::Null)
    }

    fn numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float) || self.is_dynamic()
    }

    fn string_like(self) -> bool {
        self == Self::Str || self.is_dynamic()
    }

    fn boolean_like(self) -> bool {
        self == Self::Bool || self.is_dynamic()
    }
}

/// Checks the program and returns its result type. A program whose result
/// type is provably non-boolean is rejected here; `Dyn` passes and falls
/// back to the runtime "non-boolean means false" rule.
pub fn check_program(expr: &Expr) -> Result<Ty> {
    let ty = check(expr)?;
    ensure!(ty.boolean_like(), NonBooleanProgramSnafu { ty });
    Ok(ty)
}

/// Checks an expression without the boolean-result requirement, for places
/// which evaluate to arbitrary values (vacuum ordering keys).
pub fn check_value(expr: &Expr) -> Result<Ty> {
    check(expr)
}

fn check(expr: &Expr) -> Result<Ty> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Bool(_) => Ty::Bool,
            Literal::Int(_) => Ty::Int,
            Literal::Float(_) => Ty::Float,
            Literal::Str(_) => Ty::Str,
            Literal::Null => Ty::Null,
        }),

        Expr::Ident(name) => match name.as_str() {
            "metadata" | "spec" | "status" => Ok(Ty::Map),
            _ => UnknownVariableSnafu { name }.fail(),
        },

        Expr::List(items) => {
            for item in items {
                check(item)?;
            }
            Ok(Ty::List)
        }

        Expr::Member { object, field } => {
            let ty = check(object)?;
            ensure!(
                matches!(ty, Ty::Map | Ty::Dyn | Ty::Null),
                FieldOnNonMapSnafu { field, ty }
            );
            Ok(Ty::Dyn)
        }

        Expr::Index { object, index } => {
            let ty = check(object)?;
            ensure!(
                matches!(ty, Ty::Map | Ty::List | Ty::Dyn | Ty::Null),
                IndexOnNonCollectionSnafu { ty }
            );
            check(index)?;
            Ok(Ty::Dyn)
        }

        Expr::Call { function, args } => check_call(function, args),

        Expr::Method {
            receiver,
            method,
            args,
        } => {
            let receiver_ty = check(receiver)?;
            match method.as_str() {
                "contains" | "startsWith" | "endsWith" => {
                    ensure!(
                        args.len() == 1,
                        WrongAritySnafu {
                            function: method,
                            expected: 1usize,
                            got: args.len(),
                        }
                    );
                    let arg_ty = check(&args[0])?;
                    ensure!(
                        receiver_ty.string_like() && arg_ty.string_like(),
                        BinaryTypeMismatchSnafu {
                            op: BinaryOp::Eq,
                            lhs: receiver_ty,
                            rhs: arg_ty,
                        }
                    );
                    Ok(Ty::Bool)
                }
                _ => UnknownMethodSnafu { name: method }.fail(),
            }
        }

        Expr::Unary { op, operand } => {
            let ty = check(operand)?;
            match op {
                UnaryOp::Not => {
                    ensure!(ty.boolean_like(), UnaryTypeMismatchSnafu { op: *op, ty });
                    Ok(Ty::Bool)
                }
                UnaryOp::Neg => {
                    ensure!(
                        ty.numeric() || ty == Ty::Duration,
                        UnaryTypeMismatchSnafu { op: *op, ty }
                    );
                    Ok(if ty.is_dynamic() { Ty::Dyn } else { ty })
                }
            }
        }

        Expr::Binary { op, lhs, rhs } => {
            let lhs_ty = check(lhs)?;
            let rhs_ty = check(rhs)?;
            check_binary(*op, lhs_ty, rhs_ty)
        }
    }
}

fn check_call(function: &str, args: &[Expr]) -> Result<Ty> {
    let arity = |expected: usize| -> Result<()> {
        ensure!(
            args.len() == expected,
            WrongAritySnafu {
                function,
                expected,
                got: args.len(),
            }
        );
        Ok(())
    };

    match function {
        "now" => {
            arity(0)?;
            Ok(Ty::Timestamp)
        }
        "timestamp" => {
            arity(1)?;
            let ty = check(&args[0])?;
            ensure!(
                ty.string_like() || ty == Ty::Timestamp,
                BinaryTypeMismatchSnafu {
                    op: BinaryOp::Eq,
                    lhs: ty,
                    rhs: Ty::Str,
                }
            );
            Ok(Ty::Timestamp)
        }
        "duration" => {
            arity(1)?;
            let ty = check(&args[0])?;
            ensure!(
                ty.string_like(),
                BinaryTypeMismatchSnafu {
                    op: BinaryOp::Eq,
                    lhs: ty,
                    rhs: Ty::Str,
                }
            );
            Ok(Ty::Duration)
        }
        "has" => {
            arity(1)?;
            ensure!(
                matches!(args[0], Expr::Member { .. } | Expr::Index { .. }),
                HasRequiresPathSnafu
            );
            check(&args[0])?;
            Ok(Ty::Bool)
        }
        _ => UnknownFunctionSnafu { name: function }.fail(),
    }
}

fn check_binary(op: BinaryOp, lhs: Ty, rhs: Ty) -> Result<Ty> {
    use BinaryOp::{Add, And, Eq, Ge, Gt, In, Le, Lt, Ne, Or, Sub};

    let mismatch = || BinaryTypeMismatchSnafu { op, lhs, rhs }.fail();

    match op {
        Or | And => {
            if lhs.boolean_like() && rhs.boolean_like() {
                Ok(Ty::Bool)
            } else {
                mismatch()
            }
        }

        Eq | Ne => {
            // Equality is defined between equal types and anything dynamic;
            // strings additionally compare against timestamps (RFC3339
            // coercion at runtime).
            let comparable = lhs == rhs
                || lhs.is_dynamic()
                || rhs.is_dynamic()
                || (lhs.string_like() && rhs == Ty::Timestamp)
                || (lhs == Ty::Timestamp && rhs.string_like())
                || (lhs.numeric() && rhs.numeric());
            if comparable { Ok(Ty::Bool) } else { mismatch() }
        }

        Lt | Le | Gt | Ge => {
            let ordered = (lhs.numeric() && rhs.numeric())
                || (lhs.string_like() && rhs.string_like())
                || (lhs == Ty::Timestamp || rhs == Ty::Timestamp)
                    && (lhs == Ty::Timestamp || lhs.string_like())
                    && (rhs == Ty::Timestamp || rhs.string_like())
                || (lhs == Ty::Duration && rhs == Ty::Duration)
                || (lhs == Ty::Duration && rhs.is_dynamic())
                || (lhs.is_dynamic() && rhs == Ty::Duration);
            if ordered { Ok(Ty::Bool) } else { mismatch() }
        }

        In => {
            if matches!(rhs, Ty::List | Ty::Map | Ty::Dyn | Ty::Null) {
                Ok(Ty::Bool)
            } else {
                mismatch()
            }
        }

        Add | Sub => match (lhs, rhs) {
            (Ty::Int, Ty::Int) => Ok(Ty::Int),
            (Ty::Int | Ty::Float, Ty::Int | Ty::Float) => Ok(Ty::Float),
            (Ty::Str, Ty::Str) if op == Add => Ok(Ty::Str),
            (Ty::Timestamp, Ty::Duration) => Ok(Ty::Timestamp),
            (Ty::Duration, Ty::Timestamp) if op == Add => Ok(Ty::Timestamp),
            (Ty::Timestamp, Ty::Timestamp) if op == Sub => Ok(Ty::Duration),
            (Ty::Duration, Ty::Duration) => Ok(Ty::Duration),
            _ if lhs.is_dynamic() || rhs.is_dynamic() => Ok(Ty::Dyn),
            _ => mismatch(),
        },
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{super::parser::parse, *};

    fn check_source(source: &str) -> Result<Ty> {
        check_program(&parse(source).unwrap())
    }

    #[rstest]
    #[case("true")]
    #[case("status.phase == 'Succeeded'")]
    #[case("metadata.labels['env'] != 'prod'")]
    #[case("has(status.completionTime)")]
    #[case("now() - timestamp(metadata.creationTimestamp) > duration('10m')")]
    #[case("status.phase in ['Succeeded', 'Failed']")]
    #[case("metadata.name.startsWith('job-') || spec.suspend == true")]
    #[case("!(spec.replicas > 3)")]
    // a bare dynamic field may turn out boolean at runtime
    #[case("spec.suspend")]
    fn accepted(#[case] source: &str) {
        check_source(source).unwrap();
    }

    #[rstest]
    #[case("'just a string'")]
    #[case("42")]
    #[case("now()")]
    #[case("duration('5m')")]
    #[case("metadata")]
    fn provably_non_boolean_is_rejected(#[case] source: &str) {
        assert!(matches!(
            check_source(source).unwrap_err(),
            Error::NonBooleanProgram { .. }
        ));
    }

    #[test]
    fn unknown_variable() {
        assert_eq!(
            check_source("foo.bar == 1").unwrap_err(),
            Error::UnknownVariable { name: "foo".into() }
        );
    }

    #[test]
    fn unknown_function() {
        assert_eq!(
            check_source("frobnicate(status) == 1").unwrap_err(),
            Error::UnknownFunction {
                name: "frobnicate".into()
            }
        );
    }

    #[test]
    fn bad_arity() {
        assert!(matches!(
            check_source("now(status.phase) == now()").unwrap_err(),
            Error::WrongArity { .. }
        ));
    }

    #[test]
    fn operator_type_mismatch() {
        assert!(matches!(
            check_source("true < false").unwrap_err(),
            Error::BinaryTypeMismatch { .. }
        ));
    }

    #[test]
    fn has_requires_a_path() {
        assert_eq!(
            check_source("has('literal')").unwrap_err(),
            Error::HasRequiresPath
        );
    }

    #[test]
    fn field_access_on_scalar_is_rejected() {
        assert!(matches!(
            check_source("now().year == 2024").unwrap_err(),
            Error::FieldOnNonMap { .. }
        ));
    }
}
