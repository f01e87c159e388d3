//! The expression evaluator.
//!
//! Evaluation is strict except for `&&`/`||` (short-circuiting) and never
//! mutates the input document. Missing map keys resolve to null; genuine
//! type errors abort the evaluation — the caller decides whether to
//! propagate them or fold them into `false`.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use snafu::{OptionExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;

use super::{
    ast::{BinaryOp, Expr, Literal, UnaryOp},
    value::{Value, parse_duration},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("evaluation was cancelled"))]
    Cancelled,

    #[snafu(display("operator {op} cannot be applied to {lhs} and {rhs}"))]
    BinaryTypeMismatch {
        op: BinaryOp,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[snafu(display("operator {op} cannot be applied to {ty}"))]
    UnaryTypeMismatch { op: UnaryOp, ty: &'static str },

    #[snafu(display("{function}() argument is not usable: {message}"))]
    BadArgument {
        function: &'static str,
        message: String,
    },

    #[snafu(display("cannot access a field on {ty}"))]
    FieldOnScalar { ty: &'static str },

    #[snafu(display("arithmetic overflow"))]
    Overflow,
}

/// Per-evaluation context: the wall-clock instant `now()` returns and the
/// cancellation signal of the surrounding request.
#[derive(Clone, Debug)]
pub struct EvalContext {
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl EvalContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            now: Utc::now(),
            cancel,
        }
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

pub fn evaluate(ctx: &EvalContext, expr: &Expr, resource: &Json) -> Result<Value> {
    ensure!(!ctx.cancel.is_cancelled(), CancelledSnafu);

    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
            Literal::Null => Value::Null,
        }),

        Expr::Ident(name) => Ok(resource
            .get(name.as_str())
            .map_or(Value::Null, Value::from_json)),

        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(ctx, item, resource).map(to_json))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Json(Json::Array(values)))
        }

        Expr::Member { object, field } => {
            let object = evaluate(ctx, object, resource)?;
            access_field(&object, field)
        }

        Expr::Index { object, index } => {
            let object = evaluate(ctx, object, resource)?;
            let index = evaluate(ctx, index, resource)?;
            access_index(&object, &index)
        }

        Expr::Call { function, args } => call(ctx, function, args, resource),

        Expr::Method {
            receiver,
            method,
            args,
        } => {
            let receiver = evaluate(ctx, receiver, resource)?;
            let arg = evaluate(ctx, &args[0], resource)?;
            string_method(method, &receiver, &arg)
        }

        Expr::Unary { op, operand } => {
            let value = evaluate(ctx, operand, resource)?;
            apply_unary(*op, &value)
        }

        Expr::Binary { op, lhs, rhs } => apply_binary(ctx, *op, lhs, rhs, resource),
    }
}

fn to_json(value: Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(b),
        Value::Int(i) => Json::from(i),
        Value::Float(f) => serde_json::Number::from_f64(f).map_or(Json::Null, Json::Number),
        Value::Str(s) => Json::String(s),
        Value::Timestamp(ts) => Json::String(ts.to_rfc3339()),
        Value::Duration(d) => Json::String(format!("{}s", d.num_seconds())),
        Value::Json(json) => json,
        Value::Null => Json::Null,
    }
}

fn access_field(object: &Value, field: &str) -> Result<Value> {
    match object {
        Value::Json(Json::Object(map)) => {
            Ok(map.get(field).map_or(Value::Null, Value::from_json))
        }
        Value::Null => Ok(Value::Null),
        other => FieldOnScalarSnafu {
            ty: other.type_name(),
        }
        .fail(),
    }
}

fn access_index(object: &Value, index: &Value) -> Result<Value> {
    match (object, index) {
        (Value::Json(Json::Object(map)), Value::Str(key)) => {
            Ok(map.get(key).map_or(Value::Null, Value::from_json))
        }
        (Value::Json(Json::Array(items)), Value::Int(idx)) => Ok(usize::try_from(*idx)
            .ok()
            .and_then(|idx| items.get(idx))
            .map_or(Value::Null, Value::from_json)),
        (Value::Null, _) => Ok(Value::Null),
        (object, index) => BinaryTypeMismatchSnafu {
            op: BinaryOp::In,
            lhs: index.type_name(),
            rhs: object.type_name(),
        }
        .fail(),
    }
}

fn call(ctx: &EvalContext, function: &str, args: &[Expr], resource: &Json) -> Result<Value> {
    match function {
        "now" => Ok(Value::Timestamp(ctx.now)),

        "timestamp" => {
            let arg = evaluate(ctx, &args[0], resource)?;
            if arg.is_null() {
                return Ok(Value::Null);
            }
            let ts = arg.as_timestamp().context(BadArgumentSnafu {
                function: "timestamp",
                message: format!("{} is not an RFC3339 timestamp", arg.type_name()),
            })?;
            Ok(Value::Timestamp(ts))
        }

        "duration" => {
            let arg = evaluate(ctx, &args[0], resource)?;
            let Value::Str(raw) = &arg else {
                return BadArgumentSnafu {
                    function: "duration",
                    message: format!("expected a string, got {}", arg.type_name()),
                }
                .fail();
            };
            let duration = parse_duration(raw).context(BadArgumentSnafu {
                function: "duration",
                message: format!("{raw:?} is not a duration literal"),
            })?;
            Ok(Value::Duration(duration))
        }

        "has" => {
            // The checker guarantees the argument is a path; a path whose
            // prefix is missing resolves to null, which is exactly "absent".
            let value = evaluate(ctx, &args[0], resource)?;
            Ok(Value::Bool(!value.is_null()))
        }

        _ => unreachable!("checker rejects unknown function {function:?}"),
    }
}

fn string_method(method: &str, receiver: &Value, arg: &Value) -> Result<Value> {
    if receiver.is_null() || arg.is_null() {
        return Ok(Value::Bool(false));
    }

    let (Value::Str(receiver), Value::Str(arg)) = (receiver, arg) else {
        return BinaryTypeMismatchSnafu {
            op: BinaryOp::Eq,
            lhs: receiver.type_name(),
            rhs: arg.type_name(),
        }
        .fail();
    };

    Ok(Value::Bool(match method {
        "contains" => receiver.contains(arg.as_str()),
        "startsWith" => receiver.starts_with(arg.as_str()),
        "endsWith" => receiver.ends_with(arg.as_str()),
        _ => unreachable!("checker rejects unknown method {method:?}"),
    }))
}

fn apply_unary(op: UnaryOp, value: &Value) -> Result<Value> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        // !null is true so that `!has(...)`-style guards compose with
        // missing fields
        (UnaryOp::Not, Value::Null) => Ok(Value::Bool(true)),
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or(Error::Overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Duration(d)) => Ok(Value::Duration(-*d)),
        (op, value) => UnaryTypeMismatchSnafu {
            op,
            ty: value.type_name(),
        }
        .fail(),
    }
}

fn apply_binary(
    ctx: &EvalContext,
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    resource: &Json,
) -> Result<Value> {
    use BinaryOp::{Add, And, Eq, Ge, Gt, In, Le, Lt, Ne, Or, Sub};

    // Short-circuiting boolean operators first.
    if matches!(op, And | Or) {
        let lhs = evaluate(ctx, lhs, resource)?;
        let lhs = as_bool(op, &lhs)?;

        return match (op, lhs) {
            (And, false) => Ok(Value::Bool(false)),
            (Or, true) => Ok(Value::Bool(true)),
            _ => {
                let rhs = evaluate(ctx, rhs, resource)?;
                Ok(Value::Bool(as_bool(op, &rhs)?))
            }
        };
    }

    let lhs = evaluate(ctx, lhs, resource)?;
    let rhs = evaluate(ctx, rhs, resource)?;

    match op {
        Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        Lt | Le | Gt | Ge => compare(op, &lhs, &rhs),
        In => membership(&lhs, &rhs),
        Add | Sub => arithmetic(op, &lhs, &rhs),
        And | Or => unreachable!("handled above"),
    }
}

fn as_bool(op: BinaryOp, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        // null short-circuits to false rather than erroring, so partially
        // populated resources do not poison whole filters
        Value::Null => Ok(false),
        other => BinaryTypeMismatchSnafu {
            op,
            lhs: other.type_name(),
            rhs: "bool",
        }
        .fail(),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(l), Value::Float(r)) | (Value::Float(r), Value::Int(l)) => (*l as f64) == *r,
        (Value::Timestamp(l), r) | (r, Value::Timestamp(l)) => {
            r.as_timestamp().is_some_and(|r| *l == r)
        }
        (l, r) => l == r,
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use std::cmp::Ordering;

    let ordering: Ordering = match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => l.cmp(r),
        (Value::Int(l), Value::Float(r)) => float_cmp(*l as f64, *r)?,
        (Value::Float(l), Value::Int(r)) => float_cmp(*l, *r as f64)?,
        (Value::Float(l), Value::Float(r)) => float_cmp(*l, *r)?,
        (Value::Str(l), Value::Str(r)) => {
            // Two strings compare as timestamps when both parse, else
            // lexicographically.
            match (lhs.as_timestamp(), rhs.as_timestamp()) {
                (Some(l), Some(r)) => l.cmp(&r),
                _ => l.cmp(r),
            }
        }
        (Value::Duration(l), Value::Duration(r)) => l.cmp(r),
        (l @ (Value::Timestamp(_) | Value::Str(_)), r @ (Value::Timestamp(_) | Value::Str(_))) => {
            match (l.as_timestamp(), r.as_timestamp()) {
                (Some(l), Some(r)) => l.cmp(&r),
                _ => {
                    return BinaryTypeMismatchSnafu {
                        op,
                        lhs: lhs.type_name(),
                        rhs: rhs.type_name(),
                    }
                    .fail();
                }
            }
        }
        (l, r) => {
            return BinaryTypeMismatchSnafu {
                op,
                lhs: l.type_name(),
                rhs: r.type_name(),
            }
            .fail();
        }
    };

    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!("compare only receives ordering operators"),
    }))
}

fn float_cmp(l: f64, r: f64) -> Result<std::cmp::Ordering> {
    l.partial_cmp(&r).ok_or(Error::Overflow)
}

fn membership(needle: &Value, haystack: &Value) -> Result<Value> {
    match haystack {
        Value::Json(Json::Array(items)) => Ok(Value::Bool(
            items
                .iter()
                .any(|item| values_equal(needle, &Value::from_json(item))),
        )),
        Value::Json(Json::Object(map)) => {
            let Value::Str(key) = needle else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(map.contains_key(key)))
        }
        Value::Null => Ok(Value::Bool(false)),
        other => BinaryTypeMismatchSnafu {
            op: BinaryOp::In,
            lhs: needle.type_name(),
            rhs: other.type_name(),
        }
        .fail(),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use BinaryOp::Add;

    match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => {
            let result = if op == Add {
                l.checked_add(*r)
            } else {
                l.checked_sub(*r)
            };
            result.map(Value::Int).ok_or(Error::Overflow)
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (l, r) = (as_f64(lhs), as_f64(rhs));
            Ok(Value::Float(if op == Add { l + r } else { l - r }))
        }
        (Value::Str(l), Value::Str(r)) if op == Add => Ok(Value::Str(format!("{l}{r}"))),
        (Value::Timestamp(l), Value::Duration(r)) => Ok(Value::Timestamp(if op == Add {
            *l + *r
        } else {
            *l - *r
        })),
        (Value::Duration(l), Value::Timestamp(r)) if op == Add => Ok(Value::Timestamp(*r + *l)),
        (Value::Duration(l), Value::Duration(r)) => Ok(Value::Duration(if op == Add {
            *l + *r
        } else {
            *l - *r
        })),
        (l, r) => {
            // String/timestamp coercion for `now() - creationTimestamp`
            // style arithmetic.
            if let (Some(l), Some(r)) = (l.as_timestamp(), r.as_timestamp())
                && op == BinaryOp::Sub
            {
                return Ok(Value::Duration(l - r));
            }
            BinaryTypeMismatchSnafu {
                op,
                lhs: l.type_name(),
                rhs: r.type_name(),
            }
            .fail()
        }
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}
