//! The runtime value model of the expression language.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as Json;

/// A value produced during evaluation. JSON objects and arrays stay wrapped
/// as [`Json`] and are only unwrapped when accessed; scalars are normalized
/// into the dedicated variants.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
    Json(Json),
    Null,
}

impl Value {
    /// Normalizes a JSON value: scalars become scalar variants, containers
    /// stay wrapped.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Self::Str(s.clone()),
            container => Self::Json(container.clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Timestamp(_) => "timestamp",
            Self::Duration(_) => "duration",
            Self::Json(Json::Array(_)) => "list",
            Self::Json(_) => "map",
            Self::Null => "null",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The boolean interpretation used by [`Program::matches`][super::Program::matches]:
    /// only `true` itself is true.
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    /// Coerces to a timestamp: timestamps pass through, strings parse as
    /// RFC3339.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Str(raw) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Parses Go-style duration literals: a sequence of `<number><unit>` terms
/// with units `h`, `m`, `s`, `ms`, and `d` for whole days, e.g. `"36h"`,
/// `"1h30m"`, `"90s"`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (negative, mut rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let mut total = Duration::zero();
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }
        let amount: i64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::milliseconds(amount))
        } else if rest.starts_with('h') {
            (1, Duration::hours(amount))
        } else if rest.starts_with('m') {
            (1, Duration::minutes(amount))
        } else if rest.starts_with('s') {
            (1, Duration::seconds(amount))
        } else if rest.starts_with('d') {
            (1, Duration::days(amount))
        } else {
            return None;
        };

        total += unit;
        rest = &rest[unit_len..];
    }

    Some(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("10m", Duration::minutes(10))]
    #[case("1h30m", Duration::minutes(90))]
    #[case("90s", Duration::seconds(90))]
    #[case("250ms", Duration::milliseconds(250))]
    #[case("2d", Duration::days(2))]
    #[case("-15m", Duration::minutes(-15))]
    fn durations(#[case] raw: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("10")]
    #[case("10x")]
    #[case("ten minutes")]
    fn invalid_durations(#[case] raw: &str) {
        assert_eq!(parse_duration(raw), None);
    }

    #[test]
    fn json_normalization() {
        assert_eq!(Value::from_json(&json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(&json!(3)), Value::Int(3));
        assert_eq!(Value::from_json(&json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from_json(&json!("x")), Value::Str("x".into()));
        assert_eq!(Value::from_json(&json!(null)), Value::Null);
        assert!(matches!(
            Value::from_json(&json!({"a": 1})),
            Value::Json(_)
        ));
    }

    #[test]
    fn string_timestamp_coercion() {
        let ts = Value::Str("2024-05-01T10:00:00Z".into()).as_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(Value::Int(5).as_timestamp(), None);
    }
}
