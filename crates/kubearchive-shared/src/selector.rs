//! Parsing and evaluation of Kubernetes label selector strings.
//!
//! Supports the full `kubectl` selector vocabulary: equality (`=`, `==`),
//! inequality (`!=`), set membership (`in`, `notin`), existence (`key`) and
//! non-existence (`!key`). Requirements are comma-separated and conjunctive.

use std::{collections::BTreeMap, fmt, str::FromStr};

use snafu::{OptionExt, Snafu, ensure};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("empty selector requirement"))]
    EmptyRequirement,

    #[snafu(display("selector requirement {requirement:?} has an empty key"))]
    EmptyKey { requirement: String },

    #[snafu(display("set requirement {requirement:?} is missing a parenthesized value list"))]
    MissingValueList { requirement: String },

    #[snafu(display("set requirement {requirement:?} must list at least one value"))]
    EmptyValueList { requirement: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Operator {
    #[strum(serialize = "=")]
    Equals,
    #[strum(serialize = "!=")]
    NotEquals,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "notin")]
    NotIn,
    #[strum(serialize = "exists")]
    Exists,
    #[strum(serialize = "!")]
    DoesNotExist,
}

/// A single parsed requirement, e.g. `env in (dev, stage)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    /// Evaluates this requirement against a label map with the semantics the
    /// apiserver uses: `!=` and `notin` also match objects lacking the key.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);

        match self.operator {
            Operator::Equals => value.is_some_and(|v| self.values.first() == Some(v)),
            Operator::NotEquals => !value.is_some_and(|v| self.values.first() == Some(v)),
            Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A conjunction of [`Requirement`]s parsed from a selector string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Canonical textual form, used for continue-token fingerprinting.
    pub fn canonical(&self) -> String {
        self.requirements
            .iter()
            .map(|r| match r.operator {
                Operator::Equals | Operator::NotEquals => {
                    format!("{}{}{}", r.key, r.operator, r.values[0])
                }
                Operator::In | Operator::NotIn => {
                    format!("{} {} ({})", r.key, r.operator, r.values.join(","))
                }
                Operator::Exists => r.key.clone(),
                Operator::DoesNotExist => format!("!{}", r.key),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();

        for raw in split_requirements(selector) {
            let raw = raw.trim();
            if raw.is_empty() {
                return EmptyRequirementSnafu.fail();
            }
            requirements.push(parse_requirement(raw)?);
        }

        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Splits on commas which are not inside a parenthesized value list.
fn split_requirements(selector: &str) -> Vec<&str> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in selector.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&selector[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);

    parts
}

fn parse_requirement(raw: &str) -> Result<Requirement> {
    // Non-existence: "!key"
    if let Some(key) = raw.strip_prefix('!') {
        let key = key.trim();
        ensure!(!key.is_empty(), EmptyKeySnafu { requirement: raw });
        return Ok(Requirement {
            key: key.to_owned(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        });
    }

    // Equality forms, checked longest-operator-first so "!=" wins over "=".
    for (symbol, operator) in [
        ("!=", Operator::NotEquals),
        ("==", Operator::Equals),
        ("=", Operator::Equals),
    ] {
        if let Some((key, value)) = raw.split_once(symbol) {
            let key = key.trim();
            ensure!(!key.is_empty(), EmptyKeySnafu { requirement: raw });
            return Ok(Requirement {
                key: key.to_owned(),
                operator,
                values: vec![value.trim().to_owned()],
            });
        }
    }

    // Set forms: "key in (a, b)" / "key notin (a, b)"
    let mut words = raw.splitn(2, char::is_whitespace);
    let key = words.next().unwrap_or_default().trim();
    ensure!(!key.is_empty(), EmptyKeySnafu { requirement: raw });

    let Some(rest) = words.next().map(str::trim) else {
        // Existence: bare "key"
        return Ok(Requirement {
            key: key.to_owned(),
            operator: Operator::Exists,
            values: Vec::new(),
        });
    };

    let (operator, list) = if let Some(list) = rest.strip_prefix("notin") {
        (Operator::NotIn, list)
    } else if let Some(list) = rest.strip_prefix("in") {
        (Operator::In, list)
    } else {
        return MissingValueListSnafu { requirement: raw }.fail();
    };

    let list = list
        .trim()
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .context(MissingValueListSnafu { requirement: raw })?;

    let values: Vec<String> = list
        .split(',')
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    ensure!(!values.is_empty(), EmptyValueListSnafu { requirement: raw });

    Ok(Requirement {
        key: key.to_owned(),
        operator,
        values,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[rstest]
    #[case("env=prod", &[("env", "prod")], true)]
    #[case("env==prod", &[("env", "prod")], true)]
    #[case("env=prod", &[("env", "dev")], false)]
    #[case("env!=prod", &[("env", "dev")], true)]
    // key absence satisfies inequality, as in kubectl
    #[case("env!=prod", &[("app", "web")], true)]
    #[case("env!=prod", &[("env", "prod")], false)]
    #[case("env in (dev, stage)", &[("env", "stage")], true)]
    #[case("env in (dev, stage)", &[("env", "prod")], false)]
    #[case("env notin (dev, stage)", &[("env", "prod")], true)]
    #[case("env notin (dev, stage)", &[], true)]
    #[case("env", &[("env", "anything")], true)]
    #[case("env", &[], false)]
    #[case("!env", &[], true)]
    #[case("!env", &[("env", "x")], false)]
    #[case("env=prod,app=web", &[("env", "prod"), ("app", "web")], true)]
    #[case("env=prod,app=web", &[("env", "prod")], false)]
    fn selector_semantics(
        #[case] selector: &str,
        #[case] pairs: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let selector: LabelSelector = selector.parse().unwrap();
        assert_eq!(selector.matches(&labels(pairs)), expected);
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector: LabelSelector = "".parse().unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("any", "thing")])));
    }

    #[rstest]
    #[case("env in")]
    #[case("env in dev")]
    #[case("env in ()")]
    #[case("=prod")]
    #[case("env=prod,,app=web")]
    fn invalid_selectors(#[case] selector: &str) {
        assert!(selector.parse::<LabelSelector>().is_err());
    }

    #[test]
    fn commas_inside_value_lists_do_not_split() {
        let selector: LabelSelector = "env in (dev,stage),app=web".parse().unwrap();
        assert_eq!(selector.requirements.len(), 2);
    }

    #[test]
    fn canonical_round_trips() {
        let selector: LabelSelector = "env in (dev, stage),app=web,!tmp".parse().unwrap();
        assert_eq!(selector.canonical(), "env in (dev,stage),app=web,!tmp");
    }
}
