//! Wildcard name patterns for list queries.
//!
//! A `*` matches zero or more characters. Patterns without any `*` are exact
//! (case-sensitive) names; patterns with one are matched case-insensitively,
//! mirroring the ILIKE translation the storage adapter performs.

/// A parsed `name=` query value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    Wildcard(String),
}

impl NamePattern {
    pub fn parse(raw: &str) -> Self {
        if raw.contains('*') {
            Self::Wildcard(raw.to_owned())
        } else {
            Self::Exact(raw.to_owned())
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard(_))
    }

    /// The raw pattern as supplied by the caller.
    pub fn raw(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Wildcard(s) => s,
        }
    }

    /// Translates the pattern into a SQL `LIKE`/`ILIKE` pattern, escaping the
    /// characters LIKE treats specially.
    pub fn to_like_pattern(&self) -> String {
        let raw = self.raw();
        let mut pattern = String::with_capacity(raw.len());

        for ch in raw.chars() {
            match ch {
                '*' => pattern.push('%'),
                '%' | '_' | '\\' => {
                    pattern.push('\\');
                    pattern.push(ch);
                }
                _ => pattern.push(ch),
            }
        }

        pattern
    }

    /// In-memory matcher with the same semantics as the SQL translation.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Wildcard(pattern) => {
                wildcard_match(&pattern.to_lowercase(), &name.to_lowercase())
            }
        }
    }
}

/// Greedy `*` matching with single-star backtracking, over lowercased inputs.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("*test*", "integration-test-1", true)]
    #[case("*test*", "TEST-1", true)]
    #[case("*TEST*", "test-1", true)]
    #[case("*test*", "other", false)]
    #[case("test*", "test-1", true)]
    #[case("test*", "a-test", false)]
    #[case("*test", "a-test", true)]
    #[case("*test", "test-1", false)]
    #[case("a*b*c", "a-x-b-y-c", true)]
    #[case("a*b*c", "acb", false)]
    #[case("plain", "plain", true)]
    #[case("plain", "PLAIN", false)] // exact names stay case-sensitive
    fn matching(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(NamePattern::parse(pattern).matches(name), expected);
    }

    #[test]
    fn like_translation_escapes_metacharacters() {
        let pattern = NamePattern::parse("x_y%z*");
        assert_eq!(pattern.to_like_pattern(), "x\\_y\\%z%");
    }

    #[test]
    fn exact_patterns_are_detected() {
        assert!(!NamePattern::parse("plain").is_wildcard());
        assert!(NamePattern::parse("pl*in").is_wildcard());
    }
}
