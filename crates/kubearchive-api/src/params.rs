//! Query parameter parsing and validation for the list endpoints.

use chrono::{DateTime, Utc};
use kubearchive_shared::{LabelSelector, NamePattern};
use serde::Deserialize;

use crate::error::{ApiError, Result};

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;

/// The raw query string of a list request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub name: Option<String>,
    pub limit: Option<u32>,
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
    pub creation_timestamp_after: Option<String>,
    pub creation_timestamp_before: Option<String>,
    /// Only meaningful on `/log` requests.
    pub container: Option<String>,
}

/// The validated form the handlers work with.
#[derive(Clone, Debug)]
pub struct ResolvedQuery {
    pub label_selector: LabelSelector,
    pub name: Option<NamePattern>,
    pub limit: u32,
    pub continue_token: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ListQuery {
    /// Validates the raw parameters against a possibly present `{name}` path
    /// segment.
    pub fn resolve(self, path_name: Option<&str>) -> Result<ResolvedQuery> {
        if let Some(path_name) = path_name {
            if self.name.is_some() {
                return Err(ApiError::bad_request(
                    "name cannot be given both in the path and as a query parameter",
                ));
            }
            if path_name.contains('*') {
                return Err(ApiError::bad_request(
                    "wildcards are not allowed in the path, use the name query parameter",
                ));
            }
        }

        let name = path_name
            .map(str::to_owned)
            .or(self.name)
            .map(|raw| NamePattern::parse(&raw));

        let label_selector = match self.label_selector.as_deref() {
            Some(raw) => raw
                .parse()
                .map_err(|error| ApiError::bad_request(format!("invalid labelSelector: {error}")))?,
            None => LabelSelector::default(),
        };

        let created_after = parse_rfc3339("creationTimestampAfter", self.creation_timestamp_after)?;
        let created_before =
            parse_rfc3339("creationTimestampBefore", self.creation_timestamp_before)?;
        if let (Some(after), Some(before)) = (created_after, created_before)
            && before <= after
        {
            return Err(ApiError::bad_request(
                "creationTimestampBefore must be later than creationTimestampAfter",
            ));
        }

        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        Ok(ResolvedQuery {
            label_selector,
            name,
            limit,
            continue_token: self.continue_token,
            created_after,
            created_before,
        })
    }
}

fn parse_rfc3339(parameter: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| {
                ApiError::bad_request(format!("{parameter} {raw:?} is not an RFC3339 timestamp"))
            })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults() {
        let resolved = ListQuery::default().resolve(None).unwrap();
        assert_eq!(resolved.limit, DEFAULT_LIMIT);
        assert!(resolved.name.is_none());
        assert!(resolved.label_selector.is_empty());
    }

    #[test]
    fn path_name_and_query_name_conflict() {
        let query = ListQuery {
            name: Some("x".to_owned()),
            ..ListQuery::default()
        };
        assert!(query.resolve(Some("y")).is_err());
    }

    #[test]
    fn wildcard_in_path_is_rejected() {
        assert!(ListQuery::default().resolve(Some("pod-*")).is_err());
    }

    #[test]
    fn wildcard_in_query_parameter_is_fine() {
        let query = ListQuery {
            name: Some("*test*".to_owned()),
            ..ListQuery::default()
        };
        let resolved = query.resolve(None).unwrap();
        assert!(resolved.name.unwrap().is_wildcard());
    }

    #[rstest]
    #[case("not-a-timestamp", "2024-05-01T10:00:00Z")]
    #[case("2024-05-01T10:00:00Z", "yesterday")]
    fn invalid_timestamps_are_rejected(#[case] after: &str, #[case] before: &str) {
        let query = ListQuery {
            creation_timestamp_after: Some(after.to_owned()),
            creation_timestamp_before: Some(before.to_owned()),
            ..ListQuery::default()
        };
        assert!(query.resolve(None).is_err());
    }

    #[rstest]
    // before == after
    #[case("2024-05-01T10:00:00Z", "2024-05-01T10:00:00Z")]
    // before < after
    #[case("2024-05-01T10:00:00Z", "2024-05-01T09:00:00Z")]
    fn inverted_windows_are_rejected(#[case] after: &str, #[case] before: &str) {
        let query = ListQuery {
            creation_timestamp_after: Some(after.to_owned()),
            creation_timestamp_before: Some(before.to_owned()),
            ..ListQuery::default()
        };
        assert!(query.resolve(None).is_err());
    }

    #[test]
    fn limit_is_clamped() {
        let query = ListQuery {
            limit: Some(1_000_000),
            ..ListQuery::default()
        };
        assert_eq!(query.resolve(None).unwrap().limit, MAX_LIMIT);
    }

    #[test]
    fn invalid_selector_is_rejected() {
        let query = ListQuery {
            label_selector: Some("env in".to_owned()),
            ..ListQuery::default()
        };
        assert!(query.resolve(None).is_err());
    }
}
