//! Parsing of incoming resource events.
//!
//! The event source delivers CloudEvents over HTTP in either binary content
//! mode (`ce-*` headers plus the resource JSON as the body) or structured
//! mode (`application/cloudevents+json` with the resource under `data`).
//! Only the attributes the sink acts on are modeled.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value as Json;
use snafu::{OptionExt, ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("event has no type attribute"))]
    MissingType,

    #[snafu(display("event type {event_type:?} is not a resource lifecycle event"))]
    UnsupportedType { event_type: String },

    #[snafu(display("event body is not valid JSON"))]
    MalformedBody { source: serde_json::Error },

    #[snafu(display("structured event carries no data attribute"))]
    MissingData,
}

/// What the event asks the sink to do with the resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Upsert,
    Delete,
}

/// One parsed resource event.
#[derive(Clone, Debug)]
pub struct SinkEvent {
    pub operation: Operation,
    pub event_type: String,
    pub id: Option<String>,
    /// When the source observed the change; falls back to arrival time.
    pub time: DateTime<Utc>,
    pub resource: Json,
}

/// Structured-mode envelope, `application/cloudevents+json`.
#[derive(Debug, Deserialize)]
struct StructuredEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    id: Option<String>,
    time: Option<String>,
    data: Option<Json>,
}

impl SinkEvent {
    pub fn from_request(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if content_type.starts_with("application/cloudevents+json") {
            Self::from_structured(body)
        } else {
            Self::from_binary(headers, body)
        }
    }

    fn from_binary(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };

        let event_type = header("ce-type").context(MissingTypeSnafu)?;
        let resource = serde_json::from_slice(body).context(MalformedBodySnafu)?;

        Ok(Self {
            operation: classify(&event_type)?,
            id: header("ce-id"),
            time: parse_time(header("ce-time").as_deref()),
            event_type,
            resource,
        })
    }

    fn from_structured(body: &[u8]) -> Result<Self> {
        let envelope: StructuredEvent = serde_json::from_slice(body).context(MalformedBodySnafu)?;

        let event_type = envelope.event_type.context(MissingTypeSnafu)?;
        let resource = envelope.data.context(MissingDataSnafu)?;

        Ok(Self {
            operation: classify(&event_type)?,
            id: envelope.id,
            time: parse_time(envelope.time.as_deref()),
            event_type,
            resource,
        })
    }
}

/// Maps the event type suffix onto the sink's two operations. The event
/// source emits `<prefix>.resource.{add,update,delete}`.
fn classify(event_type: &str) -> Result<Operation> {
    if event_type.ends_with(".delete") {
        Ok(Operation::Delete)
    } else if event_type.ends_with(".add") || event_type.ends_with(".update") {
        Ok(Operation::Upsert)
    } else {
        UnsupportedTypeSnafu { event_type }.fail()
    }
}

fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |time| time.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn binary_headers(event_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("ce-type", event_type.parse().unwrap());
        headers.insert("ce-id", "e-1".parse().unwrap());
        headers.insert("ce-time", "2024-05-01T10:00:00Z".parse().unwrap());
        headers
    }

    #[rstest]
    #[case("dev.knative.apiserver.resource.add", Operation::Upsert)]
    #[case("dev.knative.apiserver.resource.update", Operation::Upsert)]
    #[case("dev.knative.apiserver.resource.delete", Operation::Delete)]
    fn binary_mode(#[case] event_type: &str, #[case] operation: Operation) {
        let body = serde_json::to_vec(&json!({"kind": "Pod"})).unwrap();
        let event = SinkEvent::from_request(&binary_headers(event_type), &body).unwrap();

        assert_eq!(event.operation, operation);
        assert_eq!(event.id.as_deref(), Some("e-1"));
        assert_eq!(event.time.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(event.resource["kind"], "Pod");
    }

    #[test]
    fn structured_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            "application/cloudevents+json".parse().unwrap(),
        );
        let body = serde_json::to_vec(&json!({
            "specversion": "1.0",
            "type": "dev.knative.apiserver.resource.delete",
            "id": "e-2",
            "time": "2024-05-01T10:00:00Z",
            "data": {"kind": "Pod"},
        }))
        .unwrap();

        let event = SinkEvent::from_request(&headers, &body).unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.resource["kind"], "Pod");
    }

    #[test]
    fn unknown_event_types_are_rejected() {
        let body = serde_json::to_vec(&json!({})).unwrap();
        let error =
            SinkEvent::from_request(&binary_headers("com.example.ping"), &body).unwrap_err();
        assert!(matches!(error, Error::UnsupportedType { .. }));
    }

    #[test]
    fn missing_type_is_rejected() {
        let body = serde_json::to_vec(&json!({})).unwrap();
        let error = SinkEvent::from_request(&HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(error, Error::MissingType));
    }

    #[test]
    fn malformed_body_is_rejected() {
        let error = SinkEvent::from_request(
            &binary_headers("x.resource.add"),
            b"this is not json",
        )
        .unwrap_err();
        assert!(matches!(error, Error::MalformedBody { .. }));
    }

    #[test]
    fn missing_time_falls_back_to_now() {
        let mut headers = HeaderMap::new();
        headers.insert("ce-type", "x.resource.add".parse().unwrap());
        let body = serde_json::to_vec(&json!({})).unwrap();

        let before = Utc::now();
        let event = SinkEvent::from_request(&headers, &body).unwrap();
        assert!(event.time >= before);
    }
}
