//! The API's error taxonomy and its mapping onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use snafu::Snafu;

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("{message}"))]
    BadRequest { message: String },

    #[snafu(display("{message}"))]
    Unauthorized { message: String },

    #[snafu(display("{message}"))]
    Forbidden { message: String },

    #[snafu(display("no resources found"))]
    NotFound,

    /// An error from the live cluster, propagated verbatim.
    #[snafu(display("{message}"))]
    Upstream { status: u16, message: String },

    #[snafu(display("{message}"))]
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The single top-level error body: the message plus the URL it answers.
    pub fn into_response_for(self, uri: &axum::http::Uri) -> Response {
        let status = self.status();
        let body = json!({
            "code": status.as_u16(),
            "message": self.to_string(),
            "url": uri.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<kubearchive_storage::Error> for ApiError {
    fn from(error: kubearchive_storage::Error) -> Self {
        use kubearchive_storage::Error as Storage;

        match error {
            Storage::BadRequest { message } => Self::BadRequest { message },
            Storage::MalformedToken | Storage::TokenMismatch => Self::BadRequest {
                message: "invalid continue token for this query".to_owned(),
            },
            Storage::NotFound => Self::NotFound,
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Maps an error from the live side of a merge. 404 means "kind not served
/// live" and is handled by the caller; everything else dominates.
impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 401 => Self::Unauthorized {
                message: response.message,
            },
            kube::Error::Api(response) if response.code == 403 => Self::Forbidden {
                message: response.message,
            },
            kube::Error::Api(response) => Self::Upstream {
                status: response.code,
                message: response.message,
            },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ApiError::bad_request("x"), 400)]
    #[case(ApiError::Unauthorized { message: "x".into() }, 401)]
    #[case(ApiError::Forbidden { message: "x".into() }, 403)]
    #[case(ApiError::NotFound, 404)]
    #[case(ApiError::Upstream { status: 502, message: "x".into() }, 502)]
    #[case(ApiError::internal("x"), 500)]
    fn status_mapping(#[case] error: ApiError, #[case] expected: u16) {
        assert_eq!(error.status().as_u16(), expected);
    }

    #[test]
    fn token_errors_become_bad_requests() {
        let error: ApiError = kubearchive_storage::Error::TokenMismatch.into();
        assert!(matches!(error, ApiError::BadRequest { .. }));
    }
}
