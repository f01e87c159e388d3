//! The HTTP ingress of the sink.
//!
//! One POST endpoint receives events. Acknowledgement is the HTTP status:
//! 204 for settled events (archived or skipped), 400 for events the source
//! must not redeliver, 429 when the in-flight limit is reached and 500 when
//! a write failed — the latter two make the source redeliver.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::{Dispatcher, Outcome},
    event::SinkEvent,
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Bounds in-flight writes; an exhausted semaphore means "stop
    /// acknowledging, let the source retry".
    pub permits: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(receive_event))
        .route("/livez", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(_permit) = state.permits.try_acquire() else {
        tracing::debug!("in-flight limit reached, pushing back");
        return StatusCode::TOO_MANY_REQUESTS;
    };

    let event = match SinkEvent::from_request(&headers, &body) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(%error, "rejecting undecodable event");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state
        .dispatcher
        .handle(&event, state.shutdown.child_token())
        .await
    {
        Ok(Outcome::Skipped | Outcome::Archived | Outcome::ArchivedAndDeleteRequested) => {
            StatusCode::NO_CONTENT
        }
        Err(error) => {
            tracing::error!(
                %error,
                event_id = event.id.as_deref().unwrap_or("<none>"),
                "event not acknowledged, the source will redeliver"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
