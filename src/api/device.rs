//! Relay check-in
//!
//! Boards poll with one of their relay ids. The relay id is the capability;
//! no user context is involved.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::AppState;
use crate::bus::HubEvent;

/// GET /api/esp/checkin/{relay_id} - 200 with the pending command, else 204
pub async fn checkin_handler(
    State(state): State<AppState>,
    Path(relay_id): Path<String>,
) -> Response {
    match state.queue.poll(&relay_id).await {
        Some(command) => {
            tracing::debug!("Delivered state {} to relay {}", command.state, relay_id);
            state.bus.publish(HubEvent::CommandDelivered {
                relay_id,
                state: command.state,
            });
            (StatusCode::OK, Json(command)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
