//! HTTP API
//!
//! - `user`: dashboard routes under `/api`, scoped to the requesting user
//! - `admin`: board inventory routes under `/admin/api`
//! - `device`: relay check-in polled by boards
//!
//! Every handler returns `Result<_, HubError>`; the error's `IntoResponse`
//! maps domain kinds to status codes.

pub mod admin;
pub mod device;
pub mod user;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::appliances::ApplianceManager;
use crate::boards::{BoardLimits, BoardRegistry, RelayAllocator};
use crate::bus::SharedBus;
use crate::error::HubError;
use crate::locks::HubLocks;
use crate::queue::SharedQueue;
use crate::store::SharedStore;

pub const USER_HEADER: &str = "x-user-id";
pub const ADMIN_HEADER: &str = "x-admin-token";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: BoardRegistry,
    pub allocator: RelayAllocator,
    pub appliances: ApplianceManager,
    pub queue: SharedQueue,
    pub store: SharedStore,
    pub bus: SharedBus,
    pub admin_token: Option<Arc<str>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: SharedStore,
        queue: SharedQueue,
        bus: SharedBus,
        limits: BoardLimits,
        admin_token: Option<String>,
    ) -> Self {
        let locks = Arc::new(HubLocks::default());
        let registry = BoardRegistry::new(
            store.clone(),
            locks.clone(),
            queue.clone(),
            bus.clone(),
            limits,
        );
        let allocator = RelayAllocator::new(store.clone(), locks.clone());
        let appliances = ApplianceManager::new(
            store.clone(),
            locks,
            registry.clone(),
            allocator.clone(),
            queue.clone(),
            bus.clone(),
        );
        Self {
            registry,
            allocator,
            appliances,
            queue,
            store,
            bus,
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
            started_at: Instant::now(),
        }
    }
}

/// Build the full router with middleware
pub fn router(state: AppState) -> Router {
    Router::new()
        // Service
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        // Device check-in
        .route("/api/esp/checkin/{relay_id}", get(device::checkin_handler))
        // Boards
        .route("/api/register-board", post(user::register_board_handler))
        .route("/api/unregister-board", post(user::unregister_board_handler))
        .route("/api/my-boards", get(user::my_boards_handler))
        .route("/api/available-relays/{room_id}", get(user::available_relays_handler))
        // Appliances
        .route("/api/add-appliance", post(user::add_appliance_handler))
        .route("/api/delete-appliance", post(user::delete_appliance_handler))
        .route("/api/set-appliance-state", post(user::set_state_handler))
        .route("/api/set-appliance-name", post(user::set_name_handler))
        .route("/api/set-lock", post(user::set_lock_handler))
        .route("/api/set-timer", post(user::set_timer_handler))
        .route("/api/update-appliance-settings", post(user::update_appliance_handler))
        .route("/api/save-appliance-order", post(user::save_appliance_order_handler))
        // Rooms
        .route("/api/get-rooms-and-appliances", get(user::rooms_handler))
        .route("/api/add-room", post(user::add_room_handler))
        .route("/api/delete-room", post(user::delete_room_handler))
        .route("/api/update-room-settings", post(user::update_room_handler))
        .route("/api/save-room-order", post(user::save_room_order_handler))
        .route("/api/set-global-ai-control", post(user::global_ai_control_handler))
        .route("/api/ai-detection-signal", post(user::ai_detection_handler))
        // Admin
        .route("/admin/api/generate-board", post(admin::generate_board_handler))
        .route("/admin/api/boards", get(admin::boards_handler))
        .route("/admin/api/suspend-board", post(admin::suspend_board_handler))
        .route("/admin/api/delete-board", post(admin::delete_board_handler))
        .route("/admin/api/delete-boards", post(admin::delete_boards_handler))
        .route("/admin/api/delete-all-boards", post(admin::delete_all_boards_handler))
        .route("/admin/api/relay-audit", get(admin::relay_audit_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Responses and errors
// =============================================================================

/// `{status: "success", message, ...extra}` envelope
pub fn success(message: impl Into<String>, extra: Value) -> Json<Value> {
    let mut body = json!({ "status": "success", "message": message.into() });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    Json(body)
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::Forbidden(_) | HubError::Suspended(_) => StatusCode::FORBIDDEN,
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::StoreUnavailable(_) | HubError::Invariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if self.is_internal() {
            tracing::error!("Request failed ({}): {}", self.kind(), self);
            "An internal error occurred.".to_string()
        } else {
            tracing::debug!("Request rejected ({}): {}", self.kind(), self);
            self.to_string()
        };

        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// Requesting user, from the header set by the upstream auth layer
///
/// The user must exist and not be suspended.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(HubError::Unauthorized)?;

        let users = state.store.get_users().await?;
        let user = users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(HubError::Unauthorized)?;
        if user.is_suspended {
            tracing::warn!("Suspended user {} attempted access", user_id);
            return Err(HubError::Forbidden("Account is suspended".to_string()));
        }
        Ok(CurrentUser(user.id.clone()))
    }
}

/// Proof that the request carries the configured admin token
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let supplied = parts.headers.get(ADMIN_HEADER).and_then(|v| v.to_str().ok());
        match (state.admin_token.as_deref(), supplied) {
            (Some(expected), Some(supplied)) if tokens_match(expected, supplied) => Ok(AdminAccess),
            (None, _) => Err(HubError::Forbidden(
                "Admin access is not configured".to_string(),
            )),
            _ => {
                tracing::warn!("Rejected admin request with missing or wrong token");
                Err(HubError::Forbidden("Admin access required".to_string()))
            }
        }
    }
}

/// Compare tokens without stopping at the first differing byte
fn tokens_match(expected: &str, supplied: &str) -> bool {
    let (expected, supplied) = (expected.as_bytes(), supplied.as_bytes());
    if expected.len() != supplied.len() {
        return false;
    }
    expected
        .iter()
        .zip(supplied)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// `Json` whose rejections surface as `Validation` errors
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = HubError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidJson(value)),
            Err(rejection) => Err(validation_error(rejection)),
        }
    }
}

fn validation_error(rejection: JsonRejection) -> HubError {
    HubError::Validation(format!("Invalid request data: {}", rejection.body_text()))
}

// =============================================================================
// Service handlers
// =============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub pending_commands: usize,
    pub bus_subscribers: usize,
}

/// GET /status - Service health check
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: "luminous-hub",
        version: env!("LUMINOUS_VERSION"),
        git_sha: env!("LUMINOUS_GIT_SHA"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        pending_commands: state.queue.pending().await,
        bus_subscribers: state.bus.subscriber_count(),
    })
}

/// GET /events - Server-Sent Events stream of the requesting user's events
pub async fn events_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if event.user_id() == Some(user_id.as_str()) => serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().data(json))),
        // Other users' events and lagged messages
        _ => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::tokens_match;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("admin-secret", "admin-secret"));
        assert!(!tokens_match("admin-secret", "admin-secreT"));
        assert!(!tokens_match("admin-secret", "xdmin-secret"));
        assert!(!tokens_match("admin-secret", "admin"));
        assert!(!tokens_match("admin-secret", ""));
    }
}
