//! Dashboard routes (`/api`), all scoped to the requesting user

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, AppState, CurrentUser, ValidJson};
use crate::boards::FreeRelays;
use crate::error::HubError;
use crate::model::{Board, Room};

type ApiResult<T> = Result<T, HubError>;

// =============================================================================
// Boards
// =============================================================================

#[derive(Deserialize)]
pub struct RegisterBoardRequest {
    pub board_id: String,
    pub room_id: String,
}

/// POST /api/register-board
pub async fn register_board_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<RegisterBoardRequest>,
) -> ApiResult<Json<Value>> {
    let board = state
        .registry
        .register_board(req.board_id.trim(), &user_id, &req.room_id)
        .await?;
    Ok(success(
        "Board registered successfully.",
        json!({ "board": board }),
    ))
}

#[derive(Deserialize)]
pub struct BoardRequest {
    pub board_id: String,
}

/// POST /api/unregister-board
///
/// A board that does not exist and one owned by someone else look the same
/// to the caller.
pub async fn unregister_board_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<BoardRequest>,
) -> ApiResult<Json<Value>> {
    let released = state
        .registry
        .unregister_board(&req.board_id, &user_id)
        .await
        .map_err(|e| match e {
            HubError::Forbidden(_) => HubError::NotFound("Board"),
            other => other,
        })?;
    Ok(success(
        format!("Board unregistered. {} appliance(s) removed.", released),
        json!({ "released_appliances": released }),
    ))
}

/// GET /api/my-boards
pub async fn my_boards_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<Board>>> {
    Ok(Json(state.registry.get_by_owner(&user_id).await?))
}

/// GET /api/available-relays/{room_id}
pub async fn available_relays_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Vec<FreeRelays>>> {
    Ok(Json(state.allocator.free_relays_for(&user_id, &room_id).await?))
}

// =============================================================================
// Appliances
// =============================================================================

#[derive(Deserialize)]
pub struct AddApplianceRequest {
    pub room_id: String,
    pub name: String,
    pub board_id: String,
    pub relay_id: String,
}

/// POST /api/add-appliance
pub async fn add_appliance_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<AddApplianceRequest>,
) -> ApiResult<Json<Value>> {
    let appliance = state
        .appliances
        .add_appliance(&user_id, &req.room_id, &req.board_id, &req.relay_id, &req.name)
        .await?;
    Ok(success(
        "Appliance added.",
        json!({ "appliance_id": appliance.id }),
    ))
}

#[derive(Deserialize)]
pub struct ApplianceRequest {
    pub room_id: String,
    pub appliance_id: String,
}

/// POST /api/delete-appliance
pub async fn delete_appliance_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<ApplianceRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .delete_appliance(&user_id, &req.room_id, &req.appliance_id)
        .await?;
    Ok(success("Appliance deleted.", Value::Null))
}

#[derive(Deserialize)]
pub struct SetStateRequest {
    pub room_id: String,
    pub appliance_id: String,
    pub state: bool,
}

/// POST /api/set-appliance-state
pub async fn set_state_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<SetStateRequest>,
) -> ApiResult<Json<Value>> {
    let change = state
        .appliances
        .set_state(&user_id, &req.room_id, &req.appliance_id, req.state)
        .await?;
    Ok(success(
        format!(
            "Appliance '{}' in room '{}' has been turned {}.",
            change.appliance.name,
            change.room_name,
            if req.state { "ON" } else { "OFF" }
        ),
        Value::Null,
    ))
}

#[derive(Deserialize)]
pub struct SetNameRequest {
    pub room_id: String,
    pub appliance_id: String,
    pub name: String,
}

/// POST /api/set-appliance-name
pub async fn set_name_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<SetNameRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .rename(&user_id, &req.room_id, &req.appliance_id, &req.name)
        .await?;
    Ok(success("Name updated.", Value::Null))
}

#[derive(Deserialize)]
pub struct SetLockRequest {
    pub room_id: String,
    pub appliance_id: String,
    pub locked: bool,
}

/// POST /api/set-lock
pub async fn set_lock_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<SetLockRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .set_lock(&user_id, &req.room_id, &req.appliance_id, req.locked)
        .await?;
    Ok(success("Lock state updated.", Value::Null))
}

#[derive(Deserialize)]
pub struct SetTimerRequest {
    pub room_id: String,
    pub appliance_id: String,
    #[serde(default)]
    pub timer: Option<i64>,
}

/// POST /api/set-timer
pub async fn set_timer_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<SetTimerRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .set_timer(&user_id, &req.room_id, &req.appliance_id, req.timer)
        .await?;
    let message = if req.timer.is_some() {
        "Timer set."
    } else {
        "Timer cleared."
    };
    Ok(success(message, Value::Null))
}

#[derive(Deserialize)]
pub struct UpdateApplianceRequest {
    pub room_id: String,
    pub appliance_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub new_room_id: Option<String>,
}

/// POST /api/update-appliance-settings
pub async fn update_appliance_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<UpdateApplianceRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .update_settings(
            &user_id,
            &req.room_id,
            &req.appliance_id,
            req.name.as_deref(),
            req.new_room_id.as_deref(),
        )
        .await?;
    Ok(success("Appliance settings updated.", Value::Null))
}

#[derive(Deserialize)]
pub struct ApplianceOrderRequest {
    pub room_id: String,
    pub order: Vec<String>,
}

/// POST /api/save-appliance-order
pub async fn save_appliance_order_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<ApplianceOrderRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .reorder(&user_id, &req.room_id, &req.order)
        .await?;
    Ok(success("Appliance order saved.", Value::Null))
}

// =============================================================================
// Rooms
// =============================================================================

/// GET /api/get-rooms-and-appliances
pub async fn rooms_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<Room>>> {
    Ok(Json(state.appliances.list_rooms(&user_id).await?))
}

#[derive(Deserialize)]
pub struct AddRoomRequest {
    pub name: String,
}

/// POST /api/add-room
pub async fn add_room_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<AddRoomRequest>,
) -> ApiResult<Json<Value>> {
    let room = state.appliances.add_room(&user_id, &req.name).await?;
    Ok(success("Room added.", json!({ "room_id": room.id })))
}

#[derive(Deserialize)]
pub struct RoomRequest {
    pub room_id: String,
}

/// POST /api/delete-room
pub async fn delete_room_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<RoomRequest>,
) -> ApiResult<Json<Value>> {
    let unregistered = state.appliances.delete_room(&user_id, &req.room_id).await?;
    Ok(success(
        "Room deleted.",
        json!({ "unregistered_boards": unregistered }),
    ))
}

#[derive(Deserialize)]
pub struct UpdateRoomRequest {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ai_control: Option<bool>,
}

/// POST /api/update-room-settings
pub async fn update_room_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<UpdateRoomRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .update_room_settings(&user_id, &req.room_id, req.name.as_deref(), req.ai_control)
        .await?;
    Ok(success("Room settings updated.", Value::Null))
}

#[derive(Deserialize)]
pub struct RoomOrderRequest {
    pub order: Vec<String>,
}

/// POST /api/save-room-order
pub async fn save_room_order_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<RoomOrderRequest>,
) -> ApiResult<Json<Value>> {
    state.appliances.reorder_rooms(&user_id, &req.order).await?;
    Ok(success("Room order saved.", Value::Null))
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub state: bool,
}

/// POST /api/set-global-ai-control
pub async fn global_ai_control_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<ToggleRequest>,
) -> ApiResult<Json<Value>> {
    state
        .appliances
        .set_global_ai_control(&user_id, req.state)
        .await?;
    Ok(success(
        format!(
            "AI control for all rooms has been {}.",
            if req.state { "enabled" } else { "disabled" }
        ),
        Value::Null,
    ))
}

#[derive(Deserialize)]
pub struct DetectionRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    pub state: bool,
}

/// POST /api/ai-detection-signal
pub async fn ai_detection_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<DetectionRequest>,
) -> ApiResult<Json<Value>> {
    let affected = state
        .appliances
        .ai_detection_signal(&user_id, req.room_id.as_deref(), req.state)
        .await?;
    Ok(success(
        format!(
            "AI control has been {}.",
            if req.state { "activated" } else { "deactivated" }
        ),
        json!({ "affected": affected }),
    ))
}
