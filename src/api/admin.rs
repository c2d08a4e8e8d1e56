//! Board inventory routes (`/admin/api`)

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, AdminAccess, AppState, ValidJson};
use crate::boards::{Discrepancy, NewBoard};
use crate::error::HubError;
use crate::model::Board;

type ApiResult<T> = Result<T, HubError>;

/// POST /admin/api/generate-board
pub async fn generate_board_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
    ValidJson(params): ValidJson<NewBoard>,
) -> ApiResult<Json<Value>> {
    let board = state.registry.create_board(params).await?;
    Ok(success(
        format!("Board {} generated.", board.board_id),
        json!({ "board": board }),
    ))
}

/// GET /admin/api/boards
pub async fn boards_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> ApiResult<Json<Vec<Board>>> {
    Ok(Json(state.registry.list_all().await?))
}

#[derive(Deserialize)]
pub struct SuspendRequest {
    pub board_id: String,
    pub suspend: bool,
}

/// POST /admin/api/suspend-board
pub async fn suspend_board_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
    ValidJson(req): ValidJson<SuspendRequest>,
) -> ApiResult<Json<Value>> {
    let board = state
        .registry
        .set_suspended(&req.board_id, req.suspend)
        .await?;
    let verb = if board.is_suspended {
        "suspended"
    } else {
        "reinstated"
    };
    Ok(success(format!("Board {} {}.", board.board_id, verb), Value::Null))
}

#[derive(Deserialize)]
pub struct DeleteBoardRequest {
    pub board_id: String,
}

/// POST /admin/api/delete-board
pub async fn delete_board_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
    ValidJson(req): ValidJson<DeleteBoardRequest>,
) -> ApiResult<Json<Value>> {
    let released = state.registry.delete_board(&req.board_id).await?;
    Ok(success(
        format!("Board {} deleted.", req.board_id),
        json!({ "released_appliances": released }),
    ))
}

#[derive(Deserialize)]
pub struct DeleteBoardsRequest {
    pub board_ids: Vec<String>,
}

/// POST /admin/api/delete-boards
pub async fn delete_boards_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
    ValidJson(req): ValidJson<DeleteBoardsRequest>,
) -> ApiResult<Json<Value>> {
    let deleted = state.registry.delete_boards(&req.board_ids).await?;
    Ok(success(
        format!("{} board(s) deleted.", deleted),
        json!({ "deleted": deleted }),
    ))
}

/// POST /admin/api/delete-all-boards
pub async fn delete_all_boards_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> ApiResult<Json<Value>> {
    let deleted = state.registry.delete_all_boards().await?;
    tracing::warn!("Admin deleted all {} boards", deleted);
    Ok(success(
        format!("{} board(s) deleted.", deleted),
        json!({ "deleted": deleted }),
    ))
}

/// GET /admin/api/relay-audit
pub async fn relay_audit_handler(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> ApiResult<Json<Vec<Discrepancy>>> {
    Ok(Json(state.allocator.audit().await?))
}
