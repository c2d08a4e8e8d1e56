#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! HTTP surface: status codes, error envelopes and the device check-in flow

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use luminous_hub::api::{self, AppState, ADMIN_HEADER, USER_HEADER};
use luminous_hub::boards::BoardLimits;
use luminous_hub::bus::create_bus;
use luminous_hub::model::UserRecord;
use luminous_hub::queue::MemoryCommandQueue;
use luminous_hub::store::MemoryStore;

const ADMIN_TOKEN: &str = "admin-secret";

fn user(id: &str, suspended: bool) -> UserRecord {
    UserRecord {
        id: id.to_string(),
        username: id.to_string(),
        is_admin: false,
        is_suspended: suspended,
    }
}

fn app() -> Router {
    let store = Arc::new(MemoryStore::with_users(vec![
        user("alice", false),
        user("bob", false),
        user("mallory", true),
    ]));
    let state = AppState::new(
        store,
        Arc::new(MemoryCommandQueue::new()),
        create_bus(),
        BoardLimits::default(),
        Some(ADMIN_TOKEN.to_string()),
    );
    api::router(state)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str, user_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(user_id) = user_id {
        builder = builder.header(USER_HEADER, user_id);
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, user_id: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(USER_HEADER, user_id)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin_post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(ADMIN_HEADER, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Generate a board as admin and return it
async fn generate_board(app: &Router, relays: usize) -> Value {
    let (status, body) = send(
        app,
        admin_post(
            "/admin/api/generate-board",
            Some(ADMIN_TOKEN),
            json!({ "number_of_relays": relays }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["board"].clone()
}

async fn add_room(app: &Router, user_id: &str, name: &str) -> String {
    let (status, body) = send(app, post("/api/add-room", user_id, json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["room_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn status_is_public() {
    let app = app();
    let (status, body) = send(&app, get("/status", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "luminous-hub");
    assert_eq!(body["pending_commands"], 0);
}

#[tokio::test]
async fn user_routes_require_a_known_active_user() {
    let app = app();

    let (status, body) = send(&app, get("/api/my-boards", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let (status, _) = send(&app, get("/api/my-boards", Some("nobody"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, get("/api/my-boards", Some("mallory"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, get("/api/my-boards", Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn admin_routes_check_the_token() {
    let app = app();

    let (status, _) = send(&app, admin_post("/admin/api/generate-board", None, json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        admin_post("/admin/api/generate-board", Some("guess"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let board = generate_board(&app, 3).await;
    assert_eq!(board["relays"].as_array().unwrap().len(), 3);
    assert!(board["owner_id"].is_null());
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let app = app();
    let req = Request::post("/api/add-room")
        .header(USER_HEADER, "alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"name\": "))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().starts_with("Invalid request data"));

    let (status, _) = send(&app, post("/api/add-room", "alice", json!({ "title": "x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn toggle_reaches_the_device_once() {
    let app = app();
    let room_id = add_room(&app, "alice", "Kitchen").await;
    let board = generate_board(&app, 4).await;
    let board_id = board["board_id"].as_str().unwrap();
    let relay_id = board["relays"][0]["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        post(
            "/api/register-board",
            "alice",
            json!({ "board_id": board_id, "room_id": room_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post(
            "/api/add-appliance",
            "alice",
            json!({ "room_id": room_id, "name": "Light", "board_id": board_id, "relay_id": relay_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let appliance_id = body["appliance_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post(
            "/api/set-appliance-state",
            "alice",
            json!({ "room_id": room_id, "appliance_id": appliance_id, "state": true }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["message"],
        "Appliance 'Light' in room 'Kitchen' has been turned ON."
    );

    let checkin = format!("/api/esp/checkin/{}", relay_id);
    let (status, body) = send(&app, get(&checkin, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "state": 1 }));

    let (status, body) = send(&app, get(&checkin, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());

    let (status, body) = send(&app, get(&format!("/api/available-relays/{}", room_id), Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    let free = body[0]["relays"].as_array().unwrap();
    assert_eq!(free.len(), 3);
    assert!(free.iter().all(|r| r["id"] != relay_id));
}

#[tokio::test]
async fn boards_are_exclusive_to_their_owner() {
    let app = app();
    let alice_room = add_room(&app, "alice", "Study").await;
    let bob_room = add_room(&app, "bob", "Study").await;
    let board = generate_board(&app, 2).await;
    let board_id = board["board_id"].as_str().unwrap();
    let relay_id = board["relays"][1]["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        post(
            "/api/register-board",
            "alice",
            json!({ "board_id": board_id, "room_id": alice_room }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post(
            "/api/register-board",
            "bob",
            json!({ "board_id": board_id, "room_id": bob_room }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "error");

    let (status, _) = send(
        &app,
        post(
            "/api/add-appliance",
            "bob",
            json!({ "room_id": bob_room, "name": "Heater", "board_id": board_id, "relay_id": relay_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Someone else's board looks the same as a missing one
    let (status, _) = send(
        &app,
        post("/api/unregister-board", "bob", json!({ "board_id": board_id })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, get("/api/my-boards", Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["board_id"], board_id);
    assert!(body[0]["relays"].as_array().unwrap().iter().all(|r| r["is_occupied"] == false));
}

#[tokio::test]
async fn unknown_board_is_not_found() {
    let app = app();
    let room_id = add_room(&app, "alice", "Cellar").await;
    let (status, body) = send(
        &app,
        post(
            "/api/register-board",
            "alice",
            json!({ "board_id": "does-not-exist", "room_id": room_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Board not found");
}
