use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router, extract,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    control::{ControlError, Controller},
    defs::{FanAssignment, FanStatus},
    sensors::SensorGateway,
};

pub struct AppState {
    pub controller: Arc<Controller>,
    pub sensors: Arc<SensorGateway>,
}

pub fn create_router(controller: Arc<Controller>, sensors: Arc<SensorGateway>) -> Router {
    let state = Arc::new(AppState {
        controller,
        sensors,
    });

    Router::new()
        .route("/api/fans", get(list_fans))
        .route("/api/rooms", get(list_rooms))
        .route("/api/assign", post(assign))
        .route("/api/control", post(control))
        .route("/api/remove", post(remove))
        .route("/status", get(status))
        .with_state(state)
}

/* === Routes === */

/* == Fans == */

#[derive(Serialize)]
struct FanReport {
    room: String,
    status: FanStatus,
    pin: u8,
    co2: Option<u32>,
}

async fn list_fans(extract::State(state): extract::State<Arc<AppState>>) -> Json<Vec<FanReport>> {
    let readings: HashMap<String, u32> = state
        .sensors
        .latest()
        .await
        .into_iter()
        .map(|reading| (reading.room, reading.co2))
        .collect();

    let fans = state
        .controller
        .list()
        .await
        .into_iter()
        .map(|fan| FanReport {
            co2: readings.get(&fan.room).copied().or(fan.last_co2),
            room: fan.room,
            status: fan.status,
            pin: fan.pin,
        })
        .collect();

    Json(fans)
}

/* == Rooms == */

#[derive(Serialize)]
struct RoomReport {
    room: String,
    co2: u32,
}

/// Sensor rooms that do not have a fan assigned yet, sorted by name.
async fn list_rooms(extract::State(state): extract::State<Arc<AppState>>) -> Json<Vec<RoomReport>> {
    let assigned: Vec<FanAssignment> = state.controller.list().await;

    let mut rooms: Vec<RoomReport> = state
        .sensors
        .latest()
        .await
        .into_iter()
        .filter(|reading| !assigned.iter().any(|fan| fan.room == reading.room))
        .map(|reading| RoomReport {
            room: reading.room,
            co2: reading.co2,
        })
        .collect();

    rooms.sort_by(|a, b| a.room.cmp(&b.room));
    Json(rooms)
}

/* == Mutations == */

#[derive(Deserialize)]
struct RoomPayload {
    room: String,
}

#[derive(Deserialize)]
struct ControlPayload {
    room: String,
    action: Action,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    On,
    Off,
}

async fn assign(
    extract::State(state): extract::State<Arc<AppState>>,
    extract::Json(payload): extract::Json<RoomPayload>,
) -> StandardResponse<FanAssignment> {
    state.controller.assign(&payload.room).await.into()
}

async fn control(
    extract::State(state): extract::State<Arc<AppState>>,
    extract::Json(payload): extract::Json<ControlPayload>,
) -> StandardResponse {
    let status = match payload.action {
        Action::On => FanStatus::On,
        Action::Off => FanStatus::Off,
    };

    state.controller.control(&payload.room, status).await.into()
}

async fn remove(
    extract::State(state): extract::State<Arc<AppState>>,
    extract::Json(payload): extract::Json<RoomPayload>,
) -> StandardResponse {
    state.controller.remove(&payload.room).await.into()
}

/* == Status == */

async fn status() -> &'static str {
    "Healthy"
}

/* == Types == */

#[derive(Serialize)]
#[serde(tag = "status")]
enum StandardResponse<T = ()> {
    Success {
        data: T,
    },
    Error {
        message: String,
        #[serde(skip)]
        code: StatusCode,
    },
}

impl ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            ControlError::NoFreePins | ControlError::AlreadyAssigned(_) => StatusCode::CONFLICT,
            ControlError::UnknownRoom(_) => StatusCode::NOT_FOUND,
            ControlError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<T: Serialize> From<Result<T, ControlError>> for StandardResponse<T> {
    fn from(result: Result<T, ControlError>) -> Self {
        match result {
            Ok(data) => StandardResponse::Success { data },
            Err(error) => StandardResponse::Error {
                code: error.status_code(),
                message: error.to_string(),
            },
        }
    }
}

impl<T: Serialize> IntoResponse for StandardResponse<T> {
    fn into_response(self) -> axum::response::Response {
        match self {
            StandardResponse::Success { .. } => (StatusCode::OK, Json(self)),
            StandardResponse::Error { code, .. } => (code, Json(self)),
        }
        .into_response()
    }
}
