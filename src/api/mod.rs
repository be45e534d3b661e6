pub mod dto;
pub mod errors;
pub mod handlers;
pub mod operator;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::{control::ControlMode, reading_cache::ReadingCache, store::Stores};
use handlers::ApiDoc;

/// Shared by every handler; all fields are cheap clones of shared state.
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub cache: ReadingCache,
    pub mode: ControlMode,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/sensors/latest", get(handlers::get_latest_sample))
        .route("/sensors/history", get(handlers::get_history))
        .route("/devices", get(handlers::list_devices))
        .route("/devices/{device}/{status}", post(handlers::set_device_state))
        .route("/control/mode", get(handlers::get_control_mode))
        .route("/control/mode/toggle", post(handlers::toggle_control_mode))
        .route("/thresholds", get(handlers::list_thresholds))
        .route("/thresholds/{parameter}", put(handlers::set_threshold))
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/{id}/handle", post(handlers::handle_alert))
        .route(
            "/schedules",
            get(handlers::list_schedules).post(handlers::create_schedule),
        )
        .route("/schedules/{id}/toggle", post(handlers::toggle_schedule))
        .route("/schedules/{id}", delete(handlers::delete_schedule))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
