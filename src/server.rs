use crate::{
    config::ConfigManager,
    error::ConfigError,
    feed,
    storage::AdStore,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::TimeDelta;
use serde_json::json;
use std::sync::Arc;

const EDITOR_PAGE: &str = include_str!("../static/edit_config.html");

#[derive(Clone)]
pub struct AppState {
    pub store: AdStore,
    pub config: Arc<ConfigManager>,
    pub retention: TimeDelta,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rss", get(serve_feed))
        .route("/api/config", get(get_config).post(update_config))
        .route("/edit-config", get(edit_config))
        .with_state(state)
}

async fn serve_feed(State(state): State<AppState>) -> Response {
    let config = state.config.current();

    // Prepare a feed to serve.
    let channel = feed::build_feed(&state.store, &config, state.retention).await;
    tracing::debug!("Serving feed with {} items", channel.items().len());

    // Turn it into RSS XML and serve. Never fail the request outright.
    let rss_string = match feed::render(&channel) {
        Ok(xml) => xml,
        Err(error) => {
            tracing::error!("Serving an empty feed: {error}");
            feed::render(&feed::empty_feed(&config)).unwrap_or_default()
        }
    };
    let rss_content = [("content-type", "application/rss+xml")];
    (StatusCode::OK, rss_content, rss_string).into_response()
}

async fn get_config(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.config.current().to_json_value())).into_response()
}

async fn update_config(State(state): State<AppState>, body: String) -> Response {
    let result = match serde_json::from_str(&body) {
        Ok(document) => state.config.save_document(document).await,
        Err(error) => Err(ConfigError::validation(format!("malformed JSON: {error}"))),
    };

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Configuration saved, changes apply from the next cycle",
            })),
        )
            .into_response(),
        Err(ConfigError::Validation(message)) => {
            tracing::warn!("Rejected config update: {message}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": message })),
            )
                .into_response()
        }
        Err(error) => {
            tracing::error!("Failed to save config: {error}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": error.to_string() })),
            )
                .into_response()
        }
    }
}

async fn edit_config() -> Html<&'static str> {
    Html(EDITOR_PAGE)
}
