use crate::api::AppState;
use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use config_sync::authority::API_KEY_HEADER;
use serde_json::json;

pub const ALL_REQUESTS_REJECTED: &str = "reject_unauthorized is set to true but no client_api_keys are configured, all requests will end in a 401. Either set reject_unauthorized to false or provide a list of client_api_keys.";

/// Rejects requests whose `x-tggl-api-key` is not one of the configured client keys.
pub async fn check_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let auth = state.auth();

    if auth.reject_unauthorized {
        if auth.client_api_keys.is_empty() {
            return unauthorized(ALL_REQUESTS_REJECTED);
        }

        let key = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if !key.is_some_and(|key| auth.client_api_keys.iter().any(|k| k == key)) {
            return unauthorized("Unauthorized");
        }
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}
