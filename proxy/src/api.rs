use crate::auth::{self, check_api_key};
use crate::config::{AuthConfig, Listener, Paths};
use crate::errors::ProxyError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use axum::{
    Json, Router,
    body::{Bytes, to_bytes},
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config_sync::ConfigSync;
use config_sync::types::SyncDate;
use reporting::ReportingAggregator;
use reporting::aggregator::{FlagOutcome, UsageEvent};
use serde_json::{Map, Value, json};
use shared::{gauge, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    sync: ConfigSync,
    reporting: Option<Arc<ReportingAggregator>>,
    auth: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(
        sync: ConfigSync,
        reporting: Option<Arc<ReportingAggregator>>,
        auth: AuthConfig,
    ) -> Self {
        if auth.reject_unauthorized && auth.client_api_keys.is_empty() {
            tracing::error!("{}", auth::ALL_REQUESTS_REJECTED);
        }

        AppState {
            sync,
            reporting,
            auth: Arc::new(auth),
        }
    }

    pub(crate) fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    /// Evaluates one context merged over the request defaults and returns the active flags
    /// as a slug to value object.
    fn evaluate(&self, defaults: &Map<String, Value>, context: Value) -> Value {
        let mut merged = defaults.clone();
        if let Value::Object(fields) = context {
            merged.extend(fields);
        }

        let evaluations = self.sync.engine().evaluate(&merged);

        if let Some(reporting) = &self.reporting {
            let outcomes: Vec<FlagOutcome> = evaluations
                .iter()
                .map(|e| FlagOutcome {
                    slug: e.slug.clone(),
                    active: e.active,
                    value: e.value.clone(),
                    default: e.default.clone(),
                })
                .collect();
            reporting.ingest(&UsageEvent {
                context: &merged,
                flags: &outcomes,
            });
        }

        Value::Object(
            evaluations
                .into_iter()
                .filter(|e| e.active)
                .map(|e| (e.slug, e.value))
                .collect(),
        )
    }
}

pub fn router(state: AppState, paths: &Paths) -> Router {
    let auth_layer = middleware::from_fn_with_state(state.clone(), check_api_key);

    let mut app = Router::new();
    if let Some(path) = &paths.flags {
        app = app.route(path, post(flags).layer(auth_layer.clone()));
    }
    if let Some(path) = &paths.report {
        app = app.route(path, post(report).layer(auth_layer.clone()));
    }
    if let Some(path) = &paths.config {
        app = app.route(path, get(config).layer(auth_layer));
    }
    if let Some(path) = &paths.health {
        app = app.route(path, get(health));
    }
    if let Some(path) = &paths.ready {
        app = app.route(path, get(ready));
    }

    app.fallback(not_found)
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Serves the API until `shutdown` resolves.
pub async fn serve(
    listener: &Listener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ProxyError> {
    let app = router(state, &listener.paths);

    let addr = format!("{}:{}", listener.host, listener.port);
    let tcp_listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Flag proxy listening");

    axum::serve(
        tcp_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn flags(State(state): State<AppState>, request: Request) -> Result<Json<Value>, ProxyError> {
    state.sync.wait_ready().await;

    let defaults = default_context(&request);
    let body = to_bytes(request.into_body(), MAX_BODY_SIZE).await?;
    let body: Value = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&body)?
    };

    let response = match body {
        Value::Array(contexts) => Value::Array(
            contexts
                .into_iter()
                .map(|context| state.evaluate(&defaults, context))
                .collect(),
        ),
        context => state.evaluate(&defaults, context),
    };

    Ok(Json(response))
}

/// Properties every evaluated context starts from. The request body overrides them.
fn default_context(request: &Request) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("timestamp".into(), json!(SyncDate::now().as_millis()));

    let ip = client_ip(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .map(Value::String)
        .unwrap_or(Value::Null);
    context.insert("ip".into(), ip);

    if let Some(referer) = request
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
    {
        context.insert("referer".into(), Value::String(referer.to_string()));
    }

    context
}

/// First address of `x-forwarded-for`, the original client.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
}

/// Telemetry forwarded by another proxy or an SDK. Never fails.
async fn report(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    match serde_json::from_slice::<Value>(&body) {
        Ok(report) => {
            if let Some(reporting) = &state.reporting {
                reporting.merge(&report);
            }
        }
        Err(e) => tracing::debug!(error = %e, "Ignoring unparsable report"),
    }
    Json(json!({ "success": true }))
}

async fn config(State(state): State<AppState>) -> Json<Value> {
    state.sync.wait_ready().await;
    let config = state.sync.engine().config();
    Json(Value::Array(config.flags().cloned().collect()))
}

async fn health(State(state): State<AppState>) -> Response {
    state.sync.wait_ready().await;
    let health = state.sync.health(SyncDate::now());

    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        [(header::CACHE_CONTROL, "no-cache")],
        health.message(),
    )
        .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.sync.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

async fn track_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());

    gauge!(REQUESTS_INFLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(REQUESTS_INFLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    histogram!(REQUEST_DURATION, "path" => path.clone(), "status" => status.to_string())
        .record(elapsed.as_secs_f64());
    tracing::info!(
        %method,
        path = %path,
        status,
        duration_ms = elapsed.as_secs_f64() * 1000.0,
        "Request"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use config_sync::config::SyncSettings;
    use config_sync::engine::{Engine, Evaluator, FlagEvaluation};
    use config_sync::testutils::{TestAuthority, flag_config};
    use config_sync::types::FlagConfig;
    use http_body_util::BodyExt;
    use reporting::config::ReportingSettings;
    use reporting::testutils::RecordingSink;
    use tower::ServiceExt;

    /// Activates every flag, with the flag's slug as value.
    struct AllActiveEvaluator;

    impl Evaluator for AllActiveEvaluator {
        fn evaluate(&self, config: &FlagConfig, _context: &Map<String, Value>) -> Vec<FlagEvaluation> {
            config
                .slugs()
                .map(|slug| FlagEvaluation {
                    slug: slug.to_string(),
                    active: slug != "off",
                    value: json!(slug),
                    default: Value::Null,
                })
                .collect()
        }
    }

    struct TestApp {
        router: Router,
        sink: Arc<RecordingSink>,
        reporting: Arc<ReportingAggregator>,
    }

    async fn test_app(authority: TestAuthority, auth: AuthConfig, paths: Paths) -> TestApp {
        let engine = Arc::new(Engine::new(Arc::new(AllActiveEvaluator)));
        let settings = SyncSettings {
            max_startup_time_ms: 50,
            ..Default::default()
        };
        let sync = ConfigSync::new(Arc::new(authority), vec![], engine, settings);
        sync.wait_ready().await;

        let sink = Arc::new(RecordingSink::new());
        let reporting = Arc::new(ReportingAggregator::new(
            sink.clone(),
            &ReportingSettings::default(),
        ));
        let state = AppState::new(sync, Some(reporting.clone()), auth);

        TestApp {
            router: router(state, &paths),
            sink,
            reporting,
        }
    }

    async fn serving_app() -> TestApp {
        test_app(
            TestAuthority::serving(flag_config(&["beta", "off"])),
            AuthConfig {
                client_api_keys: vec!["client-key".into()],
                reject_unauthorized: true,
            },
            Paths::default(),
        )
        .await
    }

    fn post_json(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-tggl-api-key", "client-key")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .header("x-tggl-api-key", "client-key")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_flags_single_context() {
        let app = serving_app().await;

        let response = app
            .router
            .oneshot(post_json("/flags", r#"{"userId": "42"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"beta": "beta"}));
    }

    #[tokio::test]
    async fn test_flags_context_array_feeds_reporting() {
        let app = serving_app().await;

        let mut request = post_json("/flags", r#"[{"userId": "42", "userName": "Ada"}, {}]"#);
        request
            .headers_mut()
            .insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(
            body_json(response).await,
            json!([{"beta": "beta"}, {"beta": "beta"}])
        );

        app.reporting.flush().await;
        let payloads = app.sink.payloads();
        let flags = &payloads[0].clients[0].flags;
        assert_eq!(flags["beta"][0].count, 2);
        assert_eq!(flags["off"][0].count, 2);
        assert!(!flags["off"][0].active);

        let properties = &payloads[1].received_properties;
        assert!(properties.contains_key("timestamp"));
        assert!(properties.contains_key("userId"));

        let values = &payloads[2].received_values;
        assert_eq!(values["userId"], vec![vec!["42".to_string(), "Ada".to_string()]]);
        assert_eq!(values["ip"], vec![vec!["10.0.0.1".to_string()]]);
    }

    #[tokio::test]
    async fn test_flags_invalid_body() {
        let app = serving_app().await;
        let response = app
            .router
            .oneshot(post_json("/flags", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_report_always_succeeds() {
        let app = serving_app().await;

        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/report",
                r#"{"receivedProperties": {"plan": [10, 20]}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"success": true}));

        let response = app
            .router
            .oneshot(post_json("/report", "garbage"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({"success": true}));

        app.reporting.flush().await;
        assert_eq!(app.sink.payloads()[0].received_properties["plan"], [10, 20]);
    }

    #[tokio::test]
    async fn test_config_endpoint() {
        let app = serving_app().await;
        let response = app.router.oneshot(get_request("/config")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([
                {"slug": "beta", "conditions": []},
                {"slug": "off", "conditions": []}
            ])
        );
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = serving_app().await;

        let response = app.router.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_text(response).await, "OK");

        let response = app.router.oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_never_synced() {
        let app = test_app(TestAuthority::failing(), AuthConfig::default(), Paths::default()).await;

        let response = app.router.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "No successful config sync yet");
    }

    #[tokio::test]
    async fn test_api_key_check() {
        let app = serving_app().await;

        let mut request = post_json("/flags", "{}");
        request.headers_mut().remove("x-tggl-api-key");
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({"error": "Unauthorized"}));

        let mut request = get_request("/config");
        request
            .headers_mut()
            .insert("x-tggl-api-key", "other-key".parse().unwrap());
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Probes are never authenticated.
        let request = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_client_keys_rejects_everything() {
        let app = test_app(
            TestAuthority::serving(flag_config(&["beta"])),
            AuthConfig::default(),
            Paths::default(),
        )
        .await;

        let response = app.router.oneshot(post_json("/flags", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await,
            json!({"error": auth::ALL_REQUESTS_REJECTED})
        );
    }

    #[tokio::test]
    async fn test_unauthenticated_mode() {
        let app = test_app(
            TestAuthority::serving(flag_config(&["beta"])),
            AuthConfig {
                client_api_keys: vec![],
                reject_unauthorized: false,
            },
            Paths::default(),
        )
        .await;

        let mut request = post_json("/flags", "{}");
        request.headers_mut().remove("x-tggl-api-key");
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disabled_path_and_not_found() {
        let paths = Paths {
            config: None,
            ..Default::default()
        };
        let app = test_app(
            TestAuthority::serving(flag_config(&["beta"])),
            AuthConfig {
                client_api_keys: vec!["client-key".into()],
                reject_unauthorized: true,
            },
            paths,
        )
        .await;

        for uri in ["/config", "/nope"] {
            let response = app.router.clone().oneshot(get_request(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(body_json(response).await, json!({"error": "Not found"}));
        }
    }
}
