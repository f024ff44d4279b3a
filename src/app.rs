use crate::config::{self, ModelMapEntry};
use crate::credentials::CookieFile;
use crate::error::{AppError, AppResult};
use crate::model_map::ModelMapper;
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub model_mapper: Arc<ModelMapper>,
    pub upstream: UpstreamClient,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub upstream_url: String,
    pub cookie_path: PathBuf,
    pub device_id: String,
    pub model_map_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            upstream_url: config::DEFAULT_UPSTREAM_URL.to_string(),
            cookie_path: PathBuf::from(config::DEFAULT_COOKIE_PATH),
            device_id: config::DEFAULT_DEVICE_ID.to_string(),
            model_map_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: env_or("CHATHUB_RELAY_LISTEN", defaults.listen),
            metrics_path: env_or("CHATHUB_RELAY_METRICS_PATH", defaults.metrics_path),
            upstream_url: env_or("CHATHUB_RELAY_UPSTREAM_URL", defaults.upstream_url),
            cookie_path: env_var("CHATHUB_RELAY_COOKIE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cookie_path),
            device_id: env_or("CHATHUB_RELAY_DEVICE_ID", defaults.device_id),
            model_map_path: env_var("CHATHUB_RELAY_MODEL_MAP").map(PathBuf::from),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: String) -> String {
    env_var(key).unwrap_or(default)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let mut entries: Vec<ModelMapEntry> = config::builtin_model_map();
    if let Some(path) = &runtime.model_map_path {
        let overrides = config::load_model_map_file(path)
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "model_map_load_failed", err))?;
        tracing::info!(path = %path.display(), entries = overrides.len(), "loaded model map overrides");
        entries.extend(overrides);
    }
    let model_mapper = Arc::new(ModelMapper::new(entries));
    tracing::info!(models = model_mapper.len(), "model map ready");

    let upstream = UpstreamClient::new(
        http,
        runtime.upstream_url.clone(),
        runtime.device_id.clone(),
        Arc::new(CookieFile::new(runtime.cookie_path.clone())),
    );

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        model_mapper,
        upstream,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router(&metrics_path);
    Router::<AppState>::new()
        .route("/", get(crate::handlers::root))
        .merge(api_router.clone())
        .nest("/api", api_router)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(metrics_path, get(crate::handlers::metrics))
}
