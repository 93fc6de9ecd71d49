use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fireplace_common::FireplaceConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    actuator::SimulatedActuator,
    auth::AuthSession,
    client::EcobeeClient,
    controller::Controller,
    error::FireplaceError,
    remote::HttpTransport,
    token_store::TokenStore,
};

const API_KEY_HEADER: &str = "x-api-key";
const OVERRIDE_RANGE: std::ops::RangeInclusive<i32> = 400..=900;

#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
    api_key_digest: [u8; 32],
}

impl AppState {
    fn new(controller: Arc<Controller>, secret_key: &str) -> Self {
        let mut api_key_digest = [0u8; 32];
        api_key_digest.copy_from_slice(&Sha256::digest(secret_key.as_bytes()));
        Self {
            controller,
            api_key_digest,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct PairingView {
    pin: String,
    pairing: &'static str,
}

#[derive(Debug, Serialize)]
struct PairingResult {
    authorized: bool,
    pairing: &'static str,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, credential_path) = load_config().context("failed to load configuration")?;

    let store = TokenStore::open(credential_path).await;
    let transport = HttpTransport::new(&config.auth.api_base_url)?;
    let session =
        AuthSession::connect(config.auth.client_id.clone(), store, Arc::new(transport)).await;
    let client = Arc::new(EcobeeClient::new(session, config.control.cache_life()));

    let actuator = Arc::new(SimulatedActuator::new(config.pins));
    let controller = Controller::new(config.control.clone(), actuator.clone(), client);
    controller
        .attach_button()
        .context("failed to register button handler")?;
    #[cfg(unix)]
    spawn_button_simulation(actuator)?;

    let app = router(AppState::new(controller.clone(), &config.server.secret_key));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.host))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(controller.subscribe_fatal()))
        .await?;

    info!("shutting down");
    controller
        .shutdown()
        .await
        .context("hardware shutdown failed")?;

    let fatal = controller.subscribe_fatal().borrow().clone();
    if let Some(reason) = fatal {
        anyhow::bail!("controller stopped after hardware failure: {reason}");
    }
    Ok(())
}

/// Reads the TOML config and applies the environment overrides.
fn load_config() -> Result<(FireplaceConfig, PathBuf), FireplaceError> {
    let config_path =
        std::env::var("FIREPLACE_CONFIG").unwrap_or_else(|_| "fireplace.toml".to_string());
    let mut config = FireplaceConfig::load(&config_path)?;
    info!("loaded config from {config_path}");

    if let Some(port) = std::env::var("FIREPLACE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.server.port = port;
    }
    let credential_path = match std::env::var("FIREPLACE_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir).join(&config.credential_path),
        Err(_) => PathBuf::from(&config.credential_path),
    };
    Ok((config, credential_path))
}

fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/loop/start", post(handle_start_loop))
        .route("/api/loop/stop", post(handle_stop_loop))
        .route(
            "/api/override",
            post(handle_set_override).delete(handle_clear_override),
        )
        .route("/api/fireplace/on", post(handle_fireplace_on))
        .route("/api/fireplace/off", post(handle_fireplace_off))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/authorize", get(handle_authorize))
        .route("/api/authorize/complete", post(handle_authorize_complete))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/events", get(handle_get_events))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let supplied = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|value| Sha256::digest(value.as_bytes()));
    match supplied {
        Some(digest) if digest.as_slice() == state.api_key_digest.as_slice() => {
            next.run(request).await
        }
        _ => {
            warn!("rejected {} {}: bad api key", request.method(), request.uri());
            error_response(StatusCode::UNAUTHORIZED, "Invalid or missing API key")
        }
    }
}

#[cfg(unix)]
fn spawn_button_simulation(actuator: Arc<SimulatedActuator>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut presses =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while presses.recv().await.is_some() {
            if !actuator.press_button() {
                debug!("simulated button press dropped");
            }
        }
    });
    info!("send SIGUSR1 to simulate a button press");
    Ok(())
}

async fn shutdown_signal(mut fatal: watch::Receiver<Option<String>>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let hardware = async {
        while fatal.borrow_and_update().is_none() {
            if fatal.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
        _ = hardware => error!("hardware failure, stopping"),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

async fn handle_get_events(State(state): State<AppState>) -> Response {
    match state.controller.events().await {
        Ok(events) => Json(events).into_response(),
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_start_loop(State(state): State<AppState>) -> Response {
    match state.controller.start_loop().await {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_stop_loop(State(state): State<AppState>) -> Response {
    match state.controller.stop_loop().await {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_set_override(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.trim().parse::<i32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };
    if !OVERRIDE_RANGE.contains(&target) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Override must be between 400 and 900 tenths of a degree",
        );
    }

    state.controller.set_override(target).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_clear_override(State(state): State<AppState>) -> Response {
    state.controller.clear_override().await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_fireplace_on(State(state): State<AppState>) -> Response {
    match state.controller.manual_on().await {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_fireplace_off(State(state): State<AppState>) -> Response {
    match state.controller.manual_off().await {
        Ok(()) => handle_get_status(State(state)).await.into_response(),
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_refresh(State(state): State<AppState>) -> Response {
    state.controller.request_refresh().await;
    StatusCode::ACCEPTED.into_response()
}

async fn handle_authorize(State(state): State<AppState>) -> Response {
    match state.controller.begin_pairing().await {
        Ok(pin) => {
            info!("enter PIN {pin} under My Apps in the ecobee portal");
            Json(PairingView {
                pin,
                pairing: fireplace_common::PairingState::PendingToken.as_str(),
            })
            .into_response()
        }
        Err(err) => fireplace_error_response(&err),
    }
}

async fn handle_authorize_complete(State(state): State<AppState>) -> Response {
    match state.controller.complete_pairing().await {
        Ok(authorized) => {
            let pairing = state.controller.status().await.pairing;
            Json(PairingResult {
                authorized,
                pairing,
            })
            .into_response()
        }
        Err(err) => fireplace_error_response(&err),
    }
}

fn fireplace_error_response(err: &FireplaceError) -> Response {
    let status = match err {
        FireplaceError::Unauthorized => StatusCode::CONFLICT,
        FireplaceError::Auth(_)
        | FireplaceError::Transport(_)
        | FireplaceError::Remote { .. }
        | FireplaceError::Decode(_) => StatusCode::BAD_GATEWAY,
        FireplaceError::Storage(_) | FireplaceError::Config(_) | FireplaceError::Hardware(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use fireplace_common::ecobee::{AUTHORIZE_PATH, THERMOSTAT_PATH};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        actuator::Actuator,
        client::testing::thermostat_body,
        controller::testing::{harness, Harness},
    };

    const KEY: &str = "hunter2";

    fn app(h: &Harness) -> Router {
        router(AppState::new(h.controller.clone(), KEY))
    }

    async fn call(app: Router, method: &str, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut request = axum::http::Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn status_is_public() {
        let h = harness(true).await;
        h.transport
            .always(THERMOSTAT_PATH, 200, thermostat_body(690, 680));

        let (status, body) = call(app(&h), "GET", "/api/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loopActive"], false);
        assert_eq!(body["currentTemp"], 690);
        assert_eq!(body["threshold"], 2);
        assert_eq!(body["pairing"], "PAIRED");
    }

    #[tokio::test]
    async fn commands_require_api_key() {
        let h = harness(true).await;

        let (missing, _) = call(app(&h), "POST", "/api/loop/start", None).await;
        let (wrong, body) = call(app(&h), "POST", "/api/fireplace/on", Some("guess")).await;

        assert_eq!(missing, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid or missing API key");
        assert!(!h.controller.status().await.loop_active);
        assert_eq!(h.actuator.write_count(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_loop() {
        let h = harness(true).await;
        h.transport
            .always(THERMOSTAT_PATH, 200, thermostat_body(690, 680));

        let (status, body) = call(app(&h), "POST", "/api/loop/start", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loopActive"], true);
        assert_eq!(body["indicatorOn"], true);

        let (status, body) = call(app(&h), "POST", "/api/loop/stop", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loopActive"], false);
        assert_eq!(body["indicatorOn"], false);
    }

    #[tokio::test]
    async fn override_is_validated() {
        let h = harness(true).await;
        h.transport
            .always(THERMOSTAT_PATH, 200, thermostat_body(690, 680));

        let (missing, _) = call(app(&h), "POST", "/api/override", Some(KEY)).await;
        let (garbage, _) = call(app(&h), "POST", "/api/override?value=warm", Some(KEY)).await;
        let (too_hot, _) = call(app(&h), "POST", "/api/override?value=1000", Some(KEY)).await;
        assert_eq!(missing, StatusCode::BAD_REQUEST);
        assert_eq!(garbage, StatusCode::BAD_REQUEST);
        assert_eq!(too_hot, StatusCode::BAD_REQUEST);

        let (status, body) = call(app(&h), "POST", "/api/override?value=650", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overrideTarget"], 650);

        let (status, body) = call(app(&h), "DELETE", "/api/override", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overrideTarget"], Value::Null);
    }

    #[tokio::test]
    async fn manual_fireplace_control() {
        let h = harness(true).await;
        h.transport
            .always(THERMOSTAT_PATH, 200, thermostat_body(690, 680));

        let (status, body) = call(app(&h), "POST", "/api/fireplace/on", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["actuatorOn"], true);
        assert_eq!(body["fanHoldActive"], true);

        let (_, body) = call(app(&h), "POST", "/api/fireplace/off", Some(KEY)).await;
        assert_eq!(body["actuatorOn"], false);
        assert_eq!(body["fanHoldActive"], false);
        assert!(!h.actuator.is_actuator_on());
    }

    #[tokio::test]
    async fn hardware_failure_is_server_error() {
        let h = harness(true).await;
        h.actuator.fail_writes(true);

        let (status, body) = call(app(&h), "POST", "/api/fireplace/on", Some(KEY)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("hardware failure"));
    }

    #[tokio::test]
    async fn hardware_failure_ends_serving() {
        let h = harness(true).await;
        let signal = tokio::spawn(shutdown_signal(h.controller.subscribe_fatal()));
        h.actuator.fail_writes(true);

        let (status, _) = call(app(&h), "POST", "/api/fireplace/on", Some(KEY)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        tokio::time::timeout(Duration::from_secs(2), signal)
            .await
            .unwrap()
            .unwrap();
        assert!(h.controller.shutdown().await.is_err());
        assert!(!h.actuator.is_actuator_on());
    }

    #[tokio::test]
    async fn authorize_returns_pin() {
        let h = harness(false).await;
        h.transport.push(
            AUTHORIZE_PATH,
            200,
            r#"{"ecobeePin":"WXYZ","code":"device-code","scope":"smartWrite","expires_in":9}"#,
        );

        let (status, body) = call(app(&h), "GET", "/api/authorize", Some(KEY)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pin"], "WXYZ");
        assert_eq!(body["pairing"], "PENDING_TOKEN");
        assert_eq!(h.controller.status().await.pairing, "PENDING_TOKEN");
    }

    #[tokio::test]
    async fn authorize_complete_before_approval() {
        let h = harness(false).await;

        let (status, body) = call(app(&h), "POST", "/api/authorize/complete", Some(KEY)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], false);
        assert_eq!(body["pairing"], "UNPAIRED");
    }

    #[tokio::test]
    async fn events_need_pairing() {
        let h = harness(false).await;

        let (status, _) = call(app(&h), "GET", "/api/events", None).await;

        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn refresh_is_accepted() {
        let h = harness(true).await;

        let (status, _) = call(app(&h), "POST", "/api/refresh", Some(KEY)).await;

        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
