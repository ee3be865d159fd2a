use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;
mod error;
use error::SolveError;
mod model;
use model::{Charset, Classifier, TfClassifier};
mod preprocess;
mod utils;
use utils::ensure_files_exist;

/// Plain-text body returned when the shared secret does not match.
const AUTH_FAILURE: &str = "ocr error";

struct AppState {
    classifier: Mutex<Box<dyn Classifier>>,
    hashcode: String,
}

#[derive(Serialize)]
struct SolveResponse {
    code: String,
    status: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    ensure_files_exist(&config)
        .await
        .context("model files unavailable")?;

    info!(
        model = %config.model_path.display(),
        charset = %config.charset_path.display(),
        "Loading model"
    );
    let charset = Charset::load(&config.charset_path).context("failed to load charset")?;
    let classifier = TfClassifier::new(
        &config.model_path,
        charset,
        &config.input_op,
        &config.output_op,
    )
    .context("failed to load model")?;

    let shared_state = Arc::new(AppState {
        classifier: Mutex::new(Box::new(classifier)),
        hashcode: config.hashcode.clone(),
    });

    let app = app(shared_state, config.body_limit_bytes);

    let addr = config.addr();
    info!("Listening on http://{}", addr);
    axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

fn app(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/solve", post(solve_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .route("/health", get(health_check))
}

async fn solve_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();

    let request: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = SolveError::from(err);
            warn!(error = %err, "Rejected solve request");
            return err.into_response();
        }
    };

    let authorized = match request.get("hashcode") {
        Some(Value::String(hashcode)) => !hashcode.is_empty() && *hashcode == state.hashcode,
        _ => false,
    };
    if !authorized {
        warn!("Rejected solve request with invalid hashcode");
        return AUTH_FAILURE.into_response();
    }

    let result = match request.get("image") {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(image)) => Ok(image.clone()),
        Some(_) => Err(SolveError::ImageField),
    };
    let result = match result {
        Ok(image) => tokio::task::spawn_blocking(move || solve(&state, &image))
            .await
            .map_err(SolveError::from)
            .and_then(|solved| solved),
        Err(err) => Err(err),
    };

    match result {
        Ok(code) => {
            info!(elapsed = ?started.elapsed(), "Recognized: {}", code);
            Json(SolveResponse {
                code,
                status: "success",
            })
            .into_response()
        }
        Err(err) => {
            warn!(elapsed = ?started.elapsed(), "Error: {}", err);
            err.into_response()
        }
    }
}

/// Decode, preprocess and classify one captcha. Runs on the blocking pool.
fn solve(state: &AppState, image: &str) -> Result<String, SolveError> {
    let img_bytes = STANDARD.decode(base64_alphabet_only(strip_data_uri(image)))?;
    let processed = preprocess::preprocess_bytes(&img_bytes)?;

    let classifier = state.classifier.blocking_lock();
    Ok(classifier.classify(&processed)?)
}

/// Drops a `data:image/...;base64,` style prefix.
fn strip_data_uri(image: &str) -> &str {
    match image.split_once(',') {
        Some((_, payload)) => payload,
        None => image,
    }
}

/// Keeps only base64 alphabet and padding bytes, so wrapped or spaced payloads decode.
fn base64_alphabet_only(payload: &str) -> Vec<u8> {
    payload
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .collect()
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}
