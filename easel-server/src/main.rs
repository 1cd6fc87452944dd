use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use easel_core::{
    GenerateError, LoadOptions, ModelHandle, RequestController, SdLoader, DEFAULT_MODEL_ID,
};
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{self, net::TcpListener};
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Easel text-to-image server")]
struct Args {
    /// Hugging Face model repository to load the diffusion weights from
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
}

#[derive(Serialize)]
struct GenerateResponse {
    /// Base64-encoded PNG.
    image: String,
    /// The resolved prompt that was actually generated.
    prompt: String,
    file_name: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    message: String,
    advice: &'static str,
}

// Application state containing the shared controller.
#[derive(Clone)]
struct AppState {
    controller: Arc<RequestController>,
}

fn error_status(err: &GenerateError) -> StatusCode {
    match err {
        GenerateError::EmptyPrompt => StatusCode::UNPROCESSABLE_ENTITY,
        GenerateError::Busy => StatusCode::CONFLICT,
        GenerateError::ModelLoad(_) | GenerateError::Inference(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn sample_prompt_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "prompt": state.controller.pick_sample() }))
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> impl IntoResponse {
    match state.controller.handle_generate(&body.prompt).await {
        Ok(image) => Json(GenerateResponse {
            image: BASE64_STANDARD.encode(&image.png),
            prompt: image.prompt,
            file_name: image.file_name,
        })
        .into_response(),
        Err(e) => {
            error!(reason = e.kind(), fatal = e.is_fatal(), "generation failed: {e}");
            (
                error_status(&e),
                Json(ErrorResponse {
                    reason: e.kind(),
                    message: e.to_string(),
                    advice: e.advice(),
                }),
            )
                .into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // The model is loaded lazily: the first generation request pays the
    // load cost, later ones reuse the cached pipeline.
    let options = LoadOptions {
        model_id: args.model,
    };
    let model = ModelHandle::new(SdLoader::factory(Api::new()?, options));
    let controller = Arc::new(RequestController::new(Arc::new(model)));
    let state = Arc::new(AppState { controller });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/prompts/sample", get(sample_prompt_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_expected_statuses() {
        assert_eq!(
            error_status(&GenerateError::EmptyPrompt),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(error_status(&GenerateError::Busy), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&GenerateError::ModelLoad("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&GenerateError::Inference("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
