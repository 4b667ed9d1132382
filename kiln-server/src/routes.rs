//! HTTP surface and the request-path session protocol.
//!
//! The handler acquires (or creates) the client's session, refreshes its
//! activity timestamp, and runs generation under the session's own lock.
//! Any generation failure tears that session down before the error is
//! returned, so a bad pipeline is never observed twice.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Json, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use kiln_core::{GenerationRequest, PipelineConfig, PipelineLike, SdPipeline};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::keying::{client_addr, mask_addr};
use crate::store::SessionStore;

#[derive(Serialize)]
pub struct GenerationResponse {
    pub image: String,
}

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore<SdPipeline>>,
    pub pipeline_config: PipelineConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn generate_image_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    validate_prompt(&request.prompt)?;
    let key = mask_addr(&client_addr(&headers, peer))?;
    info!(client = %key, prompt = %request.prompt, "generation request");

    let config = state.pipeline_config.clone();
    let image = run_generation(
        &state.sessions,
        &key,
        || SdPipeline::new(config),
        &request,
    )
    .await?;

    let encoded = image_to_base64_png(&image)?;
    info!(client = %key, bytes = encoded.len(), "image generated");
    Ok(Json(GenerationResponse { image: encoded }))
}

/// Acquire the client's session, run generation, and tear the session
/// down on failure.
pub async fn run_generation<P: PipelineLike>(
    store: &SessionStore<P>,
    key: &str,
    factory: impl FnOnce() -> P,
    request: &GenerationRequest,
) -> Result<DynamicImage, ApiError> {
    let session = store.get_or_create(key, factory)?;
    store.touch(key);

    let result = session.lock().await.generate(request);
    match result {
        Ok(image) => Ok(image),
        Err(e) => {
            warn!(client = %key, error = %e, "generation failed, discarding session");
            if let Some(failed) = store.evict(key) {
                if let Err(cleanup_err) = failed.lock().await.cleanup() {
                    warn!(client = %key, error = %cleanup_err, "failed to release discarded session");
                }
            }
            Err(e.into())
        }
    }
}

fn validate_prompt(prompt: &str) -> Result<(), ApiError> {
    if prompt.trim().is_empty() {
        return Err(ApiError::EmptyPrompt);
    }
    Ok(())
}

/// Encode an image as a base64 PNG payload.
fn image_to_base64_png(img: &DynamicImage) -> Result<String, ApiError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| ApiError::Encoding(e.to_string()))?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counters, FakePipeline};

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            width: None,
            height: None,
        }
    }

    #[tokio::test]
    async fn session_is_reused_across_requests() {
        let store = SessionStore::new(4);
        let counters = Arc::new(Counters::default());
        let req = request("a knight in blue armor");

        for _ in 0..2 {
            let counters = Arc::clone(&counters);
            run_generation(
                &store,
                "10.1.2.0",
                move || FakePipeline::new(counters),
                &req,
            )
            .await
            .unwrap();
        }

        // One lazy initialization, two generations on the same pipeline.
        assert_eq!(counters.initialize_calls(), 1);
        assert_eq!(counters.generate_calls(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failure_evicts_only_the_failing_session() {
        let store = SessionStore::new(4);
        let good = Arc::new(Counters::default());
        let bad = Arc::new(Counters::default());
        let req = request("a cow pen at golden hour");

        {
            let good = Arc::clone(&good);
            run_generation(&store, "10.1.2.0", move || FakePipeline::new(good), &req)
                .await
                .unwrap();
        }
        {
            let bad = Arc::clone(&bad);
            let err = run_generation(&store, "10.9.9.0", move || FakePipeline::failing(bad), &req)
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::Pipeline(_)));
        }

        // The failing session is gone and was released exactly once; the
        // healthy one is untouched.
        assert!(store.get("10.9.9.0").is_none());
        assert_eq!(bad.cleanup_calls(), 1);
        assert!(store.get("10.1.2.0").is_some());
        assert_eq!(good.cleanup_calls(), 0);
    }

    #[tokio::test]
    async fn failed_session_is_rebuilt_on_the_next_request() {
        let store = SessionStore::new(4);
        let req = request("a kiln firing overnight");

        {
            let counters = Arc::new(Counters::default());
            let _ = run_generation(
                &store,
                "10.1.2.0",
                move || FakePipeline::failing(counters),
                &req,
            )
            .await;
        }
        assert!(store.is_empty());

        let counters = Arc::new(Counters::default());
        {
            let counters = Arc::clone(&counters);
            run_generation(
                &store,
                "10.1.2.0",
                move || FakePipeline::new(counters),
                &req,
            )
            .await
            .unwrap();
        }
        assert_eq!(counters.initialize_calls(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn capacity_error_reaches_the_caller() {
        let store = SessionStore::new(1);
        let req = request("one too many");

        {
            let counters = Arc::new(Counters::default());
            run_generation(
                &store,
                "10.1.2.0",
                move || FakePipeline::new(counters),
                &req,
            )
            .await
            .unwrap();
        }

        let counters = Arc::new(Counters::default());
        let err = run_generation(
            &store,
            "10.9.9.0",
            move || FakePipeline::new(counters),
            &req,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::SessionLimit(_)));
    }

    #[test]
    fn blank_prompts_are_rejected() {
        assert!(matches!(validate_prompt(""), Err(ApiError::EmptyPrompt)));
        assert!(matches!(validate_prompt("   "), Err(ApiError::EmptyPrompt)));
        assert!(validate_prompt("a clay kiln").is_ok());
    }

    #[test]
    fn images_encode_to_base64_png() {
        let image = DynamicImage::new_rgb8(4, 4);
        let encoded = image_to_base64_png(&image).unwrap();
        let bytes = BASE64_STANDARD.decode(encoded).unwrap();
        // PNG magic header survives the round trip.
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[test]
    fn request_dimensions_are_optional() {
        let parsed: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a clay kiln"}"#).unwrap();
        assert_eq!(parsed.prompt, "a clay kiln");
        assert_eq!(parsed.width, None);
        assert_eq!(parsed.height, None);
    }
}
