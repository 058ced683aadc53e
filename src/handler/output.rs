use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{handler::ApiJsonResult, manager};

pub fn output_router() -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/streaming/start", post(start_streaming))
        .route("/streaming/stop", post(stop_streaming))
        .route("/streaming/force_stop", post(force_stop_streaming))
        .route("/recording/start", post(start_recording))
        .route("/recording/stop", post(stop_recording))
}

#[derive(Serialize, Deserialize)]
struct OutputStatus {
    streaming: bool,
    recording: bool,
    delay_active: bool,
    /// Output currently bound to the service, if any.
    service_output: Option<String>,
}

async fn status() -> ApiJsonResult<OutputStatus> {
    let manager = manager::get_output_manager()?;
    let handler = manager.handler();
    Ok(Json(OutputStatus {
        streaming: handler.streaming_active(),
        recording: handler.recording_active(),
        delay_active: handler.base().delay_active(),
        service_output: manager.service().active_output(),
    }))
}

async fn start_streaming() -> ApiJsonResult<String> {
    let manager = manager::get_output_manager()?;
    manager.handler().start_streaming(manager.service()).await?;
    Ok(Json("success".to_string()))
}

async fn stop_streaming() -> ApiJsonResult<String> {
    manager::get_output_manager()?.handler().stop_streaming().await;
    Ok(Json("success".to_string()))
}

async fn force_stop_streaming() -> ApiJsonResult<String> {
    manager::get_output_manager()?
        .handler()
        .force_stop_streaming()
        .await;
    Ok(Json("success".to_string()))
}

async fn start_recording() -> ApiJsonResult<String> {
    manager::get_output_manager()?
        .handler()
        .start_recording()
        .await?;
    Ok(Json("success".to_string()))
}

async fn stop_recording() -> ApiJsonResult<String> {
    manager::get_output_manager()?.handler().stop_recording().await;
    Ok(Json("success".to_string()))
}
