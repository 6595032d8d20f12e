//! HTTP 路由

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::stream::CONTENT_TYPE;
use super::AppState;
use crate::error::AppError;
use crate::input::CameraKind;
use crate::pipeline::Slot;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/set_camera", post(set_camera))
        .route("/video_feed", get(video_feed))
        .route("/diff_feed", get(diff_feed))
        .route("/object_feed", get(object_feed))
        .route("/raw_feed", get(raw_feed))
        .route("/get_detections", get(get_detections))
        .route("/get_metrics", get(get_metrics))
        .route("/get_camera", get(get_camera))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Deserialize)]
pub struct SetCameraForm {
    source: Option<String>,
}

/// 显式切换摄像头 (webcam / phonecam)
async fn set_camera(State(state): State<AppState>, Form(form): Form<SetCameraForm>) -> Result<&'static str, AppError> {
    let source = form
        .source
        .ok_or_else(|| AppError::Validation("missing field 'source'".into()))?;
    let kind: CameraKind = source.parse().map_err(AppError::Validation)?;

    let selector = state.selector.clone();
    let opened = tokio::task::spawn_blocking(move || selector.switch(kind))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    match opened {
        Ok(()) => tracing::info!(source = kind.as_str(), "🔄 已切换摄像头"),
        // 句柄已替换, 由后续读帧继续重试
        Err(e) => tracing::warn!(source = kind.as_str(), error = %e, "⚠️ 已切换摄像头, 但尚未打开"),
    }
    Ok("Camera source updated!")
}

fn mjpeg_response(state: &AppState, slot: Slot) -> Response {
    let body = Body::from_stream(state.streams.open_stream(slot));
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// 运动检测标注画面
async fn video_feed(State(state): State<AppState>) -> Response {
    mjpeg_response(&state, Slot::Motion)
}

/// 前景掩码画面
async fn diff_feed(State(state): State<AppState>) -> Response {
    mjpeg_response(&state, Slot::Diff)
}

/// 目标检测标注画面
async fn object_feed(State(state): State<AppState>) -> Response {
    mjpeg_response(&state, Slot::Object)
}

async fn raw_feed(State(state): State<AppState>) -> Response {
    mjpeg_response(&state, Slot::Raw)
}

async fn get_detections(State(state): State<AppState>) -> impl IntoResponse {
    let detections = state.store.read_detections();
    Json(json!({ "detections": detections.as_slice() }))
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.snapshot())
}

/// 当前活动摄像头
async fn get_camera(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let active = state.manager.active();
    let last_frame = state
        .store
        .read_slot(Slot::Raw)
        .map(|latest| latest.frame().timestamp().to_rfc3339());
    // 句柄正在读帧/重连时等待片刻
    let status = tokio::task::spawn_blocking(move || {
        json!({
            "source": active.kind().as_str(),
            "descriptor": active.descriptor().to_string(),
            "state": active.state().map_or("busy", |s| s.as_str()),
            "last_frame": last_frame,
        })
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(status))
}
