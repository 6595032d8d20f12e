//! 错误类型 (Error types)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::input::CameraDescriptor;

/// 摄像头错误 (camera source / handle errors)
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// 重试次数耗尽
    #[error("{descriptor} unavailable after {attempts} attempts")]
    Unavailable {
        descriptor: CameraDescriptor,
        attempts: u32,
    },

    /// 句柄未处于 Open 状态
    #[error("camera is not open")]
    NotOpen,

    /// 连接失败
    #[error("connect failed: {0}")]
    Connect(String),

    /// 读取失败
    #[error("read failed: {0}")]
    Read(String),

    /// 画面停滞 (后台读取线程长时间没有新帧)
    #[error("no new frame for {0} ms")]
    Stale(u128),

    /// IO error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// 已收到退出信号
    #[error("shutdown requested")]
    Shutdown,
}

pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// HTTP 接口错误
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 请求参数错误
    #[error("Validation error: {0}")]
    Validation(String),

    /// 后台任务执行失败
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
