/// HTTP 服务 (HTTP Server)
///
/// - routes: 页面 / 切换摄像头 / JSON 接口
/// - stream: MJPEG 推流
pub mod routes;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;

use crate::input::{CameraManager, CameraSelector};
use crate::monitoring::PerformanceMonitor;
use crate::pipeline::FrameStore;
use crate::shutdown::Shutdown;

pub use routes::create_router;
pub use stream::StreamMultiplexer;

/// 各处理器共享的状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FrameStore>,
    pub monitor: Arc<PerformanceMonitor>,
    pub manager: Arc<CameraManager>,
    pub selector: Arc<CameraSelector>,
    pub streams: StreamMultiplexer,
}

/// 监听 `addr`, 直到收到退出信号
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: Shutdown) -> anyhow::Result<()> {
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("🌐 HTTP 服务监听 http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    tracing::info!("🌐 HTTP 服务已停止");
    Ok(())
}
