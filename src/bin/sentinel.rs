/// 数字卫兵 (Digital Sentinel)
///
/// 自适应摄像头监控服务
///
/// 系统架构:
/// 1. 选择线程: 定时探测网络摄像头, 热切换视频源
/// 2. 采集线程: 读帧 → 运动检测 → 目标检测 → 写入结果缓存
/// 3. 指标线程: 定时输出性能指标
/// 4. 主线程:   tokio 运行时, HTTP 接口与 MJPEG 推流
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sentinel_cam::config::{Args, PipelineConfig};
use sentinel_cam::detection::detector::{DetectorBackend, DetectorConfig, HttpDetector};
use sentinel_cam::detection::{AnalysisStage, MotionStage, ObjectStage, Overlay, YoloDetector};
use sentinel_cam::input::{list_devices, CameraDescriptor, CameraManager, CameraSelector, SystemSources};
use sentinel_cam::monitoring::PerformanceMonitor;
use sentinel_cam::pipeline::{CaptureLoop, FrameStore};
use sentinel_cam::server::{self, AppState, StreamMultiplexer};
use sentinel_cam::shutdown::Shutdown;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 推理后端: 本地模型优先, 加载失败或未配置时使用检测服务
fn build_backend(args: &Args, config: &DetectorConfig) -> Option<Box<dyn DetectorBackend>> {
    if let Some(model) = &args.model {
        match YoloDetector::new(model, config) {
            Ok(detector) => return Some(Box::new(detector)),
            Err(e) => tracing::error!(model = %model.display(), error = %e, "❌ YOLOv8 模型加载失败"),
        }
    }
    args.detector_url.clone().map(|url| {
        tracing::info!(%url, "📦 使用远程检测服务");
        Box::new(HttpDetector::new(url, config)) as Box<dyn DetectorBackend>
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel_cam=info,sentinel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config_path = args.config_path();
    let config = PipelineConfig::load(&config_path);
    config.log_summary();

    tracing::info!("🚀 数字卫兵系统启动");
    tracing::info!("📹 本地摄像头: #{}", args.webcam);
    for (index, name) in list_devices() {
        tracing::info!("📷 设备 #{}: {}", index, name);
    }
    tracing::info!("📱 网络摄像头: {}", args.phonecam_url);
    match (&args.model, &args.detector_url) {
        (Some(model), _) => tracing::info!("📦 检测模型: {}", model.display()),
        (None, Some(url)) => tracing::info!("📦 检测服务: {}", url),
        (None, None) => tracing::info!("📦 目标检测: 未配置"),
    }

    let shutdown = Shutdown::new();
    let monitor = Arc::new(PerformanceMonitor::new(&config.monitor));
    let store = Arc::new(FrameStore::new());

    let manager = Arc::new(CameraManager::new(
        CameraDescriptor::Local { index: args.webcam },
        CameraDescriptor::Network {
            url: args.phonecam_url.clone(),
        },
        Arc::new(SystemSources::new(config.camera.clone())),
        config.camera.retry_policy(),
        monitor.clone(),
        shutdown.clone(),
    ));
    let selector = Arc::new(CameraSelector::new(
        manager.clone(),
        config.camera.probe_interval(),
        shutdown.clone(),
    ));

    // ========== 分析阶段 ==========
    let overlay = Overlay::load(args.font.as_deref());
    let backend = build_backend(&args, &config.detector);
    let stages: Vec<Box<dyn AnalysisStage>> = vec![
        Box::new(MotionStage::new(config.motion.clone(), overlay.clone())),
        Box::new(ObjectStage::new(config.detector.clone(), overlay, backend)),
    ];

    // ========== 后台线程 ==========
    let selector_thread = selector.spawn().context("启动摄像头选择线程失败")?;
    let capture_thread = CaptureLoop::new(manager.clone(), stages, store.clone(), monitor.clone(), shutdown.clone())
        .spawn()
        .context("启动采集线程失败")?;
    let reporter_thread = monitor
        .spawn_reporter(Duration::from_millis(config.monitor.report_interval_ms), shutdown.clone())
        .context("启动指标线程失败")?;

    // ========== HTTP 服务 ==========
    let state = AppState {
        store: store.clone(),
        monitor,
        manager: manager.clone(),
        selector,
        streams: StreamMultiplexer::new(store, config.stream.jpeg_quality, shutdown.clone()),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;
    let served = runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("🛑 收到退出信号");
                    signal.trigger();
                }
                Err(e) => tracing::warn!(error = %e, "⚠️ 无法监听 Ctrl-C"),
            }
        });
        server::serve(args.bind, state, shutdown.clone()).await
    });

    // 服务异常退出时同样通知后台线程
    shutdown.trigger();
    for (name, handle) in [
        ("selector", selector_thread),
        ("capture", capture_thread),
        ("reporter", reporter_thread),
    ] {
        if handle.join().is_err() {
            tracing::error!(thread = name, "❌ 后台线程异常退出");
        }
    }
    manager.close();
    runtime.shutdown_timeout(Duration::from_secs(1));

    tracing::info!("👋 数字卫兵系统已退出");
    served
}
