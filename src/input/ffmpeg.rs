//! FFmpeg 解码 - 本地摄像头与网络流共用
//!
//! 解码线程运行 ez-ffmpeg 管线, `CaptureFilter` 把每一帧 YUV420P 转成 RGB
//! 写入 `FrameSlot`; 读取端按序号取最新帧

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame as AvFrame, Input};
use image::RgbImage;
use parking_lot::{Condvar, Mutex};

use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};

/// 最大支持分辨率
const MAX_SIDE: u32 = 4096;

/// 停止解码后等待线程退出的上限; 超时则放弃等待
const STOP_WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    seq: u64,
    ended: Option<String>,
}

/// 最新帧槽位 (解码线程写, 读取端取)
///
/// `seq` 每写入一帧加一; 解码结束后记录原因, 之后不再有新帧
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        let mut state = self.state.lock();
        state.frame = Some(frame);
        state.seq += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// 标记解码结束; 只保留第一次的原因
    pub fn end(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.ended.is_none() {
            state.ended = Some(reason.into());
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// 立即返回最新帧, 不等待
    pub fn latest(&self) -> CameraResult<Frame> {
        let state = self.state.lock();
        if let Some(reason) = &state.ended {
            return Err(CameraError::Read(format!("capture ended: {reason}")));
        }
        state
            .frame
            .clone()
            .ok_or_else(|| CameraError::Read("no frame captured yet".into()))
    }

    /// 等待序号大于 `after` 的帧
    ///
    /// 结束前已经写入的帧仍会先交给读取端
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> CameraResult<(Frame, u64)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.seq > after {
                if let Some(frame) = &state.frame {
                    return Ok((frame.clone(), state.seq));
                }
            }
            if let Some(reason) = &state.ended {
                return Err(CameraError::Read(format!("capture ended: {reason}")));
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(CameraError::Read(format!("no frame within {} ms", timeout.as_millis())));
            }
        }
    }
}

/// YUV420P → RGB (BT.601 定点系数)
///
/// 平面长度不足时返回 None
pub fn yuv420p_to_rgb(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    y_stride: usize,
    uv_stride: usize,
    width: u32,
    height: u32,
) -> Option<RgbImage> {
    let (w, h) = (width as usize, height as usize);
    let chroma_w = w.div_ceil(2);
    let chroma_h = h.div_ceil(2);
    if w == 0 || h == 0 || y_stride < w || uv_stride < chroma_w {
        return None;
    }
    if y_plane.len() < y_stride * (h - 1) + w
        || u_plane.len() < uv_stride * (chroma_h - 1) + chroma_w
        || v_plane.len() < uv_stride * (chroma_h - 1) + chroma_w
    {
        return None;
    }

    let mut rgb = vec![0u8; w * h * 3];
    let mut out = 0;
    for row in 0..h {
        let y_row = row * y_stride;
        let uv_row = (row >> 1) * uv_stride;
        for x in 0..w {
            let y = y_plane[y_row + x] as i32;
            let u = u_plane[uv_row + (x >> 1)] as i32 - 128;
            let v = v_plane[uv_row + (x >> 1)] as i32 - 128;

            rgb[out] = (y + ((v * 179) >> 7)).clamp(0, 255) as u8;
            rgb[out + 1] = (y - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
            rgb[out + 2] = (y + ((u * 227) >> 7)).clamp(0, 255) as u8;
            out += 3;
        }
    }
    RgbImage::from_raw(width, height, rgb)
}

/// FFmpeg 帧过滤器: 解码帧 → RGB → FrameSlot
pub struct CaptureFilter {
    name: String,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    total_frames: usize,
    dropped_frames: usize,
}

impl CaptureFilter {
    fn new(name: String, slot: Arc<FrameSlot>, stop: Arc<AtomicBool>) -> Self {
        Self {
            name,
            slot,
            stop,
            total_frames: 0,
            dropped_frames: 0,
        }
    }

    fn drop_frame(&mut self, why: &str) {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            tracing::debug!(source = %self.name, frame = self.total_frames, "⚠️ 丢弃帧: {}", why);
        }
    }

    /// 取出 YUV420P 平面并转换
    fn convert(frame: &AvFrame) -> Result<RgbImage, &'static str> {
        unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return Err("空帧/损坏帧");
            }
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width, raw.height);
            if w <= 0 || h <= 0 || w as u32 > MAX_SIDE || h as u32 > MAX_SIDE {
                return Err("非法分辨率");
            }
            // 缺少参考帧 / 无效比特流
            if raw.decode_error_flags & 0x03 != 0 {
                return Err("解码错误标志");
            }
            if raw.data[0].is_null() || raw.data[1].is_null() || raw.data[2].is_null() {
                return Err("YUV指针为空");
            }
            if raw.linesize[0] <= 0 || raw.linesize[1] <= 0 || raw.linesize[2] != raw.linesize[1] {
                return Err("步长异常");
            }

            let (w, h) = (w as u32, h as u32);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            let chroma_rows = (h as usize).div_ceil(2);
            let y_plane = std::slice::from_raw_parts(raw.data[0], y_stride * h as usize);
            let u_plane = std::slice::from_raw_parts(raw.data[1], uv_stride * chroma_rows);
            let v_plane = std::slice::from_raw_parts(raw.data[2], uv_stride * chroma_rows);

            yuv420p_to_rgb(y_plane, u_plane, v_plane, y_stride, uv_stride, w, h).ok_or("步长异常")
        }
    }
}

impl FrameFilter for CaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!(source = %self.name, "✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(&mut self, frame: AvFrame, _ctx: &FrameFilterContext) -> Result<Option<AvFrame>, String> {
        // 句柄已释放, 停止解码
        if self.stop.load(Ordering::SeqCst) {
            return Err("capture stopped".to_string());
        }

        self.total_frames += 1;
        match Self::convert(&frame) {
            Ok(image) => self.slot.publish(Frame::new(image)),
            Err(why) => {
                self.drop_frame(why);
                return Ok(None);
            }
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!(
            source = %self.name,
            total = self.total_frames,
            dropped = self.dropped_frames,
            "✅ 解码线程退出"
        );
    }
}

/// 解码输入描述
#[derive(Debug, Clone, Default)]
pub struct InputSpec {
    pub url: String,
    /// 输入格式 (dshow / avfoundation / v4l2); None 表示自动探测
    pub format: Option<&'static str>,
    pub opts: Vec<(String, String)>,
}

impl InputSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn format(mut self, format: &'static str) -> Self {
        self.format = Some(format);
        self
    }

    pub fn opt(mut self, key: &str, value: impl ToString) -> Self {
        self.opts.push((key.to_string(), value.to_string()));
        self
    }
}

/// 后台解码线程
pub struct FfmpegCapture {
    name: String,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl FfmpegCapture {
    /// 启动解码线程; 打开结果通过 `slot()` 观察 (首帧到达或结束原因)
    pub fn start(name: impl Into<String>, spec: InputSpec) -> CameraResult<Self> {
        let name = name.into();
        let slot = Arc::new(FrameSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);

        let worker = {
            let filter = CaptureFilter::new(name.clone(), slot.clone(), stop.clone());
            let slot = slot.clone();
            std::thread::Builder::new().name(name.clone()).spawn(move || {
                let reason = match run_pipeline(&spec, filter) {
                    Ok(()) => "stream ended".to_string(),
                    Err(e) => e,
                };
                tracing::debug!(url = %spec.url, %reason, "📹 解码循环结束");
                slot.end(reason);
                let _ = done_tx.send(());
            })?
        };

        Ok(Self {
            name,
            slot,
            stop,
            done,
            worker: Some(worker),
        })
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    /// 通知解码线程退出并等待
    ///
    /// 过滤器在下一帧返回错误结束管线; 输入长时间无数据时不再等待, 线程自行退出
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        if self.done.recv_timeout(STOP_WAIT).is_ok() {
            let _ = worker.join();
            tracing::debug!(source = %self.name, "📴 解码已停止");
        } else {
            tracing::warn!(source = %self.name, "⚠️ 解码线程未在 {:?} 内退出, 不再等待", STOP_WAIT);
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 构建并运行 FFmpeg 管线, 直到输入结束或过滤器要求停止
fn run_pipeline(spec: &InputSpec, filter: CaptureFilter) -> Result<(), String> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("capture", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let mut input = Input::new(spec.url.as_str());
    if let Some(format) = spec.format {
        input = input.set_format(format);
    }
    if !spec.opts.is_empty() {
        let opts: Vec<(&str, &str)> = spec.opts.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        input = input.set_input_opts(opts);
    }

    // 统一像素格式, 过滤器只处理 YUV420P
    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
        .map_err(|e| format!("构建失败: {e}"))?;

    let sch = ctx.start().map_err(|e| format!("启动失败: {e}"))?;
    let _ = sch.wait();
    Ok(())
}
