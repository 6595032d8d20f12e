//! 测试用脚本化视频源

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use super::{CameraDescriptor, CameraKind, FrameSource, SourceFactory};
use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};

/// 调用记录
#[derive(Default)]
pub struct SourceLog {
    connects: AtomicU32,
    releases: AtomicU32,
    connect_times: Mutex<Vec<Instant>>,
}

impl SourceLog {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }
}

pub struct ScriptedSource {
    log: Arc<SourceLog>,
    connects: VecDeque<bool>,
    default_connect: bool,
    gate: Option<Arc<AtomicBool>>,
    reads: VecDeque<bool>,
    repeat: bool,
    last: Option<Frame>,
    shade: u8,
}

impl ScriptedSource {
    pub fn new(log: Arc<SourceLog>) -> Self {
        Self {
            log,
            connects: VecDeque::new(),
            default_connect: true,
            gate: None,
            reads: VecDeque::new(),
            repeat: false,
            last: None,
            shade: 0,
        }
    }

    pub fn connects(mut self, script: impl IntoIterator<Item = bool>) -> Self {
        self.connects = script.into_iter().collect();
        self
    }

    pub fn default_connect(mut self, ok: bool) -> Self {
        self.default_connect = ok;
        self
    }

    /// 连接结果由外部开关决定 (脚本用完之后)
    pub fn connect_gate(mut self, gate: Arc<AtomicBool>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn reads(mut self, script: impl IntoIterator<Item = bool>) -> Self {
        self.reads = script.into_iter().collect();
        self
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> CameraResult<()> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        self.log.connect_times.lock().push(Instant::now());
        let fallback = match &self.gate {
            Some(gate) => gate.load(Ordering::SeqCst),
            None => self.default_connect,
        };
        if self.connects.pop_front().unwrap_or(fallback) {
            Ok(())
        } else {
            Err(CameraError::Connect("scripted failure".into()))
        }
    }

    fn read(&mut self) -> CameraResult<Frame> {
        if self.reads.pop_front().unwrap_or(true) {
            if self.repeat {
                if let Some(frame) = &self.last {
                    return Ok(frame.clone());
                }
            }
            self.shade = self.shade.wrapping_add(1);
            let frame = Frame::new(RgbImage::from_pixel(8, 8, Rgb([self.shade; 3])));
            self.last = Some(frame.clone());
            Ok(frame)
        } else {
            Err(CameraError::Read("scripted failure".into()))
        }
    }

    fn release(&mut self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// 按类型生成脚本化视频源; 可达性与连接结果可在运行中修改
pub struct ScriptedFactory {
    pub network_reachable: AtomicBool,
    pub local_ok: Arc<AtomicBool>,
    pub network_ok: Arc<AtomicBool>,
    pub repeat_frames: AtomicBool,
    pub created: Mutex<Vec<CameraDescriptor>>,
    pub logs: Mutex<Vec<Arc<SourceLog>>>,
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self {
            network_reachable: AtomicBool::new(false),
            local_ok: Arc::new(AtomicBool::new(true)),
            network_ok: Arc::new(AtomicBool::new(true)),
            repeat_frames: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedFactory {
    pub fn set_reachable(&self, reachable: bool) {
        self.network_reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_connect_ok(&self, kind: CameraKind, ok: bool) {
        match kind {
            CameraKind::Local => self.local_ok.store(ok, Ordering::SeqCst),
            CameraKind::Network => self.network_ok.store(ok, Ordering::SeqCst),
        }
    }

    pub fn created(&self) -> Vec<CameraDescriptor> {
        self.created.lock().clone()
    }
}

impl SourceFactory for ScriptedFactory {
    fn create(&self, descriptor: &CameraDescriptor) -> Box<dyn FrameSource> {
        self.created.lock().push(descriptor.clone());
        let log = Arc::new(SourceLog::default());
        self.logs.lock().push(log.clone());
        let gate = match descriptor.kind() {
            CameraKind::Local => self.local_ok.clone(),
            CameraKind::Network => self.network_ok.clone(),
        };
        let mut source = ScriptedSource::new(log).connect_gate(gate);
        source.repeat = self.repeat_frames.load(Ordering::SeqCst);
        Box::new(source)
    }

    fn probe(&self, descriptor: &CameraDescriptor) -> bool {
        match descriptor {
            CameraDescriptor::Local { .. } => true,
            CameraDescriptor::Network { .. } => self.network_reachable.load(Ordering::SeqCst),
        }
    }
}
