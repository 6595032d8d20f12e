//! 最新结果缓存
//!
//! 一把锁只保护引用替换; 编码/推理都在锁外完成.
//! 每次写入后通过 watch 通道通知观看者 (在锁外发送)

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::Slot;
use crate::detection::{AnnotatedFrame, Detection};

/// 一次采集产生的全部结果; `None` 的槽位保持原值
#[derive(Default)]
pub struct FrameUpdate {
    pub raw: Option<AnnotatedFrame>,
    pub motion: Option<AnnotatedFrame>,
    pub diff: Option<AnnotatedFrame>,
    pub object: Option<AnnotatedFrame>,
    pub detections: Option<Vec<Detection>>,
}

/// 所有槽位 + 检测列表的一致快照
#[derive(Clone, Default)]
pub struct FrameStoreSnapshot {
    pub raw: Option<Arc<AnnotatedFrame>>,
    pub motion: Option<Arc<AnnotatedFrame>>,
    pub diff: Option<Arc<AnnotatedFrame>>,
    pub object: Option<Arc<AnnotatedFrame>>,
    pub detections: Arc<Vec<Detection>>,
}

impl FrameStoreSnapshot {
    pub fn slot(&self, slot: Slot) -> Option<&Arc<AnnotatedFrame>> {
        match slot {
            Slot::Raw => self.raw.as_ref(),
            Slot::Motion => self.motion.as_ref(),
            Slot::Diff => self.diff.as_ref(),
            Slot::Object => self.object.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<Arc<AnnotatedFrame>> {
        match slot {
            Slot::Raw => &mut self.raw,
            Slot::Motion => &mut self.motion,
            Slot::Diff => &mut self.diff,
            Slot::Object => &mut self.object,
        }
    }
}

pub struct FrameStore {
    inner: Mutex<FrameStoreSnapshot>,
    updates: watch::Sender<u64>,
}

impl FrameStore {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            inner: Mutex::new(FrameStoreSnapshot::default()),
            updates,
        }
    }

    pub fn write_slot(&self, slot: Slot, frame: AnnotatedFrame) {
        let frame = Arc::new(frame);
        *self.inner.lock().slot_mut(slot) = Some(frame);
        self.notify();
    }

    pub fn write_detections(&self, detections: Vec<Detection>) {
        let detections = Arc::new(detections);
        self.inner.lock().detections = detections;
        self.notify();
    }

    /// 一次锁内写入多个槽位, 读者不会看到半次更新
    pub fn publish(&self, update: FrameUpdate) {
        let FrameUpdate {
            raw,
            motion,
            diff,
            object,
            detections,
        } = update;
        let slots = [
            (Slot::Raw, raw.map(Arc::new)),
            (Slot::Motion, motion.map(Arc::new)),
            (Slot::Diff, diff.map(Arc::new)),
            (Slot::Object, object.map(Arc::new)),
        ];
        let detections = detections.map(Arc::new);

        {
            let mut inner = self.inner.lock();
            for (slot, frame) in slots {
                if let Some(frame) = frame {
                    *inner.slot_mut(slot) = Some(frame);
                }
            }
            if let Some(detections) = detections {
                inner.detections = detections;
            }
        }
        self.notify();
    }

    /// 槽位最新结果; 从未写入时为 None
    pub fn read_slot(&self, slot: Slot) -> Option<Arc<AnnotatedFrame>> {
        self.inner.lock().slot(slot).cloned()
    }

    pub fn read_detections(&self) -> Arc<Vec<Detection>> {
        self.inner.lock().detections.clone()
    }

    pub fn snapshot(&self) -> FrameStoreSnapshot {
        self.inner.lock().clone()
    }

    /// 更新通知 (值为写入序号)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    fn notify(&self) {
        self.updates.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
