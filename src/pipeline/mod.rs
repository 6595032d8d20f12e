/// 采集/分析流水线 (Capture Pipeline)
///
/// - CaptureLoop: 采集线程, 读帧 → 各分析阶段 → 写入 FrameStore
/// - FrameStore:  最新结果缓存, 单写多读
pub mod capture;
pub mod frame_store;

use std::fmt;
use std::str::FromStr;

pub use capture::{CaptureLoop, StepOutcome};
pub use frame_store::{FrameStore, FrameStoreSnapshot, FrameUpdate};

/// 结果槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// 原始帧
    Raw,
    /// 运动检测标注帧
    Motion,
    /// 前景掩码
    Diff,
    /// 目标检测标注帧
    Object,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Raw, Slot::Motion, Slot::Diff, Slot::Object];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Raw => "raw",
            Slot::Motion => "motion",
            Slot::Diff => "diff",
            Slot::Object => "object",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Slot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| format!("unknown slot '{s}'"))
    }
}
