use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};

use synccap_core::frame::{FrameMetadata, ImageStatus, Timestamp};
use synccap_core::pixel_format::PixelFormat;
use synccap_core::traits::RawFrame;

/// 脚本化的下一帧行为
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStep {
    /// 正常交付一帧完整图像
    Complete,
    /// 交付一帧带错误状态的不完整图像
    Incomplete(ImageStatus),
    /// 在整个 timeout 内都没有帧
    Timeout,
    /// 延迟后交付完整帧；延迟超过 timeout 时表现为超时
    Delay(Duration),
    /// 驱动无视 timeout 卡住一段时间后才交付完整帧
    Hang(Duration),
    /// 设备掉线
    Fail(String),
}

/// 所有相机共享的硬件时钟
#[derive(Debug)]
pub struct SimClock {
    origin: Instant,
}

impl Default for SimClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl SimClock {
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Buffer Slot 计数，用于检测泄漏
#[derive(Debug, Default)]
pub struct SlotStats {
    pub delivered: AtomicU64,
    pub released: AtomicU64,
    /// 未调用 release 就被丢弃的帧
    pub leaked: AtomicU64,
}

impl SlotStats {
    pub fn outstanding(&self) -> u64 {
        let delivered = self.delivered.load(Ordering::Acquire);
        let returned =
            self.released.load(Ordering::Acquire) + self.leaked.load(Ordering::Acquire);
        delivered.saturating_sub(returned)
    }
}

/// 测试代码持有的控制句柄：在相机被 Session 独占之后仍可注入帧脚本
#[derive(Debug, Clone, Default)]
pub struct SimController {
    script: Arc<Mutex<VecDeque<FrameStep>>>,
    stats: Arc<SlotStats>,
}

impl SimController {
    pub fn push(&self, step: FrameStep) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    pub fn push_many<I: IntoIterator<Item = FrameStep>>(&self, steps: I) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.extend(steps);
    }

    pub fn pending(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn next_step(&self) -> FrameStep {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(FrameStep::Complete)
    }

    pub fn stats(&self) -> &SlotStats {
        &self.stats
    }

    pub(crate) fn stats_arc(&self) -> Arc<SlotStats> {
        self.stats.clone()
    }
}

/// 空闲 Slot 队列 (Slot 下标 + 内存)
pub(crate) type SlotQueue = (Sender<(usize, BytesMut)>, Receiver<(usize, BytesMut)>);

/// 模拟帧：持有一个 Slot，release 时归还到空闲队列
pub struct SimFrame {
    pub(crate) slot: Option<(usize, BytesMut)>,
    pub(crate) recycle: Sender<(usize, BytesMut)>,
    pub(crate) stats: Arc<SlotStats>,
    pub(crate) frame_id: u64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: PixelFormat,
    pub(crate) payload: usize,
    pub(crate) timestamp: Timestamp,
    pub(crate) status: ImageStatus,
    pub(crate) metadata: FrameMetadata,
}

impl fmt::Debug for SimFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFrame")
            .field("frame_id", &self.frame_id)
            .field("slot", &self.slot.as_ref().map(|(i, _)| *i))
            .field("status", &self.status)
            .finish()
    }
}

impl RawFrame for SimFrame {
    fn frame_id(&self) -> u64 {
        self.frame_id
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn status(&self) -> ImageStatus {
        self.status
    }

    fn metadata(&self) -> FrameMetadata {
        self.metadata.clone()
    }

    fn data(&self) -> &[u8] {
        match &self.slot {
            Some((_, buf)) => &buf[..self.payload.min(buf.len())],
            None => &[],
        }
    }

    fn release(mut self: Box<Self>) {
        if let Some(slot) = self.slot.take() {
            // 引擎已停止并回收队列时发送会失败，Slot 随之释放
            let _ = self.recycle.send(slot);
            self.stats.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for SimFrame {
    fn drop(&mut self) {
        if self.slot.is_some() {
            tracing::warn!("Frame {} dropped without release, slot leaked", self.frame_id);
            self.stats.leaked.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// 按像素格式填充测试图案：转换为 Mono8 后每个像素都等于 `level`
pub fn fill_pattern(buf: &mut [u8], format: PixelFormat, width: u32, height: u32, level: u8) {
    let size = format.image_size(width, height).min(buf.len());
    let image = &mut buf[..size];
    match format {
        PixelFormat::Mono16 => {
            for px in image.chunks_exact_mut(2) {
                px.copy_from_slice(&((level as u16) << 8).to_le_bytes());
            }
        }
        PixelFormat::Yuv422Packed => {
            for pair in image.chunks_exact_mut(2) {
                pair[0] = level;
                pair[1] = 128;
            }
        }
        _ => image.fill(level),
    }
}

/// 帧 ID 与设备序号决定的灰度值
pub fn pattern_level(device_index: usize, frame_id: u64) -> u8 {
    (frame_id.wrapping_mul(7).wrapping_add(device_index as u64 * 31) % 251) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccap_core::pixel_format::convert;

    #[test]
    fn pattern_converts_to_uniform_mono8() {
        for format in [
            PixelFormat::Mono8,
            PixelFormat::Mono16,
            PixelFormat::BayerRG8,
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::Yuv422Packed,
        ] {
            let mut buf = vec![0u8; format.image_size(4, 2) + 16];
            fill_pattern(&mut buf, format, 4, 2, 93);
            let mono = convert(&buf, 4, 2, format, PixelFormat::Mono8).unwrap();
            assert!(mono.iter().all(|v| *v == 93), "{:?}", format);
        }
    }

    #[test]
    fn dropped_frame_counts_as_leak() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let stats = Arc::new(SlotStats::default());
        stats.delivered.fetch_add(2, Ordering::AcqRel);
        let make = |id| SimFrame {
            slot: Some((0, BytesMut::from(&[0u8; 4][..]))),
            recycle: tx.clone(),
            stats: stats.clone(),
            frame_id: id,
            width: 2,
            height: 2,
            format: PixelFormat::Mono8,
            payload: 4,
            timestamp: Timestamp::default(),
            status: ImageStatus::NoError,
            metadata: FrameMetadata::default(),
        };

        Box::new(make(1)).release();
        assert!(rx.try_recv().is_ok());
        drop(make(2));
        assert_eq!(stats.leaked.load(Ordering::Acquire), 1);
        assert_eq!(stats.outstanding(), 0);
    }
}
