use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// 内存区域的唯一编号，用于追踪所有权 (同一块内存任何时刻只属于一个设备)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    fn next() -> Self {
        Self(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// 帧缓冲区由谁提供
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferOwnership {
    /// 由主机端 Pipeline 分配 (Pool-owned / User Buffer)
    Pool,
    /// 由设备驱动内部分配 (Device-owned / System Buffer)
    Device,
}

/// 内存布局策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferLayout {
    /// 一整块连续内存，按 Slot 切分
    Contiguous,
    /// 每个 Slot 单独分配
    Scattered,
}

/// 一块交给采集引擎使用的帧缓冲区域
///
/// 所有权语义：
/// - `bind_buffers` 时整体 move 给设备，Pipeline 不再持有任何引用；
/// - 采集过程中引擎可以用 [`take_slot`](Self::take_slot) 临时借出单个 Slot；
/// - `unbind_buffers` 时整体归还，Slot 必须全部在位。
pub struct BufferRegion {
    id: RegionId,
    layout: BufferLayout,
    slot_size: usize,
    alignment: usize,
    slots: Vec<Option<BytesMut>>,
}

impl BufferRegion {
    /// 分配新区域。调用方负责事先检查内存是否足够。
    pub fn allocate(layout: BufferLayout, slot_size: usize, count: usize, alignment: usize) -> Self {
        let slots = match layout {
            BufferLayout::Contiguous => {
                let total = slot_size * count;
                let mut whole = BytesMut::with_capacity(total);
                whole.resize(total, 0);
                (0..count).map(|_| Some(whole.split_to(slot_size))).collect()
            }
            BufferLayout::Scattered => (0..count)
                .map(|_| {
                    let mut slot = BytesMut::with_capacity(slot_size);
                    slot.resize(slot_size, 0);
                    Some(slot)
                })
                .collect(),
        };

        Self {
            id: RegionId::next(),
            layout,
            slot_size,
            alignment: alignment.max(1),
            slots,
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.slot_size * self.slots.len()
    }

    /// 当前在位 (未被借出) 的 Slot 数量
    pub fn slots_present(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_whole(&self) -> bool {
        self.slots_present() == self.slots.len()
    }

    /// 第一个 Slot 的起始地址，仅用于诊断 (比较两块区域是否重叠)
    pub fn base_address(&self) -> Option<usize> {
        self.slots
            .first()
            .and_then(|s| s.as_ref())
            .map(|s| s.as_ptr() as usize)
    }

    /// 借出一个 Slot
    pub fn take_slot(&mut self, index: usize) -> Option<BytesMut> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// 归还一个 Slot，长度不符或位置已被占用时原样退回
    pub fn return_slot(&mut self, index: usize, mut slot: BytesMut) -> Result<(), BytesMut> {
        if slot.len() != self.slot_size {
            // 引擎可能截断过 (写入实际 Payload 长度)，只要容量还在就恢复原长度
            if slot.capacity() < self.slot_size {
                return Err(slot);
            }
            slot.resize(self.slot_size, 0);
        }
        match self.slots.get_mut(index) {
            Some(place) if place.is_none() => {
                *place = Some(slot);
                Ok(())
            }
            _ => Err(slot),
        }
    }
}

impl fmt::Debug for BufferRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegion")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("slot_size", &self.slot_size)
            .field("slots", &self.slots.len())
            .field("present", &self.slots_present())
            .finish()
    }
}
