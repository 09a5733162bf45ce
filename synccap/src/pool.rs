//! 帧缓冲池：按设备计算 Buffer 尺寸与对齐，持有帧内存，并在采集期间把它借给采集引擎。
//!
//! 所有权规则：
//! 1. 每个设备一个 [`FrameBufferPool`]，区域 (Region) 从不在设备之间共享；
//! 2. `lend()` 把区域整体 move 给采集引擎，Pool 只记住 RegionId；
//! 3. `reclaim()` 只接受同一个 RegionId 的区域，任何退出路径都必须走到这里。

use std::fmt;

use synccap_core::buffer::{BufferLayout, BufferRegion, RegionId};

use crate::error::AllocationError;

/// 把 payload 向上取整到 alignment 的整数倍
///
/// `alignment` 为 None 或 <= 1 时不做对齐。
pub fn aligned_size(payload: usize, alignment: Option<usize>) -> usize {
    match alignment {
        Some(a) if a > 1 => payload.div_ceil(a) * a,
        _ => payload,
    }
}

/// 单个设备的缓冲区规划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub payload_size: usize,
    /// 1 表示无对齐要求
    pub alignment: usize,
    pub aligned_size: usize,
    pub buffer_count: usize,
    pub layout: BufferLayout,
}

impl BufferPlan {
    pub fn with_layout(mut self, layout: BufferLayout) -> Self {
        self.layout = layout;
        self
    }

    /// 需要的总字节数，溢出时返回 None
    pub fn total_bytes(&self) -> Option<usize> {
        self.aligned_size.checked_mul(self.buffer_count)
    }
}

/// 整个设备集合的规划
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetBufferPlan {
    pub plans: Vec<BufferPlan>,
}

impl FleetBufferPlan {
    pub fn new(plans: Vec<BufferPlan>) -> Self {
        Self { plans }
    }

    /// 所有设备中最大的单帧对齐尺寸
    pub fn max_aligned_size(&self) -> usize {
        self.plans.iter().map(|p| p.aligned_size).max().unwrap_or(0)
    }

    /// 一整块连续内存容纳所有设备时的大小：每个设备按最大帧尺寸分配相同的槽位
    pub fn contiguous_bytes(&self) -> Option<usize> {
        let count = self.plans.iter().map(|p| p.buffer_count).max().unwrap_or(0);
        self.plans
            .len()
            .checked_mul(count)?
            .checked_mul(self.max_aligned_size())
    }

    /// 每个设备独立分配时的总大小
    pub fn scattered_bytes(&self) -> Option<usize> {
        self.plans
            .iter()
            .try_fold(0usize, |acc, p| acc.checked_add(p.total_bytes()?))
    }
}

enum PoolState {
    /// 区域在池中，可以借出
    Idle(BufferRegion),
    /// 区域在采集引擎手里
    Lent(RegionId),
    /// 区域已丢失 (引擎没有归还)
    Lost(RegionId),
}

/// 单个设备的帧缓冲池
pub struct FrameBufferPool {
    plan: BufferPlan,
    state: PoolState,
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            PoolState::Idle(r) => format!("idle {}", r.id()),
            PoolState::Lent(id) => format!("lent {}", id),
            PoolState::Lost(id) => format!("lost {}", id),
        };
        f.debug_struct("FrameBufferPool")
            .field("aligned_size", &self.plan.aligned_size)
            .field("count", &self.plan.buffer_count)
            .field("layout", &self.plan.layout)
            .field("state", &state)
            .finish()
    }
}

impl FrameBufferPool {
    /// 计算缓冲规划 (纯计算，不分配内存)，默认连续布局
    pub fn size(payload: usize, alignment: Option<usize>, buffer_count: usize) -> BufferPlan {
        BufferPlan {
            payload_size: payload,
            alignment: alignment.filter(|a| *a > 1).unwrap_or(1),
            aligned_size: aligned_size(payload, alignment),
            buffer_count,
            layout: BufferLayout::Contiguous,
        }
    }

    /// 按规划分配内存
    ///
    /// `budget` 是调用方剩余的内存额度；超出额度或系统无法预留时返回 [`AllocationError`]。
    pub fn allocate(plan: BufferPlan, budget: Option<usize>) -> Result<Self, AllocationError> {
        if plan.payload_size == 0 || plan.buffer_count == 0 {
            return Err(AllocationError::ZeroPayload);
        }
        let requested = plan.total_bytes().ok_or(AllocationError::Overflow {
            count: plan.buffer_count,
            slot_size: plan.aligned_size,
        })?;
        if let Some(budget) = budget {
            if requested > budget {
                return Err(AllocationError::BudgetExceeded { requested, budget });
            }
        }

        // 先用可失败的预留探测一次，避免分配失败直接 abort 进程
        let mut probe: Vec<u8> = Vec::new();
        probe
            .try_reserve_exact(requested)
            .map_err(|_| AllocationError::ReserveFailed { requested })?;
        drop(probe);

        let region =
            BufferRegion::allocate(plan.layout, plan.aligned_size, plan.buffer_count, plan.alignment);
        tracing::debug!(
            "Allocated {} for {} x {} bytes ({:?}) at {:#x}",
            region.id(),
            plan.buffer_count,
            plan.aligned_size,
            plan.layout,
            region.base_address().unwrap_or(0)
        );
        Ok(Self {
            plan,
            state: PoolState::Idle(region),
        })
    }

    pub fn plan(&self) -> &BufferPlan {
        &self.plan
    }

    pub fn region_id(&self) -> RegionId {
        match &self.state {
            PoolState::Idle(r) => r.id(),
            PoolState::Lent(id) | PoolState::Lost(id) => *id,
        }
    }

    pub fn is_lent(&self) -> bool {
        matches!(self.state, PoolState::Lent(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, PoolState::Idle(_))
    }

    /// 借出整个区域；已借出时返回 None
    pub fn lend(&mut self) -> Option<BufferRegion> {
        let id = self.region_id();
        match std::mem::replace(&mut self.state, PoolState::Lent(id)) {
            PoolState::Idle(region) => Some(region),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// 收回区域。RegionId 不匹配或当前未借出时原样退回。
    pub fn reclaim(&mut self, region: BufferRegion) -> Result<(), BufferRegion> {
        match self.state {
            PoolState::Lent(id) | PoolState::Lost(id) if id == region.id() => {
                if !region.is_whole() {
                    tracing::warn!(
                        "{} reclaimed with {} of {} slots",
                        id,
                        region.slots_present(),
                        region.slot_count()
                    );
                }
                self.state = PoolState::Idle(region);
                Ok(())
            }
            _ => Err(region),
        }
    }

    /// 引擎没有归还区域时调用，内存由引擎一方负责释放
    pub fn mark_lost(&mut self) {
        if let PoolState::Lent(id) = self.state {
            tracing::warn!("{} was not returned by the acquisition engine", id);
            self.state = PoolState::Lost(id);
        }
    }
}
