// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod error;
pub mod feed;
pub(crate) mod internal; // 内部模块，不对外暴露
pub mod inventory;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod session;
pub mod trigger;

// Re-export 核心 crate，方便直接使用设备接口
pub use synccap_core;

pub use error::{AcquisitionError, Result};
pub use orchestrator::{CaptureBatch, FailureReason};
pub use pipeline::CapturePipeline;

/// 预置模块，用户可以通过 `use synccap::prelude::*;` 导入常用项
pub mod prelude {
    pub use crate::error::{AcquisitionError, AllocationError, ContextError, TriggerError};
    pub use crate::feed::BatchFeed;
    pub use crate::inventory::{ConnectionState, Device, DeviceInventory};
    pub use crate::orchestrator::{
        BatchEntry, CaptureBatch, ConcurrentCaptureOrchestrator, FailureReason,
    };
    pub use crate::pipeline::{CapturePipeline, StartReport};
    pub use crate::pool::{BufferPlan, FleetBufferPlan, FrameBufferPool};
    pub use crate::session::{
        DeviceAcquisitionSession, FrameOutcome, FrameStatus, SessionState, SessionStatus,
    };
    pub use crate::trigger::{TriggerConfig, TriggerReport, TriggerSignalConfigurator};
    pub use synccap_core::prelude::*;
}
