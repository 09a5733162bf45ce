use synccap_core::builder::ConfigError;
use synccap_core::error::CameraError;
use synccap_core::frame::ImageStatus;
use thiserror::Error;

use crate::session::SessionState;

/// 帧缓冲分配失败，只影响所属设备
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("payload size is zero")]
    ZeroPayload,

    #[error("buffer plan overflows: {count} x {slot_size} bytes")]
    Overflow { count: usize, slot_size: usize },

    #[error("buffer plan of {requested} bytes exceeds remaining memory budget of {budget} bytes")]
    BudgetExceeded { requested: usize, budget: usize },

    #[error("failed to reserve {requested} bytes of frame memory")]
    ReserveFailed { requested: usize },
}

/// 进程级设备系统上下文错误
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("device system context is already open")]
    AlreadyOpen,

    #[error("device system context is not open")]
    NotOpen,

    #[error("{0} acquisition sessions still outstanding")]
    SessionsOutstanding(usize),

    #[error("device system failure: {0}")]
    System(#[source] CameraError),
}

/// 硬件触发配置错误
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("counter duration and delay must both be positive (got {duration_us}us/{delay_us}us)")]
    InvalidTiming { duration_us: u32, delay_us: u32 },

    #[error("trigger capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("failed to program trigger: {0}")]
    Device(#[from] CameraError),
}

impl TriggerError {
    pub fn is_capability_unavailable(&self) -> bool {
        matches!(self, Self::CapabilityUnavailable(_))
    }
}

/// 采集流程的错误分类
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// 必需的特性不可写，只中止该设备的 begin_streaming
    #[error("configuration error on {device}: {source}")]
    Configuration {
        device: String,
        #[source]
        source: CameraError,
    },

    /// 帧缓冲分配失败，该设备退出本次运行
    #[error("allocation error on {device}: {source}")]
    Allocation {
        device: String,
        #[source]
        source: AllocationError,
    },

    #[error("no frame within {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    #[error("incomplete frame: {status}")]
    IncompleteFrame { status: ImageStatus },

    /// 不支持硬件触发，退回自由运行
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session is {state:?}, expected {expected}")]
    InvalidState {
        state: SessionState,
        expected: &'static str,
    },

    #[error("device error: {0}")]
    Device(#[from] CameraError),

    #[error("no devices available")]
    NoDevices,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("failed to start background runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl From<TriggerError> for AcquisitionError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::CapabilityUnavailable(what) => Self::CapabilityUnavailable(what),
            TriggerError::Device(err) => Self::Device(err),
            TriggerError::InvalidTiming {
                duration_us,
                delay_us,
            } => Self::Config(ConfigError::NonPositiveTrigger {
                duration_us,
                delay_us,
            }),
        }
    }
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
