use crate::pixel_format::PixelFormat;
use thiserror::Error;

/// 设备接口层错误 (节点访问、采集引擎、缓冲区绑定)
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Device not initialized")]
    NotInitialized,

    #[error("Node '{0}' is not available")]
    NodeNotAvailable(String),

    #[error("Node '{0}' is not readable")]
    NodeNotReadable(String),

    #[error("Node '{0}' is not writable")]
    NodeNotWritable(String),

    #[error("Entry '{entry}' of node '{node}' is not available")]
    EntryNotAvailable { node: String, entry: String },

    #[error("Node '{node}' is not of type {expected}")]
    TypeMismatch { node: String, expected: &'static str },

    #[error("Value {value} out of range for node '{node}'")]
    OutOfRange { node: String, value: i64 },

    #[error("Acquisition engine in wrong state: {0}")]
    InvalidState(String),

    #[error("Buffer binding rejected: {0}")]
    BufferBinding(String),

    #[error("Pixel conversion {from} -> {to} not supported")]
    ConversionNotSupported { from: PixelFormat, to: PixelFormat },

    #[error("Frame payload too short: expected {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },

    #[error("Simulation backend error: {0}")]
    SimulationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// 是否属于 "能力缺失" 类错误 (节点不存在 / 不可访问)
    /// 上层据此区分 CapabilityUnavailable 与真正的配置失败
    pub fn is_missing_capability(&self) -> bool {
        matches!(
            self,
            Self::NodeNotAvailable(_) | Self::EntryNotAvailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
