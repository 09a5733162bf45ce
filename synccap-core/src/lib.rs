// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod buffer;
pub mod builder;
pub mod error;
pub mod frame;
pub mod nodes;
pub mod pixel_format;
pub mod telemetry;
pub mod traits;

// 方便用户使用的 Prelude
pub mod prelude {
    pub use crate::buffer::{BufferLayout, BufferOwnership, BufferRegion, RegionId};
    pub use crate::builder::{
        AcquisitionMode, BufferHandlingMode, ConfigError, PipelineConfig, TriggerSettings,
    };
    pub use crate::error::{CameraError, Result};
    pub use crate::frame::{CapturedImage, FrameMetadata, ImageStatus, Timestamp};
    pub use crate::nodes::NodeMapExt;
    pub use crate::pixel_format::PixelFormat;
    pub use crate::telemetry::{HealthIssue, HealthStatus, SessionTelemetry};
    pub use crate::traits::{
        BindRejected, Camera, Capabilities, DeviceInfo, DeviceSystem, FrameWait, NodeAccess,
        NodeKind, NodeMap, RawFrame, TransportType,
    };
}

// 版本与构建信息常量
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
