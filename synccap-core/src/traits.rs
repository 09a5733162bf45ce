use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::buffer::{BufferOwnership, BufferRegion};
use crate::error::{CameraError, Result};
use crate::frame::{CapturedImage, FrameMetadata, ImageStatus, Timestamp};
use crate::pixel_format::{self, PixelFormat};

/// 设备基本信息 (来自 Transport Layer，无需 init 即可读取)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// 枚举顺序，Batch 内条目按它排序
    pub index: usize,

    /// 唯一硬件 ID，用于 DeviceSystem::open 的参数
    pub id: String,

    pub serial_number: String,

    /// 型号名 (e.g. "Blackfly S BFS-U3-16S2M")，仅用于展示
    pub model_name: String,

    pub vendor_name: String,

    pub transport: TransportType,

    /// DeviceInformation 分类下所有可读特性的快照
    pub information: Vec<(String, String)>,
}

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportType {
    Usb3Vision,
    GigEVision,
    CameraLink,
    Unknown,
}

impl TransportType {
    /// 传输层要求的 Buffer 对齐边界 (None 表示无要求)
    ///
    /// USB3 Vision 以 1024 字节的 Bulk Packet 为单位传输，Buffer 长度必须是它的整数倍。
    pub fn packet_alignment(&self) -> Option<usize> {
        match self {
            Self::Usb3Vision => Some(1024),
            _ => None,
        }
    }
}

bitflags! {
    /// 设备能力位掩码 (缓冲与流控制)
    ///
    /// 触发相关的能力不在这里：每次配置时直接查询节点。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// 支持主机分配的 User Buffer
        const USER_BUFFERS       = 1 << 3;
        /// User Buffer 可以是一整块连续内存
        const CONTIGUOUS_BUFFERS = 1 << 4;
        /// User Buffer 可以是多块离散内存
        const SCATTERED_BUFFERS  = 1 << 5;
        /// Stream 节点支持手动设置 Buffer 数量与处理模式
        const STREAM_BUFFER_CONTROL = 1 << 6;
    }
}

// --- 节点 (属性) 系统 ---

/// 节点可访问性，访问前必须检查
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeAccess {
    pub available: bool,
    pub readable: bool,
    pub writable: bool,
}

impl NodeAccess {
    pub const NONE: Self = Self {
        available: false,
        readable: false,
        writable: false,
    };
    pub const READ_ONLY: Self = Self {
        available: true,
        readable: true,
        writable: false,
    };
    pub const READ_WRITE: Self = Self {
        available: true,
        readable: true,
        writable: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Integer,
    Float,
    Boolean,
    Enumeration,
    String,
    Command,
    Category,
}

/// 具名属性系统 (GenICam NodeMap 风格)
///
/// 所有方法取 `&self`：厂商 SDK 的节点本身带内部锁，读写不需要独占设备句柄。
pub trait NodeMap: Send + Sync {
    fn access(&self, name: &str) -> NodeAccess;

    fn kind(&self, name: &str) -> Option<NodeKind>;

    fn get_integer(&self, name: &str) -> Result<i64>;
    fn set_integer(&self, name: &str, value: i64) -> Result<()>;

    fn get_float(&self, name: &str) -> Result<f64>;
    fn set_float(&self, name: &str, value: f64) -> Result<()>;

    fn get_boolean(&self, name: &str) -> Result<bool>;
    fn set_boolean(&self, name: &str, value: bool) -> Result<()>;

    fn get_string(&self, name: &str) -> Result<String>;

    /// 读取枚举节点当前条目的符号名
    fn get_enum(&self, name: &str) -> Result<String>;
    /// 按符号名设置枚举节点
    fn set_enum(&self, name: &str, entry: &str) -> Result<()>;
    /// 当前可用且可读的枚举条目 (按设备定义的顺序)
    fn enum_entries(&self, name: &str) -> Result<Vec<String>>;

    fn execute(&self, name: &str) -> Result<()>;

    /// 分类节点下的特性名列表
    fn category_features(&self, name: &str) -> Result<Vec<String>>;
}

// --- 帧 ---

/// 等待下一帧的结果，超时不是错误
#[allow(missing_debug_implementations)]
pub enum FrameWait {
    Ready(Box<dyn RawFrame>),
    TimedOut,
}

/// 采集引擎交出的原始帧，数据仍位于引擎的 Buffer Slot 中
///
/// 用完必须调用 [`release`](RawFrame::release) 归还 Slot，否则该 Slot 泄漏，
/// 引擎可用的 Buffer 会越来越少。
pub trait RawFrame: Send + fmt::Debug {
    fn frame_id(&self) -> u64;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn pixel_format(&self) -> PixelFormat;

    fn timestamp(&self) -> Timestamp;

    fn status(&self) -> ImageStatus;

    fn is_incomplete(&self) -> bool {
        !self.status().is_complete()
    }

    fn metadata(&self) -> FrameMetadata {
        FrameMetadata::default()
    }

    /// 帧数据 (可能带尾部 Padding)
    fn data(&self) -> &[u8];

    /// 转换到目标格式并拷贝出 Buffer。后端如有硬件加速可覆盖此实现。
    fn convert(&self, target: PixelFormat) -> Result<CapturedImage> {
        let data = pixel_format::convert(
            self.data(),
            self.width(),
            self.height(),
            self.pixel_format(),
            target,
        )?;
        Ok(CapturedImage {
            data,
            width: self.width(),
            height: self.height(),
            format: target,
            frame_id: self.frame_id(),
            timestamp: self.timestamp(),
            metadata: self.metadata(),
        })
    }

    /// 归还 Buffer Slot 给采集引擎
    fn release(self: Box<Self>);
}

/// `bind_buffers` 失败时把区域原样交还，保证调用方在任何路径上都能收回内存
#[derive(Debug)]
pub struct BindRejected {
    pub error: CameraError,
    pub region: BufferRegion,
}

// --- 核心 Trait 定义 ---

/// 1. 设备系统入口：进程级上下文、设备枚举与打开
pub trait DeviceSystem: Send + Sync {
    /// 库版本字符串，仅用于日志
    fn library_version(&self) -> String;

    /// 建立进程级上下文 (对应厂商 SDK 的 GetInstance)
    fn initialize(&self) -> Result<()>;

    /// 释放进程级上下文 (对应 ReleaseInstance)
    fn shutdown(&self) -> Result<()>;

    /// 扫描总线，返回设备列表
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// 打开设备，返回独占的设备句柄
    fn open(&self, id: &str) -> Result<Box<dyn Camera>>;
}

/// 2. 单个设备：控制面 (NodeMap) 与数据面 (采集引擎)
///
/// 采集引擎与主机异步运行；`next_frame` 是整个 Pipeline 中唯一允许阻塞的调用。
pub trait Camera: Send {
    fn info(&self) -> &DeviceInfo;

    fn init(&mut self) -> Result<()>;

    fn deinit(&mut self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// 设备特性节点 (init 之后可用)
    fn node_map(&self) -> &dyn NodeMap;

    /// Transport Layer Stream 节点 (Buffer 数量、处理模式)
    fn stream_node_map(&self) -> &dyn NodeMap;

    /// 一帧的原始字节数 (未对齐)
    fn payload_size(&self) -> Result<usize>;

    /// 设备声明的 Buffer 相关能力
    fn capabilities(&self) -> Capabilities;

    fn buffer_ownership(&self) -> BufferOwnership;

    fn set_buffer_ownership(&mut self, ownership: BufferOwnership) -> Result<()>;

    /// 把主机分配的区域交给采集引擎 (所有权转移)
    fn bind_buffers(&mut self, region: BufferRegion) -> std::result::Result<(), BindRejected>;

    /// 收回之前绑定的区域；引擎仍在运行时返回 None
    fn unbind_buffers(&mut self) -> Option<BufferRegion>;

    fn begin_acquisition(&mut self) -> Result<()>;

    fn end_acquisition(&mut self) -> Result<()>;

    fn is_streaming(&self) -> bool;

    /// 阻塞等待下一帧，最长 `timeout`
    fn next_frame(&mut self, timeout: Duration) -> Result<FrameWait>;
}
