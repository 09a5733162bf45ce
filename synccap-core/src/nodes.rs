//! 标准特性名 (SFNC) 与 NodeMap 的便捷扩展

use crate::error::{CameraError, Result};
use crate::traits::{NodeAccess, NodeMap};

// --- 采集控制 ---
pub const ACQUISITION_MODE: &str = "AcquisitionMode";
pub const ACQUISITION_RESULTING_FRAME_RATE: &str = "AcquisitionResultingFrameRate";
pub const PAYLOAD_SIZE: &str = "PayloadSize";
pub const PIXEL_FORMAT: &str = "PixelFormat";

// --- 曝光与触发 ---
pub const EXPOSURE_AUTO: &str = "ExposureAuto";
pub const EXPOSURE_TIME: &str = "ExposureTime";
pub const TRIGGER_MODE: &str = "TriggerMode";
pub const TRIGGER_SOURCE: &str = "TriggerSource";
pub const TRIGGER_OVERLAP: &str = "TriggerOverlap";

// --- Counter / Timer ---
pub const COUNTER_SELECTOR: &str = "CounterSelector";
pub const COUNTER_EVENT_SOURCE: &str = "CounterEventSource";
pub const COUNTER_DURATION: &str = "CounterDuration";
pub const COUNTER_DELAY: &str = "CounterDelay";
pub const COUNTER_TRIGGER_SOURCE: &str = "CounterTriggerSource";
pub const COUNTER_TRIGGER_ACTIVATION: &str = "CounterTriggerActivation";

// --- Digital IO ---
pub const LINE_SELECTOR: &str = "LineSelector";
pub const LINE_MODE: &str = "LineMode";
pub const LINE_SOURCE: &str = "LineSource";
pub const AUX_RAIL_ENABLE: &str = "V3_3Enable";

// --- 设备信息 ---
pub const DEVICE_INFORMATION: &str = "DeviceInformation";
pub const DEVICE_SERIAL_NUMBER: &str = "DeviceSerialNumber";
pub const DEVICE_MODEL_NAME: &str = "DeviceModelName";
pub const DEVICE_VENDOR_NAME: &str = "DeviceVendorName";

// --- Transport Layer Stream ---
pub const STREAM_BUFFER_COUNT_MODE: &str = "StreamBufferCountMode";
pub const STREAM_BUFFER_COUNT_MANUAL: &str = "StreamBufferCountManual";
pub const STREAM_BUFFER_COUNT_RESULT: &str = "StreamBufferCountResult";
pub const STREAM_BUFFER_HANDLING_MODE: &str = "StreamBufferHandlingMode";

/// 常用枚举条目
pub mod entries {
    pub const CONTINUOUS: &str = "Continuous";
    pub const SINGLE_FRAME: &str = "SingleFrame";
    pub const ON: &str = "On";
    pub const OFF: &str = "Off";
    pub const MANUAL: &str = "Manual";
    pub const OUTPUT: &str = "Output";
    pub const COUNTER0: &str = "Counter0";
    pub const COUNTER0_START: &str = "Counter0Start";
    pub const COUNTER0_ACTIVE: &str = "Counter0Active";
    pub const MHZ_TICK: &str = "MHzTick";
    pub const FRAME_TRIGGER_WAIT: &str = "FrameTriggerWait";
    pub const LEVEL_HIGH: &str = "LevelHigh";
    pub const READ_OUT: &str = "ReadOut";
}

/// 所有 NodeMap 自动获得的检查型访问方法
///
/// 访问前先检查 available / writable，把 "节点不存在" 与 "写入失败" 区分开。
pub trait NodeMapExt: NodeMap {
    fn is_available(&self, name: &str) -> bool {
        self.access(name).available
    }

    fn is_readable(&self, name: &str) -> bool {
        let a = self.access(name);
        a.available && a.readable
    }

    fn is_writable(&self, name: &str) -> bool {
        let a = self.access(name);
        a.available && a.writable
    }

    fn require_writable(&self, name: &str) -> Result<()> {
        match self.access(name) {
            NodeAccess {
                available: false, ..
            } => Err(CameraError::NodeNotAvailable(name.to_string())),
            NodeAccess {
                writable: false, ..
            } => Err(CameraError::NodeNotWritable(name.to_string())),
            _ => Ok(()),
        }
    }

    fn require_readable(&self, name: &str) -> Result<()> {
        match self.access(name) {
            NodeAccess {
                available: false, ..
            } => Err(CameraError::NodeNotAvailable(name.to_string())),
            NodeAccess {
                readable: false, ..
            } => Err(CameraError::NodeNotReadable(name.to_string())),
            _ => Ok(()),
        }
    }

    /// 检查节点可写且条目存在后再设置
    fn set_enum_checked(&self, name: &str, entry: &str) -> Result<()> {
        self.require_writable(name)?;
        if !self.enum_entries(name)?.iter().any(|e| e == entry) {
            return Err(CameraError::EntryNotAvailable {
                node: name.to_string(),
                entry: entry.to_string(),
            });
        }
        self.set_enum(name, entry)
    }

    fn set_integer_checked(&self, name: &str, value: i64) -> Result<()> {
        self.require_writable(name)?;
        self.set_integer(name, value)
    }

    fn set_float_checked(&self, name: &str, value: f64) -> Result<()> {
        self.require_writable(name)?;
        self.set_float(name, value)
    }

    /// 枚举节点是否提供某个条目 (节点不可读时视为不提供)
    fn offers_entry(&self, name: &str, entry: &str) -> bool {
        self.is_readable(name)
            && self
                .enum_entries(name)
                .map(|entries| entries.iter().any(|e| e == entry))
                .unwrap_or(false)
    }

    /// 读取任意类型节点并格式化为字符串，不可读时返回 None
    fn read_display(&self, name: &str) -> Option<String> {
        use crate::traits::NodeKind;

        if !self.is_readable(name) {
            return None;
        }
        match self.kind(name)? {
            NodeKind::Integer => self.get_integer(name).ok().map(|v| v.to_string()),
            NodeKind::Float => self.get_float(name).ok().map(|v| v.to_string()),
            NodeKind::Boolean => self.get_boolean(name).ok().map(|v| v.to_string()),
            NodeKind::Enumeration => self.get_enum(name).ok(),
            NodeKind::String => self.get_string(name).ok(),
            NodeKind::Command | NodeKind::Category => None,
        }
    }
}

impl<T: NodeMap + ?Sized> NodeMapExt for T {}
