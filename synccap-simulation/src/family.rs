use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use synccap_core::nodes::{self, entries};
use synccap_core::pixel_format::PixelFormat;
use synccap_core::traits::{Capabilities, NodeAccess, TransportType};

use crate::nodes::{SimNodeMap, SimNodeMapBuilder};

/// 机型家族，决定 GPIO 线与电压轨的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Line1 为纯输出线；辅助 3.3V 电压轨挂在 Line2
    BlackflyS,
    /// Line2 需要先把 LineMode 切到 Output 才能绑定 Counter；无辅助电压轨
    Oryx,
    /// 没有 Counter/Timer，只能自由运行
    Chameleon,
    /// 通用 GenICam 设备：Line3 可直接输出
    Generic,
}

impl Family {
    fn model_prefix(&self) -> &'static str {
        match self {
            Self::BlackflyS => "Blackfly S BFS-U3-16S2M",
            Self::Oryx => "Oryx ORX-10G-51S5M",
            Self::Chameleon => "Chameleon3 CM3-U3-13Y3M",
            Self::Generic => "Generic GenICam Camera",
        }
    }

    fn has_counter(&self) -> bool {
        !matches!(self, Self::Chameleon)
    }
}

/// 一台模拟相机的出厂规格
#[derive(Debug, Clone)]
pub struct SimCameraSpec {
    pub family: Family,
    pub serial_number: String,
    pub model_name: String,
    pub vendor_name: String,
    pub transport: TransportType,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// 设备在当前配置下能达到的最大帧率
    pub frame_rate: f64,
    pub capabilities: Capabilities,
    /// 相对共享时钟的固定偏差
    pub clock_skew_ns: u64,
    /// init() 失败，模拟固件异常
    pub fail_init: bool,
    /// 额外的节点访问权限覆盖 (key, access)
    pub access_overrides: Vec<(String, NodeAccess)>,
    /// 上电时的枚举节点取值 (key, entry)，模拟残留的用户设置
    pub enum_presets: Vec<(String, String)>,
}

impl SimCameraSpec {
    pub fn new(family: Family, serial: &str) -> Self {
        let transport = match family {
            Family::Oryx => TransportType::GigEVision,
            _ => TransportType::Usb3Vision,
        };
        Self {
            family,
            serial_number: serial.to_string(),
            model_name: family.model_prefix().to_string(),
            vendor_name: "FLIR".to_string(),
            transport,
            width: 64,
            height: 48,
            pixel_format: PixelFormat::Mono8,
            frame_rate: 120.0,
            capabilities: Capabilities::USER_BUFFERS
                | Capabilities::CONTIGUOUS_BUFFERS
                | Capabilities::SCATTERED_BUFFERS
                | Capabilities::STREAM_BUFFER_CONTROL,
            clock_skew_ns: 0,
            fail_init: false,
            access_overrides: Vec::new(),
            enum_presets: Vec::new(),
        }
    }

    pub fn blackfly_s(serial: &str) -> Self {
        Self::new(Family::BlackflyS, serial)
    }

    pub fn oryx(serial: &str) -> Self {
        Self::new(Family::Oryx, serial)
    }

    pub fn chameleon(serial: &str) -> Self {
        Self::new(Family::Chameleon, serial)
    }

    pub fn generic(serial: &str) -> Self {
        Self::new(Family::Generic, serial)
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    pub fn frame_rate(mut self, hz: f64) -> Self {
        self.frame_rate = hz;
        self
    }

    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn clock_skew_ns(mut self, ns: u64) -> Self {
        self.clock_skew_ns = ns;
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// 覆盖节点权限，key 可带选择器后缀 (e.g. "LineSource[Line1]")
    pub fn node_access(mut self, key: &str, access: NodeAccess) -> Self {
        self.access_overrides.push((key.to_string(), access));
        self
    }

    /// 预置枚举节点的当前条目 (e.g. 上次运行留下的 "TriggerMode" = "On")
    pub fn preset_enum(mut self, key: &str, entry: &str) -> Self {
        self.enum_presets.push((key.to_string(), entry.to_string()));
        self
    }

    pub fn payload_size(&self) -> usize {
        self.pixel_format.image_size(self.width, self.height)
    }

    pub fn device_id(&self) -> String {
        format!("sim://{}", self.serial_number)
    }

    /// 不挂在相机上的设备节点表 (非采集状态)，用于单独检查节点编程
    pub fn standalone_nodes(&self) -> SimNodeMap {
        self.build_nodes(Arc::new(AtomicBool::new(false)))
    }

    /// 设备端节点表
    pub(crate) fn build_nodes(&self, streaming: Arc<AtomicBool>) -> SimNodeMap {
        let rw = NodeAccess::READ_WRITE;
        let ro = NodeAccess::READ_ONLY;

        let mut b = SimNodeMap::builder()
            .category(
                nodes::DEVICE_INFORMATION,
                &[
                    nodes::DEVICE_VENDOR_NAME,
                    nodes::DEVICE_MODEL_NAME,
                    nodes::DEVICE_SERIAL_NUMBER,
                    "DeviceFirmwareVersion",
                ],
            )
            .text(nodes::DEVICE_VENDOR_NAME, &self.vendor_name)
            .text(nodes::DEVICE_MODEL_NAME, &self.model_name)
            .text(nodes::DEVICE_SERIAL_NUMBER, &self.serial_number)
            .text("DeviceFirmwareVersion", "1.27.3.0")
            .enumeration(
                nodes::ACQUISITION_MODE,
                entries::CONTINUOUS,
                &[entries::CONTINUOUS, entries::SINGLE_FRAME, "MultiFrame"],
                rw,
            )
            .locked_while_streaming()
            .float(
                nodes::ACQUISITION_RESULTING_FRAME_RATE,
                self.frame_rate,
                0.0,
                1000.0,
                ro,
            )
            .integer(
                nodes::PAYLOAD_SIZE,
                self.payload_size() as i64,
                0,
                i64::MAX,
                ro,
            )
            .enumeration(
                nodes::PIXEL_FORMAT,
                self.pixel_format.pfnc_name(),
                &[self.pixel_format.pfnc_name()],
                ro,
            )
            .enumeration(
                nodes::EXPOSURE_AUTO,
                "Continuous",
                &[entries::OFF, "Once", "Continuous"],
                rw,
            )
            .float(nodes::EXPOSURE_TIME, 10_000.0, 6.0, 30_000_000.0, rw)
            .requires(nodes::EXPOSURE_AUTO, entries::OFF)
            .enumeration(nodes::TRIGGER_MODE, entries::OFF, &[entries::OFF, entries::ON], rw);

        let mut trigger_sources = vec!["Software", "Line0"];
        if self.family.has_counter() {
            trigger_sources.push(entries::COUNTER0_START);
        }
        b = b
            .enumeration(nodes::TRIGGER_SOURCE, "Line0", &trigger_sources, rw)
            .requires(nodes::TRIGGER_MODE, entries::OFF);

        // Chameleon 不支持 Overlap
        if self.family != Family::Chameleon {
            b = b.enumeration(
                nodes::TRIGGER_OVERLAP,
                entries::OFF,
                &[entries::OFF, entries::READ_OUT],
                rw,
            );
        }

        if self.family.has_counter() {
            b = b
                .enumeration(
                    nodes::COUNTER_SELECTOR,
                    entries::COUNTER0,
                    &[entries::COUNTER0, "Counter1"],
                    rw,
                )
                .enumeration(
                    nodes::COUNTER_EVENT_SOURCE,
                    "Off",
                    &["Off", entries::MHZ_TICK, "ExposureStart"],
                    rw,
                )
                .integer(nodes::COUNTER_DURATION, 1, 1, 1 << 24, rw)
                .integer(nodes::COUNTER_DELAY, 0, 0, 1 << 24, rw)
                .enumeration(
                    nodes::COUNTER_TRIGGER_SOURCE,
                    "Off",
                    &["Off", entries::FRAME_TRIGGER_WAIT, "ExposureStart", "Line0"],
                    rw,
                )
                .enumeration(
                    nodes::COUNTER_TRIGGER_ACTIVATION,
                    "RisingEdge",
                    &["RisingEdge", "FallingEdge", entries::LEVEL_HIGH, "LevelLow"],
                    rw,
                );
        }

        b = self.build_lines(b, rw, ro);

        for (key, access) in &self.access_overrides {
            b = b.override_access(key, *access);
        }
        for (key, entry) in &self.enum_presets {
            b = b.override_enum(key, entry);
        }
        b.build(streaming)
    }

    fn build_lines(&self, b: SimNodeMapBuilder, rw: NodeAccess, ro: NodeAccess) -> SimNodeMapBuilder {
        let counter_sources: &[&str] = if self.family.has_counter() {
            &["Off", "ExposureActive", entries::COUNTER0_ACTIVE, "UserOutput0"]
        } else {
            &["Off", "ExposureActive", "UserOutput0"]
        };
        let input_only = |b: SimNodeMapBuilder, line: &str| {
            b.scope(line)
                .enumeration(nodes::LINE_MODE, "Input", &["Input"], ro)
        };

        let lines: &[&str] = match self.family {
            Family::BlackflyS => &["Line0", "Line1", "Line2", "Line3"],
            Family::Oryx => &["Line0", "Line2", "Line3"],
            Family::Chameleon => &["Line0", "Line1", "Line2"],
            Family::Generic => &["Line0", "Line3"],
        };

        let mut b = b
            .enumeration(nodes::LINE_SELECTOR, "Line0", lines, rw)
            .selected_by(nodes::LINE_MODE, nodes::LINE_SELECTOR)
            .selected_by(nodes::LINE_SOURCE, nodes::LINE_SELECTOR)
            .selected_by(nodes::AUX_RAIL_ENABLE, nodes::LINE_SELECTOR);
        b = input_only(b, "Line0");

        b = match self.family {
            Family::BlackflyS => b
                // Line1: 光耦输出，模式固定
                .scope("Line1")
                .enumeration(nodes::LINE_MODE, entries::OUTPUT, &[entries::OUTPUT], ro)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                // Line2: 双向 GPIO，带 3.3V 输出
                .scope("Line2")
                .enumeration(nodes::LINE_MODE, "Input", &["Input", entries::OUTPUT], rw)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                .requires(nodes::LINE_MODE, entries::OUTPUT)
                .boolean(nodes::AUX_RAIL_ENABLE, false, rw)
                .scope("Line3")
                .enumeration(nodes::LINE_MODE, "Input", &["Input", entries::OUTPUT], rw)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                .requires(nodes::LINE_MODE, entries::OUTPUT),
            Family::Oryx => b
                .scope("Line2")
                .enumeration(nodes::LINE_MODE, "Input", &["Input", entries::OUTPUT], rw)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                .requires(nodes::LINE_MODE, entries::OUTPUT)
                .scope("Line3")
                .enumeration(nodes::LINE_MODE, "Input", &["Input", entries::OUTPUT], rw)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                .requires(nodes::LINE_MODE, entries::OUTPUT),
            Family::Chameleon => b
                .scope("Line1")
                .enumeration(nodes::LINE_MODE, entries::OUTPUT, &[entries::OUTPUT], ro)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw)
                .scope("Line2")
                .enumeration(nodes::LINE_MODE, "Input", &["Input", entries::OUTPUT], rw)
                .boolean(nodes::AUX_RAIL_ENABLE, false, rw),
            Family::Generic => b
                .scope("Line3")
                .enumeration(nodes::LINE_MODE, entries::OUTPUT, &[entries::OUTPUT], ro)
                .enumeration(nodes::LINE_SOURCE, "Off", counter_sources, rw),
        };
        b.global()
    }

    /// Transport Layer Stream 节点表
    pub(crate) fn build_stream_nodes(&self, streaming: Arc<AtomicBool>) -> SimNodeMap {
        let rw = NodeAccess::READ_WRITE;
        let builder = SimNodeMap::builder();
        if !self.capabilities.contains(Capabilities::STREAM_BUFFER_CONTROL) {
            return builder.build(streaming);
        }
        builder
            .enumeration(
                nodes::STREAM_BUFFER_COUNT_MODE,
                "Auto",
                &["Auto", entries::MANUAL],
                rw,
            )
            .locked_while_streaming()
            .integer(nodes::STREAM_BUFFER_COUNT_MANUAL, 10, 1, 1024, rw)
            .requires(nodes::STREAM_BUFFER_COUNT_MODE, entries::MANUAL)
            .locked_while_streaming()
            .integer(
                nodes::STREAM_BUFFER_COUNT_RESULT,
                0,
                0,
                1024,
                NodeAccess::READ_ONLY,
            )
            .enumeration(
                nodes::STREAM_BUFFER_HANDLING_MODE,
                "OldestFirst",
                &["OldestFirst", "OldestFirstOverwrite", "NewestFirst", "NewestOnly"],
                rw,
            )
            .build(streaming)
    }
}
