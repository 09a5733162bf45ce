//! 单设备采集会话
//!
//! 状态机：`Idle → Configuring → Streaming → Draining → Idle`，任意状态遇到不可恢复错误进入 `Faulted`。
//!
//! 会话独占 `Box<dyn Camera>` 与本设备的 [`FrameBufferPool`]，
//! 外部只能通过 [`SessionProbe`] 的弱引用观察它的状态。

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use synccap_core::buffer::BufferOwnership;
use synccap_core::builder::{AcquisitionMode, PipelineConfig, TriggerSettings};
use synccap_core::error::CameraError;
use synccap_core::frame::{CapturedImage, ImageStatus};
use synccap_core::nodes::{self, entries, NodeMapExt};
use synccap_core::telemetry::{HealthIssue, HealthStatus, SessionTelemetry};
use synccap_core::traits::{Camera, Capabilities, DeviceInfo, FrameWait, NodeMap, RawFrame};

use crate::error::{AcquisitionError, Result, TriggerError};
use crate::inventory::{ConnectionState, SessionLease};
use crate::pool::FrameBufferPool;
use crate::trigger::{TriggerReport, TriggerSignalConfigurator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    Draining,
    Faulted,
}

/// 最近一帧的结果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TimedOut,
}

/// 一次 capture_next 的结果；超时与不完整帧都不是错误
#[derive(Debug)]
pub enum FrameOutcome {
    Complete(CapturedImage),
    Incomplete { status: ImageStatus },
    TimedOut { timeout_ms: u64 },
}

impl FrameOutcome {
    pub fn status(&self) -> FrameStatus {
        match self {
            Self::Complete(_) => FrameStatus::Complete,
            Self::Incomplete { .. } => FrameStatus::Incomplete,
            Self::TimedOut { .. } => FrameStatus::TimedOut,
        }
    }

    /// 只关心完整图像时使用
    pub fn into_result(self) -> Result<CapturedImage> {
        match self {
            Self::Complete(image) => Ok(image),
            Self::Incomplete { status } => Err(AcquisitionError::IncompleteFrame { status }),
            Self::TimedOut { timeout_ms } => Err(AcquisitionError::TimedOut { timeout_ms }),
        }
    }
}

/// 会话状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub index: usize,
    pub device_id: String,
    pub serial_number: String,
    pub state: SessionState,
    pub last_frame_status: Option<FrameStatus>,
    pub telemetry: SessionTelemetry,
    pub health: HealthStatus,
    pub fault: Option<String>,
    pub triggered: bool,
}

impl SessionStatus {
    #[cfg(feature = "serialize")]
    pub fn export_state(&self) -> serde_json::Value {
        serde_json::json!({
            "index": self.index,
            "device_id": self.device_id,
            "serial_number": self.serial_number,
            "state": format!("{:?}", self.state),
            "last_frame_status": self.last_frame_status.map(|s| format!("{:?}", s)),
            "complete_frames": self.telemetry.complete_frames,
            "incomplete_frames": self.telemetry.incomplete_frames,
            "timeouts": self.telemetry.timeouts,
            "device_errors": self.telemetry.device_errors,
            "consecutive_failures": self.telemetry.consecutive_failures,
            "health": format!("{:?}", self.health),
            "fault": self.fault,
            "triggered": self.triggered,
        })
    }
}

/// 会话对外发布状态的地方，orchestrator 只持有它的 Weak
#[derive(Debug)]
pub struct SessionProbe {
    status: Mutex<SessionStatus>,
}

impl SessionProbe {
    pub fn snapshot(&self) -> SessionStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// 保证原始帧在任何返回路径上都被 release
struct FrameGuard(Option<Box<dyn RawFrame>>);

impl FrameGuard {
    fn frame(&self) -> Option<&dyn RawFrame> {
        self.0.as_deref()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(frame) = self.0.take() {
            frame.release();
        }
    }
}

fn configuration(device: &str, source: CameraError) -> AcquisitionError {
    AcquisitionError::Configuration {
        device: device.to_string(),
        source,
    }
}

/// 单个设备的采集会话
pub struct DeviceAcquisitionSession {
    // 字段顺序决定 Drop 顺序：相机句柄必须先于租约释放
    camera: Box<dyn Camera>,
    info: DeviceInfo,
    state: SessionState,
    config: PipelineConfig,
    pool: Option<FrameBufferPool>,
    telemetry: SessionTelemetry,
    last_frame_status: Option<FrameStatus>,
    fault: Option<String>,
    trigger: Option<TriggerReport>,
    frames_since_arm: u32,
    probe: Arc<SessionProbe>,
    lease: SessionLease,
}

impl fmt::Debug for DeviceAcquisitionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAcquisitionSession")
            .field("serial", &self.info.serial_number)
            .field("state", &self.state)
            .field("pool", &self.pool)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl DeviceAcquisitionSession {
    pub fn new(camera: Box<dyn Camera>, config: PipelineConfig, lease: SessionLease) -> Self {
        let info = camera.info().clone();
        let probe = Arc::new(SessionProbe {
            status: Mutex::new(SessionStatus {
                index: info.index,
                device_id: info.id.clone(),
                serial_number: info.serial_number.clone(),
                state: SessionState::Idle,
                last_frame_status: None,
                telemetry: SessionTelemetry::default(),
                health: HealthStatus::Healthy,
                fault: None,
                triggered: false,
            }),
        });
        Self {
            camera,
            info,
            state: SessionState::Idle,
            config,
            pool: None,
            telemetry: SessionTelemetry::default(),
            last_frame_status: None,
            fault: None,
            trigger: None,
            frames_since_arm: 0,
            probe,
            lease,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn telemetry(&self) -> &SessionTelemetry {
        &self.telemetry
    }

    pub fn fault_reason(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn trigger_report(&self) -> Option<&TriggerReport> {
        self.trigger.as_ref()
    }

    pub fn pool(&self) -> Option<&FrameBufferPool> {
        self.pool.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.camera.capabilities()
    }

    pub fn node_map(&self) -> &dyn NodeMap {
        self.camera.node_map()
    }

    pub fn buffer_ownership(&self) -> BufferOwnership {
        self.camera.buffer_ownership()
    }

    pub fn payload_size(&self) -> Result<usize> {
        Ok(self.camera.payload_size()?)
    }

    pub fn probe(&self) -> Weak<SessionProbe> {
        Arc::downgrade(&self.probe)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            index: self.info.index,
            device_id: self.info.id.clone(),
            serial_number: self.info.serial_number.clone(),
            state: self.state,
            last_frame_status: self.last_frame_status,
            telemetry: self.telemetry.clone(),
            health: self.health(),
            fault: self.fault.clone(),
            triggered: self.trigger.is_some(),
        }
    }

    /// 连续失败超过阈值时为 Critical
    pub fn health(&self) -> HealthStatus {
        if self.state == SessionState::Faulted {
            return HealthStatus::Critical(HealthIssue::DeviceError);
        }
        self.telemetry
            .assess_health(self.config.consecutive_failure_threshold)
    }

    fn publish(&self) {
        self.probe.publish(self.status());
    }

    fn expect_state(&self, expected: SessionState, what: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(AcquisitionError::InvalidState {
                state: self.state,
                expected: what,
            });
        }
        Ok(())
    }

    /// 进入 Faulted (吸收态)
    pub fn fault(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!("[{}] session faulted: {}", self.info.serial_number, reason);
        self.state = SessionState::Faulted;
        self.fault = Some(reason);
        self.lease.mark(ConnectionState::Faulted);
        self.publish();
    }

    /// 初始化设备
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle, "Idle")?;
        if self.camera.is_initialized() {
            return Ok(());
        }
        if let Err(e) = self.camera.init() {
            self.fault(format!("init failed: {}", e));
            return Err(e.into());
        }
        self.lease.mark(ConnectionState::Initialized);
        tracing::debug!(
            "[{}] {} {} initialized",
            self.info.serial_number,
            self.info.vendor_name,
            self.info.model_name
        );
        self.publish();
        Ok(())
    }

    /// 编程硬件触发，设备没有 Counter 时返回 CapabilityUnavailable
    pub fn configure_trigger(
        &mut self,
        settings: &TriggerSettings,
    ) -> std::result::Result<TriggerReport, TriggerError> {
        let configurator =
            TriggerSignalConfigurator::new(settings.exposure_us, settings.enable_aux_rail);
        let report = configurator.configure(
            self.camera.node_map(),
            settings.duration_us,
            settings.delay_us,
        )?;
        self.trigger = Some(report.clone());
        self.publish();
        Ok(report)
    }

    /// 触发模式复位，失败只记录
    ///
    /// 没有编程过触发的设备也会检查：残留的 `TriggerMode=On` 会让自由运行的设备一直等触发。
    pub fn disarm_trigger(&mut self) {
        let armed = self.trigger.take().is_some();
        let map = self.camera.node_map();
        if !armed {
            let left_on = map.is_readable(nodes::TRIGGER_MODE)
                && map
                    .get_enum(nodes::TRIGGER_MODE)
                    .map(|mode| mode != entries::OFF)
                    .unwrap_or(false);
            if !left_on {
                return;
            }
        }
        match TriggerSignalConfigurator::reset(map) {
            Ok(()) if !armed => tracing::info!(
                "[{}] trigger mode was left on, forced off for free-running capture",
                self.info.serial_number
            ),
            Ok(()) => {}
            Err(e) => tracing::warn!("[{}] failed to reset trigger: {}", self.info.serial_number, e),
        }
        if armed {
            self.publish();
        }
    }

    /// 挂接本设备的帧缓冲池；没有池时由设备自己管理 Buffer
    pub fn attach_pool(&mut self, pool: FrameBufferPool) -> Result<()> {
        self.expect_state(SessionState::Idle, "Idle")?;
        if let Some(old) = &self.pool {
            if !old.is_idle() {
                return Err(AcquisitionError::InvalidState {
                    state: self.state,
                    expected: "pool not lent",
                });
            }
        }
        self.pool = Some(pool);
        Ok(())
    }

    /// Idle → Configuring → Streaming
    pub fn begin_streaming(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle, "Idle")?;
        if !self.camera.is_initialized() {
            return Err(CameraError::NotInitialized.into());
        }
        self.state = SessionState::Configuring;

        match self.configure_and_start() {
            Ok(()) => {
                self.state = SessionState::Streaming;
                self.frames_since_arm = 0;
                self.lease.mark(ConnectionState::Streaming);
                tracing::info!(
                    "[{}] streaming ({:?}, {:?} buffers)",
                    self.info.serial_number,
                    self.config.acquisition_mode,
                    self.camera.buffer_ownership()
                );
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.release_region();
                self.revert_ownership();
                self.fault(e.to_string());
                Err(e)
            }
        }
    }

    fn configure_and_start(&mut self) -> Result<()> {
        let serial = self.info.serial_number.clone();
        let map = self.camera.node_map();

        map.require_writable(nodes::ACQUISITION_MODE)
            .and_then(|_| {
                map.set_enum_checked(
                    nodes::ACQUISITION_MODE,
                    self.config.acquisition_mode.entry_name(),
                )
            })
            .map_err(|e| configuration(&serial, e))?;

        if self
            .camera
            .capabilities()
            .contains(Capabilities::STREAM_BUFFER_CONTROL)
        {
            self.configure_stream_buffers()
                .map_err(|e| configuration(&serial, e))?;
        }

        match self.pool.as_mut() {
            Some(pool) => {
                self.camera
                    .set_buffer_ownership(BufferOwnership::Pool)
                    .map_err(|e| configuration(&serial, e))?;
                let region = pool.lend().ok_or(AcquisitionError::InvalidState {
                    state: SessionState::Configuring,
                    expected: "idle buffer pool",
                })?;
                if let Err(rejected) = self.camera.bind_buffers(region) {
                    if let Err(foreign) = pool.reclaim(rejected.region) {
                        tracing::error!("[{}] bind returned foreign {}", serial, foreign.id());
                        pool.mark_lost();
                    }
                    return Err(configuration(&serial, rejected.error));
                }
            }
            None => {
                self.camera
                    .set_buffer_ownership(BufferOwnership::Device)
                    .map_err(|e| configuration(&serial, e))?;
            }
        }

        self.camera.begin_acquisition()?;

        let stream = self.camera.stream_node_map();
        if stream.is_readable(nodes::STREAM_BUFFER_COUNT_RESULT) {
            if let Ok(n) = stream.get_integer(nodes::STREAM_BUFFER_COUNT_RESULT) {
                tracing::debug!("[{}] resulting stream buffer count {}", serial, n);
            }
        }
        Ok(())
    }

    fn configure_stream_buffers(&self) -> synccap_core::error::Result<()> {
        let stream = self.camera.stream_node_map();
        if stream.is_writable(nodes::STREAM_BUFFER_COUNT_MODE) {
            stream.set_enum_checked(nodes::STREAM_BUFFER_COUNT_MODE, entries::MANUAL)?;
            stream.set_integer_checked(
                nodes::STREAM_BUFFER_COUNT_MANUAL,
                self.config.buffer_count as i64,
            )?;
        }
        if stream.is_writable(nodes::STREAM_BUFFER_HANDLING_MODE) {
            stream.set_enum_checked(
                nodes::STREAM_BUFFER_HANDLING_MODE,
                self.config.buffer_handling.entry_name(),
            )?;
        }
        Ok(())
    }

    /// 单帧模式下每帧之后重新启动采集引擎
    fn rearm(&mut self) -> Result<()> {
        self.camera.end_acquisition()?;
        self.camera.begin_acquisition()?;
        self.frames_since_arm = 0;
        tracing::trace!("[{}] re-armed single frame acquisition", self.info.serial_number);
        Ok(())
    }

    /// 等待下一帧，最多阻塞 `timeout`
    ///
    /// 不完整帧与超时都以 [`FrameOutcome`] 返回，Buffer 在返回前已经归还引擎。
    pub fn capture_next(&mut self, timeout: Duration) -> Result<FrameOutcome> {
        self.expect_state(SessionState::Streaming, "Streaming")?;

        if self.config.acquisition_mode == AcquisitionMode::SingleFrame && self.frames_since_arm > 0
        {
            if let Err(e) = self.rearm() {
                self.telemetry.record_device_error();
                self.fault(format!("single frame re-arm failed: {}", e));
                return Err(e);
            }
        }

        let result = self.wait_frame(timeout);
        match &result {
            Ok(outcome) => self.last_frame_status = Some(outcome.status()),
            Err(_) => self.telemetry.record_device_error(),
        }
        if let Err(AcquisitionError::Device(CameraError::Disconnected(reason))) = &result {
            self.fault(format!("device disconnected: {}", reason));
        } else {
            self.publish();
        }
        result
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<FrameOutcome> {
        let serial = &self.info.serial_number;
        let frame = match self.camera.next_frame(timeout)? {
            FrameWait::Ready(frame) => FrameGuard(Some(frame)),
            FrameWait::TimedOut => {
                self.telemetry.record_timeout();
                tracing::warn!("[{}] no frame within {:?}", serial, timeout);
                return Ok(FrameOutcome::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        self.frames_since_arm += 1;

        let Some(raw) = frame.frame() else {
            return Err(CameraError::InvalidState("frame already released".into()).into());
        };
        if raw.is_incomplete() {
            let status = raw.status();
            self.telemetry.record_incomplete(raw.frame_id(), status);
            tracing::warn!(
                "[{}] frame {} incomplete: {} ({})",
                serial,
                raw.frame_id(),
                status.description(),
                status.code()
            );
            return Ok(FrameOutcome::Incomplete { status });
        }

        let image = raw.convert(self.config.target_format)?;
        drop(frame);

        self.telemetry.record_complete(image.frame_id);
        tracing::trace!("[{}] frame {} complete", serial, image.frame_id);
        Ok(FrameOutcome::Complete(image))
    }

    /// Streaming → Draining → Idle；重复调用或从未开始时什么都不做
    pub fn end_streaming(&mut self) -> Result<()> {
        let mut result = Ok(());
        if self.camera.is_streaming() {
            if self.state != SessionState::Faulted {
                self.state = SessionState::Draining;
            }
            if let Err(e) = self.camera.end_acquisition() {
                tracing::warn!("[{}] end acquisition failed: {}", self.info.serial_number, e);
                result = Err(e.into());
            }
        }
        self.release_region();
        self.revert_ownership();

        if matches!(self.state, SessionState::Draining | SessionState::Streaming) {
            self.state = SessionState::Idle;
            self.lease.mark(ConnectionState::Initialized);
            tracing::info!("[{}] streaming ended", self.info.serial_number);
        }
        self.publish();
        result
    }

    /// Buffer 所有权交还设备
    fn revert_ownership(&mut self) {
        if self.camera.buffer_ownership() != BufferOwnership::Pool {
            return;
        }
        if let Err(e) = self.camera.set_buffer_ownership(BufferOwnership::Device) {
            tracing::warn!(
                "[{}] could not revert buffer ownership: {}",
                self.info.serial_number,
                e
            );
        }
    }

    /// 把借出的区域从引擎收回到池中
    fn release_region(&mut self) {
        let Some(pool) = self.pool.as_mut() else {
            return;
        };
        if !pool.is_lent() {
            return;
        }
        match self.camera.unbind_buffers() {
            Some(region) => {
                if let Err(foreign) = pool.reclaim(region) {
                    tracing::error!(
                        "[{}] engine returned foreign {}",
                        self.info.serial_number,
                        foreign.id()
                    );
                    pool.mark_lost();
                }
            }
            None => pool.mark_lost(),
        }
    }
}

impl Drop for DeviceAcquisitionSession {
    fn drop(&mut self) {
        let _ = self.end_streaming();
        if self.camera.is_initialized() {
            if let Err(e) = self.camera.deinit() {
                tracing::warn!("[{}] deinit failed: {}", self.info.serial_number, e);
            }
        }
    }
}
