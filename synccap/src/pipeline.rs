//! 对控制回路暴露的外观：`start()` / `capture_cycle()` / `stop()`
//!
//! 启动顺序：打开上下文 → 枚举 → 逐台打开设备并初始化 → 编程硬件触发 →
//! 按剩余内存额度分配帧缓冲池 → 开始采集 → 交给编排器。
//! 只有上下文错误和 (全部设备的) 分配错误会让启动失败，其余问题都只影响单台设备。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use synccap_core::buffer::{BufferLayout, BufferOwnership};
use synccap_core::builder::PipelineConfig;
use synccap_core::traits::{Capabilities, DeviceSystem};

use crate::error::{AcquisitionError, Result};
use crate::internal::runtime;
use crate::inventory::{Device, DeviceInventory};
use crate::orchestrator::{CaptureBatch, ConcurrentCaptureOrchestrator};
use crate::pool::{BufferPlan, FleetBufferPlan, FrameBufferPool};
use crate::session::{DeviceAcquisitionSession, SessionStatus};

/// 启动结果汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    /// 已进入 Streaming 的设备序列号
    pub streaming: Vec<String>,
    /// 硬件触发已编程的设备
    pub triggered: Vec<String>,
    /// 没有 Counter 能力，自由运行的设备
    pub free_running: Vec<String>,
    /// 会话保留但处于 Faulted 的设备 (序列号, 原因)
    pub faulted: Vec<(String, String)>,
    /// 退出本次运行的设备 (序列号, 原因)
    pub excluded: Vec<(String, String)>,
    /// 成功分配的缓冲规划
    pub buffers: FleetBufferPlan,
}

/// 根据设备能力选择缓冲布局，配置的布局不支持时退回另一种
fn choose_layout(wanted: BufferLayout, caps: Capabilities) -> BufferLayout {
    let supports = |layout: BufferLayout| match layout {
        BufferLayout::Contiguous => caps.contains(Capabilities::CONTIGUOUS_BUFFERS),
        BufferLayout::Scattered => caps.contains(Capabilities::SCATTERED_BUFFERS),
    };
    if supports(wanted) {
        return wanted;
    }
    let other = match wanted {
        BufferLayout::Contiguous => BufferLayout::Scattered,
        BufferLayout::Scattered => BufferLayout::Contiguous,
    };
    if supports(other) {
        other
    } else {
        wanted
    }
}

/// 同步多设备采集流水线
pub struct CapturePipeline {
    // 编排器 (持有会话) 必须先于清单释放
    orchestrator: Option<ConcurrentCaptureOrchestrator>,
    inventory: DeviceInventory,
    config: PipelineConfig,
}

impl fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("running", &self.is_running())
            .field("inventory", &self.inventory)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl CapturePipeline {
    pub fn new(system: Arc<dyn DeviceSystem>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator: None,
            inventory: DeviceInventory::new(system),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_some()
    }

    pub fn inventory(&self) -> &DeviceInventory {
        &self.inventory
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inventory.devices()
    }

    /// 打开上下文并让所有可用设备进入 Streaming
    pub fn start(&mut self) -> Result<StartReport> {
        if self.is_running() {
            return Err(AcquisitionError::InvalidState {
                state: crate::session::SessionState::Streaming,
                expected: "stopped pipeline",
            });
        }
        // 上次 stop 没能关闭上下文时在这里再试一次
        if self.inventory.is_open() {
            self.inventory.close_context(self.config.cycle_deadline())?;
        }
        self.inventory.open_context()?;

        match self.start_sessions() {
            Ok((sessions, report)) => {
                tracing::info!(
                    "Pipeline started: {} streaming, {} faulted, {} excluded",
                    report.streaming.len(),
                    report.faulted.len(),
                    report.excluded.len()
                );
                self.orchestrator = Some(ConcurrentCaptureOrchestrator::new(
                    sessions,
                    Duration::from_millis(self.config.cycle_grace_ms),
                ));
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Pipeline failed to start: {}", e);
                if let Err(close) = self.inventory.close_context(self.config.cycle_deadline()) {
                    tracing::warn!("Context not closed after failed start: {}", close);
                }
                Err(e)
            }
        }
    }

    fn start_sessions(&self) -> Result<(Vec<DeviceAcquisitionSession>, StartReport)> {
        let devices = self.inventory.enumerate()?;
        if devices.is_empty() {
            return Err(AcquisitionError::NoDevices);
        }

        let mut report = StartReport::default();
        let mut sessions = Vec::with_capacity(devices.len());
        let mut plans: Vec<BufferPlan> = Vec::new();
        let mut budget = self.config.memory_budget_bytes;
        let mut first_allocation_error = None;

        for device in &devices {
            let serial = device.serial_number().to_string();
            let (camera, lease) = match self.inventory.open_device(device) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::warn!("[{}] could not be opened: {}", serial, e);
                    report.excluded.push((serial, e.to_string()));
                    continue;
                }
            };
            let mut session = DeviceAcquisitionSession::new(camera, self.config.clone(), lease);

            if let Err(e) = session.initialize() {
                report.faulted.push((serial, e.to_string()));
                sessions.push(session);
                continue;
            }

            if let Some(settings) = &self.config.trigger {
                match session.configure_trigger(settings) {
                    Ok(_) => report.triggered.push(serial.clone()),
                    Err(e) if e.is_capability_unavailable() => {
                        tracing::warn!("[{}] {}, falling back to free-running capture", serial, e);
                        session.disarm_trigger();
                        report.free_running.push(serial.clone());
                    }
                    Err(e) => {
                        session.fault(format!("trigger configuration failed: {}", e));
                        report.faulted.push((serial, e.to_string()));
                        sessions.push(session);
                        continue;
                    }
                }
            } else {
                session.disarm_trigger();
                report.free_running.push(serial.clone());
            }

            let caps = session.capabilities();
            if self.config.buffer_ownership == BufferOwnership::Pool {
                if caps.contains(Capabilities::USER_BUFFERS) {
                    let payload = match session.payload_size() {
                        Ok(p) => p,
                        Err(e) => {
                            session.fault(format!("payload size unavailable: {}", e));
                            report.faulted.push((serial, e.to_string()));
                            sessions.push(session);
                            continue;
                        }
                    };
                    let plan = FrameBufferPool::size(
                        payload,
                        device.info().transport.packet_alignment(),
                        self.config.buffer_count,
                    )
                    .with_layout(choose_layout(self.config.buffer_layout, caps));

                    match FrameBufferPool::allocate(plan, budget) {
                        Ok(pool) => {
                            if let Some(remaining) = budget.as_mut() {
                                *remaining =
                                    remaining.saturating_sub(plan.total_bytes().unwrap_or(0));
                            }
                            plans.push(plan);
                            session.attach_pool(pool)?;
                        }
                        Err(e) => {
                            tracing::error!(
                                "[{}] buffer allocation failed, device dropped from this run: {}",
                                serial,
                                e
                            );
                            report.excluded.push((serial.clone(), e.to_string()));
                            first_allocation_error.get_or_insert(AcquisitionError::Allocation {
                                device: serial,
                                source: e,
                            });
                            continue;
                        }
                    }
                } else {
                    tracing::info!("[{}] user buffers not supported, using device buffers", serial);
                }
            }

            match session.begin_streaming() {
                Ok(()) => report.streaming.push(serial),
                Err(e) => report.faulted.push((serial, e.to_string())),
            }
            sessions.push(session);
        }

        if sessions.is_empty() {
            return Err(first_allocation_error.unwrap_or(AcquisitionError::NoDevices));
        }
        report.buffers = FleetBufferPlan::new(plans);
        Ok((sessions, report))
    }

    /// 同步执行一个采集周期 (在后台 Runtime 上)
    ///
    /// 已处于 async 上下文时请使用 [`capture_cycle_async`](Self::capture_cycle_async)。
    pub fn capture_cycle(&mut self) -> Result<CaptureBatch> {
        let timeout = self.config.per_device_timeout();
        let threads = self.config.worker_threads;
        let orchestrator = self
            .orchestrator
            .as_mut()
            .ok_or(AcquisitionError::NotRunning)?;
        runtime::block_on(threads, orchestrator.capture_cycle(timeout))
            .map_err(AcquisitionError::Runtime)
    }

    pub async fn capture_cycle_async(&mut self) -> Result<CaptureBatch> {
        let timeout = self.config.per_device_timeout();
        let orchestrator = self
            .orchestrator
            .as_mut()
            .ok_or(AcquisitionError::NotRunning)?;
        Ok(orchestrator.capture_cycle(timeout).await)
    }

    /// 停止所有会话并关闭上下文，最多等待一个周期期限
    pub fn stop(&mut self) -> Result<()> {
        self.stop_within(self.config.cycle_deadline())
    }

    /// 同 [`stop`](Self::stop)，`wait` 是等待分离任务结束的上限
    pub fn stop_within(&mut self, wait: Duration) -> Result<()> {
        let mut orchestrator = self.orchestrator.take().ok_or(AcquisitionError::NotRunning)?;
        let sessions = orchestrator.shutdown();
        drop(orchestrator);

        for mut session in sessions {
            session.disarm_trigger();
            if let Err(e) = session.end_streaming() {
                tracing::warn!("[{}] {}", session.info().serial_number, e);
            }
        }

        self.inventory.close_context(wait)?;
        tracing::info!("Pipeline stopped");
        Ok(())
    }

    /// 各会话的状态快照 (按枚举顺序)
    pub fn status(&self) -> Vec<SessionStatus> {
        self.orchestrator
            .as_ref()
            .map(|o| o.status())
            .unwrap_or_default()
    }

    #[cfg(feature = "serialize")]
    pub fn export_state(&self) -> serde_json::Value {
        let sessions: Vec<_> = self.status().iter().map(|s| s.export_state()).collect();
        serde_json::json!({
            "running": self.is_running(),
            "context_open": self.inventory.is_open(),
            "cycles": self.orchestrator.as_ref().map(|o| o.cycles()).unwrap_or(0),
            "sessions": sessions,
        })
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                tracing::warn!("Pipeline stop on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_falls_back_to_supported_kind() {
        let scattered_only = Capabilities::USER_BUFFERS | Capabilities::SCATTERED_BUFFERS;
        assert_eq!(
            choose_layout(BufferLayout::Contiguous, scattered_only),
            BufferLayout::Scattered
        );
        let both = scattered_only | Capabilities::CONTIGUOUS_BUFFERS;
        assert_eq!(
            choose_layout(BufferLayout::Contiguous, both),
            BufferLayout::Contiguous
        );
        assert_eq!(
            choose_layout(BufferLayout::Scattered, Capabilities::empty()),
            BufferLayout::Scattered
        );
    }
}
