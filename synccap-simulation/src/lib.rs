//! 确定性的模拟设备系统
//!
//! 用于在没有硬件的环境下驱动 synccap 的完整流程：帧脚本 (完整 / 不完整 / 超时 / 卡死 / 掉线)、
//! 不同机型的 GPIO 布局、以及 Buffer Slot 的泄漏统计。

pub mod device;
pub mod family;
pub mod nodes;
pub mod stream;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use synccap_core::error::{CameraError, Result};
use synccap_core::nodes::NodeMapExt;
use synccap_core::traits::{Camera, DeviceInfo, DeviceSystem, NodeMap};

pub use device::SimCamera;
pub use family::{Family, SimCameraSpec};
pub use nodes::{NodeValue, SimNodeMap};
pub use stream::{pattern_level, FrameStep, SimClock, SimController, SlotStats};

#[derive(Debug, Default)]
struct SystemState {
    initialized: bool,
    /// 生命周期内 initialize 成功的次数
    init_count: u32,
}

#[derive(Debug)]
struct SimDevice {
    spec: SimCameraSpec,
    controller: SimController,
}

/// 模拟的进程级设备系统
#[derive(Debug)]
pub struct SimSystem {
    devices: Vec<SimDevice>,
    state: Mutex<SystemState>,
    clock: Arc<SimClock>,
    /// 当前被打开的设备 ID，句柄 Drop 时自动移除
    registry: Arc<Mutex<HashSet<String>>>,
}

impl SimSystem {
    pub fn new(specs: Vec<SimCameraSpec>) -> Self {
        Self {
            devices: specs
                .into_iter()
                .map(|spec| SimDevice {
                    spec,
                    controller: SimController::default(),
                })
                .collect(),
            state: Mutex::new(SystemState::default()),
            clock: Arc::new(SimClock::default()),
            registry: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 三台 Blackfly S，最常见的多相机同步布置
    pub fn blackfly_rig(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| SimCameraSpec::blackfly_s(&format!("1930{:04}", i)))
                .collect(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, SystemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 按序列号取得设备的控制句柄
    pub fn controller(&self, serial: &str) -> Option<SimController> {
        self.devices
            .iter()
            .find(|d| d.spec.serial_number == serial)
            .map(|d| d.controller.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn init_count(&self) -> u32 {
        self.lock().init_count
    }

    /// 仍存活的相机句柄数量
    pub fn open_handles(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn device_info(&self, index: usize, device: &SimDevice) -> DeviceInfo {
        let spec = &device.spec;
        // 与真实 SDK 一样，DeviceInformation 分类无需 init 即可读取
        let probe = SimCamera::new(
            DeviceInfo {
                index,
                id: spec.device_id(),
                serial_number: spec.serial_number.clone(),
                model_name: spec.model_name.clone(),
                vendor_name: spec.vendor_name.clone(),
                transport: spec.transport,
                information: Vec::new(),
            },
            spec.clone(),
            device.controller.clone(),
            self.clock.clone(),
            None,
        );
        let nodes = probe.sim_nodes();
        let information = nodes
            .category_features(synccap_core::nodes::DEVICE_INFORMATION)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|name| nodes.read_display(&name).map(|v| (name, v)))
            .collect();

        DeviceInfo {
            information,
            ..probe.info().clone()
        }
    }
}

impl DeviceSystem for SimSystem {
    fn library_version(&self) -> String {
        format!("synccap-simulation {}", env!("CARGO_PKG_VERSION"))
    }

    fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        if state.initialized {
            return Err(CameraError::InvalidState(
                "device system already initialized".into(),
            ));
        }
        state.initialized = true;
        state.init_count += 1;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(CameraError::InvalidState(
                "device system not initialized".into(),
            ));
        }
        let handles = self.open_handles();
        if handles > 0 {
            return Err(CameraError::InvalidState(format!(
                "{} camera handles still referenced",
                handles
            )));
        }
        state.initialized = false;
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        if !self.is_initialized() {
            return Err(CameraError::NotInitialized);
        }
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| self.device_info(i, d))
            .collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn Camera>> {
        if !self.is_initialized() {
            return Err(CameraError::NotInitialized);
        }
        let (index, device) = self
            .devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.spec.device_id() == id)
            .ok_or_else(|| CameraError::Disconnected(id.to_string()))?;
        let inserted = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        if !inserted {
            return Err(CameraError::InvalidState(format!("{} is already open", id)));
        }

        let info = self.device_info(index, device);
        tracing::info!("Sim camera opened: {} ({})", info.model_name, id);
        Ok(Box::new(SimCamera::new(
            info,
            device.spec.clone(),
            device.controller.clone(),
            self.clock.clone(),
            Some(self.registry.clone()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccap_core::buffer::{BufferLayout, BufferOwnership, BufferRegion};
    use synccap_core::traits::{FrameWait, RawFrame};
    use std::time::Duration;

    #[test]
    fn lifecycle_requires_released_handles() -> anyhow::Result<()> {
        let system = SimSystem::blackfly_rig(2);
        assert!(system.list_devices().is_err());
        system.initialize()?;
        assert!(system.initialize().is_err());

        let devices = system.list_devices()?;
        assert_eq!(devices.len(), 2);
        assert!(devices[0]
            .information
            .iter()
            .any(|(k, v)| k == "DeviceSerialNumber" && v == "19300000"));

        let cam = system.open(&devices[1].id)?;
        assert!(system.open(&devices[1].id).is_err());
        assert!(system.shutdown().is_err());
        drop(cam);
        assert_eq!(system.open_handles(), 0);
        drop(system.open(&devices[1].id)?);
        system.shutdown()?;
        system.initialize()?;
        assert_eq!(system.init_count(), 2);
        Ok(())
    }

    #[test]
    fn pool_buffers_cycle_through_engine() -> anyhow::Result<()> {
        let system = SimSystem::new(vec![SimCameraSpec::blackfly_s("A").resolution(32, 32)]);
        system.initialize()?;
        let mut cam = system.open("sim://A")?;
        cam.init()?;
        cam.set_buffer_ownership(BufferOwnership::Pool)?;
        let region = BufferRegion::allocate(BufferLayout::Contiguous, 1024, 2, 1024);
        cam.bind_buffers(region).map_err(|r| r.error)?;
        cam.begin_acquisition()?;

        for _ in 0..5 {
            match cam.next_frame(Duration::from_millis(50))? {
                FrameWait::Ready(frame) => {
                    assert_eq!(frame.data().len(), 32 * 32);
                    frame.release();
                }
                FrameWait::TimedOut => panic!("engine starved"),
            }
        }
        cam.end_acquisition()?;
        let region = cam.unbind_buffers().expect("region");
        assert!(region.is_whole());
        Ok(())
    }

    #[test]
    fn misaligned_region_is_rejected_and_returned() -> anyhow::Result<()> {
        let system = SimSystem::new(vec![SimCameraSpec::blackfly_s("A").resolution(30, 30)]);
        system.initialize()?;
        let mut cam = system.open("sim://A")?;
        cam.init()?;
        cam.set_buffer_ownership(BufferOwnership::Pool)?;
        let region = BufferRegion::allocate(BufferLayout::Scattered, 900, 2, 1);
        let id = region.id();
        let rejected = cam.bind_buffers(region).unwrap_err();
        assert_eq!(rejected.region.id(), id);
        assert!(cam.begin_acquisition().is_err());
        Ok(())
    }

    #[test]
    fn scripted_steps_are_replayed() -> anyhow::Result<()> {
        let system = SimSystem::new(vec![SimCameraSpec::oryx("B")]);
        system.initialize()?;
        let ctl = system.controller("B").expect("controller");
        ctl.push_many([
            FrameStep::Timeout,
            FrameStep::Incomplete(synccap_core::frame::ImageStatus::MissingPackets),
            FrameStep::Fail("cable".into()),
        ]);

        let mut cam = system.open("sim://B")?;
        cam.init()?;
        cam.begin_acquisition()?;
        let t = Duration::from_millis(10);
        assert!(matches!(cam.next_frame(t)?, FrameWait::TimedOut));
        match cam.next_frame(t)? {
            FrameWait::Ready(frame) => {
                assert!(frame.is_incomplete());
                frame.release();
            }
            FrameWait::TimedOut => panic!("expected a frame"),
        }
        assert!(cam.next_frame(t).is_err());
        assert_eq!(ctl.stats().outstanding(), 0);
        Ok(())
    }
}
