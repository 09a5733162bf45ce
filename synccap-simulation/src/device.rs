use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use synccap_core::buffer::{BufferLayout, BufferOwnership, BufferRegion};
use synccap_core::error::{CameraError, Result};
use synccap_core::frame::{FrameMetadata, ImageStatus, Timestamp};
use synccap_core::nodes::{self, entries, NodeMapExt};
use synccap_core::traits::{BindRejected, Camera, Capabilities, DeviceInfo, FrameWait, NodeMap};

use crate::family::SimCameraSpec;
use crate::nodes::{NodeValue, SimNodeMap};
use crate::stream::{
    fill_pattern, pattern_level, FrameStep, SimClock, SimController, SimFrame, SlotQueue,
};

/// Device-owned 模式下驱动自行分配的默认 Buffer 数量
const DEFAULT_DRIVER_BUFFERS: usize = 10;

/// 采集进行中的引擎状态
struct Engine {
    queue: SlotQueue,
    /// 引擎自己分配的区域 (Device-owned 模式)
    internal: Option<BufferRegion>,
    /// SingleFrame 模式下剩余可交付的帧数
    remaining: Option<u32>,
    triggered: bool,
}

/// 模拟相机
pub struct SimCamera {
    info: DeviceInfo,
    spec: SimCameraSpec,
    nodes: SimNodeMap,
    stream_nodes: SimNodeMap,
    streaming: Arc<AtomicBool>,
    initialized: bool,
    ownership: BufferOwnership,
    bound: Option<BufferRegion>,
    engine: Option<Engine>,
    /// 引擎停止后仍未归还的 Slot 会回到这个队列
    recycle: Option<SlotQueue>,
    controller: SimController,
    clock: Arc<SimClock>,
    frame_counter: AtomicU64,
    /// 所属系统的打开登记表 (枚举阶段的临时探针为 None)
    registry: Option<Arc<Mutex<HashSet<String>>>>,
}

impl fmt::Debug for SimCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCamera")
            .field("serial", &self.info.serial_number)
            .field("initialized", &self.initialized)
            .field("streaming", &self.is_streaming())
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl SimCamera {
    pub(crate) fn new(
        info: DeviceInfo,
        spec: SimCameraSpec,
        controller: SimController,
        clock: Arc<SimClock>,
        registry: Option<Arc<Mutex<HashSet<String>>>>,
    ) -> Self {
        let streaming = Arc::new(AtomicBool::new(false));
        let nodes = spec.build_nodes(streaming.clone());
        let stream_nodes = spec.build_stream_nodes(streaming.clone());
        Self {
            info,
            spec,
            nodes,
            stream_nodes,
            streaming,
            initialized: false,
            ownership: BufferOwnership::Device,
            bound: None,
            engine: None,
            recycle: None,
            controller,
            clock,
            frame_counter: AtomicU64::new(0),
            registry,
        }
    }

    /// 测试用：直接访问模拟节点表
    pub fn sim_nodes(&self) -> &SimNodeMap {
        &self.nodes
    }

    pub fn controller(&self) -> &SimController {
        &self.controller
    }

    pub fn export_state(&self) -> serde_json::Value {
        serde_json::json!({
            "backend": "simulation",
            "serial": self.info.serial_number,
            "streaming": self.is_streaming(),
            "nodes": self.nodes.export_state(),
            "stream": self.stream_nodes.export_state(),
        })
    }

    fn require_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CameraError::NotInitialized)
        }
    }

    fn check_region(&self, region: &BufferRegion) -> Result<()> {
        let caps = self.spec.capabilities;
        if self.ownership != BufferOwnership::Pool {
            return Err(CameraError::BufferBinding(
                "buffer ownership is not set to pool".into(),
            ));
        }
        let layout_ok = match region.layout() {
            BufferLayout::Contiguous => caps.contains(Capabilities::CONTIGUOUS_BUFFERS),
            BufferLayout::Scattered => caps.contains(Capabilities::SCATTERED_BUFFERS),
        };
        if !layout_ok {
            return Err(CameraError::BufferBinding(format!(
                "{:?} layout not supported",
                region.layout()
            )));
        }
        if region.slot_size() < self.spec.payload_size() {
            return Err(CameraError::BufferBinding(format!(
                "slot of {} bytes is smaller than payload {}",
                region.slot_size(),
                self.spec.payload_size()
            )));
        }
        if let Some(align) = self.spec.transport.packet_alignment() {
            if region.slot_size() % align != 0 {
                return Err(CameraError::BufferBinding(format!(
                    "slot size {} is not a multiple of {}",
                    region.slot_size(),
                    align
                )));
            }
        }
        if !region.is_whole() || region.slot_count() == 0 {
            return Err(CameraError::BufferBinding("region has missing slots".into()));
        }
        Ok(())
    }

    /// 把 Slot 从区域移入空闲队列
    fn load_queue(region: &mut BufferRegion) -> SlotQueue {
        let (tx, rx) = crossbeam_channel::bounded(region.slot_count());
        for i in 0..region.slot_count() {
            if let Some(slot) = region.take_slot(i) {
                let _ = tx.send((i, slot));
            }
        }
        (tx, rx)
    }

    /// 把队列中的 Slot 放回区域
    fn drain_queue(queue: &SlotQueue, region: &mut BufferRegion) {
        while let Ok((index, slot)) = queue.1.try_recv() {
            if region.return_slot(index, slot).is_err() {
                tracing::warn!("Slot {} could not be returned to {}", index, region.id());
            }
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<FrameWait> {
        std::thread::sleep(timeout);
        Ok(FrameWait::TimedOut)
    }

    fn produce(&mut self, status: ImageStatus, timeout: Duration) -> Result<FrameWait> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(CameraError::InvalidState("acquisition not started".into()));
        };
        if let Some(remaining) = engine.remaining.as_mut() {
            if *remaining == 0 {
                std::thread::sleep(timeout);
                return Ok(FrameWait::TimedOut);
            }
            *remaining -= 1;
        }
        let triggered = engine.triggered;
        // 所有 Slot 都在下游手里时引擎没有地方写数据
        let (index, mut slot) = match engine.queue.1.recv_timeout(timeout) {
            Ok(s) => s,
            Err(_) => return Ok(FrameWait::TimedOut),
        };
        let recycle = engine.queue.0.clone();

        let frame_id = self.frame_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let level = pattern_level(self.info.index, frame_id);
        fill_pattern(
            &mut slot,
            self.spec.pixel_format,
            self.spec.width,
            self.spec.height,
            level,
        );

        let exposure = self.nodes.get_float(nodes::EXPOSURE_TIME).ok();
        let stats = self.controller.stats_arc();
        stats.delivered.fetch_add(1, Ordering::AcqRel);

        let frame = SimFrame {
            slot: Some((index, slot)),
            recycle,
            stats,
            frame_id,
            width: self.spec.width,
            height: self.spec.height,
            format: self.spec.pixel_format,
            payload: self.spec.payload_size(),
            timestamp: Timestamp {
                hw_raw_ns: self.clock.now_ns() + self.spec.clock_skew_ns,
            },
            status,
            metadata: FrameMetadata {
                actual_exposure_us: exposure,
                trigger_fired: triggered,
            },
        };
        Ok(FrameWait::Ready(Box::new(frame)))
    }
}

impl Camera for SimCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn init(&mut self) -> Result<()> {
        if self.spec.fail_init {
            return Err(CameraError::SimulationError(format!(
                "{} failed to initialize",
                self.info.serial_number
            )));
        }
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Err(CameraError::InvalidState(
                "cannot deinit while streaming".into(),
            ));
        }
        self.initialized = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn node_map(&self) -> &dyn NodeMap {
        &self.nodes
    }

    fn stream_node_map(&self) -> &dyn NodeMap {
        &self.stream_nodes
    }

    fn payload_size(&self) -> Result<usize> {
        self.require_init()?;
        let size = self.nodes.get_integer(nodes::PAYLOAD_SIZE)?;
        Ok(size as usize)
    }

    fn capabilities(&self) -> Capabilities {
        self.spec.capabilities
    }

    fn buffer_ownership(&self) -> BufferOwnership {
        self.ownership
    }

    fn set_buffer_ownership(&mut self, ownership: BufferOwnership) -> Result<()> {
        if self.is_streaming() {
            return Err(CameraError::InvalidState(
                "cannot change buffer ownership while streaming".into(),
            ));
        }
        if ownership == BufferOwnership::Pool
            && !self.spec.capabilities.contains(Capabilities::USER_BUFFERS)
        {
            return Err(CameraError::BufferBinding(
                "device does not accept user buffers".into(),
            ));
        }
        self.ownership = ownership;
        Ok(())
    }

    fn bind_buffers(&mut self, region: BufferRegion) -> std::result::Result<(), BindRejected> {
        let check = if self.is_streaming() {
            Err(CameraError::InvalidState("cannot bind while streaming".into()))
        } else if self.bound.is_some() {
            Err(CameraError::BufferBinding("a region is already bound".into()))
        } else {
            self.check_region(&region)
        };
        match check {
            Ok(()) => {
                tracing::debug!(
                    "{} bound {} ({} x {} bytes)",
                    self.info.serial_number,
                    region.id(),
                    region.slot_count(),
                    region.slot_size()
                );
                self.bound = Some(region);
                Ok(())
            }
            Err(error) => Err(BindRejected { error, region }),
        }
    }

    fn unbind_buffers(&mut self) -> Option<BufferRegion> {
        if self.is_streaming() {
            return None;
        }
        let mut region = self.bound.take()?;
        if let Some(queue) = self.recycle.take() {
            Self::drain_queue(&queue, &mut region);
            if !region.is_whole() {
                tracing::warn!(
                    "{} returned with {} of {} slots",
                    region.id(),
                    region.slots_present(),
                    region.slot_count()
                );
                // 仍在外面的 Slot 稍后归还时还需要这个队列
                self.recycle = Some(queue);
            }
        }
        Some(region)
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        self.require_init()?;
        if self.is_streaming() {
            return Err(CameraError::InvalidState("acquisition already started".into()));
        }

        let (queue, internal) = match self.ownership {
            BufferOwnership::Pool => {
                let region = self.bound.as_mut().ok_or_else(|| {
                    CameraError::BufferBinding("no buffers bound for pool ownership".into())
                })?;
                if let Some(old) = self.recycle.take() {
                    Self::drain_queue(&old, region);
                }
                (Self::load_queue(region), None)
            }
            BufferOwnership::Device => {
                let count = match self.stream_nodes.get_enum(nodes::STREAM_BUFFER_COUNT_MODE) {
                    Ok(mode) if mode == entries::MANUAL => self
                        .stream_nodes
                        .get_integer(nodes::STREAM_BUFFER_COUNT_MANUAL)
                        .map(|n| n as usize)
                        .unwrap_or(DEFAULT_DRIVER_BUFFERS),
                    _ => DEFAULT_DRIVER_BUFFERS,
                };
                let slot_size = match self.spec.transport.packet_alignment() {
                    Some(a) => self.spec.payload_size().div_ceil(a) * a,
                    None => self.spec.payload_size(),
                };
                let mut region =
                    BufferRegion::allocate(BufferLayout::Scattered, slot_size, count, 1);
                (Self::load_queue(&mut region), Some(region))
            }
        };

        let slots = queue.1.len();
        if self.stream_nodes.is_available(nodes::STREAM_BUFFER_COUNT_RESULT) {
            self.stream_nodes.poke(
                nodes::STREAM_BUFFER_COUNT_RESULT,
                NodeValue::Integer {
                    value: slots as i64,
                    min: 0,
                    max: 1024,
                },
            );
        }

        let remaining = match self.nodes.get_enum(nodes::ACQUISITION_MODE) {
            Ok(mode) if mode == entries::SINGLE_FRAME => Some(1),
            _ => None,
        };
        let triggered = self
            .nodes
            .get_enum(nodes::TRIGGER_MODE)
            .map(|m| m == entries::ON)
            .unwrap_or(false);

        self.engine = Some(Engine {
            queue,
            internal,
            remaining,
            triggered,
        });
        self.streaming.store(true, Ordering::Release);
        tracing::debug!(
            "{} acquisition started with {} buffers",
            self.info.serial_number,
            slots
        );
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        let Some(engine) = self.engine.take() else {
            return Err(CameraError::InvalidState("acquisition not started".into()));
        };
        self.streaming.store(false, Ordering::Release);

        if engine.internal.is_none() {
            if let Some(region) = self.bound.as_mut() {
                Self::drain_queue(&engine.queue, region);
            }
            // 下游还没 release 的帧之后会把 Slot 送回这个队列
            self.recycle = Some(engine.queue);
        }
        tracing::debug!("{} acquisition stopped", self.info.serial_number);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameWait> {
        if !self.is_streaming() {
            return Err(CameraError::InvalidState("acquisition not started".into()));
        }
        match self.controller.next_step() {
            FrameStep::Complete => self.produce(ImageStatus::NoError, timeout),
            FrameStep::Incomplete(status) => self.produce(status, timeout),
            FrameStep::Timeout => self.wait_timeout(timeout),
            FrameStep::Delay(d) if d >= timeout => self.wait_timeout(timeout),
            FrameStep::Delay(d) => {
                let started = Instant::now();
                std::thread::sleep(d);
                self.produce(ImageStatus::NoError, timeout.saturating_sub(started.elapsed()))
            }
            FrameStep::Hang(d) => {
                std::thread::sleep(d);
                self.produce(ImageStatus::NoError, timeout)
            }
            FrameStep::Fail(reason) => Err(CameraError::Disconnected(reason)),
        }
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.info.id);
        }
    }
}
