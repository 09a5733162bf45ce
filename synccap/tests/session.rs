use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use synccap::error::{AcquisitionError, ContextError};
use synccap::inventory::{ConnectionState, DeviceInventory};
use synccap::pool::FrameBufferPool;
use synccap::session::{DeviceAcquisitionSession, FrameOutcome, SessionState};
use synccap_core::buffer::BufferOwnership;
use synccap_core::builder::{AcquisitionMode, PipelineConfig};
use synccap_core::frame::ImageStatus;
use synccap_core::traits::{Camera, DeviceInfo, DeviceSystem};
use synccap_simulation::{pattern_level, FrameStep, SimCameraSpec, SimSystem};

fn pooled_session(
    inventory: &DeviceInventory,
    index: usize,
    config: &PipelineConfig,
) -> anyhow::Result<DeviceAcquisitionSession> {
    let device = inventory.devices()[index].clone();
    let (camera, lease) = inventory.open_device(&device)?;
    let mut session = DeviceAcquisitionSession::new(camera, config.clone(), lease);
    session.initialize()?;
    let plan = FrameBufferPool::size(
        session.payload_size()?,
        device.info().transport.packet_alignment(),
        config.buffer_count,
    );
    session.attach_pool(FrameBufferPool::allocate(plan, None)?)?;
    Ok(session)
}

fn open_rig(count: usize) -> anyhow::Result<(Arc<SimSystem>, DeviceInventory)> {
    let system = Arc::new(SimSystem::blackfly_rig(count));
    let inventory = DeviceInventory::new(system.clone());
    inventory.open_context()?;
    inventory.enumerate()?;
    Ok((system, inventory))
}

#[test]
fn streaming_lifecycle_and_idempotent_end() -> anyhow::Result<()> {
    let (system, inventory) = open_rig(1)?;
    let config = PipelineConfig::new().free_running().buffer_count(3);
    let mut session = pooled_session(&inventory, 0, &config)?;

    // 从未开始时 end 是空操作
    session.end_streaming()?;
    assert_eq!(session.state(), SessionState::Idle);

    session.begin_streaming()?;
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(session.pool().map(|p| p.is_lent()).unwrap_or(false));
    assert_eq!(inventory.devices()[0].connection_state(), ConnectionState::Streaming);

    let image = session.capture_next(Duration::from_millis(100))?.into_result()?;
    assert_eq!((image.width, image.height), (64, 48));
    assert!(image.data.iter().all(|&p| p == pattern_level(0, image.frame_id)));

    session.end_streaming()?;
    let after_first = (session.state(), session.pool().map(|p| p.is_idle()));
    session.end_streaming()?;
    assert_eq!((session.state(), session.pool().map(|p| p.is_idle())), after_first);
    assert_eq!(after_first, (SessionState::Idle, Some(true)));

    let stats = system.controller("19300000").expect("controller");
    assert_eq!(stats.stats().outstanding(), 0);

    drop(session);
    inventory.close_context(Duration::from_millis(100))?;
    Ok(())
}

#[test]
fn incomplete_frame_releases_its_buffer() -> anyhow::Result<()> {
    let (system, inventory) = open_rig(1)?;
    let controller = system.controller("19300000").expect("controller");
    // 只有一个 Slot：不完整帧如果不归还，下一帧就拿不到 Buffer
    let config = PipelineConfig::new().free_running().buffer_count(1);
    let mut session = pooled_session(&inventory, 0, &config)?;
    session.begin_streaming()?;

    controller.push(FrameStep::Incomplete(ImageStatus::MissingPackets));
    let outcome = session.capture_next(Duration::from_millis(100))?;
    assert!(matches!(
        outcome,
        FrameOutcome::Incomplete {
            status: ImageStatus::MissingPackets
        }
    ));

    for _ in 0..3 {
        let outcome = session.capture_next(Duration::from_millis(100))?;
        assert!(matches!(outcome, FrameOutcome::Complete(_)));
    }
    assert_eq!(session.telemetry().incomplete_frames, 1);
    assert_eq!(session.telemetry().complete_frames, 3);
    assert_eq!(controller.stats().outstanding(), 0);
    assert_eq!(controller.stats().leaked.load(std::sync::atomic::Ordering::Acquire), 0);
    Ok(())
}

#[test]
fn timeout_is_not_an_error() -> anyhow::Result<()> {
    let (system, inventory) = open_rig(1)?;
    let controller = system.controller("19300000").expect("controller");
    let mut session = pooled_session(&inventory, 0, &PipelineConfig::new().free_running())?;
    session.begin_streaming()?;

    controller.push(FrameStep::Timeout);
    let outcome = session.capture_next(Duration::from_millis(20))?;
    assert!(matches!(outcome, FrameOutcome::TimedOut { timeout_ms: 20 }));
    assert!(matches!(
        outcome.into_result(),
        Err(AcquisitionError::TimedOut { timeout_ms: 20 })
    ));
    assert_eq!(session.state(), SessionState::Streaming);
    Ok(())
}

#[test]
fn disconnect_faults_session() -> anyhow::Result<()> {
    let (system, inventory) = open_rig(1)?;
    let controller = system.controller("19300000").expect("controller");
    let mut session = pooled_session(&inventory, 0, &PipelineConfig::new().free_running())?;
    session.begin_streaming()?;

    controller.push(FrameStep::Fail("cable unplugged".into()));
    assert!(session.capture_next(Duration::from_millis(20)).is_err());
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(session.fault_reason().unwrap_or_default().contains("cable unplugged"));
    assert!(matches!(
        session.capture_next(Duration::from_millis(20)),
        Err(AcquisitionError::InvalidState { .. })
    ));

    // Faulted 会话拆除时仍然收回区域
    session.end_streaming()?;
    assert!(session.pool().map(|p| p.is_idle()).unwrap_or(false));
    Ok(())
}

#[test]
fn each_device_owns_a_distinct_region() -> anyhow::Result<()> {
    let (_system, inventory) = open_rig(3)?;
    let config = PipelineConfig::new().free_running();
    let mut sessions = (0..3)
        .map(|i| pooled_session(&inventory, i, &config))
        .collect::<anyhow::Result<Vec<_>>>()?;
    for s in sessions.iter_mut() {
        s.begin_streaming()?;
    }
    let ids: HashSet<_> = sessions
        .iter()
        .filter_map(|s| s.pool().map(|p| p.region_id()))
        .collect();
    assert_eq!(ids.len(), 3);
    Ok(())
}

#[test]
fn missing_acquisition_mode_is_configuration_error() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::new(vec![SimCameraSpec::blackfly_s("1").node_access(
        "AcquisitionMode",
        synccap_core::traits::NodeAccess::READ_ONLY,
    )]));
    let inventory = DeviceInventory::new(system);
    inventory.open_context()?;
    inventory.enumerate()?;

    let mut session = pooled_session(&inventory, 0, &PipelineConfig::new().free_running())?;
    let err = session.begin_streaming().unwrap_err();
    assert!(matches!(err, AcquisitionError::Configuration { .. }));
    assert_eq!(session.state(), SessionState::Faulted);
    // 区域没有留在引擎里
    assert!(session.pool().map(|p| p.is_idle()).unwrap_or(false));
    assert_eq!(inventory.devices()[0].connection_state(), ConnectionState::Faulted);
    Ok(())
}

#[test]
fn rejected_binding_returns_ownership_to_device() -> anyhow::Result<()> {
    let (_system, inventory) = open_rig(1)?;
    let config = PipelineConfig::new().free_running();
    let device = inventory.devices()[0].clone();
    let (camera, lease) = inventory.open_device(&device)?;
    let mut session = DeviceAcquisitionSession::new(camera, config, lease);
    session.initialize()?;

    // Slot 比一帧小，引擎拒绝绑定
    let undersized = FrameBufferPool::size(100, Some(1024), 2);
    session.attach_pool(FrameBufferPool::allocate(undersized, None)?)?;

    let err = session.begin_streaming().unwrap_err();
    assert!(matches!(err, AcquisitionError::Configuration { .. }));
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(session.pool().map(|p| p.is_idle()).unwrap_or(false));
    assert_eq!(session.buffer_ownership(), BufferOwnership::Device);
    Ok(())
}

#[test]
fn single_frame_mode_rearms_between_captures() -> anyhow::Result<()> {
    let (_system, inventory) = open_rig(1)?;
    let config = PipelineConfig::new()
        .free_running()
        .acquisition_mode(AcquisitionMode::SingleFrame);
    let mut session = pooled_session(&inventory, 0, &config)?;
    session.begin_streaming()?;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let image = session.capture_next(Duration::from_millis(50))?.into_result()?;
        ids.push(image.frame_id);
    }
    assert_eq!(ids, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn context_waits_for_sessions() -> anyhow::Result<()> {
    let (system, inventory) = open_rig(2)?;
    assert!(matches!(inventory.open_context(), Err(ContextError::AlreadyOpen)));

    let session = pooled_session(&inventory, 0, &PipelineConfig::new().free_running())?;
    assert_eq!(inventory.active_sessions(), 1);
    assert!(matches!(
        inventory.close_context(Duration::from_millis(10)),
        Err(ContextError::SessionsOutstanding(1))
    ));

    // 在另一个线程里结束会话，close 等到它为止
    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        drop(session);
    });
    inventory.close_context(Duration::from_secs(2))?;
    worker.join().expect("worker");

    assert!(!inventory.is_open());
    assert!(!system.is_initialized());
    assert!(inventory
        .devices()
        .iter()
        .all(|d| d.connection_state() == ConnectionState::Deinitialized));

    // 关闭后可以再次打开
    inventory.open_context()?;
    assert_eq!(inventory.enumerate()?.len(), 2);
    assert_eq!(system.init_count(), 2);
    inventory.close_context(Duration::ZERO)?;
    Ok(())
}

/// 引用计数式的设备系统：重复 initialize 不报错，只增加计数
struct RefCountedSystem {
    inner: SimSystem,
    refs: AtomicUsize,
}

impl DeviceSystem for RefCountedSystem {
    fn library_version(&self) -> String {
        self.inner.library_version()
    }

    fn initialize(&self) -> synccap_core::error::Result<()> {
        if self.refs.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.initialize()?;
        }
        Ok(())
    }

    fn shutdown(&self) -> synccap_core::error::Result<()> {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.shutdown()?;
        }
        Ok(())
    }

    fn list_devices(&self) -> synccap_core::error::Result<Vec<DeviceInfo>> {
        self.inner.list_devices()
    }

    fn open(&self, id: &str) -> synccap_core::error::Result<Box<dyn Camera>> {
        self.inner.open(id)
    }
}

#[test]
fn one_open_context_per_system_across_inventories() -> anyhow::Result<()> {
    let system: Arc<dyn DeviceSystem> = Arc::new(RefCountedSystem {
        inner: SimSystem::blackfly_rig(1),
        refs: AtomicUsize::new(0),
    });
    let first = DeviceInventory::new(system.clone());
    let second = DeviceInventory::new(system.clone());

    first.open_context()?;
    assert!(matches!(second.open_context(), Err(ContextError::AlreadyOpen)));
    assert!(!second.is_open());

    // 另一个设备系统不受影响
    let other = DeviceInventory::new(Arc::new(SimSystem::blackfly_rig(1)));
    other.open_context()?;
    other.close_context(Duration::ZERO)?;

    first.close_context(Duration::ZERO)?;
    second.open_context()?;
    assert_eq!(second.enumerate()?.len(), 1);

    // 打开着的清单被丢弃后，上下文同样释放
    drop(second);
    first.open_context()?;
    first.close_context(Duration::ZERO)?;
    Ok(())
}
