use std::sync::Arc;
use std::time::{Duration, Instant};

use synccap::error::AcquisitionError;
use synccap::feed::BatchFeed;
use synccap::inventory::DeviceInventory;
use synccap::orchestrator::{ConcurrentCaptureOrchestrator, FailureReason};
use synccap::pipeline::CapturePipeline;
use synccap::pool::FrameBufferPool;
use synccap::session::DeviceAcquisitionSession;
use synccap_core::builder::PipelineConfig;
use synccap_simulation::{FrameStep, SimSystem};

fn streaming_sessions(
    inventory: &DeviceInventory,
    config: &PipelineConfig,
) -> anyhow::Result<Vec<DeviceAcquisitionSession>> {
    let mut sessions = Vec::new();
    // 故意倒序创建，验证 Batch 仍按枚举顺序排列
    for device in inventory.enumerate()?.into_iter().rev() {
        let (camera, lease) = inventory.open_device(&device)?;
        let mut session = DeviceAcquisitionSession::new(camera, config.clone(), lease);
        session.initialize()?;
        let plan = FrameBufferPool::size(
            session.payload_size()?,
            device.info().transport.packet_alignment(),
            config.buffer_count,
        );
        session.attach_pool(FrameBufferPool::allocate(plan, None)?)?;
        session.begin_streaming()?;
        sessions.push(session);
    }
    Ok(sessions)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn devices_are_captured_in_parallel() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(4));
    let inventory = DeviceInventory::new(system.clone());
    inventory.open_context()?;
    let config = PipelineConfig::new().free_running();
    let sessions = streaming_sessions(&inventory, &config)?;

    // 每台设备都要 150ms 才出帧，串行需要 600ms
    for i in 0..4 {
        system
            .controller(&format!("1930{:04}", i))
            .expect("controller")
            .push(FrameStep::Delay(Duration::from_millis(150)));
    }

    let mut orchestrator = ConcurrentCaptureOrchestrator::new(sessions, Duration::from_millis(100));
    let started = Instant::now();
    let batch = orchestrator.capture_cycle(Duration::from_millis(500)).await;
    assert!(started.elapsed() < Duration::from_millis(450));
    assert!(batch.is_complete());
    let order: Vec<usize> = batch.entries().iter().map(|e| e.index).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);

    assert_eq!(orchestrator.status().len(), 4);
    let sessions = orchestrator.shutdown();
    assert_eq!(sessions.len(), 4);
    drop(sessions);
    inventory.close_context(Duration::from_secs(1))?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbounded_grace_does_not_overflow_the_deadline() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let inventory = DeviceInventory::new(system.clone());
    inventory.open_context()?;
    let sessions = streaming_sessions(&inventory, &PipelineConfig::new().free_running())?;
    system
        .controller("19300000")
        .expect("controller")
        .push(FrameStep::Delay(Duration::from_millis(30)));

    // timeout + grace 超出 Instant 范围时退化为无期限等待
    let mut orchestrator = ConcurrentCaptureOrchestrator::new(sessions, Duration::MAX);
    let batch = orchestrator.capture_cycle(Duration::from_millis(200)).await;
    assert!(batch.is_complete());
    assert_eq!(batch.len(), 2);

    drop(orchestrator.shutdown());
    inventory.close_context(Duration::from_secs(1))?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detached_capture_releases_context_when_it_returns() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let inventory = DeviceInventory::new(system.clone());
    inventory.open_context()?;
    let sessions = streaming_sessions(&inventory, &PipelineConfig::new().free_running())?;

    system
        .controller("19300001")
        .expect("controller")
        .push(FrameStep::Hang(Duration::from_millis(300)));

    let mut orchestrator = ConcurrentCaptureOrchestrator::new(sessions, Duration::from_millis(20));
    let batch = orchestrator.capture_cycle(Duration::from_millis(50)).await;
    assert_eq!(batch.entries()[1].failure(), Some(&FailureReason::DeadlineExceeded));

    // 拆除时停放的会话交回，卡住的那个被分离
    let parked = orchestrator.shutdown();
    assert_eq!(parked.len(), 1);
    drop(parked);
    assert_eq!(inventory.active_sessions(), 1);

    let waiter = tokio::task::spawn_blocking(move || {
        inventory.close_context(Duration::from_secs(2))?;
        Ok::<_, anyhow::Error>(inventory)
    });
    let inventory = waiter.await??;
    assert!(!inventory.is_open());
    assert_eq!(system.open_handles(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_pipeline_api() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let mut pipeline = CapturePipeline::new(system, PipelineConfig::new().timeout_ms(200))?;
    pipeline.start()?;

    // 已在 Runtime 中，同步接口拒绝阻塞
    assert!(matches!(
        pipeline.capture_cycle(),
        Err(AcquisitionError::Runtime(_))
    ));

    for _ in 0..3 {
        assert!(pipeline.capture_cycle_async().await?.is_complete());
    }
    pipeline.stop()?;
    Ok(())
}

#[test]
fn feed_applies_back_pressure() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let config = PipelineConfig::new().timeout_ms(200).buffer_count(2);
    let mut pipeline = CapturePipeline::new(system.clone(), config)?;
    pipeline.start()?;

    let feed = BatchFeed::spawn(pipeline, 2)?;
    let first = feed.recv_timeout(Duration::from_secs(2)).expect("first batch");
    assert_eq!(first.cycle(), 1);

    // 不取走 Batch 时队列最多堆积 capacity 个
    std::thread::sleep(Duration::from_millis(200));
    assert!(feed.queued() <= 2);

    let mut last = first.cycle();
    for _ in 0..5 {
        let batch = feed.recv_timeout(Duration::from_secs(2)).expect("batch");
        assert_eq!(batch.cycle(), last + 1);
        assert!(batch.is_complete());
        last = batch.cycle();
    }

    let mut pipeline = feed.stop().expect("pipeline returned");
    assert!(pipeline.is_running());
    pipeline.stop()?;
    assert_eq!(system.open_handles(), 0);
    Ok(())
}

#[test]
fn feed_requires_running_pipeline() -> anyhow::Result<()> {
    let pipeline = CapturePipeline::new(
        Arc::new(SimSystem::blackfly_rig(1)),
        PipelineConfig::new(),
    )?;
    assert!(matches!(
        BatchFeed::spawn(pipeline, 1),
        Err(AcquisitionError::NotRunning)
    ));
    Ok(())
}
