use std::sync::Arc;
use std::time::{Duration, Instant};

use synccap::error::{AcquisitionError, AllocationError};
use synccap::orchestrator::FailureReason;
use synccap::pipeline::CapturePipeline;
use synccap::session::SessionState;
use synccap_core::buffer::{BufferLayout, BufferOwnership};
use synccap_core::builder::{AcquisitionMode, PipelineConfig};
use synccap_core::frame::ImageStatus;
use synccap_core::telemetry::HealthStatus;
use synccap_simulation::{FrameStep, SimCameraSpec, SimSystem};

/// 64x48 Mono8，USB3 对齐到 1024 之后每个 Slot 3072 字节
const SLOT_BYTES: usize = 3072;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> PipelineConfig {
    PipelineConfig::new().timeout_ms(200).cycle_grace_ms(100)
}

#[test]
fn healthy_rig_yields_ordered_complete_batches() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(3));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config())?;
    let report = pipeline.start()?;
    assert_eq!(report.streaming.len(), 3);
    assert_eq!(report.triggered.len(), 3);
    assert_eq!(report.buffers.plans.len(), 3);
    assert_eq!(report.buffers.max_aligned_size(), SLOT_BYTES);

    for cycle in 1..=5 {
        let batch = pipeline.capture_cycle()?;
        assert_eq!(batch.cycle(), cycle);
        assert_eq!(batch.len(), 3);
        assert!(batch.is_complete());
        let order: Vec<usize> = batch.entries().iter().map(|e| e.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        for (_, image) in batch.images() {
            assert!(image.metadata.trigger_fired);
            assert_eq!(image.len(), 64 * 48);
        }
        assert!(batch.timestamp_spread().is_some());
        assert!(batch.escalated().is_empty());
    }

    assert!(pipeline
        .status()
        .iter()
        .all(|s| s.state == SessionState::Streaming && s.health == HealthStatus::Healthy));

    pipeline.stop()?;
    assert!(!pipeline.is_running());
    assert!(!system.is_initialized());
    assert_eq!(system.open_handles(), 0);
    assert!(matches!(pipeline.capture_cycle(), Err(AcquisitionError::NotRunning)));
    Ok(())
}

#[test]
fn incomplete_frame_is_isolated_and_buffers_recycle() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(3));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config().buffer_count(2))?;
    pipeline.start()?;

    let middle = system.controller("19300001").expect("controller");
    middle.push(FrameStep::Incomplete(ImageStatus::DataOverflow));

    let batch = pipeline.capture_cycle()?;
    assert_eq!(batch.failures().count(), 1);
    assert_eq!(
        batch.entries()[1].failure(),
        Some(&FailureReason::Incomplete {
            status: ImageStatus::DataOverflow
        })
    );
    assert!(batch.entries()[0].image().is_some());
    assert!(batch.entries()[2].image().is_some());

    // 只有两个 Slot，十个周期都成功说明 Buffer 全部归还
    for _ in 0..10 {
        assert!(pipeline.capture_cycle()?.is_complete());
    }
    assert_eq!(middle.stats().outstanding(), 0);
    pipeline.stop()?;
    Ok(())
}

#[test]
fn hung_device_does_not_hold_the_batch() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(3));
    let config = PipelineConfig::new().timeout_ms(100).cycle_grace_ms(50);
    let mut pipeline = CapturePipeline::new(system.clone(), config)?;
    pipeline.start()?;

    let stuck = system.controller("19300002").expect("controller");
    stuck.push(FrameStep::Hang(Duration::from_millis(600)));

    let started = Instant::now();
    let batch = pipeline.capture_cycle()?;
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(batch.entries()[2].failure(), Some(&FailureReason::DeadlineExceeded));
    assert_eq!(batch.images().count(), 2);

    // 仍在运行的任务在下个周期报告 Busy，不会重复发起
    let batch = pipeline.capture_cycle()?;
    assert_eq!(batch.entries()[2].failure(), Some(&FailureReason::Busy));

    // 卡住的调用返回后会话被收回
    std::thread::sleep(Duration::from_millis(600));
    let batch = pipeline.capture_cycle()?;
    assert!(batch.is_complete());
    pipeline.stop()?;
    assert_eq!(system.open_handles(), 0);
    Ok(())
}

#[test]
fn timed_out_device_is_reported_and_retried() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config())?;
    pipeline.start()?;

    system
        .controller("19300000")
        .expect("controller")
        .push(FrameStep::Timeout);

    let started = Instant::now();
    let batch = pipeline.capture_cycle()?;
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(
        batch.entries()[0].failure(),
        Some(&FailureReason::TimedOut { timeout_ms: 200 })
    );
    assert!(batch.entries()[1].image().is_some());
    assert!(pipeline.capture_cycle()?.is_complete());
    Ok(())
}

#[test]
fn repeated_failures_escalate() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let config = PipelineConfig::new().timeout_ms(20).failure_threshold(3);
    let mut pipeline = CapturePipeline::new(system.clone(), config)?;
    pipeline.start()?;

    let flaky = system.controller("19300001").expect("controller");
    flaky.push_many(std::iter::repeat(FrameStep::Timeout).take(3));

    assert!(pipeline.capture_cycle()?.escalated().is_empty());
    assert!(pipeline.capture_cycle()?.escalated().is_empty());
    let batch = pipeline.capture_cycle()?;
    assert_eq!(batch.escalated(), &["sim://19300001".to_string()]);
    assert!(matches!(pipeline.status()[1].health, HealthStatus::Critical(_)));

    // 成功一帧后连续失败清零
    let batch = pipeline.capture_cycle()?;
    assert!(batch.is_complete());
    assert!(batch.escalated().is_empty());
    Ok(())
}

#[test]
fn device_without_counter_runs_free() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::new(vec![
        SimCameraSpec::blackfly_s("A"),
        SimCameraSpec::chameleon("B"),
        SimCameraSpec::oryx("C"),
    ]));
    let mut pipeline = CapturePipeline::new(system, fast_config())?;
    let report = pipeline.start()?;
    assert_eq!(report.free_running, vec!["B".to_string()]);
    assert_eq!(report.triggered, vec!["A".to_string(), "C".to_string()]);

    let batch = pipeline.capture_cycle()?;
    assert!(batch.is_complete());
    let fired: Vec<bool> = batch
        .images()
        .map(|(_, img)| img.metadata.trigger_fired)
        .collect();
    assert_eq!(fired, vec![true, false, true]);
    Ok(())
}

#[test]
fn leftover_trigger_mode_is_cleared_for_free_running_devices() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::new(vec![
        SimCameraSpec::chameleon("B").preset_enum("TriggerMode", "On"),
    ]));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config())?;
    let report = pipeline.start()?;
    assert_eq!(report.free_running, vec!["B".to_string()]);

    let batch = pipeline.capture_cycle()?;
    assert!(batch.is_complete());
    assert!(batch.images().all(|(_, img)| !img.metadata.trigger_fired));
    pipeline.stop()?;

    // 不配置触发时同样复位
    let system = Arc::new(SimSystem::new(vec![
        SimCameraSpec::blackfly_s("A").preset_enum("TriggerMode", "On"),
    ]));
    let mut pipeline = CapturePipeline::new(system, fast_config().free_running())?;
    let report = pipeline.start()?;
    assert_eq!(report.free_running, vec!["A".to_string()]);
    let batch = pipeline.capture_cycle()?;
    assert!(batch.images().all(|(_, img)| !img.metadata.trigger_fired));
    Ok(())
}

#[test]
fn faulted_device_is_excluded_but_reported() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::new(vec![
        SimCameraSpec::blackfly_s("A"),
        SimCameraSpec::blackfly_s("B").fail_init(),
        SimCameraSpec::blackfly_s("C"),
    ]));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config())?;
    let report = pipeline.start()?;
    assert_eq!(report.faulted.len(), 1);
    assert_eq!(report.streaming.len(), 2);

    let batch = pipeline.capture_cycle()?;
    assert_eq!(batch.len(), 3);
    assert!(matches!(
        batch.entries()[1].failure(),
        Some(FailureReason::Faulted { .. })
    ));
    assert_eq!(batch.images().count(), 2);

    // 掉线的设备之后一直以 Faulted 出现
    system.controller("C").expect("controller").push(FrameStep::Fail("link down".into()));
    let batch = pipeline.capture_cycle()?;
    assert!(matches!(batch.entries()[2].failure(), Some(FailureReason::Faulted { .. })));
    let batch = pipeline.capture_cycle()?;
    assert!(matches!(batch.entries()[2].failure(), Some(FailureReason::Faulted { .. })));
    assert!(batch.entries()[0].image().is_some());

    pipeline.stop()?;
    assert_eq!(system.open_handles(), 0);
    Ok(())
}

#[test]
fn allocation_failure_reduces_device_set() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(3));
    // 刚好容纳两台设备的 10 个 Slot
    let config = fast_config().memory_budget(2 * 10 * SLOT_BYTES);
    let mut pipeline = CapturePipeline::new(system, config)?;
    let report = pipeline.start()?;
    assert_eq!(report.streaming.len(), 2);
    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].0, "19300002");

    let batch = pipeline.capture_cycle()?;
    assert_eq!(batch.len(), 2);
    assert!(batch.is_complete());
    Ok(())
}

#[test]
fn allocation_failure_everywhere_prevents_start() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config().memory_budget(1024))?;
    let err = pipeline.start().unwrap_err();
    assert!(matches!(
        err,
        AcquisitionError::Allocation {
            source: AllocationError::BudgetExceeded { .. },
            ..
        }
    ));
    assert!(!pipeline.is_running());
    assert!(!pipeline.inventory().is_open());
    assert!(!system.is_initialized());
    Ok(())
}

#[test]
fn pipeline_restarts_after_stop() -> anyhow::Result<()> {
    init_logging();
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let mut pipeline = CapturePipeline::new(system.clone(), fast_config())?;
    for _ in 0..3 {
        pipeline.start()?;
        assert!(pipeline.capture_cycle()?.is_complete());
        pipeline.stop()?;
    }
    assert_eq!(system.init_count(), 3);
    assert!(matches!(pipeline.stop(), Err(AcquisitionError::NotRunning)));
    Ok(())
}

#[test]
fn alternative_buffer_configurations() -> anyhow::Result<()> {
    init_logging();
    let configs = [
        fast_config().buffer_layout(BufferLayout::Scattered),
        fast_config().buffer_ownership(BufferOwnership::Device),
        fast_config().acquisition_mode(AcquisitionMode::SingleFrame),
        fast_config().free_running(),
    ];
    for config in configs {
        let system = Arc::new(SimSystem::blackfly_rig(2));
        let mut pipeline = CapturePipeline::new(system, config.clone())?;
        pipeline.start()?;
        for _ in 0..3 {
            assert!(pipeline.capture_cycle()?.is_complete(), "{:?}", config);
        }
        pipeline.stop()?;
    }
    Ok(())
}

#[test]
fn empty_system_cannot_start() -> anyhow::Result<()> {
    let mut pipeline = CapturePipeline::new(Arc::new(SimSystem::new(Vec::new())), fast_config())?;
    assert!(matches!(pipeline.start(), Err(AcquisitionError::NoDevices)));
    assert!(!pipeline.inventory().is_open());
    Ok(())
}

#[test]
fn invalid_config_is_rejected() {
    let system = Arc::new(SimSystem::blackfly_rig(1));
    assert!(matches!(
        CapturePipeline::new(system, PipelineConfig::new().buffer_count(0)),
        Err(AcquisitionError::Config(_))
    ));
}

#[cfg(feature = "serialize")]
#[test]
fn batch_summary_and_state_export() -> anyhow::Result<()> {
    let system = Arc::new(SimSystem::blackfly_rig(2));
    let mut pipeline = CapturePipeline::new(system, fast_config())?;
    pipeline.start()?;
    let batch = pipeline.capture_cycle()?;

    let summary = batch.summary();
    assert_eq!(summary["cycle"], 1);
    assert_eq!(summary["complete"], true);
    assert_eq!(summary["entries"].as_array().map(|a| a.len()), Some(2));

    let state = pipeline.export_state();
    assert_eq!(state["running"], true);
    assert_eq!(state["sessions"][0]["state"], "Streaming");
    assert_eq!(state["sessions"][1]["complete_frames"], 1);
    Ok(())
}
