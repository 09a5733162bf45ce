// synccap/examples/haptic_loop.rs
//
// 用模拟设备驱动一个简化的触觉控制回路：每个 Batch 算出各相机画面的平均亮度，
// 当作 "位置反馈" 交给控制器。运行：
//   RUST_LOG=info cargo run --example haptic_loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use synccap::prelude::*;
use synccap_simulation::{FrameStep, SimCameraSpec, SimSystem};

/// 控制回路的替身：只记录每个周期的反馈
struct MockController {
    setpoint: f64,
    commands: usize,
}

impl MockController {
    fn update(&mut self, feedback: &[f64]) -> f64 {
        self.commands += 1;
        let mean = feedback.iter().sum::<f64>() / feedback.len().max(1) as f64;
        self.setpoint - mean
    }
}

fn mean_intensity(image: &CapturedImage) -> f64 {
    if image.data.is_empty() {
        return 0.0;
    }
    image.data.iter().map(|&p| p as f64).sum::<f64>() / image.data.len() as f64
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 1. 三台不同家族的相机：Blackfly S / Oryx 走硬件触发，Chameleon 自由运行
    let system = Arc::new(SimSystem::new(vec![
        SimCameraSpec::blackfly_s("19300001"),
        SimCameraSpec::oryx("20100002").clock_skew_ns(1_500),
        SimCameraSpec::chameleon("15000003"),
    ]));

    // 偶发的丢包与超时，展示部分失败不影响其它设备
    if let Some(c) = system.controller("20100002") {
        c.push_many([
            FrameStep::Complete,
            FrameStep::Complete,
            FrameStep::Incomplete(ImageStatus::MissingPackets),
        ]);
    }
    if let Some(c) = system.controller("15000003") {
        c.push_many([
            FrameStep::Complete,
            FrameStep::Complete,
            FrameStep::Complete,
            FrameStep::Timeout,
        ]);
    }

    let config = PipelineConfig::new()
        .timeout_ms(100)
        .cycle_grace_ms(50)
        .buffer_count(4);

    // 2. 启动
    let mut pipeline = CapturePipeline::new(system, config)?;
    let report = pipeline.start()?;
    println!(
        "Started: {} streaming, triggered {:?}, free-running {:?}",
        report.streaming.len(),
        report.triggered,
        report.free_running
    );

    // 3. 后台连续采集，控制回路只消费
    let feed = BatchFeed::spawn(pipeline, 2)?;
    let mut controller = MockController {
        setpoint: 128.0,
        commands: 0,
    };
    let started = Instant::now();

    while controller.commands < 10 {
        let Some(batch) = feed.recv_timeout(Duration::from_secs(1)) else {
            eprintln!("Feed stopped unexpectedly");
            break;
        };
        let feedback: Vec<f64> = batch.images().map(|(_, img)| mean_intensity(img)).collect();
        let error = controller.update(&feedback);

        print!("cycle {:>3} | ", batch.cycle());
        for entry in batch.entries() {
            match &entry.result {
                Ok(img) => print!("{}: #{:<4} ", entry.serial_number, img.frame_id),
                Err(why) => print!("{}: {} ", entry.serial_number, why),
            }
        }
        match batch.timestamp_spread() {
            Some(spread) => println!("| spread {:?} | error {:+.1}", spread, error),
            None => println!("| error {:+.1}", error),
        }
    }

    println!(
        "{} control updates in {:.2?}",
        controller.commands,
        started.elapsed()
    );

    // 4. 取回流水线并停止
    if let Some(mut pipeline) = feed.stop() {
        for status in pipeline.status() {
            println!(
                "{} {:?} {:?} ({:?})",
                status.serial_number, status.state, status.health, status.telemetry
            );
        }
        pipeline.stop()?;
    }
    Ok(())
}
