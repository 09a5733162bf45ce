use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{AcquisitionError, Result};
use crate::orchestrator::CaptureBatch;
use crate::pipeline::CapturePipeline;

/// 后台连续采集：一个线程反复执行 capture_cycle，通过有界通道把 Batch 交给调用方
///
/// 通道满时后台线程阻塞在发送上 (背压)，控制回路处理不过来时不会堆积旧帧。
pub struct BatchFeed {
    batches: Receiver<CaptureBatch>,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<CapturePipeline>>,
}

impl fmt::Debug for BatchFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFeed")
            .field("queued", &self.batches.len())
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl BatchFeed {
    /// 接管一个已启动的流水线
    pub fn spawn(pipeline: CapturePipeline, capacity: usize) -> Result<Self> {
        if !pipeline.is_running() {
            return Err(AcquisitionError::NotRunning);
        }
        let (batch_tx, batches) = bounded::<CaptureBatch>(capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = std::thread::Builder::new()
            .name("synccap-feed".into())
            .spawn(move || {
                let mut pipeline = pipeline;
                loop {
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }
                    let batch = match pipeline.capture_cycle() {
                        Ok(batch) => batch,
                        Err(e) => {
                            tracing::error!("Batch feed stopped: {}", e);
                            break;
                        }
                    };
                    select! {
                        send(batch_tx, batch) -> sent => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                tracing::debug!("Batch feed worker exiting");
                pipeline
            })
            .map_err(AcquisitionError::Runtime)?;

        Ok(Self {
            batches,
            stop_tx,
            worker: Some(worker),
        })
    }

    /// 阻塞等待下一个 Batch；后台线程退出后返回 None
    pub fn recv(&self) -> Option<CaptureBatch> {
        self.batches.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<CaptureBatch> {
        match self.batches.recv_timeout(timeout) {
            Ok(batch) => Some(batch),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<CaptureBatch> {
        self.batches.try_recv().ok()
    }

    /// 已排队、尚未取走的 Batch 数量
    pub fn queued(&self) -> usize {
        self.batches.len()
    }

    fn halt(&mut self) -> Option<CapturePipeline> {
        let worker = self.worker.take()?;
        let _ = self.stop_tx.try_send(());
        match worker.join() {
            Ok(pipeline) => Some(pipeline),
            Err(_) => {
                tracing::error!("Batch feed worker panicked");
                None
            }
        }
    }

    /// 停止后台线程并交回流水线 (仍处于 Streaming，由调用方 stop)
    pub fn stop(mut self) -> Option<CapturePipeline> {
        self.halt()
    }
}

impl Drop for BatchFeed {
    fn drop(&mut self) {
        // 流水线随之 Drop 并停止
        drop(self.halt());
    }
}
