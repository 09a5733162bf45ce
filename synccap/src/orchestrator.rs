//! 并发采集编排：每个周期为每台设备发起一次 capture_next (fan-out)，
//! 全部到达终态后按枚举顺序组装 [`CaptureBatch`] (fan-in)。
//!
//! 会话本身被 move 进 `spawn_blocking` 任务，任务结束时连同结果一起交回，
//! 编排器手里只留一个 [`SessionProbe`] 的弱引用。超过周期期限仍未返回的任务留在
//! `InFlight` 槽位里，下个周期开头如果已经结束就收回；它晚到的帧直接丢弃。

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use synccap_core::frame::{CapturedImage, ImageStatus};
use synccap_core::telemetry::HealthStatus;

use crate::error::Result;
use crate::session::{
    DeviceAcquisitionSession, FrameOutcome, SessionProbe, SessionState, SessionStatus,
};

type CaptureTask = JoinHandle<(Box<DeviceAcquisitionSession>, Result<FrameOutcome>)>;

/// 某台设备在一个周期中没有交出图像的原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("no frame within {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    #[error("incomplete frame: {status}")]
    Incomplete { status: ImageStatus },

    /// 会话已进入 Faulted，不参与本周期
    #[error("session faulted: {reason}")]
    Faulted { reason: String },

    /// 任务没有在周期期限内返回
    #[error("capture did not finish before the cycle deadline")]
    DeadlineExceeded,

    /// 上个周期的任务仍在运行
    #[error("previous capture still in flight")]
    Busy,

    #[error("device error: {message}")]
    Device { message: String },

    /// 采集任务异常退出，会话已丢失
    #[error("capture task lost")]
    Lost,
}

/// Batch 中的一条记录
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub index: usize,
    pub device_id: String,
    pub serial_number: String,
    pub result: std::result::Result<CapturedImage, FailureReason>,
}

impl BatchEntry {
    pub fn image(&self) -> Option<&CapturedImage> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.result.as_ref().err()
    }
}

/// 一个采集周期的结果，组装完成后不可变
#[derive(Clone)]
pub struct CaptureBatch {
    cycle: u64,
    entries: Vec<BatchEntry>,
    elapsed: Duration,
    escalated: Vec<String>,
}

impl fmt::Debug for CaptureBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBatch")
            .field("cycle", &self.cycle)
            .field("entries", &self.entries.len())
            .field("failures", &self.failures().count())
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

impl CaptureBatch {
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// 按设备枚举顺序排列
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_complete(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| e.result.is_ok())
    }

    pub fn images(&self) -> impl Iterator<Item = (&BatchEntry, &CapturedImage)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.image().map(|img| (e, img)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&BatchEntry, &FailureReason)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.failure().map(|why| (e, why)))
    }

    pub fn get(&self, device_id: &str) -> Option<&BatchEntry> {
        self.entries.iter().find(|e| e.device_id == device_id)
    }

    /// 连续失败超过阈值的设备
    pub fn escalated(&self) -> &[String] {
        &self.escalated
    }

    /// 完整帧硬件时间戳的最大差值，少于两帧时为 None
    pub fn timestamp_spread(&self) -> Option<Duration> {
        let mut stamps = self.images().map(|(_, img)| img.timestamp.hw_raw_ns);
        let first = stamps.next()?;
        let (min, max, n) = stamps.fold((first, first, 1usize), |(lo, hi, n), t| {
            (lo.min(t), hi.max(t), n + 1)
        });
        (n > 1).then(|| Duration::from_nanos(max - min))
    }

    #[cfg(feature = "serialize")]
    pub fn summary(&self) -> serde_json::Value {
        let entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| match &e.result {
                Ok(img) => serde_json::json!({
                    "index": e.index,
                    "serial_number": e.serial_number,
                    "frame_id": img.frame_id,
                    "timestamp_ns": img.timestamp.hw_raw_ns,
                    "bytes": img.len(),
                }),
                Err(why) => serde_json::json!({
                    "index": e.index,
                    "serial_number": e.serial_number,
                    "failure": why.to_string(),
                }),
            })
            .collect();
        serde_json::json!({
            "cycle": self.cycle,
            "elapsed_ms": self.elapsed.as_secs_f64() * 1000.0,
            "complete": self.is_complete(),
            "timestamp_spread_ns": self.timestamp_spread().map(|d| d.as_nanos() as u64),
            "escalated": self.escalated,
            "entries": entries,
        })
    }
}

enum Slot {
    Parked(Box<DeviceAcquisitionSession>),
    InFlight(CaptureTask),
    Vacant,
}

struct Member {
    index: usize,
    device_id: String,
    serial_number: String,
    probe: Weak<SessionProbe>,
    slot: Slot,
}

impl Member {
    fn entry(&self, result: std::result::Result<CapturedImage, FailureReason>) -> BatchEntry {
        BatchEntry {
            index: self.index,
            device_id: self.device_id.clone(),
            serial_number: self.serial_number.clone(),
            result,
        }
    }

    /// 上个周期超期的任务如果已经结束，把会话收回来
    async fn reclaim_finished(&mut self) {
        let finished = matches!(&self.slot, Slot::InFlight(task) if task.is_finished());
        if !finished {
            return;
        }
        if let Slot::InFlight(task) = std::mem::replace(&mut self.slot, Slot::Vacant) {
            match task.await {
                Ok((session, late)) => {
                    tracing::debug!(
                        "[{}] late capture discarded ({})",
                        self.serial_number,
                        match &late {
                            Ok(outcome) => format!("{:?}", outcome.status()),
                            Err(e) => e.to_string(),
                        }
                    );
                    self.slot = Slot::Parked(session);
                }
                Err(e) => tracing::error!("[{}] capture task lost: {}", self.serial_number, e),
            }
        }
    }
}

fn to_entry_result(
    outcome: Result<FrameOutcome>,
    session: &DeviceAcquisitionSession,
) -> std::result::Result<CapturedImage, FailureReason> {
    match outcome {
        Ok(FrameOutcome::Complete(image)) => Ok(image),
        Ok(FrameOutcome::Incomplete { status }) => Err(FailureReason::Incomplete { status }),
        Ok(FrameOutcome::TimedOut { timeout_ms }) => Err(FailureReason::TimedOut { timeout_ms }),
        Err(e) if session.state() == SessionState::Faulted => Err(FailureReason::Faulted {
            reason: session
                .fault_reason()
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
        }),
        Err(e) => Err(FailureReason::Device {
            message: e.to_string(),
        }),
    }
}

/// 并发采集编排器
pub struct ConcurrentCaptureOrchestrator {
    members: Vec<Member>,
    cycle: u64,
    grace: Duration,
}

impl fmt::Debug for ConcurrentCaptureOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentCaptureOrchestrator")
            .field("devices", &self.members.len())
            .field("cycle", &self.cycle)
            .field("grace", &self.grace)
            .finish()
    }
}

impl ConcurrentCaptureOrchestrator {
    /// `grace` 是单设备超时之外，整个周期额外允许的等待时间
    pub fn new(sessions: Vec<DeviceAcquisitionSession>, grace: Duration) -> Self {
        let mut members: Vec<Member> = sessions
            .into_iter()
            .map(|session| Member {
                index: session.info().index,
                device_id: session.info().id.clone(),
                serial_number: session.info().serial_number.clone(),
                probe: session.probe(),
                slot: Slot::Parked(Box::new(session)),
            })
            .collect();
        members.sort_by_key(|m| m.index);
        Self {
            members,
            cycle: 0,
            grace,
        }
    }

    pub fn device_count(&self) -> usize {
        self.members.len()
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// 通过弱引用读取会话状态；会话已不存在的设备被跳过
    pub fn status(&self) -> Vec<SessionStatus> {
        self.members
            .iter()
            .filter_map(|m| m.probe.upgrade().map(|p| p.snapshot()))
            .collect()
    }

    /// 执行一个采集周期
    ///
    /// 每台 Streaming 设备一个阻塞任务，全部结束 (或周期期限 `timeout + grace` 到达) 后返回。
    /// Faulted 设备不参与，作为失败条目出现在 Batch 中。
    pub async fn capture_cycle(&mut self, timeout: Duration) -> CaptureBatch {
        let started = tokio::time::Instant::now();
        // 超出 Instant 表示范围时不设期限
        let deadline = started.checked_add(timeout.saturating_add(self.grace));
        self.cycle += 1;

        let mut results: Vec<Option<std::result::Result<CapturedImage, FailureReason>>> =
            Vec::with_capacity(self.members.len());

        // fan-out
        for member in self.members.iter_mut() {
            member.reclaim_finished().await;

            let slot = std::mem::replace(&mut member.slot, Slot::Vacant);
            let (slot, result) = match slot {
                Slot::Parked(session) if session.state() == SessionState::Streaming => {
                    let task = tokio::task::spawn_blocking(move || {
                        let mut session = session;
                        let outcome = session.capture_next(timeout);
                        (session, outcome)
                    });
                    (Slot::InFlight(task), None)
                }
                Slot::Parked(session) => {
                    let reason = session
                        .fault_reason()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("session is {:?}", session.state()));
                    (Slot::Parked(session), Some(Err(FailureReason::Faulted { reason })))
                }
                Slot::InFlight(task) => (Slot::InFlight(task), Some(Err(FailureReason::Busy))),
                Slot::Vacant => (Slot::Vacant, Some(Err(FailureReason::Lost))),
            };
            member.slot = slot;
            results.push(result);
        }

        // fan-in，按枚举顺序等待，总等待不超过 deadline
        for (member, result) in self.members.iter_mut().zip(results.iter_mut()) {
            if result.is_some() {
                continue;
            }
            let Slot::InFlight(task) = &mut member.slot else {
                continue;
            };
            let waited = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, task).await,
                None => Ok(task.await),
            };
            let joined = match waited {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        "[{}] capture still running at the cycle deadline",
                        member.serial_number
                    );
                    *result = Some(Err(FailureReason::DeadlineExceeded));
                    continue;
                }
            };
            match joined {
                Ok((session, outcome)) => {
                    *result = Some(to_entry_result(outcome, &session));
                    member.slot = Slot::Parked(session);
                }
                Err(e) => {
                    tracing::error!("[{}] capture task lost: {}", member.serial_number, e);
                    member.slot = Slot::Vacant;
                    *result = Some(Err(FailureReason::Lost));
                }
            }
        }

        let entries: Vec<BatchEntry> = self
            .members
            .iter()
            .zip(results)
            .map(|(member, result)| member.entry(result.unwrap_or(Err(FailureReason::Lost))))
            .collect();

        let escalated: Vec<String> = self
            .members
            .iter()
            .filter_map(|m| {
                let status = m.probe.upgrade()?.snapshot();
                match status.health {
                    HealthStatus::Critical(issue) => {
                        tracing::error!(
                            "[{}] escalated: {:?} after {} consecutive failures",
                            m.serial_number,
                            issue,
                            status.telemetry.consecutive_failures
                        );
                        Some(m.device_id.clone())
                    }
                    _ => None,
                }
            })
            .collect();

        let batch = CaptureBatch {
            cycle: self.cycle,
            entries,
            elapsed: started.elapsed(),
            escalated,
        };
        tracing::debug!(
            "Cycle {} assembled: {}/{} images in {:?}",
            batch.cycle,
            batch.images().count(),
            batch.len(),
            batch.elapsed
        );
        batch
    }

    /// 拆除编排器：交回所有停放的会话；仍在运行的任务被分离，会话在任务结束时释放
    pub fn shutdown(&mut self) -> Vec<DeviceAcquisitionSession> {
        let mut parked = Vec::new();
        let mut detached = 0usize;
        for member in self.members.drain(..) {
            match member.slot {
                Slot::Parked(session) => parked.push(*session),
                Slot::InFlight(task) => {
                    detached += 1;
                    drop(task);
                }
                Slot::Vacant => {}
            }
        }
        if detached > 0 {
            tracing::warn!("{} capture tasks detached at shutdown", detached);
        }
        parked
    }
}

impl Drop for ConcurrentCaptureOrchestrator {
    fn drop(&mut self) {
        // 会话的 Drop 负责停止采集
        drop(self.shutdown());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccap_core::frame::Timestamp;

    fn image(ts: u64) -> CapturedImage {
        CapturedImage {
            data: vec![0; 4],
            width: 2,
            height: 2,
            format: synccap_core::pixel_format::PixelFormat::Mono8,
            frame_id: 1,
            timestamp: Timestamp { hw_raw_ns: ts },
            metadata: Default::default(),
        }
    }

    fn entry(index: usize, result: std::result::Result<CapturedImage, FailureReason>) -> BatchEntry {
        BatchEntry {
            index,
            device_id: format!("dev{}", index),
            serial_number: format!("{}", index),
            result,
        }
    }

    #[test]
    fn spread_covers_complete_frames_only() {
        let batch = CaptureBatch {
            cycle: 1,
            entries: vec![
                entry(0, Ok(image(1_000))),
                entry(1, Err(FailureReason::TimedOut { timeout_ms: 10 })),
                entry(2, Ok(image(1_450))),
            ],
            elapsed: Duration::from_millis(3),
            escalated: Vec::new(),
        };
        assert_eq!(batch.timestamp_spread(), Some(Duration::from_nanos(450)));
        assert!(!batch.is_complete());
        assert_eq!(batch.failures().count(), 1);
        assert_eq!(batch.get("dev2").and_then(|e| e.image()).map(|i| i.len()), Some(4));
    }

    #[test]
    fn single_image_has_no_spread() {
        let batch = CaptureBatch {
            cycle: 1,
            entries: vec![entry(0, Ok(image(5)))],
            elapsed: Duration::ZERO,
            escalated: Vec::new(),
        };
        assert_eq!(batch.timestamp_spread(), None);
        assert!(batch.is_complete());
    }
}
