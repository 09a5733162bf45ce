use std::fmt;

use crate::frame::ImageStatus;

/// 单个采集会话的运行统计
///
/// 每次 capture_next 之后更新一次；Pipeline 用它判断某个设备是否需要人工干预。
#[derive(Clone, Default, PartialEq)]
pub struct SessionTelemetry {
    /// 完整帧数量
    pub complete_frames: u64,

    /// 不完整帧数量 (丢包 / 校验失败等)
    pub incomplete_frames: u64,

    /// 等待超时次数
    pub timeouts: u64,

    /// 设备层错误 (断线 / 转换失败) 次数
    pub device_errors: u64,

    /// 当前连续失败次数，成功一帧即清零
    pub consecutive_failures: u32,

    /// 最近一次不完整帧的状态码
    pub last_incomplete_status: Option<ImageStatus>,

    /// 上一帧的设备帧 ID，用于估计丢帧
    pub last_frame_id: Option<u64>,

    /// 根据帧 ID 跳变估计的丢帧数
    pub skipped_frames: u64,

    // 当前连续失败中最近一次的种类
    streak_issue: Option<HealthIssue>,
}

impl fmt::Debug for SessionTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTelemetry")
            .field("ok", &self.complete_frames)
            .field("incomplete", &self.incomplete_frames)
            .field("timeouts", &self.timeouts)
            .field("errors", &self.device_errors)
            .field("streak", &self.consecutive_failures)
            .finish()
    }
}

/// 简单的状态指示灯
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning(HealthIssue),
    Critical(HealthIssue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthIssue {
    /// 连续等不到帧 (触发线断开 / 设备卡死)
    RepeatedTimeouts,
    /// 连续收到不完整帧 (带宽不足 / 线缆问题)
    RepeatedIncomplete,
    /// 设备层错误
    DeviceError,
    /// 帧 ID 出现跳变
    DroppedFrames,
}

impl SessionTelemetry {
    fn track_frame_id(&mut self, frame_id: u64) {
        if let Some(prev) = self.last_frame_id {
            if let Some(expected) = prev.checked_add(1) {
                if frame_id > expected {
                    self.skipped_frames += frame_id - expected;
                }
            }
        }
        self.last_frame_id = Some(frame_id);
    }

    pub fn record_complete(&mut self, frame_id: u64) {
        self.track_frame_id(frame_id);
        self.complete_frames += 1;
        self.consecutive_failures = 0;
        self.streak_issue = None;
    }

    fn record_failure(&mut self, issue: HealthIssue) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.streak_issue = Some(issue);
    }

    /// 不完整帧同样占用一个帧 ID，不算作跳帧
    pub fn record_incomplete(&mut self, frame_id: u64, status: ImageStatus) {
        self.track_frame_id(frame_id);
        self.incomplete_frames += 1;
        self.last_incomplete_status = Some(status);
        self.record_failure(HealthIssue::RepeatedIncomplete);
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.record_failure(HealthIssue::RepeatedTimeouts);
    }

    pub fn record_device_error(&mut self) {
        self.device_errors += 1;
        self.record_failure(HealthIssue::DeviceError);
    }

    pub fn total_attempts(&self) -> u64 {
        self.complete_frames + self.incomplete_frames + self.timeouts + self.device_errors
    }

    /// 基于统计数据的健康评估
    ///
    /// 连续失败达到 `threshold` 升级为 Critical，超过一半为 Warning。
    pub fn assess_health(&self, threshold: u32) -> HealthStatus {
        let threshold = threshold.max(1);

        if let Some(issue) = self.streak_issue {
            if self.consecutive_failures >= threshold {
                return HealthStatus::Critical(issue);
            }
            if self.consecutive_failures.saturating_mul(2) >= threshold {
                return HealthStatus::Warning(issue);
            }
        }

        if self.skipped_frames > 0 {
            return HealthStatus::Warning(HealthIssue::DroppedFrames);
        }

        HealthStatus::Healthy
    }
}
