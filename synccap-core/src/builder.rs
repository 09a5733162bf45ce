use std::time::Duration;

use thiserror::Error;

use crate::buffer::{BufferLayout, BufferOwnership};
use crate::pixel_format::PixelFormat;

/// 采集模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum AcquisitionMode {
    Continuous,
    SingleFrame,
}

impl AcquisitionMode {
    pub fn entry_name(&self) -> &'static str {
        match self {
            Self::Continuous => crate::nodes::entries::CONTINUOUS,
            Self::SingleFrame => crate::nodes::entries::SINGLE_FRAME,
        }
    }
}

/// 采集引擎内部队列满/取帧时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferHandlingMode {
    /// 按到达顺序交付，队列满时丢弃新帧
    OldestFirst,
    /// 按到达顺序交付，队列满时覆盖最旧的帧
    OldestFirstOverwrite,
    /// 先交付最新的帧
    NewestFirst,
    /// 只保留最新的一帧
    NewestOnly,
}

impl BufferHandlingMode {
    pub fn entry_name(&self) -> &'static str {
        match self {
            Self::OldestFirst => "OldestFirst",
            Self::OldestFirstOverwrite => "OldestFirstOverwrite",
            Self::NewestFirst => "NewestFirst",
            Self::NewestOnly => "NewestOnly",
        }
    }
}

/// 硬件 PWM 触发参数 (单位: 微秒)
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct TriggerSettings {
    /// Counter 高电平持续时间
    pub duration_us: u32,
    /// Counter 低电平持续时间
    pub delay_us: u32,
    /// 固定曝光时间
    pub exposure_us: f64,
    /// 是否打开辅助电压轨 (部分机型的输出线需要外部上拉)
    pub enable_aux_rail: bool,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            duration_us: 14_000,
            delay_us: 6_000,
            exposure_us: 5_000.0,
            enable_aux_rail: true,
        }
    }
}

impl TriggerSettings {
    pub fn period_us(&self) -> u64 {
        self.duration_us as u64 + self.delay_us as u64
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("buffer_count must be at least 1")]
    ZeroBufferCount,

    #[error("per-device timeout must be greater than zero")]
    ZeroTimeout,

    #[error("trigger duration and delay must both be positive (got {duration_us}/{delay_us})")]
    NonPositiveTrigger { duration_us: u32, delay_us: u32 },

    #[error("exposure {exposure_us}us does not fit in trigger period {period_us}us")]
    ExposureExceedsPeriod { exposure_us: f64, period_us: u64 },

    #[error("{field} of {ms} ms exceeds the maximum of {max} ms")]
    TimeoutTooLong {
        field: &'static str,
        ms: u64,
        max: u64,
    },

    #[error("consecutive failure threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("invalid config document: {0}")]
    Parse(String),
}

/// 单设备超时与调度余量的上限 (1 小时)
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Pipeline 配置 (Builder 风格)
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct PipelineConfig {
    pub acquisition_mode: AcquisitionMode,
    /// 单个设备等待下一帧的最长时间
    pub per_device_timeout_ms: u64,
    /// 整个 Cycle 在 per_device_timeout 之外额外允许的调度余量
    pub cycle_grace_ms: u64,
    /// 每个设备的帧缓冲数量，默认 10
    pub buffer_count: usize,
    pub buffer_layout: BufferLayout,
    pub buffer_ownership: BufferOwnership,
    pub buffer_handling: BufferHandlingMode,
    /// 下游控制环消费的像素格式
    pub target_format: PixelFormat,
    /// None 表示自由运行 (不配置硬件触发)
    pub trigger: Option<TriggerSettings>,
    /// 帧缓冲总内存上限 (字节)，None 表示不限制
    pub memory_budget_bytes: Option<usize>,
    /// 连续失败多少次后会话健康状态升级为 Critical
    pub consecutive_failure_threshold: u32,
    /// 后台 Runtime 的工作线程数，None 表示使用 CPU 核数
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            acquisition_mode: AcquisitionMode::Continuous,
            per_device_timeout_ms: 1000,
            cycle_grace_ms: 250,
            buffer_count: 10,
            buffer_layout: BufferLayout::Contiguous,
            buffer_ownership: BufferOwnership::Pool,
            buffer_handling: BufferHandlingMode::OldestFirst,
            target_format: PixelFormat::Mono8,
            trigger: Some(TriggerSettings::default()),
            memory_budget_bytes: None,
            consecutive_failure_threshold: 5,
            worker_threads: None,
        }
    }

    pub fn acquisition_mode(mut self, mode: AcquisitionMode) -> Self {
        self.acquisition_mode = mode;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.per_device_timeout_ms = ms;
        self
    }

    pub fn cycle_grace_ms(mut self, ms: u64) -> Self {
        self.cycle_grace_ms = ms;
        self
    }

    /// 设置每个设备的缓冲区数量 (默认 10)
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn buffer_layout(mut self, layout: BufferLayout) -> Self {
        self.buffer_layout = layout;
        self
    }

    pub fn buffer_ownership(mut self, ownership: BufferOwnership) -> Self {
        self.buffer_ownership = ownership;
        self
    }

    pub fn buffer_handling(mut self, mode: BufferHandlingMode) -> Self {
        self.buffer_handling = mode;
        self
    }

    pub fn target_format(mut self, fmt: PixelFormat) -> Self {
        self.target_format = fmt;
        self
    }

    pub fn trigger(mut self, settings: TriggerSettings) -> Self {
        self.trigger = Some(settings);
        self
    }

    /// 关闭硬件触发，设备自由运行
    pub fn free_running(mut self) -> Self {
        self.trigger = None;
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.consecutive_failure_threshold = n;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    pub fn per_device_timeout(&self) -> Duration {
        Duration::from_millis(self.per_device_timeout_ms)
    }

    /// 整个 Cycle 的截止时间 = 单设备超时 + 调度余量
    pub fn cycle_deadline(&self) -> Duration {
        self.per_device_timeout()
            .saturating_add(Duration::from_millis(self.cycle_grace_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_count == 0 {
            return Err(ConfigError::ZeroBufferCount);
        }
        if self.per_device_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        for (field, ms) in [
            ("per_device_timeout_ms", self.per_device_timeout_ms),
            ("cycle_grace_ms", self.cycle_grace_ms),
        ] {
            if ms > MAX_TIMEOUT_MS {
                return Err(ConfigError::TimeoutTooLong {
                    field,
                    ms,
                    max: MAX_TIMEOUT_MS,
                });
            }
        }
        if self.consecutive_failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if let Some(t) = &self.trigger {
            if t.duration_us == 0 || t.delay_us == 0 {
                return Err(ConfigError::NonPositiveTrigger {
                    duration_us: t.duration_us,
                    delay_us: t.delay_us,
                });
            }
            if t.exposure_us > t.period_us() as f64 {
                return Err(ConfigError::ExposureExceedsPeriod {
                    exposure_us: t.exposure_us,
                    period_us: t.period_us(),
                });
            }
        }
        Ok(())
    }

    /// 从 JSON 文档加载，缺省字段取默认值
    #[cfg(feature = "serialize")]
    pub fn from_json_str(doc: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
