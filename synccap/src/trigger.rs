//! 硬件 PWM 触发配置
//!
//! Counter0 以 1MHz Tick 计数，高电平 `duration` 微秒、低电平 `delay` 微秒，
//! 周期性地产生 Counter0Start 事件驱动曝光，同时把 Counter0Active 输出到一条 GPIO，
//! 供其它设备 (或外部控制器) 同步。

use synccap_core::error::CameraError;
use synccap_core::nodes::{self, entries, NodeMapExt};
use synccap_core::traits::NodeMap;

use crate::error::TriggerError;

/// 触发信号参数 (纯数据，创建后只读)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    counter_duration_us: u32,
    counter_delay_us: u32,
}

impl TriggerConfig {
    pub fn new(duration_us: u32, delay_us: u32) -> Result<Self, TriggerError> {
        if duration_us == 0 || delay_us == 0 {
            return Err(TriggerError::InvalidTiming {
                duration_us,
                delay_us,
            });
        }
        Ok(Self {
            counter_duration_us: duration_us,
            counter_delay_us: delay_us,
        })
    }

    pub fn counter_duration_us(&self) -> u32 {
        self.counter_duration_us
    }

    pub fn counter_delay_us(&self) -> u32 {
        self.counter_delay_us
    }

    pub fn period_us(&self) -> u64 {
        self.counter_duration_us as u64 + self.counter_delay_us as u64
    }

    /// duration / (duration + delay) * 100，恒在 (0, 100) 内
    pub fn duty_cycle_percent(&self) -> f64 {
        self.counter_duration_us as f64 / self.period_us() as f64 * 100.0
    }

    /// 1_000_000 / (duration + delay)
    pub fn pulse_rate_hz(&self) -> f64 {
        1_000_000.0 / self.period_us() as f64
    }
}

/// 绑定到 Counter 的输出线
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub line: String,
    /// 是否需要先把 LineMode 切换成 Output
    pub mode_switched: bool,
}

/// 单台设备上的触发配置结果
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerReport {
    pub config: TriggerConfig,
    /// None 表示没有可用输出线，计数器只驱动本机曝光
    pub output_line: Option<OutputLine>,
    /// 已打开的辅助电压轨所在的线
    pub aux_rail: Option<String>,
    /// 设备最大帧率 (可读时)
    pub device_frame_rate: Option<f64>,
}

impl TriggerReport {
    /// 脉冲频率是否超过设备能达到的帧率 (会丢触发)
    pub fn exceeds_frame_rate(&self) -> bool {
        self.device_frame_rate
            .map(|fps| self.config.pulse_rate_hz() > fps)
            .unwrap_or(false)
    }
}

/// 把节点错误分成 "能力缺失" 和 "设备故障"
fn classify(e: CameraError) -> TriggerError {
    if e.is_missing_capability() {
        TriggerError::CapabilityUnavailable(e.to_string())
    } else {
        TriggerError::Device(e)
    }
}

/// 在单台设备上编程 Counter / GPIO / 曝光触发
#[derive(Debug, Clone)]
pub struct TriggerSignalConfigurator {
    exposure_us: f64,
    enable_aux_rail: bool,
}

impl Default for TriggerSignalConfigurator {
    fn default() -> Self {
        Self::new(5_000.0, true)
    }
}

impl TriggerSignalConfigurator {
    pub fn new(exposure_us: f64, enable_aux_rail: bool) -> Self {
        Self {
            exposure_us,
            enable_aux_rail,
        }
    }

    /// 计算并编程触发信号
    ///
    /// 设备没有 Counter 时返回 [`TriggerError::CapabilityUnavailable`]，调用方应退回自由运行。
    pub fn configure(
        &self,
        map: &dyn NodeMap,
        duration_us: u32,
        delay_us: u32,
    ) -> Result<TriggerReport, TriggerError> {
        let config = TriggerConfig::new(duration_us, delay_us)?;

        // 1. Counter 能力探测
        if !map.is_writable(nodes::COUNTER_SELECTOR) {
            return Err(TriggerError::CapabilityUnavailable(
                "no writable CounterSelector".into(),
            ));
        }

        // 2. Counter0: 1MHz Tick，等待帧触发时输出高电平
        self.program_counter(map, &config).map_err(classify)?;

        // 3. GPIO
        let output_line = bind_output_line(map).map_err(classify)?;
        match &output_line {
            Some(out) => tracing::info!(
                "Counter0Active routed to {}{}",
                out.line,
                if out.mode_switched { " (line mode set to Output)" } else { "" }
            ),
            None => tracing::warn!("No output line can carry Counter0Active, trigger stays internal"),
        }

        let aux_rail = if self.enable_aux_rail {
            enable_aux_rail(map).map_err(classify)?
        } else {
            None
        };

        // 4. 曝光与触发源
        self.arm_exposure_and_trigger(map).map_err(classify)?;

        let device_frame_rate = map
            .require_readable(nodes::ACQUISITION_RESULTING_FRAME_RATE)
            .and_then(|_| map.get_float(nodes::ACQUISITION_RESULTING_FRAME_RATE))
            .ok();

        let report = TriggerReport {
            config,
            output_line,
            aux_rail,
            device_frame_rate,
        };

        tracing::info!(
            "Trigger programmed: duty cycle {:.0}%, pulse rate {:.0} Hz",
            config.duty_cycle_percent(),
            config.pulse_rate_hz()
        );
        if report.exceeds_frame_rate() {
            tracing::warn!(
                "Pulse rate {:.1} Hz exceeds device frame rate {:.1} Hz, triggers will be dropped",
                config.pulse_rate_hz(),
                report.device_frame_rate.unwrap_or_default()
            );
        }
        Ok(report)
    }

    fn program_counter(
        &self,
        map: &dyn NodeMap,
        config: &TriggerConfig,
    ) -> synccap_core::error::Result<()> {
        map.set_enum_checked(nodes::COUNTER_SELECTOR, entries::COUNTER0)?;
        map.set_enum_checked(nodes::COUNTER_EVENT_SOURCE, entries::MHZ_TICK)?;
        map.set_integer_checked(nodes::COUNTER_DURATION, config.counter_duration_us() as i64)?;
        map.set_integer_checked(nodes::COUNTER_DELAY, config.counter_delay_us() as i64)?;
        map.set_enum_checked(nodes::COUNTER_TRIGGER_SOURCE, entries::FRAME_TRIGGER_WAIT)?;
        map.set_enum_checked(nodes::COUNTER_TRIGGER_ACTIVATION, entries::LEVEL_HIGH)?;
        Ok(())
    }

    /// 关闭自动曝光，固定曝光时间，以 Counter0Start 作为触发源
    ///
    /// TriggerSource 只有在 TriggerMode=Off 时才可写，所以先关再开。
    pub fn arm_exposure_and_trigger(&self, map: &dyn NodeMap) -> synccap_core::error::Result<()> {
        map.set_enum_checked(nodes::EXPOSURE_AUTO, entries::OFF)?;
        map.set_float_checked(nodes::EXPOSURE_TIME, self.exposure_us)?;

        map.set_enum_checked(nodes::TRIGGER_MODE, entries::OFF)?;
        map.set_enum_checked(nodes::TRIGGER_SOURCE, entries::COUNTER0_START)?;
        match map.set_enum_checked(nodes::TRIGGER_OVERLAP, entries::READ_OUT) {
            Ok(()) => {}
            Err(e) if e.is_missing_capability() => {
                tracing::warn!("Trigger overlap not supported ({}), continuing", e);
            }
            Err(e) => return Err(e),
        }
        map.set_enum_checked(nodes::TRIGGER_MODE, entries::ON)?;
        Ok(())
    }

    /// 拆除时关闭触发模式，设备回到自由运行
    pub fn reset(map: &dyn NodeMap) -> Result<(), TriggerError> {
        if !map.is_writable(nodes::TRIGGER_MODE) {
            return Err(TriggerError::CapabilityUnavailable(
                "TriggerMode not writable".into(),
            ));
        }
        map.set_enum(nodes::TRIGGER_MODE, entries::OFF)?;
        tracing::debug!("Trigger mode reset to Off");
        Ok(())
    }
}

/// 逐条查询 LineSelector，找到第一条可以输出 Counter0Active 的线
fn bind_output_line(map: &dyn NodeMap) -> synccap_core::error::Result<Option<OutputLine>> {
    if !map.is_writable(nodes::LINE_SELECTOR) {
        return Ok(None);
    }

    for line in map.enum_entries(nodes::LINE_SELECTOR)? {
        map.set_enum(nodes::LINE_SELECTOR, &line)?;
        if !map.offers_entry(nodes::LINE_SOURCE, entries::COUNTER0_ACTIVE) {
            continue;
        }

        let mut mode_switched = false;
        let previous_mode = map.get_enum(nodes::LINE_MODE).ok();
        if !map.is_writable(nodes::LINE_SOURCE) {
            if !(map.is_writable(nodes::LINE_MODE)
                && map.offers_entry(nodes::LINE_MODE, entries::OUTPUT))
            {
                continue;
            }
            map.set_enum(nodes::LINE_MODE, entries::OUTPUT)?;
            mode_switched = true;

            if !map.is_writable(nodes::LINE_SOURCE) {
                if let Some(mode) = previous_mode {
                    map.set_enum(nodes::LINE_MODE, &mode)?;
                }
                continue;
            }
        }

        map.set_enum(nodes::LINE_SOURCE, entries::COUNTER0_ACTIVE)?;
        return Ok(Some(OutputLine {
            line,
            mode_switched,
        }));
    }
    Ok(None)
}

/// 找到第一条带可写 V3_3Enable 的线并打开电压轨
fn enable_aux_rail(map: &dyn NodeMap) -> synccap_core::error::Result<Option<String>> {
    if !map.is_writable(nodes::LINE_SELECTOR) {
        return Ok(None);
    }
    for line in map.enum_entries(nodes::LINE_SELECTOR)? {
        map.set_enum(nodes::LINE_SELECTOR, &line)?;
        if map.is_writable(nodes::AUX_RAIL_ENABLE) {
            map.set_boolean(nodes::AUX_RAIL_ENABLE, true)?;
            tracing::info!("Auxiliary 3.3V rail enabled on {}", line);
            return Ok(Some(line));
        }
    }
    tracing::debug!("No auxiliary voltage rail on this device");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_cycle_and_pulse_rate() {
        let config = TriggerConfig::new(14_000, 6_000).unwrap();
        assert_eq!(config.duty_cycle_percent(), 70.0);
        assert_eq!(config.pulse_rate_hz(), 50.0);
        assert_eq!(config.period_us(), 20_000);

        let skewed = TriggerConfig::new(1, 999_999).unwrap();
        assert!(skewed.duty_cycle_percent() > 0.0 && skewed.duty_cycle_percent() < 100.0);
        assert_eq!(skewed.pulse_rate_hz(), 1.0);
    }

    #[test]
    fn zero_timing_is_rejected() {
        assert!(matches!(
            TriggerConfig::new(0, 6_000),
            Err(TriggerError::InvalidTiming { .. })
        ));
        assert!(matches!(
            TriggerConfig::new(14_000, 0),
            Err(TriggerError::InvalidTiming { .. })
        ));
    }

    #[test]
    fn frame_rate_check() {
        let report = TriggerReport {
            config: TriggerConfig::new(14_000, 6_000).unwrap(),
            output_line: None,
            aux_rail: None,
            device_frame_rate: Some(40.0),
        };
        assert!(report.exceeds_frame_rate());
        let unknown = TriggerReport {
            device_frame_rate: None,
            ..report
        };
        assert!(!unknown.exceeds_frame_rate());
    }
}
