use crate::pixel_format::PixelFormat;
use std::fmt;

/// 设备对每一帧上报的完整性状态
///
/// 非 `NoError` 的帧属于 "Incomplete Frame"，数据不可用，但其 Buffer 仍必须归还。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ImageStatus {
    NoError,
    CrcCheckFailed,
    DataOverflow,
    MissingPackets,
    LeaderBufferSizeInconsistent,
    TrailerBufferSizeInconsistent,
    PacketIdInconsistent,
    MissingLeader,
    MissingTrailer,
    DataIncomplete,
    InfoInconsistent,
    ChunkDataInvalid,
    NoSystemResources,
    /// 驱动返回的未知状态码
    Other(i32),
}

impl ImageStatus {
    /// 数值状态码 (与厂商 SDK 的枚举顺序一致)
    pub fn code(&self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::CrcCheckFailed => 1,
            Self::DataOverflow => 2,
            Self::MissingPackets => 3,
            Self::LeaderBufferSizeInconsistent => 4,
            Self::TrailerBufferSizeInconsistent => 5,
            Self::PacketIdInconsistent => 6,
            Self::MissingLeader => 7,
            Self::MissingTrailer => 8,
            Self::DataIncomplete => 9,
            Self::InfoInconsistent => 10,
            Self::ChunkDataInvalid => 11,
            Self::NoSystemResources => 12,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::CrcCheckFailed,
            2 => Self::DataOverflow,
            3 => Self::MissingPackets,
            4 => Self::LeaderBufferSizeInconsistent,
            5 => Self::TrailerBufferSizeInconsistent,
            6 => Self::PacketIdInconsistent,
            7 => Self::MissingLeader,
            8 => Self::MissingTrailer,
            9 => Self::DataIncomplete,
            10 => Self::InfoInconsistent,
            11 => Self::ChunkDataInvalid,
            12 => Self::NoSystemResources,
            other => Self::Other(other),
        }
    }

    pub fn is_complete(&self) -> bool {
        *self == Self::NoError
    }

    /// 人类可读的状态描述，用于日志和 Batch 中的失败原因
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoError => "Image is complete",
            Self::CrcCheckFailed => "Image data failed CRC check",
            Self::DataOverflow => "Received more data than the buffer can hold",
            Self::MissingPackets => "Packets were lost during transfer",
            Self::LeaderBufferSizeInconsistent => "Leader reports a size different from the buffer",
            Self::TrailerBufferSizeInconsistent => "Trailer reports a size different from the buffer",
            Self::PacketIdInconsistent => "Packet IDs are out of sequence",
            Self::MissingLeader => "Image leader was not received",
            Self::MissingTrailer => "Image trailer was not received",
            Self::DataIncomplete => "Image data is incomplete",
            Self::InfoInconsistent => "Image info does not match the payload",
            Self::ChunkDataInvalid => "Chunk data is invalid",
            Self::NoSystemResources => "Host ran out of system resources",
            Self::Other(_) => "Unknown image status",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp {
    /// 硬件原始时间戳 (纳秒，单调递增，来源于设备时钟)
    pub hw_raw_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameMetadata {
    pub actual_exposure_us: Option<f64>, // 实际曝光时间
    pub trigger_fired: bool,             // 是否由硬件触发产生
}

/// 转换完成后的图像，数据已从采集引擎的 Buffer 中拷贝出来，可以任意跨线程移动
#[derive(Clone, PartialEq)]
pub struct CapturedImage {
    /// Packed 像素数据 (无 Padding)
    pub data: Vec<u8>,

    pub width: u32,

    pub height: u32,

    pub format: PixelFormat,

    /// 设备侧的帧 ID (用于丢帧统计)
    pub frame_id: u64,

    pub timestamp: Timestamp,

    pub metadata: FrameMetadata,
}

impl CapturedImage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// 图像数据动辄数 MB，Debug 只输出元信息
impl fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("frame_id", &self.frame_id)
            .field("hw_ns", &self.timestamp.hw_raw_ns)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in -1..14 {
            assert_eq!(ImageStatus::from_code(code).code(), code);
        }
        assert!(ImageStatus::NoError.is_complete());
        assert!(!ImageStatus::MissingPackets.is_complete());
    }
}
