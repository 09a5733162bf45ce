use std::fmt::{self, Display};

use crate::error::{CameraError, Result};

/// 像素格式 (命名遵循 GenICam PFNC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelFormat {
    /// 8-bit 灰度 - 下游控制环默认消费的格式
    Mono8,
    /// 16-bit 灰度 (Little Endian)
    Mono16,
    /// Raw Bayer 8-bit，四种排列
    BayerRG8,
    BayerGR8,
    BayerGB8,
    BayerBG8,
    /// Packed RGB 24-bit
    Rgb8,
    /// Packed BGR 24-bit
    Bgr8,
    /// YUV 4:2:2 (YUYV 排列)
    Yuv422Packed,
    /// 驱动返回了库不认识的私有格式
    Unknown(u32),
}

impl PixelFormat {
    /// 判断是否为 Bayer 原始格式 (需要 Demosaic)
    pub fn is_bayer(&self) -> bool {
        matches!(
            self,
            Self::BayerRG8 | Self::BayerGR8 | Self::BayerGB8 | Self::BayerBG8
        )
    }

    /// 每像素比特数 (Bits Per Pixel)
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            Self::Mono8 => 8,
            Self::BayerRG8 | Self::BayerGR8 | Self::BayerGB8 | Self::BayerBG8 => 8,
            Self::Mono16 | Self::Yuv422Packed => 16,
            Self::Rgb8 | Self::Bgr8 => 24,
            Self::Unknown(_) => 0,
        }
    }

    /// 一帧图像 (无 Padding) 所需的字节数
    pub fn image_size(&self, width: u32, height: u32) -> usize {
        (width as usize * height as usize * self.bits_per_pixel() as usize) / 8
    }

    /// PFNC 符号名，用于读写 PixelFormat 节点
    pub fn pfnc_name(&self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono16 => "Mono16",
            Self::BayerRG8 => "BayerRG8",
            Self::BayerGR8 => "BayerGR8",
            Self::BayerGB8 => "BayerGB8",
            Self::BayerBG8 => "BayerBG8",
            Self::Rgb8 => "RGB8",
            Self::Bgr8 => "BGR8",
            Self::Yuv422Packed => "YUV422Packed",
            Self::Unknown(_) => "Unknown",
        }
    }

    pub fn from_pfnc_name(name: &str) -> Option<Self> {
        let fmt = match name {
            "Mono8" => Self::Mono8,
            "Mono16" => Self::Mono16,
            "BayerRG8" => Self::BayerRG8,
            "BayerGR8" => Self::BayerGR8,
            "BayerGB8" => Self::BayerGB8,
            "BayerBG8" => Self::BayerBG8,
            "RGB8" | "RGB8Packed" => Self::Rgb8,
            "BGR8" | "BGR8Packed" => Self::Bgr8,
            "YUV422Packed" | "YUV422_8" => Self::Yuv422Packed,
            _ => return None,
        };
        Some(fmt)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown(0x{:08X})", code),
            other => f.write_str(other.pfnc_name()),
        }
    }
}

/// 像素格式转换，结果总是一块新分配的 Packed 内存
///
/// 源数据可能位于采集引擎的 Buffer Slot 中，调用方在拿到结果后即可释放该 Slot。
/// 目前支持：同格式拷贝，以及任意已知格式 -> Mono8。
pub fn convert(
    src: &[u8],
    width: u32,
    height: u32,
    from: PixelFormat,
    to: PixelFormat,
) -> Result<Vec<u8>> {
    let expected = from.image_size(width, height);
    if from.bits_per_pixel() == 0 || to.bits_per_pixel() == 0 {
        return Err(CameraError::ConversionNotSupported { from, to });
    }
    if src.len() < expected {
        return Err(CameraError::PayloadTooShort {
            expected,
            actual: src.len(),
        });
    }
    let src = &src[..expected];

    if from == to {
        return Ok(src.to_vec());
    }

    match (from, to) {
        (PixelFormat::Mono16, PixelFormat::Mono8) => Ok(mono16_to_mono8(src)),
        (PixelFormat::Rgb8, PixelFormat::Mono8) => Ok(packed_rgb_to_mono8(src, [0, 1, 2])),
        (PixelFormat::Bgr8, PixelFormat::Mono8) => Ok(packed_rgb_to_mono8(src, [2, 1, 0])),
        (PixelFormat::Yuv422Packed, PixelFormat::Mono8) => {
            // YUYV: 亮度分量位于偶数字节
            Ok(src.iter().step_by(2).copied().collect())
        }
        (bayer, PixelFormat::Mono8) if bayer.is_bayer() => {
            Ok(bayer_to_mono8(src, width as usize, height as usize))
        }
        _ => Err(CameraError::ConversionNotSupported { from, to }),
    }
}

fn mono16_to_mono8(src: &[u8]) -> Vec<u8> {
    // 对齐时直接按 u16 视图读取，否则逐字节拼接
    match bytemuck::try_cast_slice::<u8, u16>(src) {
        Ok(words) => words.iter().map(|w| (u16::from_le(*w) >> 8) as u8).collect(),
        Err(_) => src
            .chunks_exact(2)
            .map(|pair| (u16::from_le_bytes([pair[0], pair[1]]) >> 8) as u8)
            .collect(),
    }
}

fn packed_rgb_to_mono8(src: &[u8], order: [usize; 3]) -> Vec<u8> {
    src.chunks_exact(3)
        .map(|px| {
            let r = px[order[0]] as u32;
            let g = px[order[1]] as u32;
            let b = px[order[2]] as u32;
            // BT.601 整数近似
            ((77 * r + 150 * g + 29 * b) >> 8) as u8
        })
        .collect()
}

/// 2x2 Bayer 单元取平均得到亮度，排列方式不影响结果
fn bayer_to_mono8(src: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height];
    for cy in (0..height).step_by(2) {
        for cx in (0..width).step_by(2) {
            let mut sum = 0u32;
            let mut count = 0u32;
            for y in cy..(cy + 2).min(height) {
                for x in cx..(cx + 2).min(width) {
                    sum += src[y * width + x] as u32;
                    count += 1;
                }
            }
            let gray = (sum / count) as u8;
            for y in cy..(cy + 2).min(height) {
                for x in cx..(cx + 2).min(width) {
                    out[y * width + x] = gray;
                }
            }
        }
    }
    out
}
