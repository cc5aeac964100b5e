use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel format.
///
/// # Example
/// ```rust
/// use hdcap_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"RGB3");
/// assert_eq!(fcc.to_string(), "RGB3");
/// assert_eq!(FourCc::from(fcc.to_u32()), fcc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding, as used on the kernel interface.
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Abstract pixel formats the pipeline can be configured for.
///
/// Each maps to exactly one kernel four-character code; negotiation never
/// substitutes another format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PixelFormat {
    /// Packed 8-bit R, G, B.
    #[default]
    Rgb24,
    /// Packed 8-bit B, G, R.
    Bgr24,
    /// Packed 4:2:2 Y, U, Y, V.
    Yuyv,
    /// Packed 4:2:2 U, Y, V, Y.
    Uyvy,
    /// Semi-planar 4:2:0.
    Nv12,
}

impl PixelFormat {
    /// Kernel four-character code.
    pub const fn fourcc(self) -> FourCc {
        match self {
            PixelFormat::Rgb24 => FourCc::new(*b"RGB3"),
            PixelFormat::Bgr24 => FourCc::new(*b"BGR3"),
            PixelFormat::Yuyv => FourCc::new(*b"YUYV"),
            PixelFormat::Uyvy => FourCc::new(*b"UYVY"),
            PixelFormat::Nv12 => FourCc::new(*b"NV12"),
        }
    }

    /// Bytes needed for one frame of `width` x `height` without row padding.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
            PixelFormat::Yuyv | PixelFormat::Uyvy => pixels * 2,
            PixelFormat::Nv12 => pixels + pixels / 2,
        }
    }

    /// Lowercase name used in configuration.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Uyvy => "uyvy",
            PixelFormat::Nv12 => "nv12",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" | "rgb3" => Ok(PixelFormat::Rgb24),
            "bgr24" | "bgr3" => Ok(PixelFormat::Bgr24),
            "yuyv" => Ok(PixelFormat::Yuyv),
            "uyvy" => Ok(PixelFormat::Uyvy),
            "nv12" => Ok(PixelFormat::Nv12),
            other => Err(format!("unknown pixel format {other:?}")),
        }
    }
}

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use hdcap_core::prelude::Resolution;
///
/// let res = Resolution::new(1920, 1080).unwrap();
/// assert_eq!(res.width.get(), 1920);
/// assert!(Resolution::new(0, 1080).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Negotiated display mode: geometry plus refresh rate rounded to whole hertz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisplayMode {
    pub resolution: Resolution,
    pub refresh_hz: u32,
}

impl DisplayMode {
    /// Build a mode from a resolution and a fractional refresh rate.
    pub fn new(resolution: Resolution, refresh_hz: f64) -> Self {
        Self {
            resolution,
            refresh_hz: refresh_hz.round().max(0.0) as u32,
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resolution, self.refresh_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_parses_config_names() {
        assert_eq!("RGB24".parse::<PixelFormat>().unwrap(), PixelFormat::Rgb24);
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert!("rgb565".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn rgb24_maps_to_rgb3() {
        assert_eq!(PixelFormat::Rgb24.fourcc().to_string(), "RGB3");
        assert_eq!(PixelFormat::Rgb24.frame_len(1920, 1080), 6_220_800);
    }

    #[test]
    fn display_mode_rounds_refresh() {
        let res = Resolution::new(1920, 1080).unwrap();
        assert_eq!(DisplayMode::new(res, 59.94).refresh_hz, 60);
        assert_eq!(DisplayMode::new(res, 0.0).refresh_hz, 0);
        assert_eq!(DisplayMode::new(res, 59.94).to_string(), "1920x1080@60");
    }

    #[test]
    fn fourcc_rejects_wrong_length() {
        assert!("RGB".parse::<FourCc>().is_err());
        assert_eq!("YUYV".parse::<FourCc>().unwrap(), PixelFormat::Yuyv.fourcc());
    }
}
