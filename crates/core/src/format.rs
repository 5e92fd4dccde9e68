use std::{fmt, num::NonZeroU32, str::FromStr};

/// Stage ports want widths aligned to 32 pixels.
pub const WIDTH_ALIGN: u32 = 32;
/// Stage ports want heights aligned to 16 lines.
pub const HEIGHT_ALIGN: u32 = 16;
/// Size of an opaque buffer handle; opaque payloads never carry pixels.
pub const OPAQUE_HANDLE_BYTES: usize = 128;

/// Four-character code describing the pixel encoding of a port.
///
/// # Example
/// ```rust
/// use prism_core::prelude::Encoding;
///
/// assert_eq!(Encoding::RGBA.to_string(), "RGBA");
/// assert_eq!("RGB3".parse::<Encoding>().unwrap(), Encoding::RGB24);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encoding([u8; 4]);

impl Encoding {
    /// 32-bit RGBA, 4 bytes per pixel.
    pub const RGBA: Encoding = Encoding(*b"RGBA");
    /// 32-bit BGRA, 4 bytes per pixel.
    pub const BGRA: Encoding = Encoding(*b"BGRA");
    /// Packed 24-bit RGB.
    pub const RGB24: Encoding = Encoding(*b"RGB3");
    /// Packed 24-bit BGR.
    pub const BGR24: Encoding = Encoding(*b"BGR3");
    /// Planar YUV 4:2:0.
    pub const I420: Encoding = Encoding(*b"I420");
    /// Platform-private handle; pixels stay inside the stages.
    pub const OPAQUE: Encoding = Encoding(*b"OPQV");

    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Whether stages in this crate know how to size buffers for this encoding.
    pub fn is_supported(self) -> bool {
        self.layout().is_some()
    }

    /// Bytes needed for one frame of `width`x`height` pixels, `None` for unknown encodings.
    pub fn frame_bytes(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        Some(match self.layout()? {
            Layout::Packed(bpp) => pixels * bpp,
            Layout::Yuv420 => pixels * 3 / 2,
            Layout::Opaque => OPAQUE_HANDLE_BYTES,
        })
    }

    fn layout(self) -> Option<Layout> {
        match self {
            Encoding::RGBA | Encoding::BGRA => Some(Layout::Packed(4)),
            Encoding::RGB24 | Encoding::BGR24 => Some(Layout::Packed(3)),
            Encoding::I420 => Some(Layout::Yuv420),
            Encoding::OPAQUE => Some(Layout::Opaque),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Packed(usize),
    Yuv420,
    Opaque,
}

impl From<u32> for Encoding {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("encoding must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(Encoding(arr))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Encoding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str().unwrap_or("????"))
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Encoding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Encoding::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Resolution of a frame or a sensor limit.
///
/// # Example
/// ```rust
/// use prism_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.width.get(), 640);
/// assert!(Resolution::new(0, 480).is_none());
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

    /// Whether `width`x`height` fits inside this resolution.
    pub fn contains(&self, width: u32, height: u32) -> bool {
        width <= self.width.get() && height <= self.height.get()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Visible region inside an aligned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Format contract committed on a single stage port.
///
/// The buffer geometry is aligned up to what the stages require while the crop keeps the
/// requested visible size.
///
/// # Example
/// ```rust
/// use prism_core::prelude::{Encoding, PortFormat, Resolution};
///
/// let fmt = PortFormat::aligned(Encoding::RGBA, Resolution::new(100, 50).unwrap());
/// assert_eq!((fmt.width, fmt.height), (128, 64));
/// assert_eq!((fmt.crop.width, fmt.crop.height), (100, 50));
/// assert_eq!(fmt.frame_size(), 128 * 64 * 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortFormat {
    /// Pixel encoding.
    pub encoding: Encoding,
    /// Aligned buffer width.
    pub width: u32,
    /// Aligned buffer height.
    pub height: u32,
    /// Requested visible area.
    pub crop: Crop,
}

impl PortFormat {
    /// Build a format for `size`, aligning the buffer geometry and cropping to `size`.
    pub fn aligned(encoding: Encoding, size: Resolution) -> Self {
        let (width, height) = (size.width.get(), size.height.get());
        Self {
            encoding,
            width: align_up(width, WIDTH_ALIGN),
            height: align_up(height, HEIGHT_ALIGN),
            crop: Crop {
                x: 0,
                y: 0,
                width,
                height,
            },
        }
    }

    /// Visible size requested by the configuration.
    pub fn visible(&self) -> Option<Resolution> {
        Resolution::new(self.crop.width, self.crop.height)
    }

    /// Whether this format can carry frames of at least `other`'s visible size.
    pub fn covers(&self, other: &PortFormat) -> bool {
        self.crop.width >= other.crop.width && self.crop.height >= other.crop.height
    }

    /// Bytes of one full aligned frame; zero for unknown encodings.
    pub fn frame_size(&self) -> usize {
        self.encoding
            .frame_bytes(self.width, self.height)
            .unwrap_or(0)
    }
}

impl fmt::Display for PortFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (crop {}x{}+{}+{})",
            self.encoding,
            self.width,
            self.height,
            self.crop.width,
            self.crop.height,
            self.crop.x,
            self.crop.y
        )
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(640, 32), 640);
        assert_eq!(align_up(641, 32), 672);
        assert_eq!(align_up(480, 16), 480);
        assert_eq!(align_up(1, 16), 16);
    }

    #[test]
    fn frame_bytes_per_layout() {
        assert_eq!(Encoding::RGB24.frame_bytes(4, 2), Some(24));
        assert_eq!(Encoding::I420.frame_bytes(4, 4), Some(24));
        assert_eq!(Encoding::OPAQUE.frame_bytes(1920, 1080), Some(OPAQUE_HANDLE_BYTES));
        assert_eq!(Encoding::new(*b"XXXX").frame_bytes(4, 4), None);
    }

    #[test]
    fn covers_compares_visible_area() {
        let big = PortFormat::aligned(Encoding::I420, Resolution::new(640, 480).unwrap());
        let small = PortFormat::aligned(Encoding::RGBA, Resolution::new(320, 240).unwrap());
        assert!(big.covers(&small));
        assert!(!small.covers(&big));
    }
}
