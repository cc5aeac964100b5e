//! Typed views over the raw kernel structures.

use std::time::Duration;

use hdcap_core::prelude::FourCc;
use v4l2r::{bindings, ioctl::Capability};

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Identity and capability flags of an opened node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    /// Effective capabilities of this node (`device_caps` when reported).
    pub flags: u32,
}

impl Capabilities {
    pub fn video_capture(&self) -> bool {
        self.flags & bindings::V4L2_CAP_VIDEO_CAPTURE != 0
    }

    pub fn streaming(&self) -> bool {
        self.flags & bindings::V4L2_CAP_STREAMING != 0
    }

    pub fn capture_and_streaming(card: &str) -> Self {
        Self {
            driver: String::new(),
            card: card.to_string(),
            bus_info: String::new(),
            version: 0,
            flags: bindings::V4L2_CAP_VIDEO_CAPTURE | bindings::V4L2_CAP_STREAMING,
        }
    }
}

impl From<Capability> for Capabilities {
    fn from(cap: Capability) -> Self {
        Self {
            flags: cap.device_caps().bits(),
            driver: cap.driver,
            card: cap.card,
            bus_info: cap.bus_info,
            version: cap.version,
        }
    }
}

/// One entry of the device's pixel format list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDesc {
    pub index: u32,
    pub flags: u32,
    pub description: String,
    pub fourcc: FourCc,
}

impl From<bindings::v4l2_fmtdesc> for FormatDesc {
    fn from(raw: bindings::v4l2_fmtdesc) -> Self {
        Self {
            index: raw.index,
            flags: raw.flags,
            description: c_str(&raw.description),
            fourcc: FourCc::from(raw.pixelformat),
        }
    }
}

/// Scanning field of a format or a captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    /// Driver chooses.
    #[default]
    Any,
    Progressive,
    Top,
    Bottom,
    Interlaced,
    Other(u32),
}

impl From<u32> for Field {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Field::Any,
            1 => Field::Progressive,
            2 => Field::Top,
            3 => Field::Bottom,
            4 => Field::Interlaced,
            other => Field::Other(other),
        }
    }
}

impl From<Field> for u32 {
    fn from(field: Field) -> u32 {
        match field {
            Field::Any => 0,
            Field::Progressive => 1,
            Field::Top => 2,
            Field::Bottom => 3,
            Field::Interlaced => 4,
            Field::Other(raw) => raw,
        }
    }
}

/// Single-planar capture geometry and pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub field: Field,
    pub bytes_per_line: u32,
    pub size_image: u32,
    pub colorspace: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

impl PixFormat {
    /// Request for `width` x `height` in `fourcc`; the driver fills in the rest.
    pub fn new(width: u32, height: u32, fourcc: FourCc) -> Self {
        Self {
            width,
            height,
            fourcc,
            field: Field::Any,
            bytes_per_line: 0,
            size_image: 0,
            colorspace: 0,
            ycbcr_enc: 0,
            quantization: 0,
            xfer_func: 0,
        }
    }
}

impl From<PixFormat> for bindings::v4l2_format {
    fn from(format: PixFormat) -> Self {
        let pix = bindings::v4l2_pix_format {
            width: format.width,
            height: format.height,
            pixelformat: format.fourcc.to_u32(),
            field: format.field.into(),
            bytesperline: format.bytes_per_line,
            sizeimage: format.size_image,
            colorspace: format.colorspace,
            __bindgen_anon_1: bindings::v4l2_pix_format__bindgen_ty_1 {
                ycbcr_enc: format.ycbcr_enc,
            },
            quantization: format.quantization,
            xfer_func: format.xfer_func,
            ..Default::default()
        };
        bindings::v4l2_format {
            type_: bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
            fmt: bindings::v4l2_format__bindgen_ty_1 { pix },
        }
    }
}

impl From<bindings::v4l2_format> for PixFormat {
    fn from(raw: bindings::v4l2_format) -> Self {
        // SAFETY: single-planar capture formats always carry the `pix` member,
        // and every bit pattern is a valid `v4l2_pix_format`.
        let pix = unsafe { raw.fmt.pix };
        // SAFETY: both union members are plain `u32`s.
        let ycbcr_enc = unsafe { pix.__bindgen_anon_1.ycbcr_enc };
        Self {
            width: pix.width,
            height: pix.height,
            fourcc: FourCc::from(pix.pixelformat),
            field: Field::from(pix.field),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
            colorspace: pix.colorspace,
            ycbcr_enc,
            quantization: pix.quantization,
            xfer_func: pix.xfer_func,
        }
    }
}

/// BT.656/1120 digital video timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DvTimings {
    /// Kernel timings type; only BT.656/1120 (`0`) is understood.
    pub kind: u32,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub polarities: u32,
    pub pixel_clock: u64,
    pub h_front_porch: u32,
    pub h_sync: u32,
    pub h_back_porch: u32,
    pub v_front_porch: u32,
    pub v_sync: u32,
    pub v_back_porch: u32,
    pub il_v_front_porch: u32,
    pub il_v_sync: u32,
    pub il_v_back_porch: u32,
    pub standards: u32,
    pub flags: u32,
    pub cea861_vic: u8,
    pub hdmi_vic: u8,
}

impl DvTimings {
    pub fn is_bt656_1120(&self) -> bool {
        self.kind == bindings::V4L2_DV_BT_656_1120
    }

    /// Active width plus horizontal blanking.
    pub fn total_width(&self) -> u64 {
        self.width as u64
            + self.h_front_porch as u64
            + self.h_sync as u64
            + self.h_back_porch as u64
    }

    /// Active height plus vertical blanking, including the second field when interlaced.
    pub fn total_height(&self) -> u64 {
        let mut total = self.height as u64
            + self.v_front_porch as u64
            + self.v_sync as u64
            + self.v_back_porch as u64;
        if self.interlaced {
            total += self.il_v_front_porch as u64
                + self.il_v_sync as u64
                + self.il_v_back_porch as u64;
        }
        total
    }

    /// Frames per second derived from the pixel clock; 0 when any term is missing.
    ///
    /// # Example
    /// ```rust
    /// use hdcap_v4l2::prelude::DvTimings;
    ///
    /// let timings = DvTimings {
    ///     width: 1920,
    ///     height: 1080,
    ///     h_front_porch: 88,
    ///     h_sync: 44,
    ///     h_back_porch: 148,
    ///     v_front_porch: 4,
    ///     v_sync: 5,
    ///     v_back_porch: 36,
    ///     pixel_clock: 148_500_000,
    ///     ..Default::default()
    /// };
    /// assert_eq!(timings.frame_rate().round(), 60.0);
    /// ```
    pub fn frame_rate(&self) -> f64 {
        let htotal = self.total_width();
        let vtotal = self.total_height();
        if self.pixel_clock == 0 || htotal == 0 || vtotal == 0 {
            return 0.0;
        }
        self.pixel_clock as f64 / (htotal * vtotal) as f64
    }
}

impl From<bindings::v4l2_dv_timings> for DvTimings {
    fn from(raw: bindings::v4l2_dv_timings) -> Self {
        // SAFETY: the union only holds the BT.656/1120 member or padding; the
        // packed struct is copied out by value.
        let bt = unsafe { raw.__bindgen_anon_1.bt };
        Self {
            kind: raw.type_,
            width: bt.width,
            height: bt.height,
            interlaced: bt.interlaced == bindings::V4L2_DV_INTERLACED,
            polarities: bt.polarities,
            pixel_clock: bt.pixelclock,
            h_front_porch: bt.hfrontporch,
            h_sync: bt.hsync,
            h_back_porch: bt.hbackporch,
            v_front_porch: bt.vfrontporch,
            v_sync: bt.vsync,
            v_back_porch: bt.vbackporch,
            il_v_front_porch: bt.il_vfrontporch,
            il_v_sync: bt.il_vsync,
            il_v_back_porch: bt.il_vbackporch,
            standards: bt.standards,
            flags: bt.flags,
            cea861_vic: bt.cea861_vic,
            hdmi_vic: bt.hdmi_vic,
        }
    }
}

impl From<DvTimings> for bindings::v4l2_dv_timings {
    fn from(timings: DvTimings) -> Self {
        let bt = bindings::v4l2_bt_timings {
            width: timings.width,
            height: timings.height,
            interlaced: u32::from(timings.interlaced),
            polarities: timings.polarities,
            pixelclock: timings.pixel_clock,
            hfrontporch: timings.h_front_porch,
            hsync: timings.h_sync,
            hbackporch: timings.h_back_porch,
            vfrontporch: timings.v_front_porch,
            vsync: timings.v_sync,
            vbackporch: timings.v_back_porch,
            il_vfrontporch: timings.il_v_front_porch,
            il_vsync: timings.il_v_sync,
            il_vbackporch: timings.il_v_back_porch,
            standards: timings.standards,
            flags: timings.flags,
            cea861_vic: timings.cea861_vic,
            hdmi_vic: timings.hdmi_vic,
            ..Default::default()
        };
        bindings::v4l2_dv_timings {
            type_: timings.kind,
            __bindgen_anon_1: bindings::v4l2_dv_timings__bindgen_ty_1 { bt },
        }
    }
}

/// Kernel-side location of one mmap buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Metadata of a filled buffer returned by dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub flags: u32,
    /// Driver frame counter; gaps indicate frames dropped before dequeue.
    pub sequence: u32,
    pub field: Field,
    /// Capture time on the clock the driver reports (usually monotonic).
    pub timestamp: Duration,
}

impl DequeuedBuffer {
    /// The driver flagged the payload as corrupted.
    pub fn has_error(&self) -> bool {
        self.flags & bindings::V4L2_BUF_FLAG_ERROR != 0
    }
}

impl From<&bindings::v4l2_buffer> for DequeuedBuffer {
    fn from(raw: &bindings::v4l2_buffer) -> Self {
        let secs = raw.timestamp.tv_sec.max(0) as u64;
        let micros = raw.timestamp.tv_usec.max(0) as u64;
        Self {
            index: raw.index,
            bytes_used: raw.bytesused,
            flags: raw.flags,
            sequence: raw.sequence,
            field: Field::from(raw.field),
            timestamp: Duration::from_secs(secs) + Duration::from_micros(micros),
        }
    }
}

/// Events the capture loop can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SourceChange,
}

impl EventKind {
    pub fn raw(self) -> u32 {
        match self {
            EventKind::SourceChange => bindings::V4L2_EVENT_SOURCE_CHANGE,
        }
    }
}

/// A dequeued device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Input signal changed; `changes` carries the `V4L2_EVENT_SRC_CH_*` bits.
    SourceChange { changes: u32 },
    Other { kind: u32 },
}

impl Event {
    pub fn is_source_change(&self) -> bool {
        matches!(self, Event::SourceChange { .. })
    }

    pub fn resolution_changed(&self) -> bool {
        matches!(
            self,
            Event::SourceChange { changes }
                if changes & bindings::V4L2_EVENT_SRC_CH_RESOLUTION != 0
        )
    }
}

impl From<bindings::v4l2_event> for Event {
    fn from(raw: bindings::v4l2_event) -> Self {
        match raw.type_ {
            bindings::V4L2_EVENT_SOURCE_CHANGE => Event::SourceChange {
                // SAFETY: source-change events carry the `src_change` member.
                changes: unsafe { raw.u.src_change.changes },
            },
            kind => Event::Other { kind },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cea_1080p(pixel_clock: u64) -> DvTimings {
        DvTimings {
            width: 1920,
            height: 1080,
            h_front_porch: 88,
            h_sync: 44,
            h_back_porch: 148,
            v_front_porch: 4,
            v_sync: 5,
            v_back_porch: 36,
            pixel_clock,
            ..Default::default()
        }
    }

    #[test]
    fn frame_rate_from_totals() {
        let timings = cea_1080p(148_500_000);
        assert_eq!(timings.total_width(), 2200);
        assert_eq!(timings.total_height(), 1125);
        assert!((timings.frame_rate() - 60.0).abs() < 1e-9);
        assert!((timings.frame_rate() - 59.94).abs() < 0.1);

        let ntsc = cea_1080p(148_351_648);
        assert!((ntsc.frame_rate() - 59.94).abs() < 0.001);
    }

    #[test]
    fn zero_pixel_clock_yields_zero() {
        assert_eq!(cea_1080p(0).frame_rate(), 0.0);
        assert_eq!(DvTimings::default().frame_rate(), 0.0);
    }

    #[test]
    fn timings_survive_raw_conversion() {
        let timings = DvTimings {
            interlaced: true,
            il_v_sync: 5,
            cea861_vic: 16,
            ..cea_1080p(74_250_000)
        };
        let raw = bindings::v4l2_dv_timings::from(timings);
        // Packed struct: copy the field out before comparing.
        let kind = raw.type_;
        assert_eq!(kind, bindings::V4L2_DV_BT_656_1120);
        assert_eq!(DvTimings::from(raw), timings);
    }

    #[test]
    fn capabilities_prefer_device_caps() {
        let mut raw = bindings::v4l2_capability::default();
        raw.card[..4].copy_from_slice(b"hdmi");
        raw.capabilities = bindings::V4L2_CAP_DEVICE_CAPS
            | bindings::V4L2_CAP_VIDEO_CAPTURE
            | bindings::V4L2_CAP_STREAMING;
        raw.device_caps = bindings::V4L2_CAP_VIDEO_CAPTURE;
        let caps = Capabilities::from(Capability::from(raw));
        assert_eq!(caps.card, "hdmi");
        assert!(caps.video_capture());
        assert!(!caps.streaming());
    }

    #[test]
    fn source_change_event_decodes() {
        let mut raw = bindings::v4l2_event {
            type_: bindings::V4L2_EVENT_SOURCE_CHANGE,
            ..Default::default()
        };
        raw.u.src_change = bindings::v4l2_event_src_change {
            changes: bindings::V4L2_EVENT_SRC_CH_RESOLUTION,
        };
        let event = Event::from(raw);
        assert!(event.is_source_change());
        assert!(event.resolution_changed());
    }

    #[test]
    fn capture_format_keeps_encoding_in_its_union() {
        let mut format = PixFormat::new(1280, 720, FourCc::new(*b"YUYV"));
        format.ycbcr_enc = 2;
        let raw = bindings::v4l2_format::from(format);
        assert_eq!(raw.type_, bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE);
        assert_eq!(PixFormat::from(raw), format);
    }
}
