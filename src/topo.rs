//! Parsed device topology.
//!
//! UVC devices expose two kinds of interfaces: one Video Control interface
//! carrying terminals and units, and one or more Video Streaming interfaces
//! carrying formats, frames and the isochronous bandwidth alternates. The
//! types in this module are the decoded, immutable view of the
//! class-specific descriptors; they are built once per open by
//! [`parse`](self::parse).

pub(crate) mod parse;

use std::fmt;

use uuid::Uuid;

use crate::error::Error;
use crate::Result;

/// Video Streaming format subtypes this driver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Uncompressed,
    Mjpeg,
    FrameBased,
}

/// A Video Streaming format along with its advertised frames.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    pub format_index: u8,
    pub kind: FormatKind,
    /// Stream encoding GUID in the mixed-endian form UVC stores it in.
    pub guid: [u8; 16],
    /// Human readable name (fourcc for uncompressed formats).
    pub description: String,
    pub frames: Vec<FrameInfo>,
    /// Method-2 still capture sizes, if the format has a
    /// `STILL_IMAGE_FRAME` descriptor.
    pub still_frames: Vec<StillFrameInfo>,
}

impl StreamFormat {
    pub fn frame_by_index(&self, frame_index: u8) -> Option<&FrameInfo> {
        self.frames.iter().find(|f| f.frame_index == frame_index)
    }
}

/// Frame descriptor summary collected from a VS frame descriptor.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub frame_index: u8,
    pub width: u16,
    pub height: u16,
    /// Default frame interval in 100 ns units.
    pub default_interval: u32,
    /// Advertised frame intervals in 100 ns units; sorted, deduplicated,
    /// zero-free. Continuous ranges are represented by their endpoints plus
    /// the default.
    pub intervals: Vec<u32>,
    pub max_frame_size: u32,
    /// Whether the frame supports method-1 still capture
    /// (`bmCapabilities` bit 0).
    pub still_supported: bool,
}

impl FrameInfo {
    /// Unique frame rates advertised for this frame, in Hz.
    pub fn rates_hz(&self) -> Vec<f64> {
        self.intervals.iter().map(|&v| interval_to_hz(v)).collect()
    }

    /// Picks the advertised frame interval closest to `target_fps`.
    ///
    /// With `strict`, the chosen interval must match the requested rate
    /// within `tolerance_hz`; otherwise the nearest interval is returned.
    pub fn pick_interval(
        &self,
        target_fps: Option<f64>,
        strict: bool,
        tolerance_hz: f64,
    ) -> Result<u32> {
        if self.intervals.is_empty() {
            return Ok(self.default_interval);
        }

        let target_fps = match target_fps {
            Some(fps) if fps > 0.0 => fps,
            _ => {
                return Ok(if self.default_interval != 0 {
                    self.default_interval
                } else {
                    self.intervals[0]
                })
            }
        };

        let target_interval = (1e7 / target_fps).round() as i64;
        let best = *self
            .intervals
            .iter()
            .min_by_key(|&&v| (i64::from(v) - target_interval).abs())
            .unwrap();
        if strict {
            let actual_fps = interval_to_hz(best);
            if (actual_fps - target_fps).abs() > tolerance_hz {
                return Err(Error::NegotiationFailed {
                    reason: format!(
                        "no advertised frame interval matches {} fps (closest {:.6} fps)",
                        target_fps, actual_fps
                    ),
                    tried_lengths: Vec::new(),
                    last: None,
                });
            }
        }
        Ok(best)
    }
}

/// One size pattern of a method-2 still image frame descriptor.
#[derive(Debug, Clone)]
pub struct StillFrameInfo {
    /// 1-based position within the descriptor's size pattern list.
    pub index: u8,
    /// Dedicated still endpoint, 0 when stills share the streaming pipe.
    pub endpoint_address: u8,
    pub width: u16,
    pub height: u16,
    /// Advertised compression patterns; passed back verbatim during the
    /// still PROBE.
    pub compression_indices: Vec<u8>,
}

/// Information about an alternate streaming interface setting.
#[derive(Debug, Clone)]
pub struct AltSetting {
    pub alt_setting: u8,
    pub endpoint_address: Option<u8>,
    pub endpoint_attributes: Option<u8>,
    /// Per-microframe payload capacity, high-bandwidth transactions
    /// included.
    pub max_packet_size: u32,
}

impl AltSetting {
    pub fn is_isochronous(&self) -> bool {
        matches!(self.endpoint_attributes, Some(attrs) if attrs & 0x03 == 0x01)
    }
}

/// Grouping of the per-interface formats and alternate settings.
#[derive(Debug, Clone)]
pub struct StreamingInterface {
    pub interface_number: u8,
    pub formats: Vec<StreamFormat>,
    /// Sorted by alternate setting number; alt 0 carries the descriptors,
    /// the others provide bandwidth.
    pub alt_settings: Vec<AltSetting>,
}

impl StreamingInterface {
    pub fn get_alt(&self, alt_setting: u8) -> Option<&AltSetting> {
        self.alt_settings
            .iter()
            .find(|alt| alt.alt_setting == alt_setting)
    }

    /// Returns the smallest isochronous alternate whose packet size covers
    /// `required_payload`, or the largest available when none does.
    pub fn select_alt_for_payload(&self, required_payload: u32) -> Option<&AltSetting> {
        let mut candidates: Vec<&AltSetting> = self
            .alt_settings
            .iter()
            .filter(|alt| alt.max_packet_size != 0 && alt.is_isochronous())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by_key(|alt| alt.max_packet_size);
        candidates
            .iter()
            .find(|alt| alt.max_packet_size >= required_payload)
            .copied()
            .or_else(|| candidates.last().copied())
    }

    pub fn format_by_index(&self, format_index: u8) -> Option<&StreamFormat> {
        self.formats
            .iter()
            .find(|fmt| fmt.format_index == format_index)
    }

    /// Returns the first `(format, frame)` matching the requested geometry.
    /// Width and height of 0 match any frame.
    pub fn find_frame(
        &self,
        width: u16,
        height: u16,
        format_index: Option<u8>,
        kind: Option<FormatKind>,
    ) -> Option<(&StreamFormat, &FrameInfo)> {
        for fmt in &self.formats {
            if let Some(idx) = format_index {
                if fmt.format_index != idx {
                    continue;
                }
            }
            if let Some(kind) = kind {
                if fmt.kind != kind {
                    continue;
                }
            }
            for frame in &fmt.frames {
                if (width == 0 && height == 0) || (frame.width == width && frame.height == height) {
                    return Some((fmt, frame));
                }
            }
        }
        None
    }
}

/// Which kind of VC entity a control belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    CameraTerminal,
    ProcessingUnit,
    ExtensionUnit,
}

/// One selector exposed by a VC unit, with its descriptor-derived name.
#[derive(Debug, Clone)]
pub struct UnitControl {
    pub selector: u8,
    pub name: String,
}

/// A camera input terminal and the controls its `bmControls` advertises.
#[derive(Debug, Clone)]
pub struct InputTerminal {
    pub unit_id: u8,
    pub controls: Vec<UnitControl>,
}

/// A processing unit and the controls its `bmControls` advertises.
#[derive(Debug, Clone)]
pub struct ProcessingUnit {
    pub unit_id: u8,
    pub controls: Vec<UnitControl>,
}

/// A vendor extension unit. Selectors are emitted for the full control
/// count; whether each one actually works is decided later by `GET_INFO`.
#[derive(Debug, Clone)]
pub struct ExtensionUnit {
    pub unit_id: u8,
    pub guid: Uuid,
    pub controls: Vec<UnitControl>,
}

/// A control-bearing entity parsed from the VC interface.
#[derive(Debug, Clone)]
pub enum ControlUnit {
    InputTerminal(InputTerminal),
    ProcessingUnit(ProcessingUnit),
    ExtensionUnit(ExtensionUnit),
}

impl ControlUnit {
    pub fn unit_id(&self) -> u8 {
        match self {
            ControlUnit::InputTerminal(t) => t.unit_id,
            ControlUnit::ProcessingUnit(u) => u.unit_id,
            ControlUnit::ExtensionUnit(x) => x.unit_id,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            ControlUnit::InputTerminal(_) => UnitKind::CameraTerminal,
            ControlUnit::ProcessingUnit(_) => UnitKind::ProcessingUnit,
            ControlUnit::ExtensionUnit(_) => UnitKind::ExtensionUnit,
        }
    }

    pub fn controls(&self) -> &[UnitControl] {
        match self {
            ControlUnit::InputTerminal(t) => &t.controls,
            ControlUnit::ProcessingUnit(u) => &u.controls,
            ControlUnit::ExtensionUnit(x) => &x.controls,
        }
    }

    pub fn guid(&self) -> Option<&Uuid> {
        match self {
            ControlUnit::ExtensionUnit(x) => Some(&x.guid),
            _ => None,
        }
    }
}

impl fmt::Display for ControlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlUnit::InputTerminal(t) => write!(f, "Camera Terminal {}", t.unit_id),
            ControlUnit::ProcessingUnit(u) => write!(f, "Processing Unit {}", u.unit_id),
            ControlUnit::ExtensionUnit(x) => write!(f, "Extension Unit {} ({})", x.unit_id, x.guid),
        }
    }
}

pub(crate) fn interval_to_hz(interval_100ns: u32) -> f64 {
    if interval_100ns == 0 {
        0.0
    } else {
        1e7 / f64::from(interval_100ns)
    }
}
