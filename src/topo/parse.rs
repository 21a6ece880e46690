//! Class-specific descriptor parsing.
//!
//! The descriptor blob attached to an interface is a sequence of TLV records
//! (`bLength`, `bDescriptorType`, `bDescriptorSubType`, payload). Records of
//! type `CS_INTERFACE` are decoded according to the owning interface's
//! subclass; everything else is skipped.

use byteorder::{ByteOrder, LittleEndian as LE};
use uuid::Uuid;

use crate::error::Error;
use crate::topo::{
    AltSetting, ControlUnit, ExtensionUnit, FormatKind, FrameInfo, InputTerminal, ProcessingUnit,
    StillFrameInfo, StreamFormat, StreamingInterface, UnitControl,
};
use crate::transport::InterfaceAlt;
use crate::Result;

pub(crate) const UVC_CLASS: u8 = 0x0E;
pub(crate) const VC_SUBCLASS: u8 = 0x01;
pub(crate) const VS_SUBCLASS: u8 = 0x02;

const CS_INTERFACE: u8 = 0x24;

const VC_INPUT_TERMINAL: u8 = 0x02;
const VC_PROCESSING_UNIT: u8 = 0x05;
const VC_EXTENSION_UNIT: u8 = 0x06;

const VS_STILL_IMAGE_FRAME: u8 = 0x03;
const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
const VS_FORMAT_MJPEG: u8 = 0x06;
const VS_FRAME_MJPEG: u8 = 0x07;
const VS_FORMAT_FRAME_BASED: u8 = 0x10;
const VS_FRAME_FRAME_BASED: u8 = 0x11;

const ITT_CAMERA: u16 = 0x0201;

/// Camera Terminal control names, indexed by `selector - 1`.
const CAMERA_TERMINAL_CONTROLS: &[&str] = &[
    "Scanning Mode",
    "Auto-Exposure Mode",
    "Auto-Exposure Priority",
    "Exposure Time, Absolute",
    "Exposure Time, Relative",
    "Focus, Absolute",
    "Focus, Relative",
    "Focus, Auto",
    "Iris, Absolute",
    "Iris, Relative",
    "Zoom, Absolute",
    "Zoom, Relative",
    "PanTilt, Absolute",
    "PanTilt, Relative",
    "Roll, Absolute",
    "Roll, Relative",
    "Privacy",
    "Focus, Simple",
    "Window",
    "Region of Interest",
];

/// Processing Unit control names, indexed by `selector - 1`.
const PROCESSING_UNIT_CONTROLS: &[&str] = &[
    "Backlight Compensation",
    "Brightness",
    "Contrast",
    "Gain",
    "Power Line Frequency",
    "Hue",
    "Saturation",
    "Sharpness",
    "Gamma",
    "White Balance Temperature",
    "White Balance Temperature, Auto",
    "White Balance Component",
    "White Balance Component, Auto",
    "Digital Multiplier",
    "Digital Multiplier Limit",
    "Hue, Auto",
    "Analog Video Standard",
    "Analog Video Lock Status",
    "Contrast, Auto",
];

/// Iterates the TLV records of a class-specific blob. Records whose length
/// is zero or runs past the buffer end the iteration.
fn descriptors(extra: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let mut idx = 0;
    std::iter::from_fn(move || {
        if idx + 2 >= extra.len() {
            return None;
        }
        let length = usize::from(extra[idx]);
        if length == 0 || idx + length > extra.len() {
            return None;
        }
        let desc = &extra[idx..idx + length];
        idx += length;
        Some(desc)
    })
}

/// Decodes the Video Control interface blob into its control-bearing units.
pub(crate) fn parse_vc_descriptors(extra: &[u8]) -> Result<Vec<ControlUnit>> {
    let mut units = Vec::new();

    for desc in descriptors(extra) {
        if desc[1] != CS_INTERFACE {
            log::debug!("skipping descriptor of type {:#04x}", desc[1]);
            continue;
        }
        if desc.len() < 4 {
            continue;
        }

        match desc[2] {
            VC_INPUT_TERMINAL => {
                if desc.len() < 8 {
                    return Err(Error::BadDescriptor(format!(
                        "INPUT_TERMINAL descriptor is {} bytes",
                        desc.len()
                    )));
                }
                let terminal_type = LE::read_u16(&desc[4..6]);
                if terminal_type != ITT_CAMERA {
                    log::debug!("skipping input terminal of type {:#06x}", terminal_type);
                    continue;
                }
                // Camera terminals carry a 3-byte bmControls at offset 15.
                let controls = if desc.len() >= 18 {
                    let bitmap = u32::from(desc[15])
                        | u32::from(desc[16]) << 8
                        | u32::from(desc[17]) << 16;
                    bitmap_controls(bitmap as u64, |sel| {
                        named_selector(CAMERA_TERMINAL_CONTROLS, "Camera Terminal", sel)
                    })
                } else {
                    Vec::new()
                };
                units.push(ControlUnit::InputTerminal(InputTerminal {
                    unit_id: desc[3],
                    controls,
                }));
            }
            VC_PROCESSING_UNIT => {
                if desc.len() < 8 {
                    return Err(Error::BadDescriptor(format!(
                        "PROCESSING_UNIT descriptor is {} bytes",
                        desc.len()
                    )));
                }
                let control_size = usize::from(desc[7]);
                let mut bitmap = 0u64;
                for (i, &byte) in desc[8..].iter().take(control_size.min(6)).enumerate() {
                    bitmap |= u64::from(byte) << (8 * i);
                }
                units.push(ControlUnit::ProcessingUnit(ProcessingUnit {
                    unit_id: desc[3],
                    controls: bitmap_controls(bitmap, |sel| {
                        named_selector(PROCESSING_UNIT_CONTROLS, "Processing Unit", sel)
                    }),
                }));
            }
            VC_EXTENSION_UNIT => {
                if desc.len() < 22 {
                    return Err(Error::BadDescriptor(format!(
                        "EXTENSION_UNIT descriptor is {} bytes",
                        desc.len()
                    )));
                }
                let unit_id = desc[3];
                let guid = read_guid(&desc[4..20]);
                let num_controls = desc[20];
                let num_pins = usize::from(desc[21]);
                let control_size_off = 22 + num_pins;
                let control_size = desc.get(control_size_off).copied().unwrap_or(0);

                // Vendor bitmaps are unreliable; expose every selector the
                // unit could have and let GET_INFO sort out the real ones.
                let count = num_controls.max(control_size.saturating_mul(8));
                let controls = (1..=count)
                    .map(|sel| UnitControl {
                        selector: sel,
                        name: format!("XU {} Control {}", unit_id, sel),
                    })
                    .collect();
                units.push(ControlUnit::ExtensionUnit(ExtensionUnit {
                    unit_id,
                    guid,
                    controls,
                }));
            }
            other => log::debug!("skipping VC descriptor subtype {:#04x}", other),
        }
    }

    Ok(units)
}

fn bitmap_controls(bitmap: u64, name: impl Fn(u8) -> String) -> Vec<UnitControl> {
    (0..48)
        .filter(|bit| bitmap & (1 << bit) != 0)
        .map(|bit| {
            let selector = bit as u8 + 1;
            UnitControl {
                selector,
                name: name(selector),
            }
        })
        .collect()
}

fn named_selector(table: &[&str], unit: &str, selector: u8) -> String {
    table
        .get(usize::from(selector) - 1)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{} Selector {}", unit, selector))
}

/// Converts a UVC GUID to RFC byte order. The first three groups are stored
/// little-endian, the rest big-endian.
pub(crate) fn read_guid(raw: &[u8]) -> Uuid {
    let mut bytes = [0; 16];
    bytes[0..4].copy_from_slice(&raw[0..4]);
    bytes[0..4].reverse();
    bytes[4..6].copy_from_slice(&raw[4..6]);
    bytes[4..6].reverse();
    bytes[6..8].copy_from_slice(&raw[6..8]);
    bytes[6..8].reverse();
    bytes[8..16].copy_from_slice(&raw[8..16]);
    Uuid::from_bytes(bytes)
}

/// Decodes the VS interface blob into its formats (with frames and still
/// sizes attached).
pub(crate) fn parse_vs_descriptors(extra: &[u8]) -> Vec<StreamFormat> {
    let mut formats: Vec<StreamFormat> = Vec::new();

    for desc in descriptors(extra) {
        if desc[1] != CS_INTERFACE {
            continue;
        }

        match desc[2] {
            VS_FORMAT_UNCOMPRESSED | VS_FORMAT_MJPEG | VS_FORMAT_FRAME_BASED => {
                if let Some(fmt) = parse_format_descriptor(desc) {
                    if formats.iter().any(|f| f.format_index == fmt.format_index) {
                        log::warn!("duplicate format index {}, skipping", fmt.format_index);
                    } else {
                        formats.push(fmt);
                    }
                }
            }
            VS_FRAME_UNCOMPRESSED | VS_FRAME_MJPEG | VS_FRAME_FRAME_BASED => {
                if let Some(fmt) = formats.last_mut() {
                    if let Some(frame) = parse_frame_descriptor(desc) {
                        if fmt.frames.iter().any(|f| f.frame_index == frame.frame_index) {
                            log::warn!("duplicate frame index {}, skipping", frame.frame_index);
                        } else {
                            fmt.frames.push(frame);
                        }
                    }
                }
            }
            VS_STILL_IMAGE_FRAME => {
                if let Some(fmt) = formats.last_mut() {
                    fmt.still_frames = parse_still_image_frame(desc);
                }
            }
            other => log::debug!("skipping VS descriptor subtype {:#04x}", other),
        }
    }

    formats
}

fn parse_format_descriptor(desc: &[u8]) -> Option<StreamFormat> {
    if desc.len() < 5 {
        return None;
    }
    let format_index = desc[3];
    let mut guid = [0; 16];
    if desc.len() >= 21 {
        guid.copy_from_slice(&desc[5..21]);
    }

    let (kind, description) = match desc[2] {
        VS_FORMAT_MJPEG => (FormatKind::Mjpeg, "MJPEG".to_string()),
        VS_FORMAT_UNCOMPRESSED => (FormatKind::Uncompressed, format_fourcc(&guid)),
        VS_FORMAT_FRAME_BASED => (
            FormatKind::FrameBased,
            format!("Frame-based {}", format_fourcc(&guid)),
        ),
        _ => return None,
    };

    Some(StreamFormat {
        format_index,
        kind,
        guid,
        description,
        frames: Vec::new(),
        still_frames: Vec::new(),
    })
}

fn parse_frame_descriptor(desc: &[u8]) -> Option<FrameInfo> {
    if desc.len() < 26 {
        return None;
    }

    let frame_index = desc[3];
    let still_supported = desc[4] & 0x01 != 0;
    let width = LE::read_u16(&desc[5..7]);
    let height = LE::read_u16(&desc[7..9]);
    let max_frame_size = LE::read_u32(&desc[17..21]);
    let default_interval = LE::read_u32(&desc[21..25]);
    let interval_type = desc[25];

    let mut intervals = Vec::new();
    if interval_type == 0 {
        // Continuous range: enumerate the endpoints plus the default; the
        // step is not useful for interval selection.
        if desc.len() >= 26 + 12 {
            let min = LE::read_u32(&desc[26..30]);
            let max = LE::read_u32(&desc[30..34]);
            intervals.extend([min, max, default_interval].iter().filter(|&&v| v != 0));
        }
    } else {
        let mut offset = 26;
        for _ in 0..interval_type {
            if offset + 4 > desc.len() {
                break;
            }
            let value = LE::read_u32(&desc[offset..offset + 4]);
            if value != 0 {
                intervals.push(value);
            }
            offset += 4;
        }
    }

    if default_interval != 0 && !intervals.contains(&default_interval) {
        intervals.push(default_interval);
    }
    intervals.sort_unstable();
    intervals.dedup();

    Some(FrameInfo {
        frame_index,
        width,
        height,
        default_interval,
        intervals,
        max_frame_size,
        still_supported,
    })
}

fn parse_still_image_frame(desc: &[u8]) -> Vec<StillFrameInfo> {
    if desc.len() < 5 {
        return Vec::new();
    }
    let endpoint_address = desc[3];
    let num_sizes = usize::from(desc[4]);

    let mut sizes = Vec::new();
    let mut offset = 5;
    for i in 0..num_sizes {
        if offset + 4 > desc.len() {
            break;
        }
        sizes.push((
            i as u8 + 1,
            LE::read_u16(&desc[offset..offset + 2]),
            LE::read_u16(&desc[offset + 2..offset + 4]),
        ));
        offset += 4;
    }

    let mut compressions = Vec::new();
    if offset < desc.len() {
        let num_compressions = usize::from(desc[offset]);
        offset += 1;
        compressions.extend(desc[offset..].iter().take(num_compressions).copied());
    }

    sizes
        .into_iter()
        .map(|(index, width, height)| StillFrameInfo {
            index,
            endpoint_address,
            width,
            height,
            compression_indices: compressions.clone(),
        })
        .collect()
}

/// Names an uncompressed format after the fourcc embedded in its GUID.
fn format_fourcc(guid: &[u8; 16]) -> String {
    let code = &guid[..4];
    if code.iter().all(|&b| (32..127).contains(&b)) {
        let text: String = code
            .iter()
            .map(|&b| b as char)
            .collect::<String>()
            .trim_end_matches('\0')
            .to_string();
        if !text.is_empty() {
            return text;
        }
    }
    format!("0x{:02x}{:02x}{:02x}{:02x}", code[0], code[1], code[2], code[3])
}

/// Groups the alternate settings of one VS interface and parses the
/// class-specific blob found on alternate 0.
pub(crate) fn build_streaming_interface(alts: &[&InterfaceAlt]) -> StreamingInterface {
    let interface_number = alts[0].interface_number;
    let mut interface = StreamingInterface {
        interface_number,
        formats: Vec::new(),
        alt_settings: Vec::new(),
    };

    for alt in alts {
        let ep = alt.endpoints.first();
        interface.alt_settings.push(AltSetting {
            alt_setting: alt.alt_setting,
            endpoint_address: ep.map(|e| e.address),
            endpoint_attributes: ep.map(|e| e.attributes),
            max_packet_size: ep.map(|e| e.payload_capacity()).unwrap_or(0),
        });

        // Alternate settings other than zero rarely repeat the class
        // descriptors, so only alt 0 is parsed.
        if alt.alt_setting == 0 && !alt.extra.is_empty() {
            interface.formats = parse_vs_descriptors(&alt.extra);
        }
    }

    interface
        .alt_settings
        .sort_by_key(|alt| alt.alt_setting);
    interface
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_desc(buf: &mut Vec<u8>, subtype: u8, payload: &[u8]) {
        buf.push(payload.len() as u8 + 3);
        buf.push(CS_INTERFACE);
        buf.push(subtype);
        buf.extend_from_slice(payload);
    }

    #[test]
    fn processing_unit_selector_names() {
        // bControlSize=3, bmControls=0x00000FC7.
        let mut blob = Vec::new();
        push_desc(
            &mut blob,
            VC_PROCESSING_UNIT,
            &[
                5, // bUnitID
                1, // bSourceID
                0, 0, // wMaxMultiplier
                3, // bControlSize
                0xC7, 0x0F, 0x00, // bmControls
                0, // iProcessing
            ],
        );

        let units = parse_vc_descriptors(&blob).unwrap();
        assert_eq!(units.len(), 1);
        let controls = units[0].controls();
        let selectors: Vec<u8> = controls.iter().map(|c| c.selector).collect();
        assert_eq!(selectors, [1, 2, 3, 6, 7, 8, 9, 10, 11]);
        let names: Vec<&str> = controls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Backlight Compensation",
                "Brightness",
                "Contrast",
                "Hue",
                "Saturation",
                "Sharpness",
                "Gamma",
                "White Balance Temperature",
                "White Balance Temperature, Auto",
            ]
        );
    }

    #[test]
    fn camera_terminal_controls() {
        // bits 3 (Exposure Time, Absolute) and 10 (Zoom, Absolute).
        let mut blob = Vec::new();
        push_desc(
            &mut blob,
            VC_INPUT_TERMINAL,
            &[
                1, // bTerminalID
                0x01, 0x02, // wTerminalType = ITT_CAMERA
                0,    // bAssocTerminal
                0,    // iTerminal
                0, 0, // wObjectiveFocalLengthMin
                0, 0, // wObjectiveFocalLengthMax
                0, 0, // wOcularFocalLength
                3, // bControlSize
                0x08, 0x04, 0x00, // bmControls
            ],
        );

        let units = parse_vc_descriptors(&blob).unwrap();
        let controls = units[0].controls();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].selector, 4);
        assert_eq!(controls[0].name, "Exposure Time, Absolute");
        assert_eq!(controls[1].selector, 11);
        assert_eq!(controls[1].name, "Zoom, Absolute");
    }

    #[test]
    fn extension_unit_guid_and_selectors() {
        let mut payload = vec![8]; // bUnitID
        // {A29E7641-DE04-47E3-8B2B-F4341AFF003B} in wire order.
        payload.extend_from_slice(&[
            0x41, 0x76, 0x9E, 0xA2, 0x04, 0xDE, 0xE3, 0x47, 0x8B, 0x2B, 0xF4, 0x34, 0x1A, 0xFF,
            0x00, 0x3B,
        ]);
        payload.push(3); // bNumControls
        payload.push(1); // bNrInPins
        payload.push(2); // baSourceID
        payload.push(1); // bControlSize
        payload.push(0x07); // bmControls
        payload.push(0); // iExtension

        let mut blob = Vec::new();
        push_desc(&mut blob, VC_EXTENSION_UNIT, &payload);

        let units = parse_vc_descriptors(&blob).unwrap();
        let xu = match &units[0] {
            ControlUnit::ExtensionUnit(xu) => xu,
            other => panic!("unexpected unit {:?}", other),
        };
        assert_eq!(
            xu.guid.to_string(),
            "a29e7641-de04-47e3-8b2b-f4341aff003b"
        );
        // max(bNumControls, 8 * bControlSize) selectors.
        assert_eq!(xu.controls.len(), 8);
        assert_eq!(xu.controls[0].selector, 1);
        assert_eq!(xu.controls[7].selector, 8);
    }

    fn yuy2_format(index: u8) -> Vec<u8> {
        let mut payload = vec![index, 1];
        payload.extend_from_slice(b"YUY2");
        payload.extend_from_slice(&[
            0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
        ]);
        payload.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
        payload
    }

    fn frame_desc(index: u8, width: u16, height: u16, intervals: &[u32]) -> Vec<u8> {
        let mut payload = vec![index, 0x01]; // bmCapabilities: still supported
        payload.extend_from_slice(&width.to_le_bytes());
        payload.extend_from_slice(&height.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes()); // dwMinBitRate
        payload.extend_from_slice(&0u32.to_le_bytes()); // dwMaxBitRate
        payload.extend_from_slice(&(u32::from(width) * u32::from(height) * 2).to_le_bytes());
        payload.extend_from_slice(&intervals[0].to_le_bytes()); // default
        payload.push(intervals.len() as u8);
        for interval in intervals {
            payload.extend_from_slice(&interval.to_le_bytes());
        }
        payload
    }

    #[test]
    fn vs_formats_and_frames() {
        let mut blob = Vec::new();
        push_desc(&mut blob, VS_FORMAT_UNCOMPRESSED, &yuy2_format(1));
        push_desc(
            &mut blob,
            VS_FRAME_UNCOMPRESSED,
            &frame_desc(1, 640, 480, &[333333, 666666, 0]),
        );
        push_desc(
            &mut blob,
            VS_FRAME_UNCOMPRESSED,
            &frame_desc(2, 1280, 720, &[666666]),
        );

        let formats = parse_vs_descriptors(&blob);
        assert_eq!(formats.len(), 1);
        let fmt = &formats[0];
        assert_eq!(fmt.kind, FormatKind::Uncompressed);
        assert_eq!(fmt.description, "YUY2");
        assert_eq!(fmt.frames.len(), 2);

        let frame = &fmt.frames[0];
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.max_frame_size, 640 * 480 * 2);
        assert_eq!(frame.default_interval, 333333);
        // Zero intervals are filtered out.
        assert_eq!(frame.intervals, [333333, 666666]);
        assert!(frame.still_supported);
    }

    #[test]
    fn continuous_interval_expansion() {
        let mut payload = vec![1, 0x00];
        payload.extend_from_slice(&640u16.to_le_bytes());
        payload.extend_from_slice(&480u16.to_le_bytes());
        payload.extend_from_slice(&[0; 8]);
        payload.extend_from_slice(&614400u32.to_le_bytes());
        payload.extend_from_slice(&400000u32.to_le_bytes()); // default
        payload.push(0); // continuous
        payload.extend_from_slice(&333333u32.to_le_bytes()); // min
        payload.extend_from_slice(&1000000u32.to_le_bytes()); // max
        payload.extend_from_slice(&333333u32.to_le_bytes()); // step

        let mut blob = Vec::new();
        push_desc(&mut blob, VS_FORMAT_UNCOMPRESSED, &yuy2_format(1));
        push_desc(&mut blob, VS_FRAME_UNCOMPRESSED, &payload);

        let formats = parse_vs_descriptors(&blob);
        let frame = &formats[0].frames[0];
        assert_eq!(frame.intervals, [333333, 400000, 1000000]);
    }

    #[test]
    fn still_image_frame_sizes() {
        let mut blob = Vec::new();
        push_desc(&mut blob, VS_FORMAT_MJPEG, &[1, 1, 0, 1, 1, 0, 0, 0]);
        push_desc(
            &mut blob,
            VS_FRAME_MJPEG,
            &frame_desc(1, 640, 480, &[333333]),
        );
        let mut still = vec![0x83, 2]; // endpoint, two sizes
        still.extend_from_slice(&1280u16.to_le_bytes());
        still.extend_from_slice(&720u16.to_le_bytes());
        still.extend_from_slice(&1920u16.to_le_bytes());
        still.extend_from_slice(&1080u16.to_le_bytes());
        still.push(1); // one compression pattern
        still.push(5);
        push_desc(&mut blob, VS_STILL_IMAGE_FRAME, &still);

        let formats = parse_vs_descriptors(&blob);
        let stills = &formats[0].still_frames;
        assert_eq!(stills.len(), 2);
        assert_eq!(stills[0].index, 1);
        assert_eq!(stills[0].endpoint_address, 0x83);
        assert_eq!((stills[1].width, stills[1].height), (1920, 1080));
        assert_eq!(stills[1].compression_indices, [5]);
    }

    #[test]
    fn zero_length_record_terminates_scan() {
        let mut blob = Vec::new();
        push_desc(&mut blob, VS_FORMAT_MJPEG, &[1, 1, 0, 1, 1, 0, 0, 0]);
        blob.push(0); // corrupt record
        push_desc(&mut blob, VS_FORMAT_MJPEG, &[2, 1, 0, 1, 1, 0, 0, 0]);

        let formats = parse_vs_descriptors(&blob);
        assert_eq!(formats.len(), 1);
    }
}
