//! PROBE/COMMIT negotiation.
//!
//! Streaming parameters are negotiated through a class-specific control
//! block whose size grew across UVC revisions (26, 34 and 48 bytes).
//! Devices routinely reject sizes they do not implement with a stall, so
//! negotiation walks a ladder of candidate lengths, and within a length a
//! ladder of frame-rate proposals.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::control::{Request, REQ_TYPE_IN, REQ_TYPE_OUT};
use crate::error::Error;
use crate::topo::{interval_to_hz, AltSetting, FormatKind, FrameInfo, StreamFormat, StreamingInterface};
use crate::transport::{TransferError, UsbHandle};
use crate::Result;

/// A Video Streaming interface control selector (the high byte of
/// `wValue` in VS class requests).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VsControl(pub(crate) u8);

impl VsControl {
    pub const PROBE: VsControl = VsControl(0x01);
    pub const COMMIT: VsControl = VsControl(0x02);
    pub const STILL_PROBE: VsControl = VsControl(0x03);
    pub const STILL_COMMIT: VsControl = VsControl(0x04);
    pub const STILL_IMAGE_TRIGGER: VsControl = VsControl(0x05);
}

impl std::fmt::Debug for VsControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self.0 {
            0x01 => "VS_PROBE_CONTROL",
            0x02 => "VS_COMMIT_CONTROL",
            0x03 => "VS_STILL_PROBE_CONTROL",
            0x04 => "VS_STILL_COMMIT_CONTROL",
            0x05 => "VS_STILL_IMAGE_TRIGGER_CONTROL",
            _ => return write!(f, "VsControl({:#04x})", self.0),
        })
    }
}

/// Probe block sizes of UVC 1.5, 1.1 and 1.0, in preference order.
const PROBE_LENGTHS: [u16; 3] = [48, 34, 26];

/// Acceptable deviation between requested and advertised rate in strict
/// mode.
pub(crate) const STRICT_FPS_TOLERANCE_HZ: f64 = 1e-3;

/// The negotiated streaming parameters, as committed to the device.
#[derive(Debug, Clone)]
pub struct Commit {
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval granted by the device, in 100 ns units.
    pub frame_interval: u32,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: Option<u32>,
    /// The control block length the device accepted.
    pub length: u16,
    pub selected_alt: u8,
    pub endpoint_address: u8,
    /// ISO packet size of the selected alternate setting.
    pub iso_packet_size: u32,
}

impl Commit {
    pub fn frame_rate_hz(&self) -> f64 {
        interval_to_hz(self.frame_interval)
    }
}

/// Outcome of a successful PROBE/COMMIT cycle, before alt selection.
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    /// The exact bytes sent to `SET_CUR(VS_COMMIT)`.
    pub bytes: Vec<u8>,
    pub length: u16,
    pub frame_interval: u32,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: Option<u32>,
}

/// IN request for a VS interface selector.
pub(crate) fn vs_read(
    handle: &dyn UsbHandle,
    interface: u8,
    request: Request,
    selector: VsControl,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransferError> {
    handle.control_in(
        REQ_TYPE_IN,
        request.0,
        u16::from(selector.0) << 8,
        u16::from(interface),
        len,
        timeout,
    )
}

/// OUT request for a VS interface selector.
pub(crate) fn vs_write(
    handle: &dyn UsbHandle,
    interface: u8,
    request: Request,
    selector: VsControl,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TransferError> {
    handle.control_out(
        REQ_TYPE_OUT,
        request.0,
        u16::from(selector.0) << 8,
        u16::from(interface),
        data,
        timeout,
    )
}

/// `GET_LEN` of a VS selector, when the device implements it.
fn announced_length(
    handle: &dyn UsbHandle,
    interface: u8,
    selector: VsControl,
    timeout: Duration,
) -> Option<u16> {
    let data = vs_read(handle, interface, Request::GET_LEN, selector, 2, timeout).ok()?;
    if data.len() >= 2 {
        Some(LE::read_u16(&data)).filter(|&len| len != 0)
    } else {
        None
    }
}

/// The probe block lengths to attempt, device-announced length first.
pub(crate) fn candidate_lengths(
    handle: &dyn UsbHandle,
    interface: u8,
    timeout: Duration,
) -> Vec<u16> {
    let mut lengths = PROBE_LENGTHS.to_vec();
    if let Some(announced) = announced_length(handle, interface, VsControl::PROBE, timeout) {
        log::debug!("VS_PROBE device announced length {} bytes", announced);
        lengths.retain(|&len| len != announced);
        lengths.insert(0, announced);
    }
    lengths
}

/// The `(bmHint, dwFrameInterval)` proposals to attempt, in order.
///
/// The requested rate comes first; then every advertised rate, lowest first
/// for uncompressed formats (cheapest bandwidth) and highest first for
/// compressed ones; finally the device default with the hint cleared. In
/// strict mode the requested rate is the only proposal.
pub(crate) fn fps_candidates(
    kind: FormatKind,
    frame: &FrameInfo,
    fps: Option<f64>,
    strict: bool,
) -> Result<Vec<(u16, Option<u32>)>> {
    let mut candidates: Vec<(u16, Option<u32>)> = Vec::new();

    if let Some(fps) = fps.filter(|&fps| fps > 0.0) {
        let interval = frame.pick_interval(Some(fps), strict, STRICT_FPS_TOLERANCE_HZ)?;
        candidates.push((1, Some(interval)));
        // Strict mode must not silently fall back to another rate.
        if strict {
            return Ok(candidates);
        }
    }

    let mut intervals = frame.intervals.clone();
    match kind {
        // fps ascending == interval descending.
        FormatKind::Uncompressed => intervals.sort_unstable_by(|a, b| b.cmp(a)),
        _ => intervals.sort_unstable(),
    }
    for interval in intervals {
        if !candidates.iter().any(|(_, i)| *i == Some(interval)) {
            candidates.push((1, Some(interval)));
        }
    }

    candidates.push((0, None));
    Ok(candidates)
}

/// Runs the full negotiation ladder and commits the result.
pub(crate) fn negotiate_stream(
    handle: &dyn UsbHandle,
    interface: u8,
    format: &StreamFormat,
    frame: &FrameInfo,
    fps: Option<f64>,
    strict: bool,
    timeout: Duration,
) -> Result<Negotiated> {
    let lengths = candidate_lengths(handle, interface, timeout);
    let candidates = fps_candidates(format.kind, frame, fps, strict)?;

    let mut tried_lengths: Vec<u16> = Vec::new();
    let mut last: Option<TransferError> = None;

    for (hint, interval) in candidates {
        for &length in &lengths {
            log::debug!(
                "attempting PROBE/COMMIT: len={} bmHint={} fmt={} frame={} interval={:?}",
                length,
                hint,
                format.format_index,
                frame.frame_index,
                interval,
            );
            match probe_commit_with_length(
                handle,
                interface,
                format.format_index,
                frame.frame_index,
                hint,
                interval,
                length,
                timeout,
            ) {
                Ok(negotiated) => return Ok(negotiated),
                Err(e) if e.is_retryable_probe_error() => {
                    log::warn!(
                        "PROBE length {} rejected ({:?}); trying next option",
                        length,
                        e.kind
                    );
                    if !tried_lengths.contains(&length) {
                        tried_lengths.push(length);
                    }
                    last = Some(e);
                }
                Err(e) => {
                    if !tried_lengths.contains(&length) {
                        tried_lengths.push(length);
                    }
                    return Err(Error::NegotiationFailed {
                        reason: format!("PROBE/COMMIT aborted at length {}", length),
                        tried_lengths,
                        last: Some(e),
                    });
                }
            }
        }
    }

    Err(Error::NegotiationFailed {
        reason: "device rejected every PROBE/COMMIT proposal".into(),
        tried_lengths,
        last,
    })
}

/// One PROBE/COMMIT cycle at a fixed control block length.
#[allow(clippy::too_many_arguments)]
fn probe_commit_with_length(
    handle: &dyn UsbHandle,
    interface: u8,
    format_index: u8,
    frame_index: u8,
    hint: u16,
    interval: Option<u32>,
    length: u16,
    timeout: Duration,
) -> Result<Negotiated, TransferError> {
    // Template priority: current, then default, then zeros.
    let template = vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::PROBE,
        length.into(),
        timeout,
    )
    .or_else(|_| {
        vs_read(
            handle,
            interface,
            Request::GET_DEF,
            VsControl::PROBE,
            length.into(),
            timeout,
        )
    })
    .unwrap_or_default();

    let mut buf = template;
    buf.resize(length.into(), 0);

    LE::write_u16(&mut buf[0..2], hint);
    buf[2] = format_index;
    buf[3] = frame_index;
    if hint & 0x01 != 0 {
        if let Some(interval) = interval {
            LE::write_u32(&mut buf[4..8], interval);
        }
    }

    log::debug!("VS_PROBE SET_CUR payload={}", hex_dump(&buf));
    vs_write(handle, interface, Request::SET_CUR, VsControl::PROBE, &buf, timeout)?;

    let negotiated = match vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::PROBE,
        length.into(),
        timeout,
    ) {
        Ok(mut data) => {
            data.resize(length.into(), 0);
            data
        }
        // Some devices won't answer GET_CUR after a probe; trust our own
        // proposal in that case.
        Err(_) => buf.clone(),
    };
    log::debug!("VS_PROBE GET_CUR payload={}", hex_dump(&negotiated));

    // Commit exactly what the device handed back.
    log::debug!("VS_COMMIT SET_CUR payload={}", hex_dump(&negotiated));
    vs_write(
        handle,
        interface,
        Request::SET_CUR,
        VsControl::COMMIT,
        &negotiated,
        timeout,
    )?;

    Ok(parse_negotiated(negotiated, length))
}

fn parse_negotiated(bytes: Vec<u8>, length: u16) -> Negotiated {
    let read_u32 = |offset: usize| {
        if offset + 4 <= bytes.len() {
            LE::read_u32(&bytes[offset..offset + 4])
        } else {
            0
        }
    };

    Negotiated {
        frame_interval: read_u32(4),
        max_video_frame_size: read_u32(18),
        max_payload_transfer_size: read_u32(22),
        clock_frequency: if bytes.len() >= 30 {
            Some(read_u32(26))
        } else {
            None
        },
        length,
        bytes,
    }
}

/// Re-runs a minimal PROBE/COMMIT with already-negotiated values.
///
/// Some devices only honor a commit issued on the handle that goes on to
/// own the isochronous endpoint, so the streaming start procedure repeats
/// the handshake on its fresh handle using the length that already worked.
pub(crate) fn recommit(
    handle: &dyn UsbHandle,
    interface: u8,
    commit: &Commit,
    timeout: Duration,
) -> Result<(), TransferError> {
    let length = usize::from(commit.length);
    let mut buf = vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::PROBE,
        length,
        timeout,
    )
    .unwrap_or_default();
    buf.resize(length, 0);

    LE::write_u16(&mut buf[0..2], 1);
    buf[2] = commit.format_index;
    buf[3] = commit.frame_index;
    LE::write_u32(&mut buf[4..8], commit.frame_interval);

    vs_write(handle, interface, Request::SET_CUR, VsControl::PROBE, &buf, timeout)?;
    let negotiated = match vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::PROBE,
        length,
        timeout,
    ) {
        Ok(mut data) => {
            data.resize(length, 0);
            data
        }
        Err(_) => buf,
    };
    vs_write(
        handle,
        interface,
        Request::SET_CUR,
        VsControl::COMMIT,
        &negotiated,
        timeout,
    )
}

/// Picks the alternate setting for the committed stream.
///
/// The smallest isochronous alternate whose packet size covers the payload
/// requirement wins; an explicit `alt_override` bypasses the search.
pub(crate) fn select_alt<'a>(
    interface: &'a StreamingInterface,
    negotiated: &Negotiated,
    frame: &FrameInfo,
    alt_override: Option<u8>,
) -> Result<&'a AltSetting> {
    let alt = match alt_override {
        Some(alt) => interface.get_alt(alt).ok_or(Error::NoSuitableAltSetting)?,
        None => {
            let required = negotiated
                .max_payload_transfer_size
                .max(frame.max_frame_size);
            interface
                .select_alt_for_payload(required)
                .ok_or(Error::NoSuitableAltSetting)?
        }
    };

    if alt.endpoint_address.is_none() {
        return Err(Error::NoSuitableAltSetting);
    }
    Ok(alt)
}

/// Logs a warning when the selected alternate cannot sustain the committed
/// rate. Truncated frames are the likely symptom; streaming still starts.
pub(crate) fn check_bandwidth(frame_interval: u32, frame_bytes: u32, packet_size: u32, alt: u8) {
    let fps = interval_to_hz(frame_interval);
    if fps <= 0.0 || frame_bytes == 0 || packet_size == 0 {
        return;
    }
    let required = fps * f64::from(frame_bytes);
    let capacity = f64::from(packet_size) * 8000.0;
    if required > capacity {
        log::warn!(
            "alt setting {} provides {:.2} MB/s < required {:.2} MB/s; expect truncated frames",
            alt,
            capacity / 1e6,
            required / 1e6,
        );
    }
}

pub(crate) fn hex_dump(data: &[u8]) -> String {
    const LIMIT: usize = 64;
    let hexed: String = data.iter().take(LIMIT).map(|b| format!("{:02x}", b)).collect();
    if data.len() <= LIMIT {
        hexed
    } else {
        format!("{}...( +{}B)", hexed, data.len() - LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(intervals: &[u32]) -> FrameInfo {
        FrameInfo {
            frame_index: 1,
            width: 640,
            height: 480,
            default_interval: intervals[0],
            intervals: {
                let mut v = intervals.to_vec();
                v.sort_unstable();
                v
            },
            max_frame_size: 614_400,
            still_supported: false,
        }
    }

    #[test]
    fn negotiated_field_offsets() {
        let mut bytes = vec![0; 34];
        LE::write_u32(&mut bytes[4..8], 333_333);
        LE::write_u32(&mut bytes[18..22], 614_400);
        LE::write_u32(&mut bytes[22..26], 3072);
        LE::write_u32(&mut bytes[26..30], 48_000_000);

        let negotiated = parse_negotiated(bytes, 34);
        assert_eq!(negotiated.frame_interval, 333_333);
        assert_eq!(negotiated.max_video_frame_size, 614_400);
        assert_eq!(negotiated.max_payload_transfer_size, 3072);
        assert_eq!(negotiated.clock_frequency, Some(48_000_000));

        let negotiated = parse_negotiated(vec![0; 26], 26);
        assert_eq!(negotiated.clock_frequency, None);
    }

    #[test]
    fn interval_selection_nearest() {
        // 30/15/10 Hz; 14 fps requested.
        let frame = frame(&[333_333, 666_666, 1_000_000]);
        let picked = frame.pick_interval(Some(14.0), false, STRICT_FPS_TOLERANCE_HZ);
        assert_eq!(picked.unwrap(), 666_666);
    }

    #[test]
    fn interval_selection_strict_rejects() {
        let frame = frame(&[333_333, 666_666, 1_000_000]);
        let err = frame.pick_interval(Some(14.0), true, 0.01).unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed { .. }));
    }

    #[test]
    fn candidate_order_uncompressed_prefers_low_rates() {
        let frame = frame(&[333_333, 666_666]);
        let candidates =
            fps_candidates(FormatKind::Uncompressed, &frame, Some(30.0), false).unwrap();
        assert_eq!(
            candidates,
            [
                (1, Some(333_333)), // requested 30 fps
                (1, Some(666_666)), // then lowest advertised rate first
                (0, None),          // device default last
            ]
        );
    }

    #[test]
    fn candidate_order_compressed_prefers_high_rates() {
        let frame = frame(&[333_333, 666_666, 1_000_000]);
        let candidates = fps_candidates(FormatKind::Mjpeg, &frame, None, false).unwrap();
        assert_eq!(
            candidates,
            [
                (1, Some(333_333)),
                (1, Some(666_666)),
                (1, Some(1_000_000)),
                (0, None),
            ]
        );
    }

    #[test]
    fn strict_mode_proposes_only_the_requested_rate() {
        let frame = frame(&[333_333, 666_666]);
        let candidates =
            fps_candidates(FormatKind::Uncompressed, &frame, Some(15.0), true).unwrap();
        assert_eq!(candidates, [(1, Some(666_666))]);
    }

    #[test]
    fn alt_selection_smallest_sufficient() {
        let interface = StreamingInterface {
            interface_number: 1,
            formats: Vec::new(),
            alt_settings: vec![
                AltSetting {
                    alt_setting: 0,
                    endpoint_address: None,
                    endpoint_attributes: None,
                    max_packet_size: 0,
                },
                AltSetting {
                    alt_setting: 1,
                    endpoint_address: Some(0x81),
                    endpoint_attributes: Some(0x05),
                    max_packet_size: 1024,
                },
                AltSetting {
                    alt_setting: 2,
                    endpoint_address: Some(0x81),
                    endpoint_attributes: Some(0x05),
                    max_packet_size: 2048,
                },
                AltSetting {
                    alt_setting: 3,
                    endpoint_address: Some(0x81),
                    endpoint_attributes: Some(0x05),
                    max_packet_size: 3072,
                },
            ],
        };

        let alt = interface.select_alt_for_payload(1500).unwrap();
        assert_eq!(alt.alt_setting, 2);

        // Nothing satisfies 4 KiB; the largest available wins.
        let alt = interface.select_alt_for_payload(4096).unwrap();
        assert_eq!(alt.alt_setting, 3);
    }
}
