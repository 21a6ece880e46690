//! Still image capture.
//!
//! UVC offers two capture methods: method 1 piggybacks on the running video
//! stream (a frame advertises the still capability and a trigger marks one
//! frame as the still), method 2 uses dedicated still frame descriptors
//! with their own PROBE/COMMIT cycle and possibly their own endpoint.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::control::Request;
use crate::error::Error;
use crate::payload::{EndReason, FrameAssembler};
use crate::probe::{hex_dump, vs_read, vs_write, VsControl};
use crate::topo::{FrameInfo, StillFrameInfo, StreamFormat};
use crate::transport::{TransferError, TransferKind, UsbHandle};
use crate::Result;

/// UVC 1.1 still probe block: format, frame, compression plus two dwords.
const STILL_PROBE_LEN: u16 = 11;

/// How a still image will be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillMethod {
    /// Trigger over the running video stream.
    Method1,
    /// Dedicated still frame descriptors.
    Method2,
}

/// Selects the frame a still capture should use.
#[derive(Debug, Clone, Copy)]
pub enum StillFrameRef {
    /// A regular video frame advertising the still capability (method 1).
    Video(u8),
    /// An entry of the format's `still_frames` list (method 2).
    Dedicated(u8),
}

/// The negotiated still capture parameters.
#[derive(Debug, Clone)]
pub struct StillCommit {
    pub method: StillMethod,
    pub format_index: u8,
    pub frame_index: u8,
    pub compression_index: u8,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub width: u16,
    pub height: u16,
    /// Dedicated still endpoint for method 2, 0 when stills share the
    /// streaming pipe.
    pub endpoint_address: u8,
    /// The control block length the device accepted.
    pub length: u16,
}

/// Resolves the capture method and geometry for a still selection.
pub(crate) fn resolve_still_target<'a>(
    format: &'a StreamFormat,
    frame: Option<StillFrameRef>,
) -> Result<(StillMethod, u8, u16, u16, u8)> {
    match frame {
        Some(StillFrameRef::Dedicated(index)) => {
            let still = format
                .still_frames
                .iter()
                .find(|s| s.index == index)
                .ok_or_else(|| Error::BadDescriptor(format!("no still frame {}", index)))?;
            Ok(method2_target(still))
        }
        Some(StillFrameRef::Video(frame_index)) => {
            let frame = format
                .frame_by_index(frame_index)
                .ok_or_else(|| Error::BadDescriptor(format!("no frame {}", frame_index)))?;
            method1_target(frame)
        }
        None => {
            // Prefer dedicated still descriptors, fall back to the first
            // frame with the still bit.
            if let Some(still) = format.still_frames.first() {
                return Ok(method2_target(still));
            }
            let frame = format
                .frames
                .iter()
                .find(|f| f.still_supported)
                .ok_or_else(|| {
                    Error::BadDescriptor(format!(
                        "format {} supports no still capture",
                        format.format_index
                    ))
                })?;
            method1_target(frame)
        }
    }
}

fn method2_target(still: &StillFrameInfo) -> (StillMethod, u8, u16, u16, u8) {
    (
        StillMethod::Method2,
        still.index,
        still.width,
        still.height,
        still.endpoint_address,
    )
}

fn method1_target(frame: &FrameInfo) -> Result<(StillMethod, u8, u16, u16, u8)> {
    if !frame.still_supported {
        return Err(Error::BadDescriptor(format!(
            "frame {} does not advertise still capture",
            frame.frame_index
        )));
    }
    Ok((StillMethod::Method1, frame.frame_index, frame.width, frame.height, 0))
}

/// Runs the still PROBE/COMMIT cycle.
pub(crate) fn negotiate_still(
    handle: &dyn UsbHandle,
    interface: u8,
    format_index: u8,
    frame_index: u8,
    compression_index: u8,
    timeout: Duration,
) -> Result<(u16, u32, u32)> {
    let length = vs_read(handle, interface, Request::GET_LEN, VsControl::STILL_PROBE, 2, timeout)
        .ok()
        .filter(|data| data.len() >= 2)
        .map(|data| LE::read_u16(&data))
        .filter(|&len| len != 0)
        .unwrap_or(STILL_PROBE_LEN);

    let mut buf = vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::STILL_PROBE,
        length.into(),
        timeout,
    )
    .or_else(|_| {
        vs_read(
            handle,
            interface,
            Request::GET_DEF,
            VsControl::STILL_PROBE,
            length.into(),
            timeout,
        )
    })
    .unwrap_or_default();
    buf.resize(length.into(), 0);

    buf[0] = format_index;
    buf[1] = frame_index;
    buf[2] = compression_index;

    log::debug!("VS_STILL_PROBE SET_CUR payload={}", hex_dump(&buf));
    vs_write(
        handle,
        interface,
        Request::SET_CUR,
        VsControl::STILL_PROBE,
        &buf,
        timeout,
    )?;

    let negotiated = match vs_read(
        handle,
        interface,
        Request::GET_CUR,
        VsControl::STILL_PROBE,
        length.into(),
        timeout,
    ) {
        Ok(mut data) => {
            data.resize(length.into(), 0);
            data
        }
        Err(_) => buf,
    };
    log::debug!("VS_STILL_PROBE GET_CUR payload={}", hex_dump(&negotiated));

    vs_write(
        handle,
        interface,
        Request::SET_CUR,
        VsControl::STILL_COMMIT,
        &negotiated,
        timeout,
    )?;

    Ok((
        length,
        read_u32_at(&negotiated, 3),
        read_u32_at(&negotiated, 7),
    ))
}

fn read_u32_at(bytes: &[u8], offset: usize) -> u32 {
    if offset + 4 <= bytes.len() {
        LE::read_u32(&bytes[offset..offset + 4])
    } else {
        0
    }
}

/// Asks the device to transmit the committed still image.
pub(crate) fn send_trigger(
    handle: &dyn UsbHandle,
    interface: u8,
    timeout: Duration,
) -> Result<(), TransferError> {
    vs_write(
        handle,
        interface,
        Request::SET_CUR,
        VsControl::STILL_IMAGE_TRIGGER,
        &[0x01],
        timeout,
    )
}

/// Synchronous frame read: polls the endpoint packet by packet and feeds
/// the assembler until one complete frame comes out or `timeout` elapses.
///
/// Also the capture path of [`Camera::read_frame`][crate::Camera::read_frame].
pub(crate) fn sync_read_frame(
    handle: &dyn UsbHandle,
    endpoint: u8,
    packet_size: usize,
    expected_size: Option<usize>,
    timeout: Duration,
) -> Result<(Vec<u8>, u8, Option<u32>)> {
    let deadline = Instant::now() + timeout;
    let mut assembler = FrameAssembler::new(expected_size);
    let mut packets_seen: usize = 0;

    // Streams that lost sync never produce EOF; give up on a frame after
    // it has consumed far more packets than its size requires.
    let max_packets = expected_size.map(|size| (size / packet_size.max(1) + 16).max(4));

    loop {
        if Instant::now() >= deadline {
            return Err(Error::FrameAssembly {
                reason: "timed out waiting for a complete frame".into(),
            });
        }

        let packet = match handle.read_bulk(endpoint, packet_size, Duration::from_millis(1000)) {
            Ok(packet) => packet,
            Err(e) if e.kind == TransferKind::Timeout => continue,
            Err(e) => return Err(e.into()),
        };
        if packet.is_empty() {
            continue;
        }

        packets_seen += 1;
        for result in assembler.push(&packet) {
            if result.complete {
                return Ok((result.payload, result.fid, result.pts));
            }
            log::debug!(
                "sync read dropped a frame: reason={:?} error={} len={}",
                result.reason,
                result.error,
                result.payload.len(),
            );
            packets_seen = 0;
        }

        if let Some(max) = max_packets {
            if packets_seen > max {
                log::debug!("abandoning frame after {} packets", packets_seen);
                assembler.flush(EndReason::Overflow);
                packets_seen = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_with_stills() -> StreamFormat {
        StreamFormat {
            format_index: 1,
            kind: crate::topo::FormatKind::Mjpeg,
            guid: [0; 16],
            description: "MJPEG".into(),
            frames: vec![
                FrameInfo {
                    frame_index: 1,
                    width: 640,
                    height: 480,
                    default_interval: 333_333,
                    intervals: vec![333_333],
                    max_frame_size: 614_400,
                    still_supported: false,
                },
                FrameInfo {
                    frame_index: 2,
                    width: 1280,
                    height: 720,
                    default_interval: 333_333,
                    intervals: vec![333_333],
                    max_frame_size: 1_843_200,
                    still_supported: true,
                },
            ],
            still_frames: vec![StillFrameInfo {
                index: 1,
                endpoint_address: 0x83,
                width: 1920,
                height: 1080,
                compression_indices: vec![1],
            }],
        }
    }

    #[test]
    fn dedicated_still_frames_win_by_default() {
        let format = format_with_stills();
        let (method, index, width, height, endpoint) =
            resolve_still_target(&format, None).unwrap();
        assert_eq!(method, StillMethod::Method2);
        assert_eq!(index, 1);
        assert_eq!((width, height), (1920, 1080));
        assert_eq!(endpoint, 0x83);
    }

    #[test]
    fn video_frame_selection_requires_still_bit() {
        let format = format_with_stills();

        let (method, index, ..) =
            resolve_still_target(&format, Some(StillFrameRef::Video(2))).unwrap();
        assert_eq!(method, StillMethod::Method1);
        assert_eq!(index, 2);

        assert!(resolve_still_target(&format, Some(StillFrameRef::Video(1))).is_err());
    }

    #[test]
    fn method1_fallback_without_dedicated_frames() {
        let mut format = format_with_stills();
        format.still_frames.clear();

        let (method, index, width, height, endpoint) =
            resolve_still_target(&format, None).unwrap();
        assert_eq!(method, StillMethod::Method1);
        assert_eq!(index, 2);
        assert_eq!((width, height), (1280, 720));
        assert_eq!(endpoint, 0);
    }
}
