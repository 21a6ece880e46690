//! UVC payload packet parsing and frame reassembly.
//!
//! Every payload packet starts with a 2–12 byte header whose flag byte
//! carries the frame ID toggle, end-of-frame marker and optional timestamps.
//! The [`FrameAssembler`] consumes packets one at a time and emits an
//! [`AssemblyResult`] whenever a frame boundary is reached.

use std::time::Instant;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian as LE};

bitflags! {
    /// The `bmHeaderInfo` flag byte (UVC 1.5, 2.4.3.3 "Video and Still
    /// Image Payload Headers").
    pub struct PayloadFlags: u8 {
        /// Toggles on every frame boundary.
        const FRAME_ID               = 0x01;
        /// Set on the last packet of a frame.
        const END_OF_FRAME           = 0x02;
        /// A 32-bit device clock sample follows the flag byte.
        const PRESENTATION_TIME      = 0x04;
        /// A 6-byte source clock reference follows the PTS field.
        const SOURCE_CLOCK_REFERENCE = 0x08;
        /// Meaning assigned by the payload format, not the base protocol.
        const PAYLOAD_SPECIFIC       = 0x10;
        /// The packet carries still image data.
        const STILL_IMAGE            = 0x20;
        /// The device hit an error transmitting this payload.
        const ERROR                  = 0x40;
        /// Marks the header complete; always set by conforming devices.
        const END_OF_HEADER          = 0x80;
    }
}

/// A decoded payload header.
#[derive(Debug, Clone, Copy)]
pub struct PayloadHeader {
    pub flags: PayloadFlags,
    /// Device clock sample, present when `PRESENTATION_TIME` is set.
    pub pts: Option<u32>,
}

impl PayloadHeader {
    pub fn fid(&self) -> u8 {
        self.flags.bits() & PayloadFlags::FRAME_ID.bits()
    }
}

/// Splits a payload packet into its header and payload bytes.
///
/// Returns `None` when the header length byte is out of range; such packets
/// poison any frame being assembled.
pub fn split_packet(packet: &[u8]) -> Option<(PayloadHeader, &[u8])> {
    if packet.is_empty() {
        return None;
    }
    let header_len = usize::from(packet[0]);
    if header_len < 2 || header_len > packet.len() {
        return None;
    }

    let flags = PayloadFlags::from_bits_truncate(packet[1]);
    let pts = if flags.contains(PayloadFlags::PRESENTATION_TIME) && header_len >= 6 {
        Some(LE::read_u32(&packet[2..6]))
    } else {
        None
    };

    Some((PayloadHeader { flags, pts }, &packet[header_len..]))
}

/// Why a frame was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The end-of-frame bit was seen.
    Eof,
    /// A packet with the opposite frame ID arrived.
    FidToggle,
    /// The stream went quiet (flush on timeout or close).
    Timeout,
    /// The assembler state was flushed due to overrun.
    Overflow,
}

/// A finalized frame.
///
/// `complete` is the delivery gate: the payload is non-empty, the device
/// reported no error, and when the frame size is known up front the payload
/// matches it exactly. Incomplete results still carry their payload so the
/// caller owns the discard policy.
#[derive(Debug, Clone)]
pub struct AssemblyResult {
    pub payload: Vec<u8>,
    pub fid: u8,
    pub pts: Option<u32>,
    pub reason: EndReason,
    pub error: bool,
    pub complete: bool,
    /// Wall-clock time from first packet to finalization, in seconds.
    pub duration_s: f64,
}

struct InFlight {
    payload: Vec<u8>,
    fid: u8,
    pts: Option<u32>,
    error: bool,
    started: Instant,
}

impl InFlight {
    fn new(fid: u8) -> Self {
        Self {
            payload: Vec::new(),
            fid,
            pts: None,
            error: false,
            started: Instant::now(),
        }
    }
}

/// Reassembles video frames from a stream of payload packets.
///
/// Results are emitted in strict input order. The assembler carries no
/// transport state; feed it and it answers.
pub struct FrameAssembler {
    /// Exact frame size for uncompressed streams; compressed streams leave
    /// it unset and rely on EOF alone.
    expected_size: Option<usize>,
    current: Option<InFlight>,
}

impl FrameAssembler {
    pub fn new(expected_size: Option<usize>) -> Self {
        Self {
            expected_size,
            current: None,
        }
    }

    /// Feeds one payload packet. Finalized frames come back in input order;
    /// a packet that both toggles the frame ID and carries EOF yields two.
    /// The returned `Vec` is empty on the hot path and never allocates then.
    pub fn push(&mut self, packet: &[u8]) -> Vec<AssemblyResult> {
        let mut results = Vec::new();

        let (header, payload) = match split_packet(packet) {
            Some(parts) => parts,
            None => {
                // A bogus header length poisons the frame in flight.
                if self.current.take().is_some() {
                    log::debug!("discarding frame in flight after bad payload header");
                }
                return results;
            }
        };

        let fid = header.fid();
        match &self.current {
            None => self.current = Some(InFlight::new(fid)),
            Some(current) if current.fid != fid => {
                results.extend(self.finalize(EndReason::FidToggle));
                self.current = Some(InFlight::new(fid));
            }
            Some(_) => {}
        }

        let current = self.current.as_mut().unwrap();
        if header.flags.contains(PayloadFlags::ERROR) {
            current.error = true;
        }
        if current.pts.is_none() {
            current.pts = header.pts;
        }
        current.payload.extend_from_slice(payload);

        if let Some(expected) = self.expected_size {
            if current.payload.len() > expected {
                current.error = true;
            }
        }

        if header.flags.contains(PayloadFlags::END_OF_FRAME) {
            results.extend(self.finalize(EndReason::Eof));
        }

        results
    }

    /// Finalizes whatever is in flight, typically on timeout or stream
    /// close.
    pub fn flush(&mut self, reason: EndReason) -> Option<AssemblyResult> {
        self.finalize(reason)
    }

    /// Whether a frame is currently being accumulated.
    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    fn finalize(&mut self, reason: EndReason) -> Option<AssemblyResult> {
        let current = self.current.take()?;
        let size_ok = self
            .expected_size
            .map_or(true, |expected| current.payload.len() == expected);
        let complete = !current.payload.is_empty() && !current.error && size_ok;

        Some(AssemblyResult {
            complete,
            fid: current.fid,
            pts: current.pts,
            reason,
            error: current.error,
            duration_s: current.started.elapsed().as_secs_f64(),
            payload: current.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(header_len: u8, flags: u8, pts: Option<u32>, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0; usize::from(header_len)];
        packet[0] = header_len;
        packet[1] = flags;
        if let Some(pts) = pts {
            LE::write_u32(&mut packet[2..6], pts);
        }
        packet.extend_from_slice(payload);
        packet
    }

    const EOH: u8 = 0x80;
    const EOF: u8 = 0x02;
    const PTS: u8 = 0x04;
    const ERR: u8 = 0x40;
    const FID: u8 = 0x01;

    fn push_one(assembler: &mut FrameAssembler, packet: &[u8]) -> AssemblyResult {
        let mut results = assembler.push(packet);
        assert_eq!(results.len(), 1);
        results.pop().unwrap()
    }

    #[test]
    fn three_packet_frame_with_error_and_pts() {
        let mut assembler = FrameAssembler::new(None);

        assert!(assembler
            .push(&packet(12, PTS | ERR | EOH, Some(0xDEAD_BEEF), b"A"))
            .is_empty());
        assert!(assembler.push(&packet(2, EOH, None, b"B")).is_empty());
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b"C"));

        assert_eq!(result.payload, b"ABC");
        assert_eq!(result.reason, EndReason::Eof);
        assert_eq!(result.pts, Some(0xDEAD_BEEF));
        assert!(result.error);
        assert!(!result.complete);
    }

    #[test]
    fn fid_toggle_finalizes_previous_frame() {
        let mut assembler = FrameAssembler::new(None);

        assert!(assembler.push(&packet(2, EOH, None, b"first")).is_empty());
        // New FID without EOF: the packets so far become a frame.
        let result = push_one(&mut assembler, &packet(2, FID | EOH, None, b"second"));

        assert_eq!(result.payload, b"first");
        assert_eq!(result.reason, EndReason::FidToggle);
        assert_eq!(result.fid, 0);
        assert!(result.complete);

        // The toggling packet seeds the next frame.
        let result = push_one(&mut assembler, &packet(2, FID | EOF | EOH, None, b"!"));
        assert_eq!(result.payload, b"second!");
        assert_eq!(result.fid, 1);
    }

    #[test]
    fn toggle_and_eof_in_one_packet() {
        let mut assembler = FrameAssembler::new(None);

        assembler.push(&packet(2, EOH, None, b"old"));
        let results = assembler.push(&packet(2, FID | EOF | EOH, None, b"new"));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload, b"old");
        assert_eq!(results[0].reason, EndReason::FidToggle);
        assert_eq!(results[1].payload, b"new");
        assert_eq!(results[1].reason, EndReason::Eof);
    }

    #[test]
    fn expected_size_gates_completion() {
        let mut assembler = FrameAssembler::new(Some(4));

        assembler.push(&packet(2, EOH, None, b"ab"));
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b"cd"));
        assert!(result.complete);
        assert_eq!(result.payload, b"abcd");

        // Short frame: EOF arrives before enough bytes accumulated.
        assembler.push(&packet(2, EOH, None, b"ab"));
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b"c"));
        assert!(!result.complete);
        assert!(!result.error);

        // Overrun: the error flag latches as soon as the size is exceeded.
        assembler.push(&packet(2, EOH, None, b"abcd"));
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b"e"));
        assert!(result.error);
        assert!(!result.complete);
    }

    #[test]
    fn bad_header_length_discards_frame_in_flight() {
        let mut assembler = FrameAssembler::new(None);

        assembler.push(&packet(2, EOH, None, b"doomed"));
        // Header length byte larger than the packet itself.
        assert!(assembler.push(&[200, 0]).is_empty());
        assert!(!assembler.in_flight());

        // The next EOF-terminated frame is unaffected.
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b"ok"));
        assert_eq!(result.payload, b"ok");
        assert!(result.complete);
    }

    #[test]
    fn flush_reports_partial_frame() {
        let mut assembler = FrameAssembler::new(None);
        assert!(assembler.flush(EndReason::Timeout).is_none());

        assembler.push(&packet(2, EOH, None, b"tail"));
        let result = assembler.flush(EndReason::Timeout).unwrap();
        assert_eq!(result.reason, EndReason::Timeout);
        assert_eq!(result.payload, b"tail");
        assert!(!assembler.in_flight());
    }

    #[test]
    fn header_only_packets_append_nothing() {
        let mut assembler = FrameAssembler::new(None);

        assembler.push(&packet(2, EOH, None, b""));
        assembler.push(&packet(2, EOH, None, b"data"));
        let result = push_one(&mut assembler, &packet(2, EOF | EOH, None, b""));
        assert_eq!(result.payload, b"data");
        assert!(result.complete);
    }

    #[test]
    fn pts_requires_room_in_header() {
        // PTS flag set but header too short to carry it.
        let (header, _) = split_packet(&packet(2, PTS | EOH, None, b"x")).unwrap();
        assert_eq!(header.pts, None);

        let packet_bytes = packet(12, PTS | EOH, Some(42), b"x");
        let (header, payload) = split_packet(&packet_bytes).unwrap();
        assert_eq!(header.pts, Some(42));
        assert_eq!(payload, b"x");
    }
}
