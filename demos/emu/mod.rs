//! A scripted software UVC camera.
//!
//! Implements [`UsbTransport`] entirely in memory: descriptors, control
//! requests, PROBE/COMMIT negotiation and isochronous frame delivery are
//! all emulated, so the driver can be exercised end to end without
//! hardware. The demos run against it, and the integration tests script its
//! failure modes (rejected probe lengths, stalls, bound kernel drivers).

// Each demo uses a different slice of the emulator.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uvchost::{
    ConfigDescriptor, DeviceId, DeviceInfo, EndpointDesc, InterfaceAlt, IsoPacket, IsoStream,
    TransferError, TransferKind, UsbHandle, UsbTransport,
};

pub const VC_INTERFACE: u8 = 0;
pub const VS_INTERFACE: u8 = 1;
pub const STREAM_ENDPOINT: u8 = 0x81;
pub const INTERRUPT_ENDPOINT: u8 = 0x82;

const SET_CUR: u8 = 0x01;
const GET_CUR: u8 = 0x81;
const GET_MIN: u8 = 0x82;
const GET_MAX: u8 = 0x83;
const GET_RES: u8 = 0x84;
const GET_LEN: u8 = 0x85;
const GET_INFO: u8 = 0x86;
const GET_DEF: u8 = 0x87;

const VS_PROBE: u8 = 0x01;
const VS_COMMIT: u8 = 0x02;
const VS_STILL_PROBE: u8 = 0x03;
const VS_STILL_COMMIT: u8 = 0x04;
const VS_STILL_TRIGGER: u8 = 0x05;

/// Geometry the emulated camera advertises. Tiny frames keep tests quick.
pub const YUY2_WIDTH: u16 = 32;
pub const YUY2_HEIGHT: u16 = 8;
pub const YUY2_FRAME_SIZE: u32 = 32 * 8 * 2;
pub const STILL_WIDTH: u16 = 64;
pub const STILL_HEIGHT: u16 = 16;

/// Behavioral switches for the emulated device.
#[derive(Debug, Clone)]
pub struct EmuProfile {
    /// Probe block sizes `SET_CUR(VS_PROBE)` accepts; others stall.
    pub accepted_probe_lengths: Vec<usize>,
    /// Whether `GET_LEN(VS_PROBE)` answers (with the first accepted size).
    pub announce_probe_length: bool,
    /// Interfaces that start out bound to an emulated kernel driver.
    pub kernel_driver_bound: Vec<u8>,
    /// The first ISO poll reports a stall before packets flow.
    pub stall_first_poll: bool,
    /// How many video frames the ISO stream produces before going quiet.
    pub frame_limit: u32,
    /// Payload transfer size reported in the negotiated probe block.
    pub max_payload_transfer_size: u32,
}

impl Default for EmuProfile {
    fn default() -> Self {
        Self {
            accepted_probe_lengths: vec![26, 34, 48],
            announce_probe_length: true,
            kernel_driver_bound: vec![VC_INTERFACE, VS_INTERFACE],
            stall_first_poll: false,
            frame_limit: 64,
            max_payload_transfer_size: 1500,
        }
    }
}

/// One emulated unit control.
#[derive(Debug, Clone, Default)]
pub struct EmuControl {
    pub info: u8,
    pub len: Option<u16>,
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub res: Option<Vec<u8>>,
    pub def: Option<Vec<u8>>,
    pub cur: Vec<u8>,
}

impl EmuControl {
    pub fn int16(min: i16, max: i16, res: i16, def: i16) -> Self {
        Self {
            info: 0x03,
            len: Some(2),
            min: Some(min.to_le_bytes().to_vec()),
            max: Some(max.to_le_bytes().to_vec()),
            res: Some(res.to_le_bytes().to_vec()),
            def: Some(def.to_le_bytes().to_vec()),
            cur: def.to_le_bytes().to_vec(),
        }
    }

    pub fn int32(min: i32, max: i32, res: i32, def: i32) -> Self {
        Self {
            info: 0x03,
            len: Some(4),
            min: Some(min.to_le_bytes().to_vec()),
            max: Some(max.to_le_bytes().to_vec()),
            res: Some(res.to_le_bytes().to_vec()),
            def: Some(def.to_le_bytes().to_vec()),
            cur: def.to_le_bytes().to_vec(),
        }
    }

    pub fn read_only(len: u16, cur: Vec<u8>) -> Self {
        Self {
            info: 0x01,
            len: Some(len),
            cur,
            ..Default::default()
        }
    }
}

struct EmuState {
    profile: EmuProfile,
    controls: HashMap<(u8, u8), EmuControl>,
    kernel_bound: Vec<u8>,
    claimed: Vec<u8>,
    alt_settings: HashMap<u8, u8>,
    probe: Option<Vec<u8>>,
    committed: Option<Vec<u8>>,
    still_probe: Option<Vec<u8>>,
    still_committed: Option<Vec<u8>>,
    bulk_queue: VecDeque<Vec<u8>>,
    sync_frame: u32,
    sync_fid: u8,
    halted: Vec<u8>,
    resets: u32,
    control_log: Vec<(u8, u8, u16, u16)>,
}

/// The emulated camera; hand it to [`uvchost::Camera::open`] as transport.
pub struct Emulator {
    state: Arc<Mutex<EmuState>>,
}

impl Emulator {
    pub fn new(profile: EmuProfile) -> Self {
        let mut controls = HashMap::new();
        // Camera Terminal (unit 1): Exposure Time, Absolute.
        controls.insert((1, 4), EmuControl::int32(100, 10000, 1, 333));
        // Processing Unit (unit 2): Brightness is signed, Contrast is not.
        controls.insert((2, 2), EmuControl::int16(-64, 64, 1, 0));
        controls.insert((2, 3), EmuControl::int16(0, 95, 1, 32));
        // Extension Unit (unit 4): two live selectors.
        controls.insert((4, 5), EmuControl::int16(0, 3, 1, 0));
        controls.insert((4, 9), EmuControl::read_only(2, vec![0x01, 0x01]));

        let kernel_bound = profile.kernel_driver_bound.clone();
        Self {
            state: Arc::new(Mutex::new(EmuState {
                profile,
                controls,
                kernel_bound,
                claimed: Vec::new(),
                alt_settings: HashMap::new(),
                probe: None,
                committed: None,
                still_probe: None,
                still_committed: None,
                bulk_queue: VecDeque::new(),
                sync_frame: 0,
                sync_fid: 0,
                halted: Vec::new(),
                resets: 0,
                control_log: Vec::new(),
            })),
        }
    }

    pub fn with_default_profile() -> Self {
        Self::new(EmuProfile::default())
    }

    pub fn control(&self, unit: u8, selector: u8) -> Option<EmuControl> {
        self.state.lock().unwrap().controls.get(&(unit, selector)).cloned()
    }

    pub fn set_control_table(&self, unit: u8, selector: u8, control: EmuControl) {
        self.state
            .lock()
            .unwrap()
            .controls
            .insert((unit, selector), control);
    }

    pub fn committed_block(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn still_committed_block(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().still_committed.clone()
    }

    pub fn current_alt(&self, interface: u8) -> u8 {
        *self
            .state
            .lock()
            .unwrap()
            .alt_settings
            .get(&interface)
            .unwrap_or(&0)
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn kernel_bound(&self) -> Vec<u8> {
        self.state.lock().unwrap().kernel_bound.clone()
    }

    /// `(request_type, request, wValue, wIndex)` of every control transfer.
    pub fn control_log(&self) -> Vec<(u8, u8, u16, u16)> {
        self.state.lock().unwrap().control_log.clone()
    }
}

impl UsbTransport for Emulator {
    fn devices(&self) -> Result<Vec<DeviceInfo>, TransferError> {
        Ok(vec![DeviceInfo {
            id: DeviceId {
                bus_number: 1,
                address: 4,
            },
            vendor_id: 0x1209,
            product_id: 0x0001,
            manufacturer: Some("Emulated".into()),
            product: Some("UVC Camera".into()),
            serial: Some("EMU0001".into()),
            port_path: vec![1, 2],
            interface_classes: vec![(0x0E, 0x01), (0x0E, 0x02)],
        }])
    }

    fn open(&self, id: DeviceId) -> Result<Arc<dyn UsbHandle>, TransferError> {
        if id.bus_number != 1 || id.address != 4 {
            return Err(TransferError::no_device());
        }
        Ok(Arc::new(EmuHandle {
            state: self.state.clone(),
        }))
    }
}

struct EmuHandle {
    state: Arc<Mutex<EmuState>>,
}

fn stall() -> TransferError {
    TransferError::stall()
}

impl EmuHandle {
    fn vs_control_in(
        &self,
        state: &mut EmuState,
        request: u8,
        selector: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransferError> {
        match (selector, request) {
            (VS_PROBE, GET_LEN) => {
                if state.profile.announce_probe_length {
                    let announced = state.profile.accepted_probe_lengths[0] as u16;
                    Ok(announced.to_le_bytes().to_vec())
                } else {
                    Err(stall())
                }
            }
            (VS_PROBE, GET_CUR) | (VS_PROBE, GET_DEF) => {
                let mut block = match (&state.probe, request) {
                    (Some(block), GET_CUR) => block.clone(),
                    _ => default_probe_block(),
                };
                block.resize(len.max(26), 0);
                negotiate(&mut block, &state.profile);
                block.truncate(len);
                Ok(block)
            }
            (VS_STILL_PROBE, GET_LEN) => Ok(11u16.to_le_bytes().to_vec()),
            (VS_STILL_PROBE, GET_CUR) | (VS_STILL_PROBE, GET_DEF) => {
                let mut block = match (&state.still_probe, request) {
                    (Some(block), GET_CUR) => block.clone(),
                    _ => vec![0; 11],
                };
                block.resize(11, 0);
                negotiate_still(&mut block);
                block.truncate(len);
                Ok(block)
            }
            _ => Err(stall()),
        }
    }

    fn vs_control_out(
        &self,
        state: &mut EmuState,
        request: u8,
        selector: u8,
        data: &[u8],
    ) -> Result<(), TransferError> {
        if request != SET_CUR {
            return Err(stall());
        }
        match selector {
            VS_PROBE => {
                if !state.profile.accepted_probe_lengths.contains(&data.len()) {
                    return Err(stall());
                }
                state.probe = Some(data.to_vec());
                Ok(())
            }
            VS_COMMIT => {
                if !state.profile.accepted_probe_lengths.contains(&data.len()) {
                    return Err(stall());
                }
                state.committed = Some(data.to_vec());
                Ok(())
            }
            VS_STILL_PROBE => {
                if data.len() < 11 {
                    return Err(stall());
                }
                state.still_probe = Some(data.to_vec());
                Ok(())
            }
            VS_STILL_COMMIT => {
                state.still_committed = Some(data.to_vec());
                Ok(())
            }
            VS_STILL_TRIGGER => {
                if data != [0x01] {
                    return Err(stall());
                }
                if state.still_committed.is_none() {
                    return Err(stall());
                }
                let packets = still_frame_packets();
                state.bulk_queue.extend(packets);
                Ok(())
            }
            _ => Err(stall()),
        }
    }

    fn unit_control_in(
        &self,
        state: &mut EmuState,
        request: u8,
        unit: u8,
        selector: u8,
        len: usize,
    ) -> Result<Vec<u8>, TransferError> {
        let control = match state.controls.get(&(unit, selector)) {
            Some(control) => control,
            None => return Err(stall()),
        };
        let clip = |data: &Option<Vec<u8>>| -> Result<Vec<u8>, TransferError> {
            match data {
                Some(data) => {
                    let mut data = data.clone();
                    data.truncate(len.max(1));
                    Ok(data)
                }
                None => Err(stall()),
            }
        };
        match request {
            GET_INFO => Ok(vec![control.info]),
            GET_LEN => match control.len {
                Some(len) => Ok(len.to_le_bytes().to_vec()),
                None => Err(stall()),
            },
            GET_MIN => clip(&control.min),
            GET_MAX => clip(&control.max),
            GET_RES => clip(&control.res),
            GET_DEF => clip(&control.def),
            GET_CUR => {
                if control.info & 0x01 == 0 {
                    return Err(stall());
                }
                let mut data = control.cur.clone();
                data.truncate(len.max(1));
                Ok(data)
            }
            _ => Err(stall()),
        }
    }
}

impl UsbHandle for EmuHandle {
    fn device_id(&self) -> DeviceId {
        DeviceId {
            bus_number: 1,
            address: 4,
        }
    }

    fn config_descriptor(&self) -> Result<ConfigDescriptor, TransferError> {
        Ok(emulated_config())
    }

    fn set_configuration(&self) -> Result<(), TransferError> {
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.kernel_bound.contains(&interface) {
            return Err(TransferError::other("interface busy (kernel driver)"));
        }
        if !state.claimed.contains(&interface) {
            state.claimed.push(interface);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransferError> {
        self.state.lock().unwrap().claimed.retain(|&i| i != interface);
        Ok(())
    }

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if !state.claimed.contains(&interface) {
            return Err(TransferError::invalid_param());
        }
        state.alt_settings.insert(interface, alt_setting);
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransferError> {
        self.state.lock().unwrap().halted.retain(|&ep| ep != endpoint);
        Ok(())
    }

    fn reset(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.resets += 1;
        state.alt_settings.clear();
        state.claimed.clear();
        Ok(())
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransferError> {
        Ok(self.state.lock().unwrap().kernel_bound.contains(&interface))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransferError> {
        self.state
            .lock()
            .unwrap()
            .kernel_bound
            .retain(|&i| i != interface);
        Ok(())
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if !state.kernel_bound.contains(&interface) {
            state.kernel_bound.push(interface);
        }
        Ok(())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let mut state = self.state.lock().unwrap();
        state.control_log.push((request_type, request, value, index));
        if request_type != 0xA1 {
            return Err(stall());
        }

        let selector = (value >> 8) as u8;
        let unit = (index >> 8) as u8;
        let interface = (index & 0xFF) as u8;
        if interface == VS_INTERFACE && unit == 0 {
            self.vs_control_in(&mut state, request, selector, len)
        } else if interface == VC_INTERFACE {
            self.unit_control_in(&mut state, request, unit, selector, len)
        } else {
            Err(stall())
        }
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.control_log.push((request_type, request, value, index));
        if request_type != 0x21 {
            return Err(stall());
        }

        let selector = (value >> 8) as u8;
        let unit = (index >> 8) as u8;
        let interface = (index & 0xFF) as u8;
        if interface == VS_INTERFACE && unit == 0 {
            self.vs_control_out(&mut state, request, selector, data)
        } else if interface == VC_INTERFACE {
            let control = match state.controls.get_mut(&(unit, selector)) {
                Some(control) => control,
                None => return Err(stall()),
            };
            if request != SET_CUR || control.info & 0x02 == 0 {
                return Err(stall());
            }
            control.cur = data.to_vec();
            Ok(())
        } else {
            Err(stall())
        }
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let mut state = self.state.lock().unwrap();
        // Synchronous reads deliver pending still packets first and fall
        // back to synthesizing video frames, like a host stack polling an
        // ISO endpoint one packet at a time.
        if state.bulk_queue.is_empty() {
            if state.committed.is_none() {
                return Err(TransferError::timeout());
            }
            let payload = video_frame_payload(state.sync_frame);
            let packets = packetize(&payload, state.sync_fid, len.max(64), state.sync_frame);
            state.bulk_queue.extend(packets);
            state.sync_frame += 1;
            state.sync_fid ^= 1;
        }
        let mut packet = state.bulk_queue.pop_front().unwrap();
        packet.truncate(len);
        Ok(packet)
    }

    fn read_interrupt(
        &self,
        _endpoint: u8,
        _len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        // No unsolicited notifications; the listener just idles.
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Err(TransferError::timeout())
    }

    fn iso_stream(
        &self,
        _endpoint: u8,
        packet_size: usize,
        packets_per_transfer: usize,
        _transfers: usize,
    ) -> Result<Box<dyn IsoStream>, TransferError> {
        let state = self.state.lock().unwrap();
        if state.committed.is_none() {
            return Err(TransferError::invalid_param());
        }
        let stall_pending = state.profile.stall_first_poll;
        let frame_limit = state.profile.frame_limit;
        drop(state);

        Ok(Box::new(EmuIsoStream {
            packet_size,
            packets_per_transfer,
            frame_limit,
            frames_emitted: 0,
            fid: 0,
            pending: VecDeque::new(),
            stall_pending,
            cancelled: false,
        }))
    }
}

struct EmuIsoStream {
    packet_size: usize,
    packets_per_transfer: usize,
    frame_limit: u32,
    frames_emitted: u32,
    fid: u8,
    pending: VecDeque<Vec<u8>>,
    stall_pending: bool,
    cancelled: bool,
}

impl IsoStream for EmuIsoStream {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<IsoPacket>, TransferError> {
        if self.cancelled {
            return Err(TransferError::other("stream cancelled"));
        }
        if self.stall_pending {
            self.stall_pending = false;
            return Err(TransferError::stall());
        }

        if self.pending.is_empty() {
            if self.frames_emitted >= self.frame_limit {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                return Ok(Vec::new());
            }
            // Pace frame generation so consumers are not lapped instantly.
            std::thread::sleep(Duration::from_millis(2));
            let payload = video_frame_payload(self.frames_emitted);
            self.pending
                .extend(packetize(&payload, self.fid, self.packet_size, self.frames_emitted));
            self.frames_emitted += 1;
            self.fid ^= 1;
        }

        let count = self.pending.len().min(self.packets_per_transfer);
        Ok(self
            .pending
            .drain(..count)
            .map(|data| IsoPacket { data })
            .collect())
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
        self.pending.clear();
    }
}

/// YUY2 test pattern sized to the advertised frame.
fn video_frame_payload(frame_number: u32) -> Vec<u8> {
    (0..YUY2_FRAME_SIZE)
        .map(|i| (i as u32).wrapping_add(frame_number) as u8)
        .collect()
}

/// Splits a frame into UVC payload packets: 12-byte headers, PTS on the
/// first packet, EOF on the last.
pub fn packetize(payload: &[u8], fid: u8, packet_size: usize, pts: u32) -> Vec<Vec<u8>> {
    const HEADER_LEN: usize = 12;
    let chunk = packet_size.saturating_sub(HEADER_LEN).max(1);
    let chunks: Vec<&[u8]> = payload.chunks(chunk).collect();

    chunks
        .iter()
        .enumerate()
        .map(|(i, data)| {
            let mut flags = 0x80 | fid; // EOH
            if i == 0 {
                flags |= 0x04; // PTS
            }
            if i == chunks.len() - 1 {
                flags |= 0x02; // EOF
            }
            let mut packet = vec![0u8; HEADER_LEN];
            packet[0] = HEADER_LEN as u8;
            packet[1] = flags;
            if i == 0 {
                packet[2..6].copy_from_slice(&pts.to_le_bytes());
            }
            packet.extend_from_slice(data);
            packet
        })
        .collect()
}

fn still_frame_packets() -> Vec<Vec<u8>> {
    let payload: Vec<u8> = (0..u32::from(STILL_WIDTH) * u32::from(STILL_HEIGHT))
        .map(|i| (i % 251) as u8)
        .collect();
    packetize(&payload, 0, 1024, 0xBEEF)
}

fn default_probe_block() -> Vec<u8> {
    let mut block = vec![0; 26];
    block[2] = 1; // bFormatIndex
    block[3] = 1; // bFrameIndex
    block[4..8].copy_from_slice(&333_333u32.to_le_bytes());
    block
}

/// Patches the device-chosen fields into a probe block.
fn negotiate(block: &mut [u8], profile: &EmuProfile) {
    if block[2] == 0 {
        block[2] = 1;
    }
    if block[3] == 0 {
        block[3] = 1;
    }
    let mut interval = u32::from_le_bytes(block[4..8].try_into().unwrap());
    if interval == 0 {
        interval = 333_333;
    }
    // Snap to the nearest advertised interval.
    let advertised = [333_333u32, 666_666, 1_000_000];
    let snapped = advertised
        .iter()
        .min_by_key(|&&v| v.abs_diff(interval))
        .copied()
        .unwrap();
    block[4..8].copy_from_slice(&snapped.to_le_bytes());
    if block.len() >= 22 {
        block[18..22].copy_from_slice(&YUY2_FRAME_SIZE.to_le_bytes());
    }
    if block.len() >= 26 {
        block[22..26].copy_from_slice(&profile.max_payload_transfer_size.to_le_bytes());
    }
    if block.len() >= 30 {
        block[26..30].copy_from_slice(&48_000_000u32.to_le_bytes());
    }
}

fn negotiate_still(block: &mut [u8]) {
    if block[0] == 0 {
        block[0] = 1;
    }
    if block[1] == 0 {
        block[1] = 1;
    }
    if block[2] == 0 {
        block[2] = 1;
    }
    let size = u32::from(STILL_WIDTH) * u32::from(STILL_HEIGHT);
    block[3..7].copy_from_slice(&size.to_le_bytes());
    block[7..11].copy_from_slice(&1024u32.to_le_bytes());
}

fn cs_desc(subtype: u8, payload: &[u8]) -> Vec<u8> {
    let mut desc = vec![payload.len() as u8 + 3, 0x24, subtype];
    desc.extend_from_slice(payload);
    desc
}

/// The class-specific blob of the emulated VC interface: one camera
/// terminal, one processing unit, one extension unit.
fn vc_extra() -> Vec<u8> {
    let mut blob = Vec::new();

    // INPUT_TERMINAL: camera with Exposure Time, Absolute (bit 3).
    blob.extend(cs_desc(
        0x02,
        &[
            1, // bTerminalID
            0x01, 0x02, // wTerminalType = ITT_CAMERA
            0, 0, // bAssocTerminal, iTerminal
            0, 0, 0, 0, 0, 0, // focal lengths
            3, // bControlSize
            0x08, 0x00, 0x00,
        ],
    ));

    // PROCESSING_UNIT: the classic 0x0FC7 control set.
    blob.extend(cs_desc(
        0x05,
        &[
            2, // bUnitID
            1, // bSourceID
            0, 0, // wMaxMultiplier
            3, // bControlSize
            0xC7, 0x0F, 0x00, // bmControls
            0, // iProcessing
        ],
    ));

    // EXTENSION_UNIT: the H.264 payload GUID, 16 selectors.
    let mut xu = vec![4]; // bUnitID
    xu.extend_from_slice(&[
        0x41, 0x76, 0x9E, 0xA2, 0x04, 0xDE, 0xE3, 0x47, 0x8B, 0x2B, 0xF4, 0x34, 0x1A, 0xFF, 0x00,
        0x3B,
    ]);
    xu.push(2); // bNumControls
    xu.push(1); // bNrInPins
    xu.push(2); // baSourceID
    xu.push(2); // bControlSize
    xu.extend_from_slice(&[0xFF, 0xFF]); // bmControls
    xu.push(0); // iExtension
    blob.extend(cs_desc(0x06, &xu));

    blob
}

/// The class-specific blob of the emulated VS interface: YUY2 and MJPEG,
/// with a dedicated still frame on the YUY2 format.
fn vs_extra() -> Vec<u8> {
    let mut blob = Vec::new();

    let mut fmt = vec![1, 1]; // bFormatIndex, bNumFrameDescriptors
    fmt.extend_from_slice(b"YUY2");
    fmt.extend_from_slice(&[
        0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
    ]);
    fmt.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
    blob.extend(cs_desc(0x04, &fmt));

    blob.extend(cs_desc(
        0x05,
        &frame_desc(1, YUY2_WIDTH, YUY2_HEIGHT, YUY2_FRAME_SIZE, true),
    ));

    // Dedicated still size on the YUY2 format.
    let mut still = vec![0x00, 1]; // shared endpoint, one size
    still.extend_from_slice(&STILL_WIDTH.to_le_bytes());
    still.extend_from_slice(&STILL_HEIGHT.to_le_bytes());
    still.push(1);
    still.push(1);
    blob.extend(cs_desc(0x03, &still));

    let mjpeg = [2, 1, 0x01, 1, 0, 0, 0, 0]; // bFormatIndex, frames, flags...
    blob.extend(cs_desc(0x06, &mjpeg));
    blob.extend(cs_desc(
        0x07,
        &frame_desc(1, YUY2_WIDTH, YUY2_HEIGHT, 0, false),
    ));

    blob
}

fn frame_desc(index: u8, width: u16, height: u16, size: u32, still: bool) -> Vec<u8> {
    let mut desc = vec![index, u8::from(still)];
    desc.extend_from_slice(&width.to_le_bytes());
    desc.extend_from_slice(&height.to_le_bytes());
    desc.extend_from_slice(&[0; 8]); // bit rates
    desc.extend_from_slice(&size.to_le_bytes());
    desc.extend_from_slice(&333_333u32.to_le_bytes()); // default interval
    desc.push(3);
    for interval in [333_333u32, 666_666, 1_000_000] {
        desc.extend_from_slice(&interval.to_le_bytes());
    }
    desc
}

fn emulated_config() -> ConfigDescriptor {
    let mut interfaces = vec![InterfaceAlt {
        interface_number: VC_INTERFACE,
        alt_setting: 0,
        interface_class: 0x0E,
        interface_subclass: 0x01,
        endpoints: vec![EndpointDesc {
            address: INTERRUPT_ENDPOINT,
            attributes: 0x03,
            max_packet_size: 16,
        }],
        extra: vc_extra(),
    }];

    interfaces.push(InterfaceAlt {
        interface_number: VS_INTERFACE,
        alt_setting: 0,
        interface_class: 0x0E,
        interface_subclass: 0x02,
        endpoints: Vec::new(),
        extra: vs_extra(),
    });
    // High-bandwidth encodings: base 1024 plus 0/1/2 extra transactions
    // per microframe, for capacities of 1024, 2048 and 3072 bytes.
    for (alt, packet_size) in [(1u8, 0x0400u16), (2, 0x0C00), (3, 0x1400)] {
        interfaces.push(InterfaceAlt {
            interface_number: VS_INTERFACE,
            alt_setting: alt,
            interface_class: 0x0E,
            interface_subclass: 0x02,
            endpoints: vec![EndpointDesc {
                address: STREAM_ENDPOINT,
                attributes: 0x05,
                max_packet_size: packet_size,
            }],
            extra: Vec::new(),
        });
    }

    ConfigDescriptor { interfaces }
}
