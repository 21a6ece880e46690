//! User-space **UVC** camera driver.
//!
//! Talks the USB Video Class protocol (UVC 1.1/1.5) directly to a camera
//! through a pluggable [`UsbTransport`], bypassing any kernel video driver:
//! descriptor parsing, control enumeration with vendor quirks, PROBE/COMMIT
//! negotiation, isochronous streaming and still capture.

pub mod control;
mod error;
pub mod payload;
mod probe;
pub mod quirks;
mod still;
pub mod stream;
pub mod topo;
pub mod transport;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use control::{ScopedClaim, CONTROL_TIMEOUT};
use crossbeam_channel::RecvTimeoutError;
use stream::StreamAccess;
use topo::parse::{UVC_CLASS, VC_SUBCLASS, VS_SUBCLASS};

pub use control::{ControlEntry, ControlInfo, ControlKey, ValueKind};
pub use error::Error;
pub use probe::Commit;
pub use quirks::QuirksRegistry;
pub use still::{StillCommit, StillFrameRef, StillMethod};
pub use stream::{CapturedFrame, FrameStream, Frames, StreamParams, StreamStats};
pub use topo::{
    AltSetting, ControlUnit, ExtensionUnit, FormatKind, FrameInfo, InputTerminal, ProcessingUnit,
    StillFrameInfo, StreamFormat, StreamingInterface, UnitControl, UnitKind,
};
pub use transport::{
    ConfigDescriptor, DeviceId, DeviceInfo, EndpointDesc, InterfaceAlt, IsoPacket, IsoStream,
    TransferError, TransferKind, UsbHandle, UsbTransport,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Environment variable naming an additional quirks directory.
const QUIRKS_DIR_ENV: &str = "UVCHOST_QUIRKS_DIR";

/// Returns every attached device that exposes a Video-class function,
/// optionally filtered by vendor/product id.
pub fn list_devices(
    transport: &dyn UsbTransport,
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DeviceInfo>> {
    let devices = transport.devices().map_err(Error::from)?;
    Ok(devices
        .into_iter()
        .filter(|dev| vid.map_or(true, |vid| dev.vendor_id == vid))
        .filter(|dev| pid.map_or(true, |pid| dev.product_id == pid))
        .filter(|dev| {
            dev.interface_classes
                .iter()
                .any(|&(class, _)| class == UVC_CLASS)
        })
        .collect())
}

/// How [`Camera::open`] picks its device.
#[derive(Debug, Clone)]
pub enum CameraSelector {
    /// Position in the [`list_devices`] order.
    Index(usize),
    /// Exact serial number match.
    Serial(String),
    /// Bus number and hub port chain.
    BusPort { bus_number: u8, port_path: Vec<u8> },
}

impl From<usize> for CameraSelector {
    fn from(index: usize) -> Self {
        CameraSelector::Index(index)
    }
}

impl From<&str> for CameraSelector {
    fn from(serial: &str) -> Self {
        CameraSelector::Serial(serial.to_string())
    }
}

/// Codec preference for [`Camera::select_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Uncompressed first, MJPEG second.
    #[default]
    Auto,
    Yuyv,
    Mjpeg,
}

/// Declarative stream selection: any field left unset matches everything.
#[derive(Debug, Clone, Default)]
pub struct StreamPreference {
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub codec: Codec,
    pub format_index: Option<u8>,
    pub frame_index: Option<u8>,
}

/// An open UVC camera.
///
/// The camera exclusively owns its device handle. Topology is parsed once
/// at open; control enumeration is cached until refreshed. Streaming runs
/// on a second handle so control transfers keep working alongside it.
pub struct Camera {
    transport: Arc<dyn UsbTransport>,
    handle: Arc<dyn UsbHandle>,
    info: DeviceInfo,
    /// VC interface units, per interface number.
    units: Vec<(u8, Vec<ControlUnit>)>,
    vc_interface: Option<u8>,
    /// `(endpoint, wMaxPacketSize)` of the VC interrupt endpoint.
    interrupt_endpoint: Option<(u8, u16)>,
    interfaces: Vec<StreamingInterface>,
    /// Which entry of `interfaces` streaming operations use.
    stream_index: usize,
    quirks: QuirksRegistry,
    controls: Option<Vec<ControlEntry>>,
    commit: Option<Commit>,
    committed: Option<(Arc<StreamFormat>, Arc<FrameInfo>)>,
    still: Option<StillCommit>,
    /// Claim held between `configure_stream` and `start_stream`/release.
    vs_claim: Option<ScopedClaim>,
    active_alt: u8,
    streaming: Option<StreamAccess>,
    sync_sequence: u64,
    auto_detach: bool,
}

impl Camera {
    /// Opens the camera matched by `selector`.
    pub fn open(
        transport: Arc<dyn UsbTransport>,
        selector: impl Into<CameraSelector>,
    ) -> Result<Camera> {
        let devices = list_devices(&*transport, None, None)?;
        let info = match selector.into() {
            CameraSelector::Index(index) => {
                devices.into_iter().nth(index).ok_or(Error::NoDevice)?
            }
            CameraSelector::Serial(serial) => devices
                .into_iter()
                .find(|dev| dev.serial.as_deref() == Some(serial.as_str()))
                .ok_or(Error::NoDevice)?,
            CameraSelector::BusPort {
                bus_number,
                port_path,
            } => devices
                .into_iter()
                .find(|dev| dev.id.bus_number == bus_number && dev.port_path == port_path)
                .ok_or(Error::NoDevice)?,
        };

        log::info!("opening {}", info.describe());
        let handle = transport.open(info.id).map_err(Error::from)?;
        Self::with_handle(transport, handle, info)
    }

    fn with_handle(
        transport: Arc<dyn UsbTransport>,
        handle: Arc<dyn UsbHandle>,
        info: DeviceInfo,
    ) -> Result<Camera> {
        if let Err(e) = handle.set_configuration() {
            // Usually just means the device is already configured.
            log::debug!("set_configuration failed: {}", e);
        }
        let config = handle.config_descriptor().map_err(Error::from)?;

        let mut units = Vec::new();
        let mut vc_interface = None;
        let mut interrupt_endpoint = None;
        for alt in &config.interfaces {
            if alt.interface_class != UVC_CLASS
                || alt.interface_subclass != VC_SUBCLASS
                || alt.alt_setting != 0
            {
                continue;
            }
            // A bad VC blob loses this interface's controls, nothing more.
            match topo::parse::parse_vc_descriptors(&alt.extra) {
                Ok(parsed) => units.push((alt.interface_number, parsed)),
                Err(e) => log::warn!(
                    "failed to parse VC descriptors of interface {}: {}",
                    alt.interface_number,
                    e
                ),
            }
            if vc_interface.is_none() {
                vc_interface = Some(alt.interface_number);
                interrupt_endpoint = alt
                    .endpoints
                    .iter()
                    .find(|ep| ep.is_input() && ep.is_interrupt())
                    .map(|ep| (ep.address, ep.max_packet_size.max(16)));
            }
        }
        match vc_interface {
            Some(interface) => log::info!("Video Control interface is {}", interface),
            None => log::warn!("no Video Control interface found"),
        }

        let mut vs_numbers: Vec<u8> = Vec::new();
        for alt in &config.interfaces {
            if alt.interface_class == UVC_CLASS
                && alt.interface_subclass == VS_SUBCLASS
                && !vs_numbers.contains(&alt.interface_number)
            {
                vs_numbers.push(alt.interface_number);
            }
        }
        let interfaces: Vec<StreamingInterface> = vs_numbers
            .iter()
            .map(|&number| {
                let alts: Vec<&InterfaceAlt> = config
                    .interfaces
                    .iter()
                    .filter(|alt| {
                        alt.interface_number == number
                            && alt.interface_class == UVC_CLASS
                            && alt.interface_subclass == VS_SUBCLASS
                    })
                    .collect();
                topo::parse::build_streaming_interface(&alts)
            })
            .collect();
        if interfaces.is_empty() {
            return Err(Error::BadDescriptor(
                "device has no Video Streaming interface".into(),
            ));
        }

        let mut quirks = QuirksRegistry::builtin();
        if let Ok(dir) = std::env::var(QUIRKS_DIR_ENV) {
            quirks.load_dir(std::path::Path::new(&dir))?;
        }

        Ok(Camera {
            transport,
            handle,
            info,
            units,
            vc_interface,
            interrupt_endpoint,
            interfaces,
            stream_index: 0,
            quirks,
            controls: None,
            commit: None,
            committed: None,
            still: None,
            vs_claim: None,
            active_alt: 0,
            streaming: None,
            sync_sequence: 0,
            auto_detach: control::auto_detach_enabled(),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Human readable `vendor product (S/N serial)` line.
    pub fn describe(&self) -> String {
        self.info.describe()
    }

    /// The control units of every VC interface, as `(interface, units)`.
    pub fn control_units(&self) -> &[(u8, Vec<ControlUnit>)] {
        &self.units
    }

    pub fn streaming_interfaces(&self) -> &[StreamingInterface] {
        &self.interfaces
    }

    /// The VS interface streaming operations currently target.
    pub fn streaming_interface(&self) -> &StreamingInterface {
        &self.interfaces[self.stream_index]
    }

    /// Switches streaming operations to another VS interface.
    pub fn set_streaming_interface(&mut self, interface_number: u8) -> Result<()> {
        if self.stream_active() {
            return Err(busy());
        }
        let index = self
            .interfaces
            .iter()
            .position(|i| i.interface_number == interface_number)
            .ok_or_else(|| {
                Error::NoMatchingFormat(format!(
                    "interface {} is not a streaming interface",
                    interface_number
                ))
            })?;
        self.release_vs(true);
        self.stream_index = index;
        self.commit = None;
        self.committed = None;
        self.still = None;
        Ok(())
    }

    /// Replaces the quirks registry and invalidates cached controls.
    pub fn set_quirks(&mut self, quirks: QuirksRegistry) {
        self.quirks = quirks;
        self.controls = None;
    }

    pub fn last_commit(&self) -> Option<&Commit> {
        self.commit.as_ref()
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    /// Validates and caches all controls. Pass `refresh` to re-probe the
    /// device.
    pub fn enumerate_controls(&mut self, refresh: bool) -> Result<&[ControlEntry]> {
        if refresh {
            self.controls = None;
        }
        if self.controls.is_none() {
            let unit_sets = self.units.clone();
            let mut entries = Vec::new();
            for (interface, units) in &unit_sets {
                let quirks = &self.quirks;
                let enumerated = self.with_vc_handle(*interface, |handle| {
                    Ok(control::enumerate_units(handle, *interface, units, quirks))
                })?;
                entries.extend(enumerated);
            }
            log::info!("validated {} controls", entries.len());
            self.controls = Some(entries);
        }
        Ok(self.controls.as_deref().unwrap())
    }

    /// Reads a control as an integer.
    pub fn get(&mut self, key: impl Into<ControlKey>) -> Result<i64> {
        let entry = self.lookup(key.into())?;
        if !entry.supports_get() {
            return Err(Error::ControlUnavailable { name: entry.name });
        }
        let raw = self.read_current(&entry)?;
        entry
            .decode_value(&raw)
            .ok_or(Error::ControlUnavailable { name: entry.name })
    }

    /// Reads a control's raw payload.
    pub fn get_raw(&mut self, key: impl Into<ControlKey>) -> Result<Vec<u8>> {
        let entry = self.lookup(key.into())?;
        if !entry.supports_get() {
            return Err(Error::ControlUnavailable { name: entry.name });
        }
        self.read_current(&entry)
    }

    /// Writes an integer control value, encoded at the control's width.
    pub fn set(&mut self, key: impl Into<ControlKey>, value: i64) -> Result<()> {
        let entry = self.lookup(key.into())?;
        if !entry.supports_set() {
            return Err(Error::ControlUnavailable { name: entry.name });
        }
        let data = entry.encode_value(value);
        self.write_current(&entry, &data)
    }

    /// Writes a control's raw payload. The length must match the control's
    /// reported length.
    pub fn set_raw(&mut self, key: impl Into<ControlKey>, data: &[u8]) -> Result<()> {
        let entry = self.lookup(key.into())?;
        if !entry.supports_set() {
            return Err(Error::ControlUnavailable { name: entry.name });
        }
        if let Some(expected) = entry.length {
            if usize::from(expected) != data.len() {
                return Err(Error::ValueOutOfBounds {
                    expected,
                    got: data.len(),
                });
            }
        }
        self.write_current(&entry, data)
    }

    fn lookup(&mut self, key: ControlKey) -> Result<ControlEntry> {
        let preferred = self.vc_interface.unwrap_or(0);
        self.enumerate_controls(false)?;
        control::resolve(self.controls.as_deref().unwrap(), &key, preferred)
            .cloned()
            .ok_or(Error::NoSuchControl(key))
    }

    fn read_current(&self, entry: &ControlEntry) -> Result<Vec<u8>> {
        let len = entry.length.map(usize::from).unwrap_or(64);
        self.with_vc_handle(entry.interface_number, |handle| {
            control::unit_read(
                handle,
                entry.interface_number,
                entry.unit_id,
                control::Request::GET_CUR,
                entry.selector,
                len,
                CONTROL_TIMEOUT,
            )
        })
    }

    fn write_current(&self, entry: &ControlEntry, data: &[u8]) -> Result<()> {
        self.with_vc_handle(entry.interface_number, |handle| {
            control::unit_write(
                handle,
                entry.interface_number,
                entry.unit_id,
                entry.selector,
                data,
                CONTROL_TIMEOUT,
            )
        })
    }

    /// Runs a control operation on the right handle: the streaming handle
    /// while a stream is active (it owns the claims), otherwise a scoped
    /// claim on the idle handle.
    fn with_vc_handle<T>(
        &self,
        interface: u8,
        f: impl FnOnce(&dyn UsbHandle) -> Result<T, TransferError>,
    ) -> Result<T> {
        if let Some(access) = &self.streaming {
            if access.shared.active.load(Ordering::SeqCst) {
                return f(&*access.handle).map_err(Error::from);
            }
        }

        let claim = ScopedClaim::acquire(&self.handle, interface, self.auto_detach)?;
        let result = f(&**claim.handle());
        claim.release();
        result.map_err(Error::from)
    }

    // ------------------------------------------------------------------
    // Stream selection and negotiation
    // ------------------------------------------------------------------

    /// Resolves a preference to a concrete `(format, frame)` pair.
    pub fn select_stream(
        &self,
        preference: &StreamPreference,
    ) -> Result<(&StreamFormat, &FrameInfo)> {
        let interface = self.streaming_interface();

        if preference.format_index.is_some() || preference.frame_index.is_some() {
            let format = match preference.format_index {
                Some(index) => interface.format_by_index(index).ok_or_else(|| {
                    Error::NoMatchingFormat(format!("format index {} not found", index))
                })?,
                None => interface
                    .formats
                    .first()
                    .ok_or_else(|| no_formats(interface.interface_number))?,
            };
            let frame = match preference.frame_index {
                Some(index) => format.frame_by_index(index).ok_or_else(|| {
                    Error::NoMatchingFormat(format!(
                        "frame index {} not available for format {}",
                        index, format.format_index
                    ))
                })?,
                None => format
                    .frames
                    .first()
                    .ok_or_else(|| no_formats(interface.interface_number))?,
            };
            return Ok((format, frame));
        }

        let width = preference.width.unwrap_or(0);
        let height = preference.height.unwrap_or(0);
        let order: &[FormatKind] = match preference.codec {
            Codec::Yuyv => &[FormatKind::Uncompressed],
            Codec::Mjpeg => &[FormatKind::Mjpeg],
            Codec::Auto => &[FormatKind::Uncompressed, FormatKind::Mjpeg],
        };

        for &kind in order {
            if let Some(found) = interface.find_frame(width, height, None, Some(kind)) {
                return Ok(found);
            }
        }
        if preference.codec != Codec::Auto {
            return Err(Error::NoMatchingFormat(format!(
                "codec {:?} not available on interface {}",
                preference.codec, interface.interface_number
            )));
        }
        // Any codec at the requested geometry.
        interface.find_frame(width, height, None, None).ok_or_else(|| {
            if width != 0 || height != 0 {
                Error::NoMatchingFormat(format!(
                    "resolution {}x{} not advertised on interface {}",
                    width, height, interface.interface_number
                ))
            } else {
                no_formats(interface.interface_number)
            }
        })
    }

    /// Negotiates and commits streaming parameters, switches to the chosen
    /// alternate setting and leaves the interface claimed and ready.
    pub fn configure_stream(
        &mut self,
        format_index: u8,
        frame_index: u8,
        fps: Option<f64>,
        strict_fps: bool,
        alt_setting: Option<u8>,
    ) -> Result<Commit> {
        if self.stream_active() {
            return Err(busy());
        }

        let interface_number = self.streaming_interface().interface_number;
        let format = self
            .streaming_interface()
            .format_by_index(format_index)
            .ok_or_else(|| Error::NoMatchingFormat(format!("format index {} not found", format_index)))?
            .clone();
        let frame = format
            .frame_by_index(frame_index)
            .ok_or_else(|| {
                Error::NoMatchingFormat(format!(
                    "frame index {} not available for format {}",
                    frame_index, format_index
                ))
            })?
            .clone();

        self.ensure_vs_claim(interface_number)?;
        let handle = self.vs_claim.as_ref().unwrap().handle().clone();

        let negotiated = match probe::negotiate_stream(
            &*handle,
            interface_number,
            &format,
            &frame,
            fps,
            strict_fps,
            CONTROL_TIMEOUT,
        ) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                // A failed negotiation leaves the camera idle.
                self.release_vs(true);
                return Err(e);
            }
        };

        let alt = match probe::select_alt(self.streaming_interface(), &negotiated, &frame, alt_setting)
        {
            Ok(alt) => alt.clone(),
            Err(e) => {
                self.release_vs(true);
                return Err(e);
            }
        };
        let endpoint_address = alt.endpoint_address.unwrap();

        if alt.alt_setting != self.active_alt {
            if let Err(e) = handle.set_alt_setting(interface_number, alt.alt_setting) {
                self.release_vs(true);
                return Err(e.into());
            }
            self.active_alt = alt.alt_setting;
        }
        // Recommended after every alternate switch.
        if let Err(e) = handle.clear_halt(endpoint_address) {
            log::debug!("clear_halt failed: {}", e);
        }

        probe::check_bandwidth(
            negotiated.frame_interval,
            frame.max_frame_size,
            alt.max_packet_size,
            alt.alt_setting,
        );

        let commit = Commit {
            format_index,
            frame_index,
            frame_interval: negotiated.frame_interval,
            max_video_frame_size: negotiated.max_video_frame_size,
            max_payload_transfer_size: negotiated.max_payload_transfer_size,
            clock_frequency: negotiated.clock_frequency,
            length: negotiated.length,
            selected_alt: alt.alt_setting,
            endpoint_address,
            iso_packet_size: alt.max_packet_size,
        };
        log::debug!(
            "configured stream: {} {}x{} @ {:.2} fps, alt {} packet {}",
            format.description,
            frame.width,
            frame.height,
            commit.frame_rate_hz(),
            commit.selected_alt,
            commit.iso_packet_size,
        );

        self.committed = Some((Arc::new(format), Arc::new(frame)));
        self.commit = Some(commit.clone());
        self.still = None;
        Ok(commit)
    }

    /// Releases the streaming interface and returns the camera to idle.
    pub fn stop_streaming(&mut self) {
        self.release_vs(true);
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Starts isochronous streaming with the committed parameters.
    ///
    /// The stream runs on a freshly opened handle; this camera keeps
    /// serving control transfers while it is active.
    pub fn start_stream(&mut self, params: StreamParams) -> Result<FrameStream> {
        if self.stream_active() {
            return Err(busy());
        }
        let commit = self.commit.clone().ok_or(Error::StreamNotConfigured)?;
        let (format, frame) = self.committed.clone().ok_or(Error::StreamNotConfigured)?;
        let interface_number = self.streaming_interface().interface_number;

        // The fresh handle performs its own claims; drop ours but keep the
        // committed alternate selected.
        if let Some(claim) = self.vs_claim.take() {
            claim.release();
        }
        self.active_alt = 0;

        let fresh = self.transport.open(self.info.id).map_err(Error::from)?;
        let stream = FrameStream::start(stream::StartArgs {
            handle: fresh,
            vc_interface: self.vc_interface,
            interrupt_endpoint: self.interrupt_endpoint,
            vs_interface: interface_number,
            commit,
            format,
            frame,
            params,
            auto_detach: self.auto_detach,
        })?;

        self.streaming = Some(stream.access());
        Ok(stream)
    }

    /// Reads one frame synchronously.
    ///
    /// With an active stream this drains the stream's queue; otherwise the
    /// committed endpoint is read directly (no transfer pool, adequate for
    /// low-rate captures and stills).
    pub fn read_frame(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        if let Some(access) = &self.streaming {
            if access.shared.active.load(Ordering::SeqCst) {
                return match access.rx.recv_timeout(timeout) {
                    Ok(frame) => Ok(frame),
                    Err(RecvTimeoutError::Timeout) => Err(TransferError::timeout().into()),
                    Err(RecvTimeoutError::Disconnected) => Err(Error::StreamNotConfigured),
                };
            }
        }

        let commit = self.commit.clone().ok_or(Error::StreamNotConfigured)?;
        let (format, frame) = self.committed.clone().ok_or(Error::StreamNotConfigured)?;
        if self.vs_claim.is_none() {
            return Err(Error::StreamNotConfigured);
        }

        let expected_size = match format.kind {
            FormatKind::Uncompressed => Some(commit.max_video_frame_size as usize),
            _ => None,
        };
        let handle = self.vs_claim.as_ref().unwrap().handle().clone();
        let (payload, fid, pts) = still::sync_read_frame(
            &*handle,
            commit.endpoint_address,
            commit.iso_packet_size as usize,
            expected_size.filter(|&size| size != 0),
            timeout,
        )?;

        let sequence = self.sync_sequence;
        self.sync_sequence += 1;
        Ok(CapturedFrame {
            payload,
            format,
            frame,
            fid,
            pts,
            host_timestamp: Instant::now(),
            sequence,
        })
    }

    // ------------------------------------------------------------------
    // Still capture
    // ------------------------------------------------------------------

    /// Negotiates still capture parameters.
    ///
    /// Picking a frame from the format's `still_frames` selects method 2;
    /// a regular video frame with the still capability selects method 1.
    /// With no explicit frame, dedicated still descriptors win.
    pub fn configure_still_image(
        &mut self,
        format_index: Option<u8>,
        frame: Option<StillFrameRef>,
        compression_index: u8,
    ) -> Result<StillCommit> {
        let format_index = format_index
            .or(self.commit.as_ref().map(|c| c.format_index))
            .or(self
                .streaming_interface()
                .formats
                .first()
                .map(|f| f.format_index))
            .ok_or_else(|| no_formats(self.streaming_interface().interface_number))?;
        let interface_number = self.streaming_interface().interface_number;

        let format = self
            .streaming_interface()
            .format_by_index(format_index)
            .ok_or_else(|| Error::NoMatchingFormat(format!("format index {} not found", format_index)))?
            .clone();
        let (method, frame_index, width, height, still_endpoint) =
            still::resolve_still_target(&format, frame)?;

        let (length, max_video_frame_size, max_payload_transfer_size) =
            if let Some(access) = self.active_stream_access() {
                still::negotiate_still(
                    &*access.handle,
                    interface_number,
                    format_index,
                    frame_index,
                    compression_index,
                    CONTROL_TIMEOUT,
                )?
            } else {
                self.ensure_vs_claim(interface_number)?;
                let handle = self.vs_claim.as_ref().unwrap().handle().clone();
                still::negotiate_still(
                    &*handle,
                    interface_number,
                    format_index,
                    frame_index,
                    compression_index,
                    CONTROL_TIMEOUT,
                )?
            };

        let endpoint_address = if still_endpoint != 0 {
            still_endpoint
        } else {
            self.commit.as_ref().map(|c| c.endpoint_address).unwrap_or(0)
        };

        let still = StillCommit {
            method,
            format_index,
            frame_index,
            compression_index,
            max_video_frame_size,
            max_payload_transfer_size,
            width,
            height,
            endpoint_address,
            length,
        };
        log::debug!("configured still capture: {:?}", still);
        self.still = Some(still.clone());
        Ok(still)
    }

    /// Triggers and captures one still image.
    pub fn capture_still_image(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        let still = self.still.clone().ok_or(Error::StreamNotConfigured)?;
        let interface_number = self.streaming_interface().interface_number;

        // Method 1 on a live stream: the still is just the next frame after
        // the trigger.
        if still.method == StillMethod::Method1 {
            if let Some(access) = self.active_stream_access() {
                still::send_trigger(&*access.handle, interface_number, CONTROL_TIMEOUT)?;
                return match access.rx.recv_timeout(timeout) {
                    Ok(frame) => Ok(frame),
                    Err(RecvTimeoutError::Timeout) => Err(TransferError::timeout().into()),
                    Err(RecvTimeoutError::Disconnected) => Err(Error::StreamNotConfigured),
                };
            }
        }

        if self.stream_active() {
            return Err(busy());
        }
        self.ensure_vs_claim(interface_number)?;
        let handle = self.vs_claim.as_ref().unwrap().handle().clone();

        let endpoint = if still.endpoint_address != 0 {
            still.endpoint_address
        } else {
            self.commit
                .as_ref()
                .map(|c| c.endpoint_address)
                .ok_or(Error::StreamNotConfigured)?
        };

        // The still payload may need more bandwidth than the video alt.
        let required = still.max_payload_transfer_size.max(still.max_video_frame_size);
        let (still_alt, packet_size) = {
            let interface = self.streaming_interface();
            match interface.select_alt_for_payload(required) {
                Some(alt) => (alt.alt_setting, alt.max_packet_size),
                None => return Err(Error::NoSuitableAltSetting),
            }
        };

        let previous_alt = self.active_alt;
        if still_alt != previous_alt {
            handle
                .set_alt_setting(interface_number, still_alt)
                .map_err(Error::from)?;
            self.active_alt = still_alt;
        }

        let capture = (|| {
            still::send_trigger(&*handle, interface_number, CONTROL_TIMEOUT)?;
            handle.clear_halt(endpoint)
        })()
        .map_err(Error::from)
        .and_then(|()| {
            still::sync_read_frame(&*handle, endpoint, packet_size as usize, None, timeout)
        });

        if still_alt != previous_alt {
            if let Err(e) = handle.set_alt_setting(interface_number, previous_alt) {
                log::debug!("failed to restore alt setting: {}", e);
            } else {
                self.active_alt = previous_alt;
            }
        }

        let (payload, fid, pts) = capture?;
        let format = self
            .streaming_interface()
            .format_by_index(still.format_index)
            .map(|f| Arc::new(f.clone()))
            .unwrap_or_else(|| {
                self.committed
                    .as_ref()
                    .map(|(f, _)| f.clone())
                    .expect("still commit without any format")
            });
        // Dedicated still frames have no video frame descriptor; synthesize
        // one carrying the still geometry.
        let frame = Arc::new(FrameInfo {
            frame_index: still.frame_index,
            width: still.width,
            height: still.height,
            default_interval: 0,
            intervals: Vec::new(),
            max_frame_size: still.max_video_frame_size,
            still_supported: true,
        });

        let sequence = self.sync_sequence;
        self.sync_sequence += 1;
        Ok(CapturedFrame {
            payload,
            format,
            frame,
            fid,
            pts,
            host_timestamp: Instant::now(),
            sequence,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn stream_active(&self) -> bool {
        self.streaming
            .as_ref()
            .map_or(false, |access| access.shared.active.load(Ordering::SeqCst))
    }

    fn active_stream_access(&self) -> Option<&StreamAccess> {
        self.streaming
            .as_ref()
            .filter(|access| access.shared.active.load(Ordering::SeqCst))
    }

    fn ensure_vs_claim(&mut self, interface_number: u8) -> Result<()> {
        if self.vs_claim.is_some() {
            return Ok(());
        }
        if let Err(e) = self.handle.set_configuration() {
            log::debug!("set_configuration failed: {}", e);
        }
        self.vs_claim = Some(ScopedClaim::acquire(
            &self.handle,
            interface_number,
            self.auto_detach,
        )?);
        Ok(())
    }

    fn release_vs(&mut self, reset_alt: bool) {
        if let Some(claim) = self.vs_claim.take() {
            if reset_alt && self.active_alt != 0 {
                if let Err(e) = claim.handle().set_alt_setting(claim.interface(), 0) {
                    log::debug!("failed to reset alt setting: {}", e);
                }
                self.active_alt = 0;
            }
            claim.release();
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release_vs(true);
    }
}

fn busy() -> Error {
    TransferError::other("a stream is active; stop it first").into()
}

fn no_formats(interface: u8) -> Error {
    Error::NoMatchingFormat(format!("no formats advertised on interface {}", interface))
}
