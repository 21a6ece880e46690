//! The USB transport capability.
//!
//! The driver core never talks to a USB stack directly. Everything it needs
//! from the platform is captured by the [`UsbTransport`]/[`UsbHandle`] traits
//! defined here; a transport implementation (libusb, usbfs, a software
//! emulator, ...) is provided by the embedding application.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Classification of a failed USB transfer.
///
/// Transport implementations map their native error codes onto these kinds;
/// the rest of the driver only ever matches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferKind {
    /// The endpoint or control pipe stalled (`EPIPE`).
    Stall,
    /// The request was rejected as invalid (`EINVAL`).
    InvalidParam,
    /// The transfer did not complete in time (`ETIMEDOUT`).
    Timeout,
    /// The device is gone.
    NoDevice,
    /// Anything else.
    Other,
}

/// A failed USB transfer, as surfaced by a transport implementation.
#[derive(Debug, Clone, Error)]
#[error("USB transfer failed ({kind:?}): {message}")]
pub struct TransferError {
    pub kind: TransferKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn stall() -> Self {
        Self::new(TransferKind::Stall, "endpoint stalled")
    }

    pub fn invalid_param() -> Self {
        Self::new(TransferKind::InvalidParam, "invalid request")
    }

    pub fn timeout() -> Self {
        Self::new(TransferKind::Timeout, "transfer timed out")
    }

    pub fn no_device() -> Self {
        Self::new(TransferKind::NoDevice, "device disconnected")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransferKind::Other, message)
    }

    pub fn is_retryable_probe_error(&self) -> bool {
        matches!(self.kind, TransferKind::Stall | TransferKind::InvalidParam)
    }
}

/// Identifies a device on the bus for reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub bus_number: u8,
    pub address: u8,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_number, self.address)
    }
}

/// Summary of an attached USB device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    /// Hub port chain from the root hub to the device.
    pub port_path: Vec<u8>,
    /// `(bInterfaceClass, bInterfaceSubClass)` of every interface in the
    /// active configuration, used to recognize UVC functions without opening
    /// the device.
    pub interface_classes: Vec<(u8, u8)>,
}

impl DeviceInfo {
    /// Human readable `vendor product (S/N serial)` line.
    pub fn describe(&self) -> String {
        let vendor = self
            .manufacturer
            .clone()
            .unwrap_or_else(|| format!("VID_{:04x}", self.vendor_id));
        let product = self
            .product
            .clone()
            .unwrap_or_else(|| format!("PID_{:04x}", self.product_id));
        let serial = self.serial.as_deref().unwrap_or("?");
        format!("{} {} (S/N {})", vendor, product, serial)
    }
}

/// One endpoint of an interface alternate setting.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointDesc {
    pub fn is_input(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn is_isochronous(&self) -> bool {
        self.attributes & 0x03 == 0x01
    }

    pub fn is_interrupt(&self) -> bool {
        self.attributes & 0x03 == 0x03
    }

    /// Per-microframe payload capacity, accounting for high-bandwidth
    /// endpoints that request 2 or 3 transactions per microframe.
    pub fn payload_capacity(&self) -> u32 {
        let base = u32::from(self.max_packet_size & 0x7FF);
        let transactions = u32::from((self.max_packet_size >> 11) & 0x3) + 1;
        base * transactions
    }
}

/// One alternate setting of an interface, with its class-specific blob.
#[derive(Debug, Clone)]
pub struct InterfaceAlt {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub endpoints: Vec<EndpointDesc>,
    /// Raw class-specific descriptors attached to this alternate setting.
    pub extra: Vec<u8>,
}

/// Plain-data snapshot of the active configuration descriptor.
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptor {
    pub interfaces: Vec<InterfaceAlt>,
}

/// A single isochronous packet delivered by [`IsoStream::poll`].
///
/// `data` is the packet contents up to the ISO descriptor's `actual_length`;
/// packets that completed empty are delivered with empty `data`.
#[derive(Debug, Clone)]
pub struct IsoPacket {
    pub data: Vec<u8>,
}

/// A pool of in-flight isochronous transfers on one endpoint.
///
/// Implementations submit `transfers` URBs of `packets_per_transfer` packets
/// each up front and keep them in flight: a transfer whose packets have been
/// handed out through [`poll`](Self::poll) is resubmitted before the next
/// poll returns. Packets are delivered in submission order.
///
/// A transfer that completes with an error is surfaced as an `Err` from
/// `poll`; the implementation must keep the stream usable afterwards (the
/// caller clears the halt for [`TransferKind::Stall`] and polls again).
/// Transfers that merely timed out are resubmitted internally and yield no
/// packets.
pub trait IsoStream: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<IsoPacket>, TransferError>;

    /// Cancels every in-flight transfer. Idempotent.
    fn cancel_all(&mut self);
}

/// An open device handle.
///
/// Handles are shared between the streaming poll thread (isochronous
/// transfers only) and caller threads (control transfers only); transport
/// implementations must support interleaving those two classes of transfers
/// on one handle, which is why every method takes `&self`.
pub trait UsbHandle: Send + Sync {
    fn device_id(&self) -> DeviceId;

    fn config_descriptor(&self) -> Result<ConfigDescriptor, TransferError>;

    /// Activates the device's (only) configuration. Returns `Ok` if it was
    /// already active.
    fn set_configuration(&self) -> Result<(), TransferError>;

    fn claim_interface(&self, interface: u8) -> Result<(), TransferError>;
    fn release_interface(&self, interface: u8) -> Result<(), TransferError>;
    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError>;
    fn clear_halt(&self, endpoint: u8) -> Result<(), TransferError>;
    fn reset(&self) -> Result<(), TransferError>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransferError>;
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransferError>;
    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransferError>;

    /// IN control transfer. `request_type` carries the direction bit.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;

    /// OUT control transfer.
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransferError>;

    /// Synchronous read from a streaming endpoint. Returns at most `len`
    /// bytes (one packet for isochronous endpoints).
    fn read_bulk(&self, endpoint: u8, len: usize, timeout: Duration)
        -> Result<Vec<u8>, TransferError>;

    /// Synchronous read from an interrupt endpoint.
    fn read_interrupt(
        &self,
        endpoint: u8,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;

    /// Sets up the isochronous transfer pool used for streaming.
    fn iso_stream(
        &self,
        endpoint: u8,
        packet_size: usize,
        packets_per_transfer: usize,
        transfers: usize,
    ) -> Result<Box<dyn IsoStream>, TransferError>;
}

/// Entry point of a transport implementation.
pub trait UsbTransport: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceInfo>, TransferError>;

    fn open(&self, id: DeviceId) -> Result<Arc<dyn UsbHandle>, TransferError>;
}
