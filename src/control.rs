//! Control enumeration, validation and access.
//!
//! Every `(unit, selector)` pair from the parsed topology is validated
//! against the live device with the `GET_*` request family; the surviving
//! controls become [`ControlEntry`] values that carry everything needed to
//! read and write them later without re-probing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use serde_json::Value;

use crate::quirks::QuirksRegistry;
use crate::topo::{ControlUnit, UnitKind};
use crate::transport::{TransferError, UsbHandle};

pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// `CLASS | INTERFACE | IN`
pub(crate) const REQ_TYPE_IN: u8 = 0xA1;
/// `CLASS | INTERFACE | OUT`
pub(crate) const REQ_TYPE_OUT: u8 = 0x21;

/// A UVC class-specific request code. Bit 7 distinguishes reads from
/// writes; unknown codes are preserved and printed in hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request(pub(crate) u8);

impl Request {
    pub const SET_CUR: Request = Request(0x01);
    pub const GET_CUR: Request = Request(0x81);
    pub const GET_MIN: Request = Request(0x82);
    pub const GET_MAX: Request = Request(0x83);
    pub const GET_RES: Request = Request(0x84);
    pub const GET_LEN: Request = Request(0x85);
    pub const GET_INFO: Request = Request(0x86);
    pub const GET_DEF: Request = Request(0x87);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Request::SET_CUR => "SET_CUR",
            Request::GET_CUR => "GET_CUR",
            Request::GET_MIN => "GET_MIN",
            Request::GET_MAX => "GET_MAX",
            Request::GET_RES => "GET_RES",
            Request::GET_LEN => "GET_LEN",
            Request::GET_INFO => "GET_INFO",
            Request::GET_DEF => "GET_DEF",
            _ => return None,
        })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Request({:#04x})", self.0),
        }
    }
}

bitflags! {
    /// Capabilities reported by `GET_INFO`.
    pub struct ControlInfo: u8 {
        const SUPPORTS_GET      = 1 << 0;
        const SUPPORTS_SET      = 1 << 1;
        const DISABLED_BY_AUTO  = 1 << 2;
        const AUTOUPDATE        = 1 << 3;
        const ASYNCHRONOUS      = 1 << 4;
    }
}

/// How a control's payload is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bool,
    Bytes,
}

impl ValueKind {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" | "integer" => Some(ValueKind::Int),
            "bool" | "boolean" => Some(ValueKind::Bool),
            "bytes" | "bytearray" | "raw" => Some(ValueKind::Bytes),
            _ => None,
        }
    }
}

/// Identifies a control for [`get`][crate::Camera::get]/[`set`][crate::Camera::set].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKey {
    /// Case-insensitive control name.
    Name(String),
    /// `(unit_id, selector)` on any VC interface.
    Unit(u8, u8),
    /// `(interface_number, unit_id, selector)`.
    Interface(u8, u8, u8),
}

impl From<&str> for ControlKey {
    fn from(name: &str) -> Self {
        ControlKey::Name(name.to_string())
    }
}

impl From<String> for ControlKey {
    fn from(name: String) -> Self {
        ControlKey::Name(name)
    }
}

impl From<(u8, u8)> for ControlKey {
    fn from((unit_id, selector): (u8, u8)) -> Self {
        ControlKey::Unit(unit_id, selector)
    }
}

impl From<(u8, u8, u8)> for ControlKey {
    fn from((interface, unit_id, selector): (u8, u8, u8)) -> Self {
        ControlKey::Interface(interface, unit_id, selector)
    }
}

/// One validated control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEntry {
    pub interface_number: u8,
    pub unit_id: u8,
    pub selector: u8,
    pub name: String,
    pub unit_kind: UnitKind,
    pub kind: ValueKind,
    pub info: ControlInfo,
    /// Payload length; from `GET_LEN` when the device answers it, otherwise
    /// the observed length of the first successful range read.
    pub length: Option<u16>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub step: Option<i64>,
    pub default: Option<i64>,
    pub raw_min: Option<Vec<u8>>,
    pub raw_max: Option<Vec<u8>>,
    pub raw_step: Option<Vec<u8>>,
    pub raw_default: Option<Vec<u8>>,
    /// Vendor metadata merged in from a matched quirk definition.
    pub metadata: BTreeMap<String, Value>,
}

impl ControlEntry {
    pub fn supports_get(&self) -> bool {
        self.info.contains(ControlInfo::SUPPORTS_GET)
    }

    pub fn supports_set(&self) -> bool {
        self.info.contains(ControlInfo::SUPPORTS_SET)
    }

    /// Whether values of this control are two's-complement on the wire.
    pub fn is_signed(&self) -> bool {
        matches!(self.min, Some(min) if min < 0)
    }

    fn value_width(&self) -> usize {
        usize::from(self.length.unwrap_or(2))
    }

    /// Encodes an integer value for `SET_CUR`.
    pub(crate) fn encode_value(&self, value: i64) -> Vec<u8> {
        let width = self.value_width().min(8);
        value.to_le_bytes()[..width].to_vec()
    }

    /// Decodes a `GET_CUR` payload according to this control's signedness.
    pub(crate) fn decode_value(&self, raw: &[u8]) -> Option<i64> {
        decode_int(raw, self.is_signed())
    }
}

impl fmt::Display for ControlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (unit {} selector {} on interface {})",
            self.name, self.unit_id, self.selector, self.interface_number
        )
    }
}

/// Little-endian integer decode for payloads of at most 4 bytes.
pub(crate) fn decode_int(raw: &[u8], signed: bool) -> Option<i64> {
    if raw.is_empty() || raw.len() > 4 {
        return None;
    }
    let mut unsigned: u64 = 0;
    for (i, &byte) in raw.iter().enumerate() {
        unsigned |= u64::from(byte) << (8 * i);
    }
    if signed {
        let shift = 64 - 8 * raw.len() as u32;
        Some(((unsigned << shift) as i64) >> shift)
    } else {
        Some(unsigned as i64)
    }
}

/// IN request targeting `(unit, selector)` on a VC interface.
pub(crate) fn unit_read(
    handle: &dyn UsbHandle,
    interface: u8,
    unit_id: u8,
    request: Request,
    selector: u8,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransferError> {
    handle.control_in(
        REQ_TYPE_IN,
        request.0,
        u16::from(selector) << 8,
        u16::from(unit_id) << 8 | u16::from(interface),
        len,
        timeout,
    )
}

/// OUT request targeting `(unit, selector)` on a VC interface.
pub(crate) fn unit_write(
    handle: &dyn UsbHandle,
    interface: u8,
    unit_id: u8,
    selector: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TransferError> {
    handle.control_out(
        REQ_TYPE_OUT,
        Request::SET_CUR.0,
        u16::from(selector) << 8,
        u16::from(unit_id) << 8 | u16::from(interface),
        data,
        timeout,
    )
}

/// Validates every control a set of units advertises.
///
/// Controls whose `GET_INFO` is absent or zero are dropped; failures of the
/// individual range reads are tolerated. Extension Unit controls are matched
/// against the quirks registry.
pub(crate) fn enumerate_units(
    handle: &dyn UsbHandle,
    interface: u8,
    units: &[ControlUnit],
    quirks: &QuirksRegistry,
) -> Vec<ControlEntry> {
    let mut entries = Vec::new();
    let mut pass = quirks.pass();

    for unit in units {
        for control in unit.controls() {
            let unit_id = unit.unit_id();
            let selector = control.selector;

            let info = match unit_read(
                handle,
                interface,
                unit_id,
                Request::GET_INFO,
                selector,
                1,
                CONTROL_TIMEOUT,
            ) {
                Ok(data) if !data.is_empty() && data[0] != 0 => data[0],
                Ok(_) => {
                    log::debug!("{} selector {}: empty GET_INFO, dropped", unit, selector);
                    continue;
                }
                Err(e) => {
                    log::debug!("{} selector {}: GET_INFO failed ({}), dropped", unit, selector, e);
                    continue;
                }
            };

            let mut length = unit_read(
                handle,
                interface,
                unit_id,
                Request::GET_LEN,
                selector,
                2,
                CONTROL_TIMEOUT,
            )
            .ok()
            .filter(|data| data.len() >= 2)
            .map(|data| u16::from(data[0]) | u16::from(data[1]) << 8)
            .filter(|&len| len != 0);

            // Read the value range at the length hint; a device without
            // GET_LEN still truncates the reads to the real length.
            let read_len = length.map(usize::from).unwrap_or(64);
            let range = |request: Request| {
                unit_read(handle, interface, unit_id, request, selector, read_len, CONTROL_TIMEOUT)
                    .ok()
                    .filter(|data| !data.is_empty())
            };
            let raw_min = range(Request::GET_MIN);
            let raw_max = range(Request::GET_MAX);
            let raw_step = range(Request::GET_RES);
            let raw_default = range(Request::GET_DEF);

            if length.is_none() {
                length = [&raw_min, &raw_max, &raw_step, &raw_default]
                    .iter()
                    .find_map(|raw| raw.as_ref())
                    .map(|raw| raw.len() as u16);
            }

            let signed = infer_signed(&raw_min, &raw_max);
            let decode = |raw: &Option<Vec<u8>>| {
                raw.as_ref().and_then(|raw| decode_int(raw, signed))
            };
            let min = decode(&raw_min);
            let max = decode(&raw_max);
            let step = decode(&raw_step);
            let default = decode(&raw_default);

            let kind = if min.is_some() && max.is_some() {
                if min == Some(0) && max == Some(1) {
                    ValueKind::Bool
                } else {
                    ValueKind::Int
                }
            } else {
                ValueKind::Bytes
            };

            let mut entry = ControlEntry {
                interface_number: interface,
                unit_id,
                selector,
                name: control.name.clone(),
                unit_kind: unit.kind(),
                kind,
                info: ControlInfo::from_bits_truncate(info),
                length,
                min,
                max,
                step,
                default,
                raw_min,
                raw_max,
                raw_step,
                raw_default,
                metadata: BTreeMap::new(),
            };

            if let Some(guid) = unit.guid() {
                if let Some(def) = pass.best_match(guid, selector, info, length) {
                    entry.name = def.name.clone();
                    if let Some(kind) = def.kind {
                        entry.kind = kind;
                    }
                    entry
                        .metadata
                        .extend(def.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }

            log::debug!(
                "validated {}: info={:#04x} len={:?} min={:?} max={:?}",
                entry,
                info,
                entry.length,
                entry.min,
                entry.max
            );
            entries.push(entry);
        }
    }

    entries
}

/// Detects controls whose range only makes sense in two's complement: equal
/// 2- or 4-byte min/max where the unsigned reading has min > max.
fn infer_signed(raw_min: &Option<Vec<u8>>, raw_max: &Option<Vec<u8>>) -> bool {
    let (min, max) = match (raw_min, raw_max) {
        (Some(min), Some(max)) => (min, max),
        _ => return false,
    };
    if min.len() != max.len() || !matches!(min.len(), 2 | 4) {
        return false;
    }
    decode_int(min, false) > decode_int(max, false)
}

/// Resolves a key against the enumerated controls.
///
/// An exact triple wins; otherwise entries on `preferred_interface` are
/// preferred over entries on other VC interfaces.
pub(crate) fn resolve<'a>(
    entries: &'a [ControlEntry],
    key: &ControlKey,
    preferred_interface: u8,
) -> Option<&'a ControlEntry> {
    let matches = |entry: &ControlEntry| match key {
        ControlKey::Name(name) => entry.name.eq_ignore_ascii_case(name),
        ControlKey::Unit(unit_id, selector) => {
            entry.unit_id == *unit_id && entry.selector == *selector
        }
        ControlKey::Interface(interface, unit_id, selector) => {
            entry.interface_number == *interface
                && entry.unit_id == *unit_id
                && entry.selector == *selector
        }
    };

    entries
        .iter()
        .filter(|entry| matches(entry))
        .min_by_key(|entry| entry.interface_number != preferred_interface)
}

/// Scoped interface acquisition. Acquiring detaches a bound kernel driver
/// when permitted; dropping releases the interface and reattaches.
pub(crate) struct ScopedClaim {
    handle: Arc<dyn UsbHandle>,
    interface: u8,
    reattach: bool,
    released: bool,
}

impl ScopedClaim {
    pub(crate) fn acquire(
        handle: &Arc<dyn UsbHandle>,
        interface: u8,
        auto_detach: bool,
    ) -> Result<Self, TransferError> {
        let mut reattach = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                if auto_detach {
                    handle.detach_kernel_driver(interface)?;
                    reattach = true;
                } else {
                    return Err(TransferError::other(format!(
                        "interface {} is bound to a kernel driver and auto-detach is disabled",
                        interface
                    )));
                }
            }
            Ok(false) => {}
            // Not every platform can answer this; claim and see.
            Err(e) => log::debug!("kernel_driver_active({}) failed: {}", interface, e),
        }

        if let Err(e) = handle.claim_interface(interface) {
            if reattach {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(e);
        }

        Ok(Self {
            handle: handle.clone(),
            interface,
            reattach,
            released: false,
        })
    }

    pub(crate) fn handle(&self) -> &Arc<dyn UsbHandle> {
        &self.handle
    }

    pub(crate) fn interface(&self) -> u8 {
        self.interface
    }

    pub(crate) fn needed_detach(&self) -> bool {
        self.reattach
    }

    pub(crate) fn release(mut self) {
        self.release_impl();
    }

    fn release_impl(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.handle.release_interface(self.interface) {
            log::debug!("failed to release interface {}: {}", self.interface, e);
        }
        if self.reattach {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                log::debug!("failed to reattach kernel driver: {}", e);
            }
        }
    }
}

impl Drop for ScopedClaim {
    fn drop(&mut self) {
        self.release_impl();
    }
}

/// `LIBUSB_UVC_AUTO_DETACH_VC` gate; defaults to on.
pub(crate) fn auto_detach_enabled() -> bool {
    match std::env::var("LIBUSB_UVC_AUTO_DETACH_VC") {
        Ok(value) => {
            let value = value.trim();
            !(value == "0" || value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("off"))
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_widths() {
        assert_eq!(decode_int(&[0xFF], false), Some(255));
        assert_eq!(decode_int(&[0x34, 0x12], false), Some(0x1234));
        assert_eq!(decode_int(&[0xFF, 0xFF], true), Some(-1));
        assert_eq!(decode_int(&[0x00, 0x80, 0xFF, 0xFF], true), Some(-32768));
        assert_eq!(decode_int(&[], false), None);
        assert_eq!(decode_int(&[0; 5], false), None);
    }

    #[test]
    fn signed_inference() {
        // Unsigned reading: min = 0xFF80 (65408) > max = 0x007F (127).
        let min = Some(vec![0x80, 0xFF]);
        let max = Some(vec![0x7F, 0x00]);
        assert!(infer_signed(&min, &max));
        assert_eq!(decode_int(min.as_ref().unwrap(), true), Some(-128));
        assert_eq!(decode_int(max.as_ref().unwrap(), true), Some(127));

        // Plain unsigned range.
        assert!(!infer_signed(&Some(vec![0, 0]), &Some(vec![0xFF, 0x7F])));
        // Mixed widths never trigger inference.
        assert!(!infer_signed(&Some(vec![0x80, 0xFF]), &Some(vec![0x7F])));
        // 1-byte values never trigger inference.
        assert!(!infer_signed(&Some(vec![0xFF]), &Some(vec![0x00])));
    }

    fn entry(min: Option<i64>, length: Option<u16>) -> ControlEntry {
        ControlEntry {
            interface_number: 0,
            unit_id: 2,
            selector: 2,
            name: "Brightness".into(),
            unit_kind: UnitKind::ProcessingUnit,
            kind: ValueKind::Int,
            info: ControlInfo::SUPPORTS_GET | ControlInfo::SUPPORTS_SET,
            length,
            min,
            max: Some(255),
            step: Some(1),
            default: Some(128),
            raw_min: None,
            raw_max: None,
            raw_step: None,
            raw_default: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn value_encoding() {
        // Width defaults to 2 when the device never reported a length.
        assert_eq!(entry(Some(0), None).encode_value(0x1234), [0x34, 0x12]);
        assert_eq!(entry(Some(0), Some(4)).encode_value(1), [1, 0, 0, 0]);
        // Negative values use two's complement at the stored width.
        assert_eq!(entry(Some(-128), Some(2)).encode_value(-2), [0xFE, 0xFF]);
    }

    #[test]
    fn key_resolution_prefers_owning_interface() {
        let mut a = entry(Some(0), Some(2));
        a.interface_number = 0;
        let mut b = entry(Some(0), Some(2));
        b.interface_number = 2;
        let entries = vec![a, b];

        let hit = resolve(&entries, &ControlKey::Unit(2, 2), 2).unwrap();
        assert_eq!(hit.interface_number, 2);
        let hit = resolve(&entries, &ControlKey::Interface(0, 2, 2), 2).unwrap();
        assert_eq!(hit.interface_number, 0);
        // Names resolve case-insensitively.
        let hit = resolve(&entries, &ControlKey::Name("brightness".into()), 0).unwrap();
        assert_eq!(hit.interface_number, 0);
        assert!(resolve(&entries, &ControlKey::Unit(9, 9), 0).is_none());
    }
}
