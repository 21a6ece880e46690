use std::path::PathBuf;

use thiserror::Error;

use crate::control::ControlKey;
use crate::transport::TransferError;

/// The error type for interactions with this library.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No device matched the given selector.
    #[error("no matching UVC device found")]
    NoDevice,
    /// A class-specific descriptor could not be decoded.
    #[error("malformed descriptor: {0}")]
    BadDescriptor(String),
    /// Every attempted PROBE/COMMIT variant was rejected by the device.
    #[error("stream negotiation failed (tried control lengths {tried_lengths:?}): {reason}")]
    NegotiationFailed {
        reason: String,
        tried_lengths: Vec<u16>,
        #[source]
        last: Option<TransferError>,
    },
    /// Stream selection found no advertised format/frame combination.
    #[error("no matching stream: {0}")]
    NoMatchingFormat(String),
    /// No alternate setting provides an isochronous endpoint.
    #[error("no suitable alternate setting for streaming")]
    NoSuitableAltSetting,
    /// A streaming operation was attempted before `configure_stream`.
    #[error("stream not configured")]
    StreamNotConfigured,
    /// An underlying USB transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// A frame could not be assembled from the payload packets.
    #[error("frame assembly failed: {reason}")]
    FrameAssembly { reason: String },
    /// The control key did not resolve to any enumerated control.
    #[error("no control matches {0:?}")]
    NoSuchControl(ControlKey),
    /// The control exists but does not support the requested operation.
    #[error("control `{name}` does not support this operation")]
    ControlUnavailable { name: String },
    /// A raw value's length disagrees with the control's reported length.
    #[error("value is {got} bytes but the control expects {expected}")]
    ValueOutOfBounds { expected: u16, got: usize },
    /// A quirks file could not be loaded.
    #[error("failed to load quirks file {path:?}: {cause}")]
    QuirksLoad { path: PathBuf, cause: String },
}
