//! Isochronous streaming pipeline.
//!
//! After a commit, the pipeline owns the isochronous transfer pool on a
//! fresh device handle. A dedicated poll thread demultiplexes ISO packets
//! into the frame assembler and publishes completed frames into a bounded
//! queue; the consumer iterates the queue from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::control::ScopedClaim;
use crate::error::Error;
use crate::payload::{AssemblyResult, EndReason, FrameAssembler};
use crate::probe::{self, Commit};
use crate::topo::{FormatKind, FrameInfo, StreamFormat};
use crate::transport::{IsoStream, TransferError, TransferKind, UsbHandle};
use crate::Result;

/// Tunables for the transfer pool and delivery queue.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// In-flight isochronous transfers.
    pub transfers: usize,
    /// ISO packets per transfer.
    pub packets_per_transfer: usize,
    /// Completed-frame queue depth; the oldest frame is dropped on
    /// overflow.
    pub queue_depth: usize,
    /// Upper bound of a single `iso_poll` call. Also bounds how quickly the
    /// poll thread notices `stop()`.
    pub poll_timeout: Duration,
    /// How long `stop()` waits for the poll thread to exit.
    pub stop_timeout: Duration,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            transfers: 8,
            packets_per_transfer: 32,
            queue_depth: 4,
            poll_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// A video frame delivered by the pipeline.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub payload: Vec<u8>,
    pub format: Arc<StreamFormat>,
    pub frame: Arc<FrameInfo>,
    pub fid: u8,
    /// Device clock timestamp from the payload header, when present.
    pub pts: Option<u32>,
    /// Monotonic host time at which the frame completed.
    pub host_timestamp: Instant,
    /// Strictly increasing per stream.
    pub sequence: u64,
}

/// Running totals for one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub frames_completed: u64,
    pub frames_dropped: u64,
    pub bytes_delivered: u64,
    pub last_frame_duration_s: f64,
}

pub(crate) struct StreamShared {
    pub(crate) active: AtomicBool,
    stats: Mutex<StreamStats>,
    error: Mutex<Option<TransferError>>,
}

impl StreamShared {
    fn store_error(&self, error: TransferError) {
        *self.error.lock().unwrap() = Some(error);
    }
}

/// An active video stream.
///
/// Frames are read with [`read_frame`](Self::read_frame) or by iterating
/// [`frames`](Self::frames). Dropping the stream stops it.
pub struct FrameStream {
    shared: Arc<StreamShared>,
    rx: Receiver<CapturedFrame>,
    poll_thread: Option<JoinHandle<()>>,
    interrupt_thread: Option<JoinHandle<()>>,
    handle: Arc<dyn UsbHandle>,
    vs_interface: u8,
    vs_claim: Option<ScopedClaim>,
    vc_claim: Option<ScopedClaim>,
    stop_timeout: Duration,
    stopped: bool,
}

pub(crate) struct StartArgs {
    pub handle: Arc<dyn UsbHandle>,
    pub vc_interface: Option<u8>,
    /// `(endpoint address, packet size)` of the VC interrupt endpoint.
    pub interrupt_endpoint: Option<(u8, u16)>,
    pub vs_interface: u8,
    pub commit: Commit,
    pub format: Arc<StreamFormat>,
    pub frame: Arc<FrameInfo>,
    pub params: StreamParams,
    pub auto_detach: bool,
}

/// Handles shared with the camera so control transfers keep working while
/// the stream runs.
pub(crate) struct StreamAccess {
    pub handle: Arc<dyn UsbHandle>,
    pub shared: Arc<StreamShared>,
    pub rx: Receiver<CapturedFrame>,
}

impl FrameStream {
    /// Claims the interfaces on the fresh handle, re-commits, switches to
    /// the streaming alternate and spawns the poll thread.
    pub(crate) fn start(args: StartArgs) -> Result<Self> {
        let StartArgs {
            handle,
            vc_interface,
            interrupt_endpoint,
            vs_interface,
            commit,
            format,
            frame,
            params,
            auto_detach,
        } = args;

        // The VC claim is optional: in-stream controls and the interrupt
        // listener want it, streaming itself does not.
        let vc_claim = match vc_interface {
            Some(interface) => match ScopedClaim::acquire(&handle, interface, auto_detach) {
                Ok(claim) => Some(claim),
                Err(e) => {
                    log::warn!("failed to claim VC interface {}: {}", interface, e);
                    None
                }
            },
            None => None,
        };
        let vs_claim = ScopedClaim::acquire(&handle, vs_interface, auto_detach)?;

        let endpoint = commit.endpoint_address;
        let setup = (|| -> Result<Box<dyn IsoStream>, TransferError> {
            // Commit again from the handle that will own the endpoint, then
            // enable the streaming alternate.
            handle.set_alt_setting(vs_interface, 0)?;
            probe::recommit(&*handle, vs_interface, &commit, Duration::from_millis(1000))?;
            handle.set_alt_setting(vs_interface, commit.selected_alt)?;
            handle.clear_halt(endpoint)?;

            handle.iso_stream(
                endpoint,
                commit.iso_packet_size as usize,
                params.packets_per_transfer,
                params.transfers,
            )
        })();
        let iso = match setup {
            Ok(iso) => iso,
            Err(e) => {
                // Claims release via Drop; leave the interface idle.
                let _ = handle.set_alt_setting(vs_interface, 0);
                return Err(e.into());
            }
        };

        log::debug!(
            "streaming started: ep={:#04x} alt={} packet={} pool={}x{}",
            endpoint,
            commit.selected_alt,
            commit.iso_packet_size,
            params.transfers,
            params.packets_per_transfer,
        );

        let shared = Arc::new(StreamShared {
            active: AtomicBool::new(true),
            stats: Mutex::new(StreamStats::default()),
            error: Mutex::new(None),
        });

        let expected_size = match format.kind {
            FormatKind::Uncompressed => {
                let size = if commit.max_video_frame_size != 0 {
                    commit.max_video_frame_size
                } else {
                    frame.max_frame_size
                };
                Some(size as usize).filter(|&size| size != 0)
            }
            _ => None,
        };

        let (tx, rx) = bounded(params.queue_depth.max(1));
        let poll_thread = {
            let shared = shared.clone();
            let handle = handle.clone();
            let drain = rx.clone();
            let format = format.clone();
            let frame = frame.clone();
            let poll_timeout = params.poll_timeout;
            thread::Builder::new()
                .name("uvc-iso-poll".into())
                .spawn(move || {
                    poll_loop(
                        iso,
                        &*handle,
                        endpoint,
                        &shared,
                        tx,
                        drain,
                        FrameAssembler::new(expected_size),
                        format,
                        frame,
                        poll_timeout,
                    );
                })
                .map_err(|e| TransferError::other(format!("failed to spawn poll thread: {}", e)))?
        };

        let interrupt_thread = match (vc_claim.is_some(), interrupt_endpoint) {
            (true, Some((endpoint, packet_size))) => {
                let shared = shared.clone();
                let handle = handle.clone();
                thread::Builder::new()
                    .name("uvc-vc-interrupt".into())
                    .spawn(move || interrupt_loop(&*handle, endpoint, packet_size, &shared))
                    .ok()
            }
            _ => None,
        };

        Ok(Self {
            shared,
            rx,
            poll_thread: Some(poll_thread),
            interrupt_thread,
            handle,
            vs_interface,
            vs_claim: Some(vs_claim),
            vc_claim,
            stop_timeout: params.stop_timeout,
            stopped: false,
        })
    }

    pub(crate) fn access(&self) -> StreamAccess {
        StreamAccess {
            handle: self.handle.clone(),
            shared: self.shared.clone(),
            rx: self.rx.clone(),
        }
    }

    /// Whether the poll thread is still delivering frames.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats.lock().unwrap().clone()
    }

    /// Waits up to `timeout` for the next frame.
    pub fn read_frame(&self, timeout: Duration) -> Result<CapturedFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => match self.take_error() {
                Some(e) => Err(e.into()),
                None => Err(TransferError::timeout().into()),
            },
            Err(RecvTimeoutError::Disconnected) => match self.take_error() {
                Some(e) => Err(e.into()),
                None => Err(Error::StreamNotConfigured),
            },
        }
    }

    /// Blocking iterator over incoming frames. Ends cleanly when the stream
    /// is stopped; a transport loss is yielded as the final `Err` item.
    pub fn frames(&self) -> Frames<'_> {
        Frames { stream: self }
    }

    fn take_error(&self) -> Option<TransferError> {
        self.shared.error.lock().unwrap().take()
    }

    /// Stops streaming and returns the device to its idle state.
    /// Idempotent, and safe to call from any thread with `&mut`.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.active.store(false, Ordering::SeqCst);
        join_bounded(self.poll_thread.take(), self.stop_timeout, "iso poll");
        join_bounded(
            self.interrupt_thread.take(),
            self.stop_timeout,
            "VC interrupt",
        );

        if let Err(e) = self.handle.set_alt_setting(self.vs_interface, 0) {
            log::debug!("failed to reset alt setting: {}", e);
        }

        let mut needed_detach = false;
        if let Some(claim) = self.vs_claim.take() {
            needed_detach |= claim.needed_detach();
            claim.release();
        }
        if let Some(claim) = self.vc_claim.take() {
            needed_detach |= claim.needed_detach();
            claim.release();
        }

        // A reattached kernel driver only re-probes reliably after a reset.
        if needed_detach {
            if let Err(e) = self.handle.reset() {
                log::debug!("device reset failed: {}", e);
            }
        }

        log::debug!("stream stopped: {:?}", self.stats());
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Iterator over the frames of a running stream.
pub struct Frames<'a> {
    stream: &'a FrameStream,
}

impl Iterator for Frames<'_> {
    type Item = Result<CapturedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stream.rx.recv_timeout(Duration::from_millis(250)) {
                Ok(frame) => return Some(Ok(frame)),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.stream.is_active() {
                        return self.stream.take_error().map(|e| Err(e.into()));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.stream.take_error().map(|e| Err(e.into()));
                }
            }
        }
    }
}

fn join_bounded(thread: Option<JoinHandle<()>>, timeout: Duration, what: &str) {
    let thread = match thread {
        Some(thread) => thread,
        None => return,
    };

    let deadline = Instant::now() + timeout;
    while !thread.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if thread.is_finished() {
        let _ = thread.join();
    } else {
        log::warn!("{} thread did not exit within {:?}", what, timeout);
    }
}

#[allow(clippy::too_many_arguments)]
fn poll_loop(
    mut iso: Box<dyn IsoStream>,
    handle: &dyn UsbHandle,
    endpoint: u8,
    shared: &StreamShared,
    tx: Sender<CapturedFrame>,
    drain: Receiver<CapturedFrame>,
    mut assembler: FrameAssembler,
    format: Arc<StreamFormat>,
    frame: Arc<FrameInfo>,
    poll_timeout: Duration,
) {
    let mut sequence = 0u64;

    while shared.active.load(Ordering::SeqCst) {
        match iso.poll(poll_timeout) {
            Ok(packets) => {
                for packet in &packets {
                    if packet.data.is_empty() {
                        continue;
                    }
                    for result in assembler.push(&packet.data) {
                        publish(result, &format, &frame, &mut sequence, shared, &tx, &drain);
                    }
                }
            }
            Err(e) => match e.kind {
                TransferKind::Stall => {
                    log::warn!("ISO transfer stalled; clearing halt");
                    if let Err(e) = handle.clear_halt(endpoint) {
                        log::error!("failed to clear halt: {}", e);
                        shared.store_error(e);
                        break;
                    }
                }
                TransferKind::Timeout => {}
                TransferKind::NoDevice => {
                    log::error!("device disconnected during streaming");
                    shared.store_error(e);
                    break;
                }
                _ => log::warn!("ISO poll failed, resubmitting: {}", e),
            },
        }
    }

    if let Some(result) = assembler.flush(EndReason::Timeout) {
        publish(result, &format, &frame, &mut sequence, shared, &tx, &drain);
    }
    iso.cancel_all();
    shared.active.store(false, Ordering::SeqCst);
}

/// Accounts for a finalized frame and, when complete, makes it visible to
/// consumers. Statistics are updated before the queue insert.
fn publish(
    result: AssemblyResult,
    format: &Arc<StreamFormat>,
    frame: &Arc<FrameInfo>,
    sequence: &mut u64,
    shared: &StreamShared,
    tx: &Sender<CapturedFrame>,
    drain: &Receiver<CapturedFrame>,
) {
    if !result.complete {
        log::debug!(
            "dropping incomplete frame: reason={:?} error={} len={}",
            result.reason,
            result.error,
            result.payload.len(),
        );
        shared.stats.lock().unwrap().frames_dropped += 1;
        return;
    }

    {
        let mut stats = shared.stats.lock().unwrap();
        stats.frames_completed += 1;
        stats.bytes_delivered += result.payload.len() as u64;
        stats.last_frame_duration_s = result.duration_s;
    }

    let mut captured = CapturedFrame {
        payload: result.payload,
        format: format.clone(),
        frame: frame.clone(),
        fid: result.fid,
        pts: result.pts,
        host_timestamp: Instant::now(),
        sequence: *sequence,
    };
    *sequence += 1;

    loop {
        match tx.try_send(captured) {
            Ok(()) => break,
            Err(TrySendError::Full(rejected)) => {
                // Admit the new frame at the cost of the oldest one.
                if drain.try_recv().is_ok() {
                    log::debug!("frame queue full; dropped oldest frame");
                    shared.stats.lock().unwrap().frames_dropped += 1;
                }
                captured = rejected;
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

/// Drains unsolicited status packets from the VC interrupt endpoint.
fn interrupt_loop(handle: &dyn UsbHandle, endpoint: u8, packet_size: u16, shared: &StreamShared) {
    log::debug!("VC interrupt listener started on endpoint {:#04x}", endpoint);
    while shared.active.load(Ordering::SeqCst) {
        match handle.read_interrupt(endpoint, packet_size.into(), Duration::from_millis(500)) {
            Ok(data) if !data.is_empty() => {
                log::debug!("VC interrupt data={}", probe::hex_dump(&data));
            }
            Ok(_) => {}
            Err(e) if e.kind == TransferKind::Timeout => {}
            Err(e) if e.kind == TransferKind::NoDevice => break,
            Err(e) => {
                log::debug!("VC interrupt read failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_dimensions() {
        let params = StreamParams::default();
        assert_eq!(params.transfers, 8);
        assert_eq!(params.packets_per_transfer, 32);
        assert_eq!(params.queue_depth, 4);
    }
}
