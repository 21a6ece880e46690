//! End-to-end tests against the scripted software camera.

#[path = "../demos/emu/mod.rs"]
mod emu;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use emu::{EmuControl, EmuProfile, Emulator, VC_INTERFACE, VS_INTERFACE};
use uvchost::{
    Camera, CameraSelector, Codec, Error, FormatKind, QuirksRegistry, StillMethod, StreamParams,
    StreamPreference, UnitKind,
};

fn open_camera(profile: EmuProfile) -> (Arc<Emulator>, Camera) {
    let transport = Arc::new(Emulator::new(profile));
    let camera = Camera::open(transport.clone(), 0).unwrap();
    (transport, camera)
}

fn default_camera() -> (Arc<Emulator>, Camera) {
    open_camera(EmuProfile::default())
}

#[test]
fn open_parses_topology() {
    let (_emu, camera) = default_camera();

    let interface = camera.streaming_interface();
    assert_eq!(interface.interface_number, VS_INTERFACE);
    assert_eq!(interface.formats.len(), 2);

    let yuy2 = &interface.formats[0];
    assert_eq!(yuy2.kind, FormatKind::Uncompressed);
    assert_eq!(yuy2.description, "YUY2");
    assert_eq!(yuy2.frames.len(), 1);
    assert_eq!(yuy2.frames[0].intervals, [333_333, 666_666, 1_000_000]);
    assert!(yuy2.frames[0].still_supported);
    assert_eq!(yuy2.still_frames.len(), 1);
    assert_eq!(
        (yuy2.still_frames[0].width, yuy2.still_frames[0].height),
        (emu::STILL_WIDTH, emu::STILL_HEIGHT)
    );

    assert_eq!(interface.formats[1].kind, FormatKind::Mjpeg);

    // High-bandwidth wMaxPacketSize decoding: 1024/2048/3072 capacities.
    let capacities: Vec<u32> = interface
        .alt_settings
        .iter()
        .map(|alt| alt.max_packet_size)
        .collect();
    assert_eq!(capacities, [0, 1024, 2048, 3072]);

    // One VC interface with camera terminal, processing unit, extension
    // unit.
    let (vc, units) = &camera.control_units()[0];
    assert_eq!(*vc, VC_INTERFACE);
    let kinds: Vec<UnitKind> = units.iter().map(|u| u.kind()).collect();
    assert_eq!(
        kinds,
        [
            UnitKind::CameraTerminal,
            UnitKind::ProcessingUnit,
            UnitKind::ExtensionUnit
        ]
    );
    // bmControls 0x0FC7 with bControlSize 3.
    let pu_names: Vec<&str> = units[1].controls().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        pu_names,
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
fn open_by_serial_and_bus_port() {
    let transport = Arc::new(Emulator::with_default_profile());
    assert!(Camera::open(transport.clone(), "EMU0001").is_ok());
    assert!(Camera::open(
        transport.clone(),
        CameraSelector::BusPort {
            bus_number: 1,
            port_path: vec![1, 2],
        },
    )
    .is_ok());

    match Camera::open(transport, 5) {
        Err(Error::NoDevice) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn select_stream_preferences() {
    let (_emu, camera) = default_camera();

    let (format, frame) = camera.select_stream(&StreamPreference::default()).unwrap();
    assert_eq!(format.kind, FormatKind::Uncompressed);
    assert_eq!((frame.width, frame.height), (emu::YUY2_WIDTH, emu::YUY2_HEIGHT));

    let (format, _) = camera
        .select_stream(&StreamPreference {
            codec: Codec::Mjpeg,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(format.kind, FormatKind::Mjpeg);

    let missing = camera.select_stream(&StreamPreference {
        width: Some(1920),
        height: Some(1080),
        ..Default::default()
    });
    assert!(matches!(missing, Err(Error::NoMatchingFormat(_))));
}

#[test]
fn negotiation_commits_nearest_interval() {
    let (emu, mut camera) = default_camera();

    let commit = camera
        .configure_stream(1, 1, Some(14.0), false, None)
        .unwrap();
    // 14 fps sits between 15 Hz (666666) and 10 Hz (1000000); 15 wins.
    assert_eq!(commit.frame_interval, 666_666);
    assert_eq!(commit.max_video_frame_size, emu::YUY2_FRAME_SIZE);

    // The committed block is the negotiated block, byte for byte.
    let block = emu.committed_block().unwrap();
    assert_eq!(block.len(), usize::from(commit.length));
    assert_eq!(block[2], 1);
    assert_eq!(block[3], 1);
    assert_eq!(
        u32::from_le_bytes(block[4..8].try_into().unwrap()),
        666_666
    );
}

#[test]
fn strict_fps_rejects_unmatched_rates() {
    let (_emu, mut camera) = default_camera();

    let err = camera
        .configure_stream(1, 1, Some(14.0), true, None)
        .unwrap_err();
    assert!(matches!(err, Error::NegotiationFailed { .. }));

    // The exact advertised rate is accepted in strict mode.
    let commit = camera
        .configure_stream(1, 1, Some(15.0), true, None)
        .unwrap();
    assert_eq!(commit.frame_interval, 666_666);
}

#[test]
fn probe_length_fallback_on_stall() {
    // The device rejects everything but the 34-byte block and does not
    // announce a length.
    let profile = EmuProfile {
        accepted_probe_lengths: vec![34],
        announce_probe_length: false,
        ..Default::default()
    };
    let (emu, mut camera) = open_camera(profile);

    let commit = camera.configure_stream(1, 1, Some(30.0), false, None).unwrap();
    assert_eq!(commit.length, 34);
    assert_eq!(emu.committed_block().unwrap().len(), 34);
}

#[test]
fn alt_selection_covers_negotiated_payload() {
    // dwMaxPayloadTransferSize = 1500 against capacities 1024/2048/3072:
    // the smallest sufficient alternate is 2.
    let (emu, mut camera) = default_camera();

    let commit = camera.configure_stream(1, 1, None, false, None).unwrap();
    assert_eq!(commit.selected_alt, 2);
    assert_eq!(commit.iso_packet_size, 2048);
    assert_eq!(emu.current_alt(VS_INTERFACE), 2);

    // An explicit alternate overrides the search.
    let commit = camera.configure_stream(1, 1, None, false, Some(3)).unwrap();
    assert_eq!(commit.selected_alt, 3);
    assert_eq!(emu.current_alt(VS_INTERFACE), 3);
}

#[test]
fn control_enumeration_and_quirks() {
    let (_emu, mut camera) = default_camera();

    let entries = camera.enumerate_controls(false).unwrap().to_vec();

    // Only controls that answered GET_INFO survive.
    let exposure = entries
        .iter()
        .find(|e| e.name == "Exposure Time, Absolute")
        .unwrap();
    assert_eq!(exposure.unit_id, 1);
    assert_eq!(exposure.length, Some(4));
    assert_eq!((exposure.min, exposure.max), (Some(100), Some(10000)));

    // Brightness advertises min 0xFFC0 > max 0x0040 unsigned: signed
    // inference kicks in.
    let brightness = entries.iter().find(|e| e.name == "Brightness").unwrap();
    assert!(brightness.is_signed());
    assert_eq!((brightness.min, brightness.max), (Some(-64), Some(64)));

    // PU selectors whose GET_INFO stalls are dropped.
    assert!(!entries.iter().any(|e| e.name == "Gamma"));

    // The bundled H.264 quirk renames XU selector 9.
    let version = entries
        .iter()
        .find(|e| e.unit_id == 4 && e.selector == 9)
        .unwrap();
    assert_eq!(version.name, "H.264 Picture Type");
    assert!(version.metadata.contains_key("description"));
    // Unmatched XU selectors keep their default name.
    let plain = entries
        .iter()
        .find(|e| e.unit_id == 4 && e.selector == 5)
        .unwrap();
    assert_eq!(plain.name, "XU 4 Control 5");

    // Without refresh the cache returns object-equal entries.
    let again = camera.enumerate_controls(false).unwrap().to_vec();
    assert_eq!(entries, again);
}

#[test]
fn quirk_scoring_consumes_definitions() {
    let (emu, mut camera) = default_camera();
    // Give both XU controls the same info byte so only scoring separates
    // them.
    emu.set_control_table(4, 9, EmuControl::int16(0, 1, 1, 0));

    let mut registry = QuirksRegistry::empty();
    registry
        .load_str(
            Path::new("inline.json"),
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": [
                    { "selector": 5, "name": "A" },
                    { "expected_info": "0x03", "name": "B" }
                ]
            }"#,
        )
        .unwrap();
    camera.set_quirks(registry);

    let entries = camera.enumerate_controls(true).unwrap();
    let sel5 = entries.iter().find(|e| e.unit_id == 4 && e.selector == 5).unwrap();
    let sel9 = entries.iter().find(|e| e.unit_id == 4 && e.selector == 9).unwrap();
    assert_eq!(sel5.name, "A");
    assert_eq!(sel9.name, "B");
}

#[test]
fn control_get_set_roundtrip() {
    let (_emu, mut camera) = default_camera();

    assert_eq!(camera.get("Brightness").unwrap(), 0);
    camera.set("brightness", -5).unwrap();
    assert_eq!(camera.get((2, 2)).unwrap(), -5);
    assert_eq!(camera.get_raw("Brightness").unwrap(), vec![0xFB, 0xFF]);

    // Raw writes must match the reported length.
    let err = camera.set_raw("Brightness", &[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        Error::ValueOutOfBounds {
            expected: 2,
            got: 3
        }
    ));

    // XU selector 9 is read-only.
    let err = camera.set((4, 9), 1).unwrap_err();
    assert!(matches!(err, Error::ControlUnavailable { .. }));

    let err = camera.get("No Such Thing").unwrap_err();
    assert!(matches!(err, Error::NoSuchControl(_)));
}

#[test]
fn streaming_delivers_ordered_frames() {
    let (emu, mut camera) = default_camera();
    camera.configure_stream(1, 1, Some(30.0), false, None).unwrap();

    let mut stream = camera.start_stream(StreamParams::default()).unwrap();

    let mut last_sequence = None;
    let mut last_timestamp = None;
    for _ in 0..8 {
        let frame = stream.read_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.payload.len(), emu::YUY2_FRAME_SIZE as usize);
        assert!(frame.pts.is_some());
        if let Some(last) = last_sequence {
            assert!(frame.sequence > last, "sequence must increase");
        }
        if let Some(last) = last_timestamp {
            assert!(frame.host_timestamp >= last, "timestamps must not go back");
        }
        last_sequence = Some(frame.sequence);
        last_timestamp = Some(frame.host_timestamp);
    }

    let stats = stream.stats();
    assert!(stats.frames_completed >= 8);
    assert!(stats.bytes_delivered >= 8 * u64::from(emu::YUY2_FRAME_SIZE));

    // In-stream control access rides the streaming handle.
    assert_eq!(camera.get("Contrast").unwrap(), 32);

    stream.stop();
    stream.stop(); // idempotent

    // Teardown: alternate 0, interfaces released, kernel drivers back,
    // device reset because claims required a detach.
    assert_eq!(emu.current_alt(VS_INTERFACE), 0);
    let mut bound = emu.kernel_bound();
    bound.sort_unstable();
    assert_eq!(bound, vec![VC_INTERFACE, VS_INTERFACE]);
    assert!(emu.reset_count() >= 1);
}

#[test]
fn streaming_recovers_from_stall() {
    let profile = EmuProfile {
        stall_first_poll: true,
        ..Default::default()
    };
    let (_emu, mut camera) = open_camera(profile);
    camera.configure_stream(1, 1, None, false, None).unwrap();

    let stream = camera.start_stream(StreamParams::default()).unwrap();
    let frame = stream.read_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.payload.len(), emu::YUY2_FRAME_SIZE as usize);
}

#[test]
fn stream_iterator_terminates_on_stop() {
    let (_emu, mut camera) = default_camera();
    camera.configure_stream(1, 1, None, false, None).unwrap();

    let mut stream = camera.start_stream(StreamParams::default()).unwrap();
    let frames: Vec<_> = stream.frames().take(3).collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.is_ok()));

    stream.stop();
    // A stopped stream's iterator drains and then ends cleanly.
    assert!(stream.frames().all(|f| f.is_ok()));
}

#[test]
fn start_stream_requires_commit() {
    let (_emu, mut camera) = default_camera();
    match camera.start_stream(StreamParams::default()) {
        Err(Error::StreamNotConfigured) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn synchronous_read_frame() {
    let (_emu, mut camera) = default_camera();
    camera.configure_stream(1, 1, None, false, None).unwrap();

    let frame = camera.read_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.payload.len(), emu::YUY2_FRAME_SIZE as usize);
    let next = camera.read_frame(Duration::from_secs(2)).unwrap();
    assert!(next.sequence > frame.sequence);
}

#[test]
fn still_capture_dedicated_frame() {
    let (emu, mut camera) = default_camera();
    let commit = camera.configure_stream(1, 1, None, false, None).unwrap();

    let still = camera.configure_still_image(None, None, 1).unwrap();
    assert_eq!(still.method, StillMethod::Method2);
    assert_eq!((still.width, still.height), (emu::STILL_WIDTH, emu::STILL_HEIGHT));
    assert!(emu.still_committed_block().is_some());

    let frame = camera.capture_still_image(Duration::from_secs(2)).unwrap();
    assert_eq!(
        frame.payload.len(),
        usize::from(emu::STILL_WIDTH) * usize::from(emu::STILL_HEIGHT)
    );
    // The video alternate is restored after the capture.
    assert_eq!(emu.current_alt(VS_INTERFACE), commit.selected_alt);
}

#[test]
fn still_capture_over_running_stream() {
    let (_emu, mut camera) = default_camera();
    camera.configure_stream(1, 1, None, false, None).unwrap();
    let still = camera
        .configure_still_image(Some(1), Some(uvchost::StillFrameRef::Video(1)), 1)
        .unwrap();
    assert_eq!(still.method, StillMethod::Method1);

    let _stream = camera.start_stream(StreamParams::default()).unwrap();
    let frame = camera.capture_still_image(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.payload.len(), emu::YUY2_FRAME_SIZE as usize);
}

#[test]
fn negotiation_failure_leaves_camera_idle() {
    // Device that rejects every probe length.
    let profile = EmuProfile {
        accepted_probe_lengths: vec![],
        announce_probe_length: false,
        ..Default::default()
    };
    let (emu, mut camera) = open_camera(profile);

    let err = camera.configure_stream(1, 1, None, false, None).unwrap_err();
    match err {
        Error::NegotiationFailed { tried_lengths, .. } => {
            assert_eq!(tried_lengths, vec![48, 34, 26]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // The claim was dropped and the kernel driver reattached.
    let mut bound = emu.kernel_bound();
    bound.sort_unstable();
    assert_eq!(bound, vec![VC_INTERFACE, VS_INTERFACE]);
}
