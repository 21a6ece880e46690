//! Streams a handful of frames and prints delivery statistics.

mod emu;

use std::sync::Arc;
use std::time::Duration;

use uvchost::{Camera, StreamParams, StreamPreference};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(emu::Emulator::with_default_profile());
    let mut camera = Camera::open(transport, 0)?;

    let (format_index, frame_index) = {
        let (format, frame) = camera.select_stream(&StreamPreference::default())?;
        println!(
            "selected {} {}x{}",
            format.description, frame.width, frame.height
        );
        (format.format_index, frame.frame_index)
    };

    let commit = camera.configure_stream(format_index, frame_index, Some(30.0), false, None)?;
    println!(
        "committed {:.1} fps, alt {}, packet {} bytes",
        commit.frame_rate_hz(),
        commit.selected_alt,
        commit.iso_packet_size,
    );

    let mut stream = camera.start_stream(StreamParams::default())?;
    for _ in 0..10 {
        let frame = stream.read_frame(Duration::from_secs(2))?;
        println!(
            "frame #{:<3} {} bytes fid={} pts={:?}",
            frame.sequence,
            frame.payload.len(),
            frame.fid,
            frame.pts,
        );
    }

    println!("{:?}", stream.stats());
    stream.stop();

    Ok(())
}
