//! Captures a still image over the dedicated still path.

mod emu;

use std::sync::Arc;
use std::time::Duration;

use uvchost::{Camera, StreamPreference};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(emu::Emulator::with_default_profile());
    let mut camera = Camera::open(transport, 0)?;

    let (format_index, frame_index) = {
        let (format, frame) = camera.select_stream(&StreamPreference::default())?;
        (format.format_index, frame.frame_index)
    };
    camera.configure_stream(format_index, frame_index, None, false, None)?;

    let still = camera.configure_still_image(None, None, 1)?;
    println!(
        "still: method {:?}, {}x{}, compression {}",
        still.method, still.width, still.height, still.compression_index,
    );

    let frame = camera.capture_still_image(Duration::from_secs(2))?;
    println!("captured {} bytes", frame.payload.len());

    Ok(())
}
