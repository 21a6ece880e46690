//! Enumerates controls and round-trips a value through one of them.

mod emu;

use std::sync::Arc;

use uvchost::Camera;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(emu::Emulator::with_default_profile());
    let mut camera = Camera::open(transport, 0)?;

    for entry in camera.enumerate_controls(false)? {
        println!(
            "{:<32} info={:?} len={:?} range={:?}..{:?} default={:?}",
            entry.name, entry.info, entry.length, entry.min, entry.max, entry.default,
        );
    }

    let before = camera.get("Brightness")?;
    println!("Brightness: {}", before);
    camera.set("Brightness", before + 1)?;
    println!("Brightness after set: {}", camera.get("Brightness")?);
    camera.set("Brightness", before)?;

    Ok(())
}
