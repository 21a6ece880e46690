//! Lists attached UVC cameras.

mod emu;

use std::sync::Arc;

use uvchost::list_devices;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(emu::Emulator::with_default_profile());

    for dev in list_devices(&*transport, None, None)? {
        println!(
            "{} [{:04x}:{:04x}] {}",
            dev.id, dev.vendor_id, dev.product_id, dev.describe()
        );
    }

    Ok(())
}
