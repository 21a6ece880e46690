//! Dumps the parsed topology of a camera.

mod emu;

use std::sync::Arc;

use uvchost::Camera;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let transport = Arc::new(emu::Emulator::with_default_profile());
    let camera = Camera::open(transport, 0)?;

    println!("{}", camera.describe());

    for (interface, units) in camera.control_units() {
        println!("VC interface {}:", interface);
        for unit in units {
            println!("  {}", unit);
            for control in unit.controls() {
                println!("    selector {:>2}: {}", control.selector, control.name);
            }
        }
    }

    for interface in camera.streaming_interfaces() {
        println!("VS interface {}:", interface.interface_number);
        for format in &interface.formats {
            println!("  format {}: {}", format.format_index, format.description);
            for frame in &format.frames {
                let rates: Vec<String> = frame
                    .rates_hz()
                    .iter()
                    .map(|hz| format!("{:.1}", hz))
                    .collect();
                println!(
                    "    frame {}: {}x{} @ {} fps{}",
                    frame.frame_index,
                    frame.width,
                    frame.height,
                    rates.join("/"),
                    if frame.still_supported { " (still)" } else { "" },
                );
            }
            for still in &format.still_frames {
                println!(
                    "    still {}: {}x{} (endpoint {:#04x})",
                    still.index, still.width, still.height, still.endpoint_address
                );
            }
        }
        for alt in &interface.alt_settings {
            println!(
                "  alt {}: packet size {} bytes{}",
                alt.alt_setting,
                alt.max_packet_size,
                if alt.is_isochronous() { " (iso)" } else { "" },
            );
        }
    }

    Ok(())
}
