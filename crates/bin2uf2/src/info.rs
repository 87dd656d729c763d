use std::path::Path;

use bin2uf2_core::{inspect::inspect, read_image, Family};
use log::info;

pub fn info<P: AsRef<Path>>(input_path: &P) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = input_path.as_ref();
    let bytes = read_image(input_path)?;
    let summary = inspect(&bytes)?;

    info!("{}", input_path.display());
    info!("  Blocks:  {}", summary.blocks);
    info!("  Flags:   {:#010x}", summary.flags);
    match summary.family_id {
        Some(id) => match Family::from_id(id) {
            Some(family) => info!("  Family:  {} ({:#010x})", family.name(), id),
            None => info!("  Family:  {:#010x}", id),
        },
        None => info!("  Family:  not present"),
    }
    info!(
        "  Address: {:#010x} -> {:#010x}",
        summary.first_addr, summary.last_addr
    );
    info!("  Payload: {} bytes", summary.payload_bytes);

    Ok(())
}
