use std::path::Path;

use bin2uf2_core::{reporter::NoProgress, ConvertOptions, Family};
use log::{info, LevelFilter};

use crate::reporter::ProgressBarReporter;

pub fn convert<P1: AsRef<Path>, P2: AsRef<Path>>(
    input_path: &P1,
    output_path: &P2,
    options: &ConvertOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    match Family::from_id(options.family_id) {
        Some(family) => info!(
            "Using UF2 Family {} ({:#010x})",
            family.name(),
            options.family_id
        ),
        None => info!("Using UF2 Family {:#010x}", options.family_id),
    }
    info!("Placing image at {:#010x}", options.base_address);

    let should_print_progress = log::max_level() >= LevelFilter::Info;

    let summary = if should_print_progress {
        let mut reporter = ProgressBarReporter::default();
        bin2uf2_core::convert(input_path, output_path, options, &mut reporter)?
    } else {
        bin2uf2_core::convert(input_path, output_path, options, &mut NoProgress)?
    };

    info!(
        "Success! Created {} ({} blocks, {} bytes of image)",
        summary.output.display(),
        summary.blocks,
        summary.payload_bytes
    );

    Ok(())
}
