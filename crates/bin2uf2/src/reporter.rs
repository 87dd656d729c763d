use std::io::Stdout;

use bin2uf2_core::reporter::ProgressReporter;
use pbr::{ProgressBar, Units};

/// Shows a byte progress bar on stdout while blocks are written.
#[derive(Default)]
pub struct ProgressBarReporter {
    pb: Option<ProgressBar<Stdout>>,
}

impl ProgressReporter for ProgressBarReporter {
    fn start(&mut self, total_bytes: usize) {
        let mut pb = ProgressBar::new(total_bytes as u64);
        pb.set_units(Units::Bytes);
        self.pb = Some(pb);
    }

    fn advance(&mut self, bytes: usize) {
        if let Some(pb) = self.pb.as_mut() {
            pb.add(bytes as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(mut pb) = self.pb.take() {
            pb.finish();
            // New line after progress bar
            println!();
        }
    }
}
