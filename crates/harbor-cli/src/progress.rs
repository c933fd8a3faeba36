//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};

/// Transfer progress tracker
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker.
    ///
    /// Uploads know their total up front (the digest pass counts the file
    /// once, the send pass counts it again); downloads start at zero and
    /// learn the total from GET_START.
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg:.bold}\n  [{elapsed_precise}] {wide_bar:.green/black} \
                     {binary_bytes}/{binary_total_bytes} ({binary_bytes_per_sec}, eta {eta})",
                )
                .expect("static progress template"),
        );

        bar.set_message(filename.to_string());

        Self { bar }
    }

    /// Update position, re-homing the bar length when the total shifts
    /// (downloads learn their size from the server mid-flight)
    pub fn update(&self, done: u64, total: u64) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }
        self.bar.set_position(done);
    }

    /// Finish with a message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format a byte count with binary units, matching the chunk and rate
/// vocabulary the protocol uses (KiB, MiB, ...)
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let exponent = ((63 - u64::from(bytes.leading_zeros())) / 10) as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / (1u64 << (10 * exponent)) as f64;
    format!("{value:.1} {}", UNITS[exponent])
}
