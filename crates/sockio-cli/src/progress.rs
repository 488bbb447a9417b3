//! Progress display and formatting for load generation.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress of a `blast` run, in datagrams
pub struct BlastProgress {
    bar: ProgressBar,
}

impl BlastProgress {
    /// Create a tracker for `total` datagrams
    #[must_use]
    pub fn new(total: u64, target: &str) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} datagrams ({per_sec})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(format!("Sending to {target}"));
        Self { bar }
    }

    /// Add `datagrams` to the position
    pub fn advance(&self, datagrams: u64) {
        self.bar.inc(datagrams);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(524_288), "512.00 KiB");
        assert_eq!(format_bytes(67_108_864), "64.00 MiB");
    }
}
