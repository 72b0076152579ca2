//! Terminal progress bars for transfers.
//!
//! Bars are added to a shared [`MultiProgress`] so concurrent transfers each
//! keep their own line instead of overwriting one another.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::transfer::ProgressObserver;
use crate::types::TransferMetadata;

/// Renders one transfer as an indicatif progress bar on stderr
pub struct ProgressBarObserver {
    bar: ProgressBar,
    verb: &'static str,
}

impl ProgressBarObserver {
    pub fn sending(multi: &MultiProgress) -> Self {
        Self::new(multi, "Sending")
    }

    pub fn receiving(multi: &MultiProgress) -> Self {
        Self::new(multi, "Receiving")
    }

    fn new(multi: &MultiProgress, verb: &'static str) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(Self::bar_style());
        Self { bar, verb }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
    }
}

impl ProgressObserver for ProgressBarObserver {
    fn on_start(&self, metadata: &TransferMetadata) {
        self.bar.set_length(metadata.size);
        self.bar.set_position(0);
        self.bar.set_message(format!("{} {}", self.verb, metadata.name));
    }

    fn on_progress(&self, transferred: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(transferred);
    }

    fn on_finish(&self, metadata: &TransferMetadata) {
        self.bar
            .finish_with_message(format!("[DONE] {} {}", self.verb, metadata.name));
    }
}

impl Drop for ProgressBarObserver {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}
