//! Terminal progress display for running batches

use indicatif::{ProgressBar, ProgressStyle};
use permshift_core::Progress;
use std::time::Duration;

/// Spinner fed by the engine's progress callback
#[derive(Clone)]
pub struct ProgressReporter {
	bar: ProgressBar,
}

impl ProgressReporter {
	pub fn new() -> Self {
		let bar = ProgressBar::new_spinner();
		let style = ProgressStyle::default_spinner()
			.template("{spinner:.green} [{elapsed_precise}] {msg}")
			.unwrap_or_else(|_| ProgressStyle::default_spinner())
			.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
		bar.set_style(style);
		bar.enable_steady_tick(Duration::from_millis(100));
		Self { bar }
	}

	pub fn update(&self, progress: &Progress) {
		self.bar.set_message(format!(
			"{} | Seen: {} | Changed: {} | Unchanged: {} | Errors: {} | In flight: {}",
			progress.state,
			progress.seen,
			progress.changed,
			progress.unchanged,
			progress.errored,
			progress.in_flight,
		));
	}

	pub fn set_status(&self, status: &str) {
		self.bar.set_message(status.to_string());
	}

	pub fn finish_and_clear(&self) {
		self.bar.finish_and_clear();
	}
}

impl Default for ProgressReporter {
	fn default() -> Self {
		Self::new()
	}
}
