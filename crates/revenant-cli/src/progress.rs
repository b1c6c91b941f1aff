//! Terminal progress for long scans

use std::sync::{Arc, Mutex};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use revenant_core::recovery::progress::ProgressSink;
use revenant_core::{ScanProgress, ScanStage};

/// One bar, re-labelled whenever the scan moves to a new stage
pub struct ProgressReporter {
	bar: ProgressBar,
	stage: Arc<Mutex<Option<ScanStage>>>,
}

impl ProgressReporter {
	/// A bar on stderr, or `None` when stderr is not a terminal
	pub fn for_terminal() -> Result<Option<Self>> {
		if !atty::is(atty::Stream::Stderr) {
			return Ok(None);
		}
		let bar = ProgressBar::new(0);
		bar.set_style(
			ProgressStyle::with_template(
				"{msg:>18} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
			)?
			.progress_chars("#>-"),
		);
		Ok(Some(Self {
			bar,
			stage: Arc::new(Mutex::new(None)),
		}))
	}

	pub fn sink(&self) -> ProgressSink {
		let bar = self.bar.clone();
		let stage = Arc::clone(&self.stage);
		Arc::new(move |progress: ScanProgress| {
			if let Ok(mut current) = stage.lock() {
				if *current != Some(progress.stage) {
					*current = Some(progress.stage);
					bar.reset();
					bar.set_message(progress.stage.to_string());
				}
			}
			bar.set_length(progress.total_units);
			bar.set_position(progress.scanned_units);
		})
	}

	pub fn finish(&self) {
		self.bar.finish_and_clear();
	}
}
