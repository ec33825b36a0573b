use std::path::{Path, PathBuf};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Carries the subcommand's arguments and the shared terminal progress
/// handle through an action's `run()`.
#[derive(Clone, Debug)]
pub struct Context<A = ()> {
	pub args: A,
	pub config_dir: Option<PathBuf>,
	pub progress: MultiProgress,
}

impl Context {
	pub fn new(config_dir: Option<PathBuf>) -> Self {
		Self {
			args: (),
			config_dir,
			progress: MultiProgress::new(),
		}
	}
}

impl<A> Context<A> {
	pub fn with_args<B>(self, args: B) -> Context<B> {
		Context::<B> {
			args,
			config_dir: self.config_dir,
			progress: self.progress,
		}
	}

	pub fn config_dir(&self) -> Option<&Path> {
		self.config_dir.as_deref()
	}

	/// A progress bar counting discrete items (wikis, files).
	pub fn count_bar(&self, len: u64, message: impl Into<String>) -> ProgressBar {
		self.progress.add(
			ProgressBar::new(len)
				.with_message(message.into())
				.with_style(
					ProgressStyle::default_bar()
						.template("[{bar:20.cyan/blue}] {msg} {pos}/{len} ({eta})")
						.expect("count bar template invalid"),
				),
		)
	}
}
