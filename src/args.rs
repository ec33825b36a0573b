use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueHint};
use miette::Result;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Media backups tooling
///
/// Continuously mirrors wiki media files from production storage into backup
/// storage, maintains the metadata of every known file revision, and lets
/// operators query, restore and hard-delete those backups.
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help.",
)]
pub struct Args {
	/// Set diagnostic log level
	///
	/// Use multiple times to increase verbosity. Goes up to '-vvvv'. Setting
	/// $RUST_LOG also works, and takes precedence, but is not recommended
	/// unless you know what you're doing.
	#[arg(long, short, action = ArgAction::Count)]
	pub verbose: u8,

	/// Write diagnostic logs to a file
	///
	/// This writes diagnostic logs to a file, instead of the terminal, in JSON
	/// format.
	///
	/// If the path provided is a directory, a file will be created in that
	/// directory, named 'mediabackups.YYYY-MM-DDTHH-MM-SSZ.log'.
	#[arg(
		long,
		num_args = 0..=1,
		default_missing_value = ".",
		value_hint = ValueHint::AnyPath,
		value_name = "PATH",
	)]
	pub log_file: Option<PathBuf>,

	/// Directory holding the configuration files
	///
	/// Defaults to /etc/mediabackup, falling back to the home directory for
	/// files not present there.
	#[arg(long, value_hint = ValueHint::DirPath, value_name = "DIR")]
	pub config_dir: Option<PathBuf>,

	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

pub fn get_args() -> Result<(Args, Option<WorkerGuard>)> {
	let args = Args::parse();
	let guard = setup_logging(&args)?;
	debug!(?args, "got arguments");
	Ok((args, guard))
}

fn setup_logging(args: &Args) -> Result<Option<WorkerGuard>> {
	let filter = if std::env::var("RUST_LOG").is_ok() {
		warn!("⚠ RUST_LOG environment variable set, logging options have no effect");
		EnvFilter::from_default_env()
	} else {
		EnvFilter::new(match args.verbose {
			0 => "info",
			1 => "info,mediabackups=debug",
			2 => "debug",
			3 => "debug,mediabackups=trace",
			_ => "trace",
		})
	};

	match &args.log_file {
		Some(path) => {
			let path = if path.is_dir() {
				path.join(format!(
					"mediabackups.{}.log",
					chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ"),
				))
			} else {
				path.clone()
			};
			let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
			let filename = path
				.file_name()
				.ok_or_else(|| miette::miette!("log file path has no file name"))?;
			let appender = tracing_appender::rolling::never(directory, filename);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			tracing_subscriber::fmt()
				.json()
				.with_env_filter(filter)
				.with_writer(writer)
				.try_init()
				.map_err(|err| miette::miette!("could not set up logging: {err}"))?;
			Ok(Some(guard))
		}
		None => {
			tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_writer(std::io::stderr)
				.try_init()
				.map_err(|err| miette::miette!("could not set up logging: {err}"))?;
			Ok(None)
		}
	}
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
