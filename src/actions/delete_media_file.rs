use std::path::PathBuf;

use clap::{Parser, ValueHint};
use miette::{IntoDiagnostic, Result};
use tracing::{error, info, warn};

use crate::{
	actions::{Context, EXIT_ABORTED, EXIT_NO_MATCH, EXIT_PROBE_TIMEOUT, EXIT_STILL_PUBLIC},
	config::{self, MetadataConfig, StorageConfig},
	metadata::MetadataStore,
	recovery::{self, ProductionProbeError, QueryAction},
	store::BackupStore,
};

/// Hard-delete backups of files already erased from production.
///
/// Finds the backups either interactively or from a maintenance deletion log,
/// prints them, and after confirmation removes them from backup storage and
/// marks their metadata hard-deleted. As a failsafe, every file that still
/// has a public production URL is probed first: anything not answering 404
/// aborts the whole session.
///
/// This is the one undoable operation of the tooling, so it defaults to a
/// dry run; pass '--execute' to actually delete.
#[derive(Debug, Clone, Parser)]
pub struct DeleteMediaFileArgs {
	/// Actually delete; the default is a dry run following the same steps.
	#[arg(long)]
	pub execute: bool,

	/// Maintenance deletion log to take the files from, instead of asking
	/// interactively. The log is expected to name the wiki on `mwscript
	/// eraseArchivedFile.php --wiki=… --delete` lines and the erased
	/// revisions on the `Deleted version '…' (…) of file '…'` lines below
	/// them.
	#[arg(value_name = "LOGFILE", value_hint = ValueHint::FilePath)]
	pub logfile: Option<PathBuf>,
}

pub async fn run(ctx: Context<DeleteMediaFileArgs>) -> Result<()> {
	let dry_run = !ctx.args.execute;
	if dry_run {
		println!(
			"This is a dry run deletion: no actual file or metadata will be affected, \
			 even if the script will follow the same steps and confirmation."
		);
	} else {
		println!(
			"An actual backup file deletion will be performed. These actions are undoable, \
			 although you will be given the chance of a final confirmation."
		);
	}

	let metadata_config: MetadataConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::METADATA_DB_CONFIG,
	))
	.into_diagnostic()?;
	let metadata = MetadataStore::connect(&metadata_config)
		.await
		.into_diagnostic()?;

	let (files, missing, multiple) = match &ctx.args.logfile {
		Some(logfile) => {
			info!("starting a batch deletion session");
			let parsed = recovery::parse_deletion_log(logfile, &metadata).await?;
			(parsed.found, parsed.missing, parsed.multiple)
		}
		None => {
			info!("starting an interactive deletion session");
			let search =
				recovery::collect_search_interactively(&metadata, QueryAction::Deletion).await?;
			let files = metadata.query_backups(&search).await.into_diagnostic()?;
			(files, Vec::new(), Vec::new())
		}
	};
	// the operator can sit a long time on the confirmation prompt
	metadata.close().await;

	if files.is_empty() {
		warn!("no file was found that matched the given criteria, exiting");
		std::process::exit(EXIT_NO_MATCH);
	}
	recovery::print_files(&files);
	if !missing.is_empty() {
		warn!(count = missing.len(), "searches returned no files");
	}
	if !multiple.is_empty() {
		warn!(count = multiple.len(), "searches returned multiple results");
	}
	if dry_run {
		println!("Executing deletion in dry mode, so files will not be actually deleted");
	} else {
		println!("WARNING! File deletion cannot be reverted");
	}
	if !recovery::confirm_action(QueryAction::Deletion, files.len())? {
		warn!("deletion aborted due to user input");
		std::process::exit(EXIT_ABORTED);
	}

	let storage_config: StorageConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::STORAGE_CONFIG,
	))
	.into_diagnostic()?;
	let store = BackupStore::new(&storage_config).into_diagnostic()?;

	// failsafe: none of these files may still be publicly reachable
	if let Err(err) = recovery::check_deleted_from_production(&files).await {
		error!("{err}");
		error!("aborting deletion process");
		std::process::exit(match err {
			ProductionProbeError::Timeout { .. } => EXIT_PROBE_TIMEOUT,
			_ => EXIT_STILL_PUBLIC,
		});
	}

	let deleted = recovery::delete_files(&files, &store, dry_run).await;

	let metadata = MetadataStore::connect(&metadata_config)
		.await
		.into_diagnostic()?;
	let fks = metadata.load_fks().await.into_diagnostic()?;
	metadata
		.mark_as_deleted(&fks, &deleted, dry_run)
		.await
		.into_diagnostic()?;
	metadata.close().await;

	recovery::datacenter_reminder(QueryAction::Deletion);
	Ok(())
}
