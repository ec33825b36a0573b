use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

use crate::{
	actions::{Context, EXIT_ABORTED, EXIT_NO_MATCH},
	config::{self, MetadataConfig, StorageConfig},
	encryption::Encryption,
	metadata::MetadataStore,
	recovery::{self, QueryAction},
	store::BackupStore,
};

/// Restore backed-up files to the local filesystem.
///
/// Asks interactively for a wiki and an identification method, prints the
/// matching backups, and after confirmation downloads each one into the
/// current directory (decrypting non-public wikis' files on the way).
/// Existing local files are never overwritten; recovered files get a '~'
/// suffix instead. Without '--execute' nothing is written.
#[derive(Debug, Clone, Parser)]
pub struct RestoreMediaFileArgs {
	/// Actually write the recovered files; the default is a dry run.
	#[arg(long)]
	pub execute: bool,
}

pub async fn run(ctx: Context<RestoreMediaFileArgs>) -> Result<()> {
	let metadata_config: MetadataConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::METADATA_DB_CONFIG,
	))
	.into_diagnostic()?;
	let metadata = MetadataStore::connect(&metadata_config)
		.await
		.into_diagnostic()?;

	let search = recovery::collect_search_interactively(&metadata, QueryAction::Recovery).await?;
	let files = metadata.query_backups(&search).await.into_diagnostic()?;
	// the operator can sit a long time on the confirmation prompt
	metadata.close().await;

	if files.is_empty() {
		warn!("no file was found that matched the given criteria, exiting");
		std::process::exit(EXIT_NO_MATCH);
	}
	recovery::print_files(&files);
	if !recovery::confirm_action(QueryAction::Recovery, files.len())? {
		warn!("recovery aborted due to user input");
		std::process::exit(EXIT_ABORTED);
	}

	if !ctx.args.execute {
		info!(
			count = files.len(),
			"dry run: no files were written; pass --execute to perform the recovery"
		);
		return Ok(());
	}

	let storage_config: StorageConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::STORAGE_CONFIG,
	))
	.into_diagnostic()?;
	let store = BackupStore::new(&storage_config).into_diagnostic()?;
	let encryption = Encryption::new(&storage_config.identity_file);

	recovery::recover_to_local(&files, &store, &encryption).await;
	recovery::datacenter_reminder(QueryAction::Recovery);
	Ok(())
}
