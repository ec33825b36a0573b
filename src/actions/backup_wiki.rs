use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{error, info};

use crate::{
	actions::{
		Context, EXIT_TMPDIR_EXISTS, EXIT_TMPDIR_MISSING_PARENT, EXIT_TMPDIR_PERMISSION,
	},
	config::{self, MetadataConfig, StorageConfig},
	encryption::Encryption,
	metadata::MetadataStore,
	pipeline::{self, BackupPipeline, TempDirError},
	store::BackupStore,
	swift::SwiftClient,
};

/// Back up all pending files.
///
/// Claims batches of files marked 'pending' on the metadata database, and
/// for each one: downloads it from production, checksums it, skips it if the
/// same contents were already backed up for the wiki, encrypts it if the
/// wiki is not public, uploads it to backup storage and records the outcome.
/// Multiple workers can run concurrently against the same metadata database;
/// they coordinate through the files' backup status.
#[derive(Debug, Clone, Parser)]
pub struct BackupWikiArgs {}

pub async fn run(ctx: Context<BackupWikiArgs>) -> Result<()> {
	let metadata_config: MetadataConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::METADATA_DB_CONFIG,
	))
	.into_diagnostic()?;
	let storage_config: StorageConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::STORAGE_CONFIG,
	))
	.into_diagnostic()?;

	let tmp_dir = match pipeline::create_tmp_dir(&storage_config.tmpdir) {
		Ok(tmp_dir) => tmp_dir,
		Err(err) => {
			error!("{err}");
			std::process::exit(match err {
				TempDirError::Permission(_) => EXIT_TMPDIR_PERMISSION,
				TempDirError::AlreadyExists(_) => EXIT_TMPDIR_EXISTS,
				TempDirError::MissingParent(_) => EXIT_TMPDIR_MISSING_PARENT,
				TempDirError::Other(..) => EXIT_TMPDIR_PERMISSION,
			});
		}
	};

	let metadata = MetadataStore::connect(&metadata_config)
		.await
		.into_diagnostic()?;
	let store = BackupStore::new(&storage_config).into_diagnostic()?;
	let swift = SwiftClient::new(&storage_config.swift_url);
	let encryption = Encryption::new(&storage_config.identity_file);

	let pipeline = BackupPipeline::new(metadata, swift, store, encryption, tmp_dir.clone());
	let result = pipeline.run().await;
	pipeline.close().await;
	pipeline::remove_tmp_dir(&tmp_dir);

	let summary = result.into_diagnostic()?;
	info!(
		processed = summary.processed,
		backedup = summary.backedup,
		duplicates = summary.duplicates,
		errors = summary.errors,
		"backup run finished"
	);
	Ok(())
}
