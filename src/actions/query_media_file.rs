use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

use crate::{
	actions::{Context, EXIT_NO_MATCH},
	config::{self, MetadataConfig},
	metadata::MetadataStore,
	recovery::{self, QueryAction},
};

/// Search the backed-up files of a wiki.
///
/// Asks interactively for a wiki and an identification method (title, hash,
/// storage path or date) and prints every matching completed backup. Exits
/// with status 4 when nothing matches.
#[derive(Debug, Clone, Parser)]
pub struct QueryMediaFileArgs {}

pub async fn run(ctx: Context<QueryMediaFileArgs>) -> Result<()> {
	let metadata_config: MetadataConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::METADATA_DB_CONFIG,
	))
	.into_diagnostic()?;
	let metadata = MetadataStore::connect(&metadata_config)
		.await
		.into_diagnostic()?;

	let search = recovery::collect_search_interactively(&metadata, QueryAction::Query).await?;
	let files = metadata.query_backups(&search).await.into_diagnostic()?;
	metadata.close().await;

	if files.is_empty() {
		warn!("no file was found that matched the given criteria, exiting");
		std::process::exit(EXIT_NO_MATCH);
	}
	recovery::print_files(&files);
	info!(count = files.len(), "printed file(s) and finished execution");
	Ok(())
}
