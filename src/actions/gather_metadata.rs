use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{error, info, warn};

use crate::{
	actions::Context,
	config::{self, MetadataConfig, ProductionConfig},
	metadata::MetadataStore,
	production::{ProductionCatalog, SourceTable},
};

/// Record every known production file revision on the backup metadata.
///
/// Reads the file tables of every wiki listed in the configured dblists and
/// inserts all their revisions as new, pending rows. This is the one-shot
/// full discovery; for day-to-day reconciliation of an already-populated
/// metadata database, use `update-mysql-metadata` instead.
#[derive(Debug, Clone, Parser)]
pub struct GatherMetadataArgs {}

pub async fn run(ctx: Context<GatherMetadataArgs>) -> Result<()> {
	let production_config: ProductionConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::PRODUCTION_DB_CONFIG,
	))
	.into_diagnostic()?;
	let metadata_config: MetadataConfig = config::read_yaml_config(&config::resolve(
		ctx.config_dir(),
		config::METADATA_DB_CONFIG,
	))
	.into_diagnostic()?;

	let wikis = production_config.list_wikis().into_diagnostic()?;
	info!(count = wikis.len(), "about to process wikis");
	let bar = ctx.count_bar(wikis.len() as u64, "gathering metadata");

	for wiki in wikis {
		info!(wiki, "gathering metadata");
		let catalog = match ProductionCatalog::connect(&production_config, &wiki).await {
			Ok(catalog) => catalog,
			Err(err) => {
				error!(wiki, ?err, "skipping processing of wiki");
				bar.inc(1);
				continue;
			}
		};
		let metadata = MetadataStore::connect(&metadata_config)
			.await
			.into_diagnostic()?;
		let fks = metadata.load_fks().await.into_diagnostic()?;

		for table in SourceTable::ALL {
			info!(wiki, table = table.as_str(), "scanning source table");
			let mut scan = catalog.scan(table);
			loop {
				match scan.next_batch().await {
					Ok(Some(batch)) => {
						metadata.add(&fks, &batch).await.into_diagnostic()?;
					}
					Ok(None) => break,
					Err(err) => {
						// a query that failed even after a reconnect ends the
						// pass for this table
						warn!(wiki, table = table.as_str(), ?err, "scan aborted");
						break;
					}
				}
			}
		}
		catalog.close().await;
		metadata.close().await;
		info!(wiki, "finished processing");
		bar.inc(1);
	}
	bar.finish();
	info!("finished processing all wikis");
	Ok(())
}
