use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{error, info, warn};

use crate::{
	actions::Context,
	config::{self, MetadataConfig, ProductionConfig},
	metadata::MetadataStore,
	production::{ProductionCatalog, SourceTable},
};

/// Reconcile the backup metadata with the production file tables.
///
/// Re-reads the file tables of every wiki listed in the configured dblists
/// and reconciles them against the existing metadata: new revisions are
/// inserted, changed ones have their previous metadata moved to history and
/// are updated in place, and unchanged ones are left alone.
#[derive(Debug, Clone, Parser)]
pub struct UpdateMetadataArgs {}

pub async fn run(ctx: Context<UpdateMetadataArgs>) -> Result<()> {
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
	let bar = ctx.count_bar(wikis.len() as u64, "updating metadata");

	for wiki in wikis {
		info!(wiki, "updating metadata");
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
						info!(first = %batch[0], "starting to process batch");
						metadata
							.check_and_update(&fks, &wiki, &batch)
							.await
							.into_diagnostic()?;
						info!(last = %batch[batch.len() - 1], "batch processed");
					}
					Ok(None) => break,
					Err(err) => {
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
