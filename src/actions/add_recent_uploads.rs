use std::time::Duration;

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use tracing::{debug, error, info, warn};

use crate::{
	actions::Context,
	config::{self, MetadataConfig, ProductionConfig},
	metadata::MetadataStore,
	production::ProductionCatalog,
	updater::LogEventsClient,
};

/// Keep the metadata up to date with recent uploads.
///
/// Polls the upstream log API for uploads newer than the latest one already
/// recorded for the configured wiki, resolves each to its full production
/// row, and reconciles the results into the metadata. Runs until
/// interrupted; the pauses between polls and between batches come from the
/// production configuration.
#[derive(Debug, Clone, Parser)]
pub struct AddRecentUploadsArgs {}

pub async fn run(ctx: Context<AddRecentUploadsArgs>) -> Result<()> {
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
	let wiki = production_config
		.wiki
		.clone()
		.ok_or_else(|| miette!("no wiki configured for recent-upload monitoring"))?;
	let client = LogEventsClient::new(production_config.api_url.as_deref());

	loop {
		// both connections are reopened each cycle, as one poll can be hours
		// apart from the next on quiet wikis
		let catalog = ProductionCatalog::connect(&production_config, &wiki)
			.await
			.into_diagnostic()?;
		let metadata = MetadataStore::connect(&metadata_config)
			.await
			.into_diagnostic()?;
		let fks = metadata.load_fks().await.into_diagnostic()?;

		match metadata
			.get_latest_upload_time(&fks, &wiki)
			.await
			.into_diagnostic()?
		{
			None => {
				warn!(wiki, "no upload watermark yet; run a full discovery first");
			}
			Some(since) => match client.uploads_since(since).await {
				Ok(pages) => {
					for page in pages {
						debug!(uploads = page.len(), "processing a page of uploads");
						let files = catalog.query_files(&page).await.into_diagnostic()?;
						metadata
							.check_and_update(&fks, &wiki, &files)
							.await
							.into_diagnostic()?;
						tokio::time::sleep(Duration::from_secs(
							production_config.batch_wait_time,
						))
						.await;
					}
				}
				Err(err) => {
					error!(?err, "could not poll the upload log, will retry");
				}
			},
		}

		catalog.close().await;
		metadata.close().await;
		info!(
			wiki,
			wait = production_config.api_wait_time,
			"poll finished, sleeping"
		);
		tokio::time::sleep(Duration::from_secs(production_config.api_wait_time)).await;
	}
}
