use clap::Subcommand;
use miette::Result;
use tracing::debug;

pub use context::Context;
pub mod context;

pub mod add_recent_uploads;
pub mod backup_wiki;
pub mod delete_media_file;
pub mod gather_metadata;
pub mod query_media_file;
pub mod restore_media_file;
pub mod update_metadata;

// Exit codes shared by the operator entry points.
pub const EXIT_ABORTED: i32 = 3;
pub const EXIT_NO_MATCH: i32 = 4;
pub const EXIT_STILL_PUBLIC: i32 = 6;
pub const EXIT_PROBE_TIMEOUT: i32 = 7;
pub const EXIT_TMPDIR_MISSING_PARENT: i32 = 253;
pub const EXIT_TMPDIR_EXISTS: i32 = 254;
pub const EXIT_TMPDIR_PERMISSION: i32 = 255;

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
	GatherMysqlMetadata(gather_metadata::GatherMetadataArgs),
	UpdateMysqlMetadata(update_metadata::UpdateMetadataArgs),
	BackupWiki(backup_wiki::BackupWikiArgs),
	AddRecentUploads(add_recent_uploads::AddRecentUploadsArgs),
	QueryMediaFile(query_media_file::QueryMediaFileArgs),
	RestoreMediaFile(restore_media_file::RestoreMediaFileArgs),
	DeleteMediaFile(delete_media_file::DeleteMediaFileArgs),
}

pub async fn run(args: crate::args::Args) -> Result<()> {
	let ctx = Context::new(args.config_dir);
	debug!(version = %env!("CARGO_PKG_VERSION"), "starting up");
	match args.action {
		Action::GatherMysqlMetadata(sub) => gather_metadata::run(ctx.with_args(sub)).await,
		Action::UpdateMysqlMetadata(sub) => update_metadata::run(ctx.with_args(sub)).await,
		Action::BackupWiki(sub) => backup_wiki::run(ctx.with_args(sub)).await,
		Action::AddRecentUploads(sub) => add_recent_uploads::run(ctx.with_args(sub)).await,
		Action::QueryMediaFile(sub) => query_media_file::run(ctx.with_args(sub)).await,
		Action::RestoreMediaFile(sub) => restore_media_file::run(ctx.with_args(sub)).await,
		Action::DeleteMediaFile(sub) => delete_media_file::run(ctx.with_args(sub)).await,
	}
}
