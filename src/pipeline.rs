use std::{
	io,
	path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
	encryption::Encryption,
	file::{BackupStatus, FileRecord},
	hashes::{sha1sum, sha256sum},
	metadata::{ForeignKeys, MetadataError, MetadataStore, StatusUpdate},
	store::BackupStore,
	swift::SwiftClient,
};

#[derive(Debug, Error)]
pub enum TempDirError {
	#[error("the download dir {0} could not be created due to a permission problem")]
	Permission(PathBuf),
	#[error("the download dir {0} could not be created because it already exists")]
	AlreadyExists(PathBuf),
	#[error("the download dir {0} could not be created because its parent dir does not exist")]
	MissingParent(PathBuf),
	#[error("the download dir {0} could not be created")]
	Other(PathBuf, #[source] io::Error),
}

/// Create the per-process download directory under the configured parent. The
/// process id guarantees uniqueness across concurrent workers on one host.
pub fn create_tmp_dir(parent: &Path) -> Result<PathBuf, TempDirError> {
	let tmp_dir = parent.join(std::process::id().to_string());
	match std::fs::create_dir(&tmp_dir) {
		Ok(()) => Ok(tmp_dir),
		Err(err) => Err(match err.kind() {
			io::ErrorKind::PermissionDenied => TempDirError::Permission(tmp_dir),
			io::ErrorKind::AlreadyExists => TempDirError::AlreadyExists(tmp_dir),
			io::ErrorKind::NotFound => TempDirError::MissingParent(tmp_dir),
			_ => TempDirError::Other(tmp_dir, err),
		}),
	}
}

/// Remove the per-process download directory; failures are logged and
/// otherwise ignored, as a non-empty directory is worth an operator's look
/// but not a failed run.
pub fn remove_tmp_dir(tmp_dir: &Path) {
	if let Err(err) = std::fs::remove_dir(tmp_dir) {
		match err.kind() {
			io::ErrorKind::NotFound => warn!(
				tmp_dir = %tmp_dir.display(),
				"temporary download directory could not be deleted: it was not found"
			),
			_ => warn!(
				tmp_dir = %tmp_dir.display(),
				"temporary download directory could not be deleted: it is not empty"
			),
		}
	}
}

/// What should go wrong while backing up one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFailure {
	Download,
	Checksum,
	Encryption,
	Upload,
}

/// The explicit outcome of one file's trip through the pipeline. Everything
/// maps onto a terminal backup status; nothing unwinds across the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
	Backedup { location: i64 },
	Duplicate,
	Error(BackupFailure),
}

impl BackupOutcome {
	pub fn status(self) -> BackupStatus {
		match self {
			Self::Backedup { .. } => BackupStatus::Backedup,
			Self::Duplicate => BackupStatus::Duplicate,
			Self::Error(_) => BackupStatus::Error,
		}
	}

	pub fn location(self) -> Option<i64> {
		match self {
			Self::Backedup { location } => Some(location),
			_ => None,
		}
	}
}

/// The target path of a file on backup storage: content-addressed under the
/// wiki, with an extra `.age` extension for encrypted (non-public) wikis.
pub fn backup_key(wiki: &str, sha256: &str, non_public_wikis: &[String]) -> String {
	let mut key = format!("{wiki}/{}/{sha256}", &sha256[..3.min(sha256.len())]);
	if non_public_wikis.iter().any(|w| w == wiki) {
		key.push_str(".age");
	}
	key
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
	pub processed: usize,
	pub backedup: usize,
	pub duplicates: usize,
	pub errors: usize,
}

/// The backup worker: claims batches of pending files and drives each one
/// through download, hashing, duplicate detection, optional encryption and
/// upload, committing all outcomes per batch.
pub struct BackupPipeline {
	metadata: MetadataStore,
	swift: SwiftClient,
	store: BackupStore,
	encryption: Encryption,
	tmp_dir: PathBuf,
}

impl BackupPipeline {
	pub fn new(
		metadata: MetadataStore,
		swift: SwiftClient,
		store: BackupStore,
		encryption: Encryption,
		tmp_dir: PathBuf,
	) -> Self {
		Self {
			metadata,
			swift,
			store,
			encryption,
			tmp_dir,
		}
	}

	/// Drain the pending queue. Per-file failures are recorded as `error` and
	/// the run continues; only metadata-level failures (claiming, committing)
	/// abort.
	#[instrument(skip(self))]
	pub async fn run(&self) -> Result<PipelineSummary, MetadataError> {
		let fks = self.metadata.load_fks().await?;
		let non_public_wikis = self.metadata.get_non_public_wikis().await?;
		let mut summary = PipelineSummary::default();

		while let Some(batch) = self.metadata.next_pending_batch(&fks).await? {
			let mut updates = Vec::with_capacity(batch.len());
			for (id, mut file) in batch {
				let outcome = self.backup_one(&mut file, &non_public_wikis).await;
				match outcome {
					BackupOutcome::Backedup { .. } => {
						info!(%file, "backup completed correctly");
						summary.backedup += 1;
					}
					BackupOutcome::Duplicate => {
						warn!(%file, "a file with the same sha256 was already uploaded, skipping");
						summary.duplicates += 1;
					}
					BackupOutcome::Error(failure) => {
						warn!(%file, ?failure, "backup failed");
						summary.errors += 1;
					}
				}
				summary.processed += 1;
				updates.push(StatusUpdate {
					id,
					status: outcome.status(),
					location: outcome.location(),
					file,
				});
			}
			self.metadata.update_status(&fks, &updates).await?;
		}
		Ok(summary)
	}

	/// Back up a single claimed file, filling in its computed hashes on the
	/// way. Temporary downloads are removed whatever the outcome.
	async fn backup_one(
		&self,
		file: &mut FileRecord,
		non_public_wikis: &[String],
	) -> BackupOutcome {
		let basename = file
			.storage_path
			.as_deref()
			.and_then(|p| p.rsplit('/').next())
			.unwrap_or("");
		let download_path = self.tmp_dir.join(basename);
		let outcome = self
			.download_and_store(file, &download_path, non_public_wikis)
			.await;

		remove_file_quietly(&download_path);
		let mut encrypted = download_path.into_os_string();
		encrypted.push(".age");
		remove_file_quietly(Path::new(&encrypted));

		outcome
	}

	async fn download_and_store(
		&self,
		file: &mut FileRecord,
		download_path: &Path,
		non_public_wikis: &[String],
	) -> BackupOutcome {
		if let Err(err) = self.swift.download(file, download_path).await {
			warn!(%file, ?err, "download from production failed");
			return BackupOutcome::Error(BackupFailure::Download);
		}

		let sha1 = match sha1sum(download_path) {
			Ok(sha1) => sha1,
			Err(err) => {
				warn!(%file, ?err, "could not checksum the downloaded file");
				return BackupOutcome::Error(BackupFailure::Checksum);
			}
		};
		// the metadata hash is untrusted: warn on a mismatch, then believe
		// the downloaded contents
		if file.sha1.as_deref() != Some(sha1.as_str()) {
			warn!(
				calculated = sha1,
				queried = file.sha1.as_deref().unwrap_or(""),
				name = file.upload_name.as_deref().unwrap_or(""),
				"calculated and queried sha1 checksums are not the same"
			);
			file.sha1 = Some(sha1);
		}
		let sha256 = match sha256sum(download_path) {
			Ok(sha256) => sha256,
			Err(err) => {
				warn!(%file, ?err, "could not checksum the downloaded file");
				return BackupOutcome::Error(BackupFailure::Checksum);
			}
		};
		debug!(name = file.upload_name.as_deref().unwrap_or(""), sha256, "computed sha256");
		file.sha256 = Some(sha256.clone());

		let backup_name = backup_key(&file.wiki, &sha256, non_public_wikis);
		match self.store.exists(&backup_name, None).await {
			Ok(true) => return BackupOutcome::Duplicate,
			Ok(false) => {}
			Err(err) => {
				warn!(%file, ?err, "could not check the backup storage for duplicates");
				return BackupOutcome::Error(BackupFailure::Upload);
			}
		}

		let upload_path = if non_public_wikis.iter().any(|w| w == &file.wiki) {
			match self.encryption.encrypt(download_path) {
				Ok(encrypted) => encrypted,
				Err(err) => {
					warn!(%file, ?err, "encryption failed");
					return BackupOutcome::Error(BackupFailure::Encryption);
				}
			}
		} else {
			download_path.to_owned()
		};

		match self.store.put(&upload_path, &backup_name).await {
			Ok(location) => BackupOutcome::Backedup { location },
			Err(err) => {
				warn!(%file, ?err, "upload to backup storage failed");
				BackupOutcome::Error(BackupFailure::Upload)
			}
		}
	}

	pub async fn close(self) {
		self.metadata.close().await;
	}
}

fn remove_file_quietly(path: &Path) {
	// the file may legitimately not exist, depending on where the pipeline
	// stopped for this record
	let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backup_keys_are_content_addressed() {
		let sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
		assert_eq!(
			backup_key("enwiki", sha256, &[]),
			format!("enwiki/9f8/{sha256}")
		);
	}

	#[test]
	fn non_public_wikis_get_the_age_extension() {
		let sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
		let non_public = vec!["privatewiki".to_owned()];
		assert_eq!(
			backup_key("privatewiki", sha256, &non_public),
			format!("privatewiki/9f8/{sha256}.age")
		);
		assert_eq!(
			backup_key("enwiki", sha256, &non_public),
			format!("enwiki/9f8/{sha256}")
		);
	}

	#[test]
	fn outcomes_map_onto_backup_statuses() {
		assert_eq!(
			BackupOutcome::Backedup { location: 3 }.status(),
			BackupStatus::Backedup
		);
		assert_eq!(BackupOutcome::Backedup { location: 3 }.location(), Some(3));
		assert_eq!(BackupOutcome::Duplicate.status(), BackupStatus::Duplicate);
		assert_eq!(BackupOutcome::Duplicate.location(), None);
		assert_eq!(
			BackupOutcome::Error(BackupFailure::Download).status(),
			BackupStatus::Error
		);
	}

	#[test]
	fn tmp_dir_is_per_process() {
		let parent = tempfile::tempdir().unwrap();
		let tmp_dir = create_tmp_dir(parent.path()).unwrap();
		assert!(tmp_dir.is_dir());
		assert_eq!(
			tmp_dir.file_name().unwrap().to_str().unwrap(),
			std::process::id().to_string()
		);

		// a second worker with the same pid cannot happen; a leftover dir is
		// a hard error instead
		assert!(matches!(
			create_tmp_dir(parent.path()),
			Err(TempDirError::AlreadyExists(_))
		));

		remove_tmp_dir(&tmp_dir);
		assert!(!tmp_dir.exists());
	}

	#[test]
	fn missing_parent_is_its_own_failure() {
		assert!(matches!(
			create_tmp_dir(Path::new("/nonexistent-parent-dir/sub")),
			Err(TempDirError::MissingParent(_))
		));
	}
}
