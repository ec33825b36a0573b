use std::fmt;

use chrono::NaiveDateTime;
use sqlx::{mysql::MySqlRow, Row};
use thiserror::Error;

use crate::metadata::ForeignKeys;

/// Production lifecycle of a file revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
	Public,
	Archived,
	Deleted,
	HardDeleted,
}

impl FileStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Public => "public",
			Self::Archived => "archived",
			Self::Deleted => "deleted",
			Self::HardDeleted => "hard-deleted",
		}
	}

	pub fn parse(name: &str) -> Option<Self> {
		match name {
			"public" => Some(Self::Public),
			"archived" => Some(Self::Archived),
			"deleted" => Some(Self::Deleted),
			"hard-deleted" => Some(Self::HardDeleted),
			_ => None,
		}
	}
}

impl fmt::Display for FileStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Backup workflow state of a `files` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
	Pending,
	Processing,
	Backedup,
	Duplicate,
	Error,
}

impl BackupStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Backedup => "backedup",
			Self::Duplicate => "duplicate",
			Self::Error => "error",
		}
	}

	pub fn parse(name: &str) -> Option<Self> {
		match name {
			"pending" => Some(Self::Pending),
			"processing" => Some(Self::Processing),
			"backedup" => Some(Self::Backedup),
			"duplicate" => Some(Self::Duplicate),
			"error" => Some(Self::Error),
			_ => None,
		}
	}
}

impl fmt::Display for BackupStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error)]
pub enum RowDecodeError {
	#[error("missing or unreadable column '{0}'")]
	Column(&'static str, #[source] sqlx::Error),
	#[error("row references unknown {table} id {id}")]
	UnknownKey { table: &'static str, id: i64 },
	#[error("row carries unknown file status '{0}'")]
	UnknownStatus(String),
}

/// Metadata for an individual image, video, document or any other object that
/// can be uploaded to a wiki site. One value represents one revision of one
/// file, as discovered from production or read back from the metadata
/// database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
	pub wiki: String,
	pub upload_name: Option<String>,
	pub status: FileStatus,
	/// Media category; `ERROR` when the source row carried none.
	pub file_type: String,
	pub size: Option<u64>,
	pub upload_timestamp: Option<NaiveDateTime>,
	pub archived_timestamp: Option<NaiveDateTime>,
	pub deleted_timestamp: Option<NaiveDateTime>,
	/// 40-character lowercase hexadecimal, zero-padded; absent for rows that
	/// never had a hash recorded.
	pub sha1: Option<String>,
	/// 64-character lowercase hexadecimal; filled in by the backup pipeline
	/// after download.
	pub sha256: Option<String>,
	pub md5: Option<String>,
	pub storage_container: Option<String>,
	pub storage_path: Option<String>,
}

impl FileRecord {
	/// The persistence projection of a record: the `files` columns written on
	/// insert, in the fixed order used to build multi-row statements.
	pub const FIELDS: [&'static str; 12] = [
		"archived_timestamp",
		"deleted_timestamp",
		"file_type",
		"md5",
		"sha1",
		"size",
		"status",
		"storage_container",
		"storage_path",
		"upload_name",
		"upload_timestamp",
		"wiki",
	];

	pub fn new(wiki: impl Into<String>, upload_name: Option<String>, status: FileStatus) -> Self {
		Self {
			wiki: wiki.into(),
			upload_name,
			status,
			file_type: "ERROR".into(),
			size: None,
			upload_timestamp: None,
			archived_timestamp: None,
			deleted_timestamp: None,
			sha1: None,
			sha256: None,
			md5: None,
			storage_container: None,
			storage_path: None,
		}
	}

	/// The key two records are considered interchangeable under for
	/// de-duplication purposes; identity beyond that is the
	/// `(wiki, sha1, size, upload_timestamp)` tuple.
	pub fn dedup_key(&self) -> Option<&str> {
		self.sha1.as_deref()
	}

	/// Decode a row holding all [`Self::FIELDS`] columns, resolving the
	/// normalized foreign keys back to their names.
	pub fn from_row(row: &MySqlRow, fks: &ForeignKeys) -> Result<Self, RowDecodeError> {
		let wiki_id = get_id(row, "wiki")?
			.ok_or(RowDecodeError::Column("wiki", sqlx::Error::RowNotFound))?;
		let wiki = fks
			.wikis
			.name(wiki_id)
			.ok_or(RowDecodeError::UnknownKey { table: "wikis", id: wiki_id })?
			.to_owned();

		let status_id = get_id(row, "status")?
			.ok_or(RowDecodeError::Column("status", sqlx::Error::RowNotFound))?;
		let status_name = fks
			.file_status
			.name(status_id)
			.ok_or(RowDecodeError::UnknownKey { table: "file_status", id: status_id })?;
		let status = FileStatus::parse(status_name)
			.ok_or_else(|| RowDecodeError::UnknownStatus(status_name.to_owned()))?;

		let file_type = match get_id(row, "file_type")? {
			Some(id) => fks
				.file_types
				.name(id)
				.ok_or(RowDecodeError::UnknownKey { table: "file_types", id })?
				.to_owned(),
			None => "ERROR".to_owned(),
		};

		let storage_container = match get_id(row, "storage_container")? {
			Some(id) => Some(
				fks.storage_containers
					.name(id)
					.ok_or(RowDecodeError::UnknownKey { table: "storage_containers", id })?
					.to_owned(),
			),
			None => None,
		};

		Ok(Self {
			wiki,
			upload_name: get_text(row, "upload_name")?,
			status,
			file_type,
			size: row
				.try_get::<Option<u64>, _>("size")
				.map_err(|err| RowDecodeError::Column("size", err))?,
			upload_timestamp: get_time(row, "upload_timestamp")?,
			archived_timestamp: get_time(row, "archived_timestamp")?,
			deleted_timestamp: get_time(row, "deleted_timestamp")?,
			sha1: get_text(row, "sha1")?,
			sha256: None,
			md5: get_text(row, "md5")?,
			storage_container,
			storage_path: get_text(row, "storage_path")?,
		})
	}
}

impl fmt::Display for FileRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {} {}",
			self.wiki,
			self.upload_name.as_deref().unwrap_or(""),
			self.sha1.as_deref().unwrap_or(""),
		)
	}
}

/// Text columns are stored as varbinary and decoded leniently, matching how
/// the wiki databases store titles and hashes.
pub(crate) fn get_text(row: &MySqlRow, column: &'static str) -> Result<Option<String>, RowDecodeError> {
	let bytes = row
		.try_get::<Option<Vec<u8>>, _>(column)
		.map_err(|err| RowDecodeError::Column(column, err))?;
	Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
}

pub(crate) fn get_time(
	row: &MySqlRow,
	column: &'static str,
) -> Result<Option<NaiveDateTime>, RowDecodeError> {
	row.try_get::<Option<NaiveDateTime>, _>(column)
		.map_err(|err| RowDecodeError::Column(column, err))
}

pub(crate) fn get_id(row: &MySqlRow, column: &'static str) -> Result<Option<i64>, RowDecodeError> {
	row.try_get::<Option<i64>, _>(column)
		.map_err(|err| RowDecodeError::Column(column, err))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_records_default_to_error_type() {
		let record = FileRecord::new("commonswiki", Some("Test.jpg".into()), FileStatus::Public);
		assert_eq!(record.file_type, "ERROR");
		assert_eq!(record.size, None);
		assert_eq!(record.dedup_key(), None);
	}

	#[test]
	fn equality_is_structural() {
		let sha1 = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
		let mut left = FileRecord::new("commonswiki", Some("Test.jpg".into()), FileStatus::Public);
		left.sha1 = Some(sha1.into());
		let mut right = FileRecord::new("commonswiki", Some("Test.jpg".into()), FileStatus::Public);
		right.sha1 = Some(sha1.into());
		assert_eq!(left, right);

		right.size = Some(42);
		assert_ne!(left, right);
		assert_eq!(left.dedup_key(), right.dedup_key());
	}

	#[test]
	fn statuses_round_trip_through_names() {
		for status in [
			FileStatus::Public,
			FileStatus::Archived,
			FileStatus::Deleted,
			FileStatus::HardDeleted,
		] {
			assert_eq!(FileStatus::parse(status.as_str()), Some(status));
		}
		assert_eq!(FileStatus::parse("nonsense"), None);

		for status in [
			BackupStatus::Pending,
			BackupStatus::Processing,
			BackupStatus::Backedup,
			BackupStatus::Duplicate,
			BackupStatus::Error,
		] {
			assert_eq!(BackupStatus::parse(status.as_str()), Some(status));
		}
	}

	#[test]
	fn persistence_projection_is_stable() {
		// multi-row statements are built positionally from this list, so its
		// order is part of the storage format
		assert!(FileRecord::FIELDS.windows(2).all(|pair| pair[0] < pair[1]));
		assert_eq!(FileRecord::FIELDS.len(), 12);
		assert!(FileRecord::FIELDS.contains(&"upload_name"));
		assert!(!FileRecord::FIELDS.contains(&"backup_status"));
	}

	#[test]
	fn display_is_compact() {
		let mut record = FileRecord::new("enwiki", Some("A.png".into()), FileStatus::Public);
		record.sha1 = Some("00".repeat(20));
		assert_eq!(record.to_string(), format!("enwiki A.png {}", "00".repeat(20)));
	}
}
