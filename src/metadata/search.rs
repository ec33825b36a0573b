use chrono::NaiveDateTime;
use sqlx::{mysql::MySqlRow, Row};
use tracing::debug;

use crate::{
	file::{get_text, get_time, RowDecodeError},
	swift::encode_path,
};

use super::{MetadataError, MetadataStore, SqlValue};

/// The fixed container all backups live in on the backup storage.
pub const BACKUP_CONTAINER: &str = "mediabackups";

/// The attribute a backup search filters on. All searches are scoped to one
/// wiki and only return rows whose backup completed (`backedup` or
/// `duplicate`).
#[derive(Debug, Clone)]
pub enum BackupSearch {
	Title { wiki: String, title: String },
	/// 40-character lowercase hexadecimal.
	Sha1 { wiki: String, sha1: String },
	/// 64-character lowercase hexadecimal.
	Sha256 { wiki: String, sha256: String },
	SwiftPath {
		wiki: String,
		container: String,
		path: String,
	},
	UploadDate { wiki: String, date: NaiveDateTime },
	ArchiveDate { wiki: String, date: NaiveDateTime },
	DeleteDate { wiki: String, date: NaiveDateTime },
	/// Used by the batch deletion flow to resolve parsed log tuples.
	TitleUploadDateSha1 {
		wiki: String,
		title: String,
		date: NaiveDateTime,
		sha1: String,
	},
}

impl BackupSearch {
	fn where_clause(&self) -> &'static str {
		match self {
			Self::Title { .. } => "wiki_name = ? AND upload_name = ?",
			Self::Sha1 { .. } => "wiki_name = ? AND files.sha1 = ?",
			Self::Sha256 { .. } => "wiki_name = ? AND backups.sha256 = ?",
			Self::SwiftPath { .. } => {
				"wiki_name = ? AND storage_container_name = ? AND storage_path = ?"
			}
			Self::UploadDate { .. } => "wiki_name = ? AND upload_timestamp = ?",
			Self::ArchiveDate { .. } => "wiki_name = ? AND archived_timestamp = ?",
			Self::DeleteDate { .. } => "wiki_name = ? AND deleted_timestamp = ?",
			Self::TitleUploadDateSha1 { .. } => {
				"wiki_name = ? AND upload_name = ? AND upload_timestamp = ? AND files.sha1 = ?"
			}
		}
	}

	fn values(&self) -> Vec<SqlValue> {
		match self {
			Self::Title { wiki, title } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Text(Some(title.clone())),
			],
			Self::Sha1 { wiki, sha1 } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Text(Some(sha1.clone())),
			],
			Self::Sha256 { wiki, sha256 } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Text(Some(sha256.clone())),
			],
			Self::SwiftPath { wiki, container, path } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Text(Some(container.clone())),
				SqlValue::Text(Some(path.clone())),
			],
			Self::UploadDate { wiki, date }
			| Self::ArchiveDate { wiki, date }
			| Self::DeleteDate { wiki, date } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Time(Some(*date)),
			],
			Self::TitleUploadDateSha1 { wiki, title, date, sha1 } => vec![
				SqlValue::Text(Some(wiki.clone())),
				SqlValue::Text(Some(title.clone())),
				SqlValue::Time(Some(*date)),
				SqlValue::Text(Some(sha1.clone())),
			],
		}
	}
}

/// One backed-up file as found by a search, with its computed backup address
/// and, where it exists, the public production URL.
#[derive(Debug, Clone)]
pub struct BackupSearchRow {
	/// id of the live `files` row; used by hard deletion.
	pub file_id: Option<i64>,
	pub wiki: String,
	pub title: Option<String>,
	pub production_container: Option<String>,
	pub production_path: Option<String>,
	pub sha1: Option<String>,
	pub sha256: String,
	pub size: Option<u64>,
	pub file_type: Option<String>,
	pub production_status: Option<String>,
	pub production_url: Option<String>,
	pub upload_date: Option<NaiveDateTime>,
	pub archive_date: Option<NaiveDateTime>,
	pub delete_date: Option<NaiveDateTime>,
	pub backup_status: Option<String>,
	pub backup_date: Option<NaiveDateTime>,
	/// Endpoint URL the physical backup lives on.
	pub backup_location: String,
	pub backup_container: String,
	pub backup_path: String,
}

impl BackupSearchRow {
	/// The printable properties of a result, in presentation order; internal
	/// ids are not included.
	pub fn display_fields(&self) -> Vec<(&'static str, String)> {
		fn opt(value: &Option<String>) -> String {
			value.clone().unwrap_or_else(|| "-".into())
		}
		fn date(value: &Option<NaiveDateTime>) -> String {
			value
				.map(|d| d.to_string())
				.unwrap_or_else(|| "-".into())
		}
		vec![
			("wiki", self.wiki.clone()),
			("title", opt(&self.title)),
			("production_container", opt(&self.production_container)),
			("production_path", opt(&self.production_path)),
			("sha1", opt(&self.sha1)),
			("sha256", self.sha256.clone()),
			(
				"size",
				self.size
					.map(|s| s.to_string())
					.unwrap_or_else(|| "-".into()),
			),
			("type", opt(&self.file_type)),
			("production_status", opt(&self.production_status)),
			("production_url", opt(&self.production_url)),
			("upload_date", date(&self.upload_date)),
			("archive_date", date(&self.archive_date)),
			("delete_date", date(&self.delete_date)),
			("backup_status", opt(&self.backup_status)),
			("backup_date", date(&self.backup_date)),
			("backup_location", self.backup_location.clone()),
			("backup_container", self.backup_container.clone()),
			("backup_path", self.backup_path.clone()),
		]
	}
}

/// The public URL a production file is served from, or `None` for deleted
/// files and malformed containers. Every path segment is percent-encoded
/// exactly once (archived names contain `!`).
pub fn swift_to_url(status: &str, container: &str, path: &str) -> Option<String> {
	if status == "deleted" {
		return None;
	}
	let mut tokens = container.split('-');
	let (Some(project), Some(subproject)) = (tokens.next(), tokens.next()) else {
		return None;
	};
	Some(format!(
		"https://upload.wikimedia.org/{}/{}/{}",
		encode_path(project),
		encode_path(subproject),
		encode_path(path),
	))
}

const QUERY_BACKUPS: &str = "SELECT wiki_name, upload_name, storage_container_name, storage_path, \
	        files.id as file_id, files.sha1 as sha1, file_types.type_name as file_type, \
	        backups.sha256 as sha256, size, status_name, \
	        upload_timestamp, archived_timestamp, deleted_timestamp, \
	        backup_status_name, backup_time, endpoint_url \
	   FROM backups \
	   JOIN wikis ON backups.wiki = wikis.id \
	   JOIN locations ON backups.location = locations.id \
	   LEFT JOIN files ON files.wiki = backups.wiki AND files.sha1 = backups.sha1 \
	   LEFT JOIN storage_containers ON files.storage_container = storage_containers.id \
	   LEFT JOIN file_status ON files.status = file_status.id \
	   LEFT JOIN backup_status ON files.backup_status = backup_status.id \
	   LEFT JOIN file_types ON files.file_type = file_types.id \
	   WHERE ";

impl MetadataStore {
	/// Search completed backups by one attribute, augmenting each result with
	/// its backup address and production URL.
	pub async fn query_backups(
		&self,
		search: &BackupSearch,
	) -> Result<Vec<BackupSearchRow>, MetadataError> {
		let sql = format!(
			"{QUERY_BACKUPS}{} AND backup_status_name IN ('backedup', 'duplicate') \
			 ORDER BY upload_name, status, upload_timestamp, archived_timestamp, deleted_timestamp",
			search.where_clause(),
		);
		debug!(?search, "searching backups");
		let rows = self.query_rows(&sql, &search.values()).await?;
		let non_public = self.get_non_public_wikis().await?;
		rows.iter()
			.map(|row| decode_backup_row(row, &non_public))
			.collect()
	}
}

fn decode_backup_row(
	row: &MySqlRow,
	non_public_wikis: &[String],
) -> Result<BackupSearchRow, MetadataError> {
	let wiki = get_text(row, "wiki_name")?
		.ok_or(RowDecodeError::Column("wiki_name", sqlx::Error::RowNotFound))?;
	let sha256 = get_text(row, "sha256")?
		.ok_or(RowDecodeError::Column("sha256", sqlx::Error::RowNotFound))?;
	let mut backup_path = format!("{wiki}/{}/{sha256}", &sha256[..3.min(sha256.len())]);
	if non_public_wikis.iter().any(|w| w == &wiki) {
		backup_path.push_str(".age");
	}

	let production_status = get_text(row, "status_name")?;
	let production_container = get_text(row, "storage_container_name")?;
	let production_path = get_text(row, "storage_path")?;
	let production_url = match (&production_status, &production_container, &production_path) {
		(Some(status), Some(container), Some(path)) => swift_to_url(status, container, path),
		_ => None,
	};

	Ok(BackupSearchRow {
		file_id: crate::file::get_id(row, "file_id")?,
		title: get_text(row, "upload_name")?,
		production_container,
		production_path,
		sha1: get_text(row, "sha1")?,
		size: row
			.try_get::<Option<u64>, _>("size")
			.map_err(|err| RowDecodeError::Column("size", err))?,
		file_type: get_text(row, "file_type")?,
		production_status,
		production_url,
		upload_date: get_time(row, "upload_timestamp")?,
		archive_date: get_time(row, "archived_timestamp")?,
		delete_date: get_time(row, "deleted_timestamp")?,
		backup_status: get_text(row, "backup_status_name")?,
		backup_date: get_time(row, "backup_time")?,
		backup_location: get_text(row, "endpoint_url")?.unwrap_or_default(),
		backup_container: BACKUP_CONTAINER.to_owned(),
		backup_path,
		wiki,
		sha256,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deleted_files_have_no_public_url() {
		assert_eq!(
			swift_to_url("deleted", "wikipedia-commons-local-deleted", "a/b/c/abc.jpg"),
			None
		);
	}

	#[test]
	fn malformed_containers_have_no_public_url() {
		assert_eq!(swift_to_url("public", "nodashes", "a/ac/Test.jpg"), None);
	}

	#[test]
	fn public_urls_are_derived_from_the_container() {
		assert_eq!(
			swift_to_url(
				"public",
				"wikipedia-commons-local-public.ac",
				"a/ac/Test.jpg"
			)
			.as_deref(),
			Some("https://upload.wikimedia.org/wikipedia/commons/a/ac/Test.jpg")
		);
	}

	#[test]
	fn archived_urls_encode_the_bang_once() {
		assert_eq!(
			swift_to_url(
				"archived",
				"wikipedia-test-local-public",
				"archive/a/ac/20221130132556!Test image.jpg"
			)
			.as_deref(),
			Some(
				"https://upload.wikimedia.org/wikipedia/test/archive/a/ac/20221130132556%21Test%20image.jpg"
			)
		);
	}
}
