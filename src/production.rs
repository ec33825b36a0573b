use std::collections::VecDeque;

use chrono::NaiveDateTime;
use itertools::iproduct;
use sqlx::{
	mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow},
	Row,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
	config::ProductionConfig,
	dates::{wiki_date_to_datetime, WIKI_DATE_FORMAT},
	file::{FileRecord, FileStatus},
	hashes::base36_to_base16,
	swift,
};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ProductionError {
	#[error("could not connect to the production database for {wiki} on {host}")]
	Connect {
		wiki: String,
		host: String,
		#[source]
		source: sqlx::Error,
	},
	#[error("query against the production database failed after reconnecting")]
	Query(#[source] sqlx::Error),
}

/// The three tables every wiki keeps its file revisions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTable {
	/// Current revisions.
	Image,
	/// Older revisions of still-existing files; rows flagged deleted there
	/// were suppressed rather than archived.
	OldImage,
	/// Soft-deleted revisions.
	FileArchive,
}

impl SourceTable {
	pub const ALL: [Self; 3] = [Self::Image, Self::OldImage, Self::FileArchive];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Image => "image",
			Self::OldImage => "oldimage",
			Self::FileArchive => "filearchive",
		}
	}

	fn query(self) -> &'static str {
		match self {
			Self::Image => {
				"SELECT 'public' as status, \
				        img_name as upload_name, \
				        img_name as storage_path, \
				        img_size as size, \
				        img_media_type as type, \
				        STR_TO_DATE(img_timestamp, '%Y%m%d%H%i%s') as upload_timestamp, \
				        CAST(NULL AS BINARY) as archived_name, \
				        CAST(NULL AS DATETIME) as deleted_timestamp, \
				        img_sha1 as sha1 \
				   FROM image"
			}
			Self::OldImage => {
				"SELECT IF(oi_deleted, 'deleted', 'archived') as status, \
				        oi_name as upload_name, \
				        IF(oi_deleted, \
				            CONCAT(oi_sha1, '.', SUBSTRING_INDEX(oi_name, '.', -1)), \
				            oi_archive_name \
				        ) as storage_path, \
				        oi_size as size, \
				        oi_media_type as type, \
				        STR_TO_DATE(oi_timestamp, '%Y%m%d%H%i%s') as upload_timestamp, \
				        oi_archive_name as archived_name, \
				        CAST(NULL AS DATETIME) as deleted_timestamp, \
				        oi_sha1 as sha1 \
				   FROM oldimage"
			}
			Self::FileArchive => {
				"SELECT 'deleted' as status, \
				        fa_name as upload_name, \
				        fa_storage_key as storage_path, \
				        fa_size as size, \
				        fa_media_type as type, \
				        STR_TO_DATE(fa_timestamp, '%Y%m%d%H%i%s') as upload_timestamp, \
				        fa_archive_name as archived_name, \
				        STR_TO_DATE(fa_deleted_timestamp, '%Y%m%d%H%i%s') as deleted_timestamp, \
				        fa_sha1 as sha1 \
				   FROM filearchive"
			}
		}
	}

	/// The columns giving a strict order; the first one is also the column
	/// the title-range paging filters on.
	fn ordering(self) -> &'static [&'static str] {
		match self {
			Self::Image => &["img_name"],
			Self::OldImage => &["oi_name", "oi_archive_name"],
			Self::FileArchive => &["fa_name", "fa_storage_key"],
		}
	}
}

/// A recently-uploaded file as reported by the upstream log API, used to look
/// up the full production row.
#[derive(Debug, Clone)]
pub struct RecentUpload {
	pub title: String,
	/// base-36, as the log API reports it.
	pub sha1: Option<String>,
	pub upload_timestamp: Option<NaiveDateTime>,
}

/// Reader of the production media tables for one wiki.
pub struct ProductionCatalog {
	pool: MySqlPool,
	wiki: String,
	batchsize: usize,
}

impl ProductionCatalog {
	/// Connect to the production database holding the given wiki.
	pub async fn connect(config: &ProductionConfig, wiki: &str) -> Result<Self, ProductionError> {
		let mut options = MySqlConnectOptions::new()
			.host(&config.host)
			.port(config.port)
			.username(&config.user)
			.password(&config.password)
			.database(wiki);
		if let Some(socket) = &config.socket {
			options = options.socket(socket);
		}
		let pool = MySqlPoolOptions::new()
			.max_connections(2)
			.connect_with(options)
			.await
			.map_err(|source| ProductionError::Connect {
				wiki: wiki.to_owned(),
				host: config.host.clone(),
				source,
			})?;
		Ok(Self {
			pool,
			wiki: wiki.to_owned(),
			batchsize: config.batchsize.max(1),
		})
	}

	pub fn wiki(&self) -> &str {
		&self.wiki
	}

	pub async fn close(self) {
		self.pool.close().await;
	}

	/// The title-space boundaries used to page the scan of a large wiki.
	/// `None` leaves that side of a range open; small wikis get a single
	/// unbounded range.
	pub fn get_image_ranges(&self) -> Vec<Option<String>> {
		image_ranges(swift::is_big_wiki(&self.wiki))
	}

	/// One query per title range, covering the whole table in primary-key
	/// order without ever selecting more than one range's worth of rows.
	pub fn calculate_queries(&self, table: SourceTable) -> Vec<String> {
		build_queries(
			table.query(),
			table.ordering(),
			&self.get_image_ranges(),
		)
	}

	/// Scan one source table, yielding batches of at most `batchsize` records.
	pub fn scan(&self, table: SourceTable) -> FileScan<'_> {
		FileScan {
			catalog: self,
			queries: self.calculate_queries(table).into(),
			buffered: VecDeque::new(),
		}
	}

	/// Look up the full production rows for recently-uploaded files, by
	/// title, upload timestamp and (base-36) sha1.
	#[instrument(skip(self, uploads))]
	pub async fn query_files(
		&self,
		uploads: &[RecentUpload],
	) -> Result<Vec<FileRecord>, ProductionError> {
		let sql = format!(
			"{} WHERE img_name = ? AND img_timestamp = ? AND img_sha1 = ?",
			SourceTable::Image.query()
		);
		let mut files = Vec::new();
		for upload in uploads {
			let binds = vec![
				Some(upload.title.clone()),
				upload
					.upload_timestamp
					.map(|ts| ts.format(WIKI_DATE_FORMAT).to_string()),
				upload.sha1.clone(),
			];
			let rows = self.query_retry(&sql, &binds).await?;
			if rows.len() == 1 {
				info!(
					title = upload.title,
					"checking whether this file has to be inserted or updated in the backups"
				);
				files.push(self.process_row(&rows[0]));
			} else {
				warn!(
					title = upload.title,
					matches = rows.len(),
					"file was not found on the production database; is there lag or another issue?"
				);
			}
		}
		Ok(files)
	}

	/// Run a query, reconnecting and retrying once if it fails; a second
	/// failure escalates.
	async fn query_retry(
		&self,
		sql: &str,
		binds: &[Option<String>],
	) -> Result<Vec<MySqlRow>, ProductionError> {
		match self.fetch(sql, binds).await {
			Ok(rows) => Ok(rows),
			Err(err) => {
				warn!(?err, "a database error occurred while querying, retrying connection");
				self.fetch(sql, binds)
					.await
					.map_err(ProductionError::Query)
			}
		}
	}

	async fn fetch(&self, sql: &str, binds: &[Option<String>]) -> Result<Vec<MySqlRow>, sqlx::Error> {
		let mut query = sqlx::query(sql);
		for bind in binds {
			query = query.bind(bind.clone());
		}
		query.fetch_all(&self.pool).await
	}

	/// Decode one row of a source-table query into a [`FileRecord`],
	/// computing its production address on the way.
	fn process_row(&self, row: &MySqlRow) -> FileRecord {
		let upload_name = text_column(row, "upload_name");
		let status = text_column(row, "status")
			.as_deref()
			.and_then(FileStatus::parse)
			.unwrap_or(FileStatus::Public);
		let size = row.try_get::<Option<u64>, _>("size").unwrap_or(None);
		let file_type = text_column(row, "type");
		let upload_timestamp = row
			.try_get::<Option<NaiveDateTime>, _>("upload_timestamp")
			.unwrap_or(None);
		let deleted_timestamp = row
			.try_get::<Option<NaiveDateTime>, _>("deleted_timestamp")
			.unwrap_or(None);
		let sha1 = decode_sha1(&self.wiki, text_column(row, "sha1").as_deref());

		// deleted files may or may not have been previously archived; try
		// several sources for their original archival name
		let stored_path = text_column(row, "storage_path");
		let storage_name = match &stored_path {
			Some(path) if !path.is_empty() => {
				Some(path.rsplit('/').next().unwrap_or(path).to_owned())
			}
			_ => upload_name.clone(),
		};
		let archived_name = text_column(row, "archived_name");
		let archived_timestamp = recover_archived_timestamp(
			status,
			archived_name.as_deref(),
			storage_name.as_deref(),
		);

		let (storage_container, storage_path) = swift::name_to_swift(
			&self.wiki,
			status,
			upload_name.as_deref(),
			storage_name.as_deref(),
		);
		// double check the calculated name against the one on the database
		if let (Some(path), Some(name)) = (&storage_path, &storage_name) {
			if !path.ends_with(name.as_str()) {
				warn!(
					retrieved = name,
					calculated = path,
					"retrieved storage name and calculated one do not match"
				);
			}
		}

		let mut record = FileRecord::new(self.wiki.clone(), upload_name, status);
		if let Some(file_type) = file_type {
			record.file_type = file_type;
		}
		record.size = size;
		record.upload_timestamp = upload_timestamp;
		record.deleted_timestamp = deleted_timestamp;
		record.archived_timestamp = archived_timestamp;
		record.sha1 = sha1;
		record.storage_container = storage_container;
		record.storage_path = storage_path;
		record
	}
}

/// Batched pull iterator over one source table. Not restartable; batches
/// never span two range queries.
pub struct FileScan<'a> {
	catalog: &'a ProductionCatalog,
	queries: VecDeque<String>,
	buffered: VecDeque<FileRecord>,
}

impl FileScan<'_> {
	/// The next batch of up to `batchsize` records, or `None` at the end of
	/// the table.
	pub async fn next_batch(&mut self) -> Result<Option<Vec<FileRecord>>, ProductionError> {
		loop {
			if !self.buffered.is_empty() {
				let take = self.buffered.len().min(self.catalog.batchsize);
				return Ok(Some(self.buffered.drain(..take).collect()));
			}
			let Some(query) = self.queries.pop_front() else {
				return Ok(None);
			};
			debug!(query, "scanning next title range");
			let rows = self.catalog.query_retry(&query, &[]).await?;
			self.buffered
				.extend(rows.iter().map(|row| self.catalog.process_row(row)));
		}
	}
}

fn text_column(row: &MySqlRow, column: &str) -> Option<String> {
	row.try_get::<Option<Vec<u8>>, _>(column)
		.ok()
		.flatten()
		.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_sha1(wiki: &str, raw: Option<&str>) -> Option<String> {
	let raw = raw.filter(|s| !s.is_empty())?;
	let converted = base36_to_base16(raw);
	if converted.is_none() {
		warn!(wiki, sha1 = raw, "row carries an undecodable base-36 sha1");
	}
	converted
}

/// Archived timestamps are recovered from the `archive_name` column when it is
/// usable, falling back to the leading `YYYYMMDDHHMMSS!` segment of the stored
/// name, and to nothing at all for rows where neither exists.
fn recover_archived_timestamp(
	status: FileStatus,
	archived_name: Option<&str>,
	storage_name: Option<&str>,
) -> Option<NaiveDateTime> {
	if status == FileStatus::Public {
		return None;
	}
	match archived_name {
		None => {
			let name = storage_name.filter(|n| !n.is_empty() && n.contains('!'))?;
			Some(wiki_date_to_datetime(name.split('!').next().unwrap_or("")))
		}
		Some(archived) => {
			let date = if archived.is_empty() || !archived.contains('!') {
				"19700101000001"
			} else {
				archived.split('!').next().unwrap_or("")
			};
			Some(wiki_date_to_datetime(date))
		}
	}
}

fn image_ranges(big_wiki: bool) -> Vec<Option<String>> {
	if !big_wiki {
		return vec![None, None];
	}
	let mut ranges: Vec<Option<String>> = vec![None];
	ranges.extend(
		[
			"0", "05", "1", "15", "19", "20", "2013", "2016", "2018", "2019", "2020", "3", "4",
			"5", "6", "7", "8", "9",
		]
		.into_iter()
		.map(|r| Some(r.to_owned())),
	);
	ranges.extend(
		iproduct!('A'..='Z', "0chmqt".chars())
			.map(|(first, second)| Some(format!("{first}{second}"))),
	);
	ranges.extend(
		["^", "В", "Л", "С", "Ե", "儀"]
			.into_iter()
			.map(|r| Some(r.to_owned())),
	);
	ranges.push(None);
	ranges
}

/// Expand a base query into one `[lower, upper)` filtered query per range,
/// each strictly ordered. `None` bounds are left open, so a `[None, None]`
/// range list produces a single unbounded query.
fn build_queries(base: &str, ordering: &[&str], ranges: &[Option<String>]) -> Vec<String> {
	let paging_col = ordering.first().copied().unwrap_or_default();
	let order_by = format!(
		" ORDER BY {}",
		ordering
			.iter()
			.map(|col| format!("`{col}`"))
			.collect::<Vec<_>>()
			.join(", ")
	);
	ranges
		.windows(2)
		.map(|bounds| {
			let mut query = format!("{base} WHERE 1=1");
			if let Some(lower) = &bounds[0] {
				query.push_str(&format!(" AND `{paging_col}` >= '{lower}'"));
			}
			if let Some(upper) = &bounds[1] {
				query.push_str(&format!(" AND `{paging_col}` < '{upper}'"));
			}
			query.push_str(&order_by);
			query
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn small_wikis_scan_in_one_range() {
		assert_eq!(image_ranges(false), vec![None, None]);
	}

	#[test]
	fn big_wikis_page_over_the_title_space() {
		let ranges = image_ranges(true);
		assert_eq!(ranges.len(), 182);
		assert_eq!(ranges[0], None);
		assert_eq!(ranges[1].as_deref(), Some("0"));
		assert_eq!(ranges[2].as_deref(), Some("05"));
		assert!(ranges.contains(&Some("2020".into())));
		assert!(ranges.contains(&Some("^".into())));
		assert_eq!(ranges[ranges.len() - 2].as_deref(), Some("儀"));
		assert_eq!(ranges[ranges.len() - 1], None);
		// every A-Z boundary is paired with one of the fixed second characters
		for range in ranges.iter().flatten() {
			let mut chars = range.chars();
			if let Some(first) = chars.next() {
				if first.is_ascii_uppercase() {
					let second = chars.next().unwrap();
					assert!("0chmqt".contains(second), "{range}");
				}
			}
		}
	}

	#[test]
	fn unbounded_ranges_build_a_single_query() {
		let queries = build_queries("SELECT 1 FROM my_table", &["my_column"], &[None, None]);
		assert_eq!(
			queries,
			vec!["SELECT 1 FROM my_table WHERE 1=1 ORDER BY `my_column`"]
		);
	}

	#[test]
	fn bounded_ranges_filter_on_the_paging_column() {
		let ranges = vec![None, Some("A".to_owned()), Some("M".to_owned()), None];
		let queries = build_queries("SELECT 1 FROM my_table", &["name", "archive"], &ranges);
		assert_eq!(
			queries,
			vec![
				"SELECT 1 FROM my_table WHERE 1=1 AND `name` < 'A' ORDER BY `name`, `archive`",
				"SELECT 1 FROM my_table WHERE 1=1 AND `name` >= 'A' AND `name` < 'M' \
				 ORDER BY `name`, `archive`",
				"SELECT 1 FROM my_table WHERE 1=1 AND `name` >= 'M' ORDER BY `name`, `archive`",
			]
		);
	}

	#[test]
	fn archived_timestamps_recover_from_either_name() {
		let expected = wiki_date_to_datetime("20221130132556");

		// public rows never carry one
		assert_eq!(
			recover_archived_timestamp(
				FileStatus::Public,
				Some("20221130132556!Test.jpg"),
				Some("20221130132556!Test.jpg"),
			),
			None
		);

		// usual case: the archive name leads with the timestamp
		assert_eq!(
			recover_archived_timestamp(
				FileStatus::Archived,
				Some("20221130132556!Test.jpg"),
				Some("whatever"),
			),
			Some(expected)
		);

		// no archive name: fall back to the stored name
		assert_eq!(
			recover_archived_timestamp(
				FileStatus::Deleted,
				None,
				Some("20221130132556!Test.jpg"),
			),
			Some(expected)
		);

		// malformed archive name: epoch marker
		assert_eq!(
			recover_archived_timestamp(FileStatus::Archived, Some("garbage"), Some("x")),
			Some(wiki_date_to_datetime("19700101000001"))
		);

		// nothing usable at all
		assert_eq!(
			recover_archived_timestamp(FileStatus::Deleted, None, Some("no-marker.jpg")),
			None
		);
	}
}
