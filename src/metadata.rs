use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use sqlx::{
	mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow},
	query::Query,
	MySql, Row,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
	config::MetadataConfig,
	file::{BackupStatus, FileRecord, FileStatus, RowDecodeError},
};

pub mod search;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum MetadataError {
	#[error("could not connect to the metadata database on {host}")]
	Connect {
		host: String,
		#[source]
		source: sqlx::Error,
	},
	#[error("query against the metadata database failed after reconnecting")]
	Query(#[source] sqlx::Error),
	#[error("normalized table '{0}' is empty or could not be loaded")]
	DictionaryLoad(&'static str),
	#[error(transparent)]
	Decode(#[from] RowDecodeError),
	#[error("'{name}' is not present in the '{table}' dictionary")]
	UnknownName { table: &'static str, name: String },
	#[error("{context}: expected {expected} affected row(s), got {affected}")]
	SchemaMismatch {
		context: &'static str,
		expected: u64,
		affected: u64,
	},
}

/// Bi-directional name/id map for one of the small normalized tables.
#[derive(Debug, Clone, Default)]
pub struct NameMap {
	by_name: HashMap<String, i64>,
	by_id: HashMap<i64, String>,
}

impl NameMap {
	pub fn from_pairs(pairs: impl IntoIterator<Item = (String, i64)>) -> Self {
		let mut map = Self::default();
		for (name, id) in pairs {
			map.by_id.insert(id, name.clone());
			map.by_name.insert(name, id);
		}
		map
	}

	pub fn id(&self, name: &str) -> Option<i64> {
		self.by_name.get(name).copied()
	}

	pub fn name(&self, id: i64) -> Option<&str> {
		self.by_id.get(&id).map(String::as_str)
	}

	pub fn is_empty(&self) -> bool {
		self.by_name.is_empty()
	}
}

/// The normalized dictionaries, loaded fresh per operation so they stay
/// consistent with schema changes without restarts; they are passed down the
/// call chain rather than cached globally.
#[derive(Debug, Clone)]
pub struct ForeignKeys {
	pub wikis: NameMap,
	pub file_types: NameMap,
	pub file_status: NameMap,
	pub storage_containers: NameMap,
	pub backup_status: NameMap,
}

impl ForeignKeys {
	pub fn wiki_id(&self, wiki: &str) -> Result<i64, MetadataError> {
		self.wikis.id(wiki).ok_or_else(|| MetadataError::UnknownName {
			table: "wikis",
			name: wiki.to_owned(),
		})
	}

	pub fn file_status_id(&self, status: FileStatus) -> Result<i64, MetadataError> {
		self.file_status
			.id(status.as_str())
			.ok_or_else(|| MetadataError::UnknownName {
				table: "file_status",
				name: status.as_str().to_owned(),
			})
	}

	pub fn backup_status_id(&self, status: BackupStatus) -> Result<i64, MetadataError> {
		self.backup_status
			.id(status.as_str())
			.ok_or_else(|| MetadataError::UnknownName {
				table: "backup_status",
				name: status.as_str().to_owned(),
			})
	}
}

/// One parameter of a dynamically-built statement.
#[derive(Debug, Clone)]
pub enum SqlValue {
	Text(Option<String>),
	Int(Option<i64>),
	Uint(Option<u64>),
	Time(Option<NaiveDateTime>),
}

fn bind_values<'q>(
	query: Query<'q, MySql, MySqlArguments>,
	values: &[SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
	let mut query = query;
	for value in values {
		query = match value {
			SqlValue::Text(v) => query.bind(v.clone()),
			SqlValue::Int(v) => query.bind(*v),
			SqlValue::Uint(v) => query.bind(*v),
			SqlValue::Time(v) => query.bind(*v),
		};
	}
	query
}

/// The terminal outcome of one file's backup attempt, applied by
/// [`MetadataStore::update_status`].
#[derive(Debug, Clone)]
pub struct StatusUpdate {
	pub id: i64,
	pub file: FileRecord,
	pub status: BackupStatus,
	/// 1-based backup endpoint id; only meaningful for the backedup
	/// transition.
	pub location: Option<i64>,
}

/// The internal backup metadata database: the `files` workflow table, the
/// `backups` ledger and the `file_history` audit trail.
pub struct MetadataStore {
	pool: MySqlPool,
	batchsize: usize,
}

impl MetadataStore {
	pub async fn connect(config: &MetadataConfig) -> Result<Self, MetadataError> {
		let mut options = MySqlConnectOptions::new()
			.host(&config.host)
			.port(config.port)
			.username(&config.user)
			.password(&config.password)
			.database(&config.database);
		if let Some(socket) = &config.socket {
			options = options.socket(socket);
		}
		let pool = MySqlPoolOptions::new()
			.max_connections(2)
			.connect_with(options)
			.await
			.map_err(|source| MetadataError::Connect {
				host: config.host.clone(),
				source,
			})?;
		Ok(Self {
			pool,
			batchsize: config.batchsize.max(1),
		})
	}

	pub async fn close(self) {
		self.pool.close().await;
	}

	/// Run a query, retrying once if it fails; a second failure escalates.
	async fn query_rows(
		&self,
		sql: &str,
		values: &[SqlValue],
	) -> Result<Vec<MySqlRow>, MetadataError> {
		debug!(sql, "executing query");
		match bind_values(sqlx::query(sql), values).fetch_all(&self.pool).await {
			Ok(rows) => Ok(rows),
			Err(err) => {
				warn!(?err, "a database error occurred while executing a query, retrying");
				bind_values(sqlx::query(sql), values)
					.fetch_all(&self.pool)
					.await
					.map_err(MetadataError::Query)
			}
		}
	}

	/// Run a statement, retrying once if it fails; returns the affected row
	/// count.
	async fn execute(&self, sql: &str, values: &[SqlValue]) -> Result<u64, MetadataError> {
		debug!(sql, "executing statement");
		match bind_values(sqlx::query(sql), values).execute(&self.pool).await {
			Ok(result) => Ok(result.rows_affected()),
			Err(err) => {
				warn!(?err, "a database error occurred while executing a statement, retrying");
				bind_values(sqlx::query(sql), values)
					.execute(&self.pool)
					.await
					.map(|result| result.rows_affected())
					.map_err(MetadataError::Query)
			}
		}
	}

	async fn read_dictionary(
		&self,
		table: &'static str,
		sql: &str,
	) -> Result<NameMap, MetadataError> {
		let rows = self
			.query_rows(sql, &[])
			.await
			.map_err(|_| MetadataError::DictionaryLoad(table))?;
		if rows.is_empty() {
			return Err(MetadataError::DictionaryLoad(table));
		}
		let mut pairs = Vec::with_capacity(rows.len());
		for row in &rows {
			let name = crate::file::get_text(row, "name")?
				.ok_or(MetadataError::DictionaryLoad(table))?;
			let id = row
				.try_get::<i64, _>("id")
				.map_err(|err| RowDecodeError::Column("id", err))?;
			pairs.push((name, id));
		}
		Ok(NameMap::from_pairs(pairs))
	}

	/// Load the five normalized tables into bi-directional maps.
	#[instrument(skip(self))]
	pub async fn load_fks(&self) -> Result<ForeignKeys, MetadataError> {
		info!("reading foreign key values for the files table from the database");
		Ok(ForeignKeys {
			wikis: self
				.read_dictionary("wikis", "SELECT wiki_name as name, id FROM wikis")
				.await?,
			file_types: self
				.read_dictionary("file_types", "SELECT type_name as name, id FROM file_types")
				.await?,
			file_status: self
				.read_dictionary("file_status", "SELECT status_name as name, id FROM file_status")
				.await?,
			storage_containers: self
				.read_dictionary(
					"storage_containers",
					"SELECT storage_container_name as name, id FROM storage_containers",
				)
				.await?,
			backup_status: self
				.read_dictionary(
					"backup_status",
					"SELECT backup_status_name as name, id FROM backup_status",
				)
				.await?,
		})
	}

	fn insert_values(fks: &ForeignKeys, file: &FileRecord) -> Result<Vec<SqlValue>, MetadataError> {
		let file_type = fks
			.file_types
			.id(&file.file_type)
			.ok_or_else(|| MetadataError::UnknownName {
				table: "file_types",
				name: file.file_type.clone(),
			})?;
		Ok(vec![
			SqlValue::Time(file.archived_timestamp),
			SqlValue::Time(file.deleted_timestamp),
			SqlValue::Int(Some(file_type)),
			SqlValue::Text(file.md5.clone()),
			SqlValue::Text(file.sha1.clone()),
			SqlValue::Uint(file.size),
			SqlValue::Int(Some(fks.file_status_id(file.status)?)),
			SqlValue::Int(
				file.storage_container
					.as_deref()
					.and_then(|c| fks.storage_containers.id(c)),
			),
			SqlValue::Text(file.storage_path.clone()),
			SqlValue::Text(file.upload_name.clone()),
			SqlValue::Time(file.upload_timestamp),
			SqlValue::Int(Some(fks.wiki_id(&file.wiki)?)),
		])
	}

	/// Insert new rows for the given records, in a single multi-row
	/// statement; new rows start out `pending`.
	#[instrument(skip_all, fields(files = files.len()))]
	pub async fn add(&self, fks: &ForeignKeys, files: &[FileRecord]) -> Result<u64, MetadataError> {
		if files.is_empty() {
			warn!("zero files to add, doing nothing");
			return Ok(0);
		}
		let placeholders = format!("({})", vec!["?"; FileRecord::FIELDS.len()].join(", "));
		let sql = format!(
			"INSERT INTO files ({}) VALUES {}",
			FileRecord::FIELDS.join(", "),
			vec![placeholders.as_str(); files.len()].join(", "),
		);
		let mut values = Vec::with_capacity(files.len() * FileRecord::FIELDS.len());
		for file in files {
			values.extend(Self::insert_values(fks, file)?);
		}
		info!(count = files.len(), "about to insert files");
		let affected = self.execute(&sql, &values).await?;
		if affected != files.len() as u64 {
			return Err(MetadataError::SchemaMismatch {
				context: "multi-row insert into files",
				expected: files.len() as u64,
				affected,
			});
		}
		info!(count = affected, "files were inserted correctly");
		Ok(affected)
	}

	/// Update the live rows for the given `{id: record}` map. The previous
	/// row contents are first copied verbatim to `file_history`, in the same
	/// transaction as the in-place update. A row whose storage address
	/// changed while its backup had errored is re-armed to `pending`.
	///
	/// Returns the number of rows successfully updated.
	#[instrument(skip_all, fields(files = files.len()))]
	pub async fn update(
		&self,
		fks: &ForeignKeys,
		files: &BTreeMap<i64, FileRecord>,
	) -> Result<u64, MetadataError> {
		if files.is_empty() {
			warn!("zero files to update, doing nothing");
			return Ok(0);
		}
		let pending = fks.backup_status_id(BackupStatus::Pending)?;
		let fields = FileRecord::FIELDS.join(", ");
		let mut success = 0;
		for (&file_id, file) in files {
			let mut tx = self.pool.begin().await.map_err(MetadataError::Query)?;

			let select = "SELECT storage_container, storage_path, backup_status \
			              FROM files WHERE id = ?";
			let rows = sqlx::query(select)
				.bind(file_id)
				.fetch_all(&mut *tx)
				.await
				.map_err(MetadataError::Query)?;
			if rows.len() != 1 {
				warn!(%file, file_id, "file not found on the list of files");
				continue;
			}
			let row = &rows[0];
			let old_container = crate::file::get_id(row, "storage_container")?
				.and_then(|id| fks.storage_containers.name(id))
				.map(str::to_owned);
			let old_path = crate::file::get_text(row, "storage_path")?;
			let old_backup_status = crate::file::get_id(row, "backup_status")?
				.and_then(|id| fks.backup_status.name(id))
				.and_then(BackupStatus::parse);

			let history = format!(
				"INSERT INTO file_history (file_id, {fields}) \
				 SELECT id, {fields} FROM files WHERE id = ?"
			);
			let copied = sqlx::query(&history)
				.bind(file_id)
				.execute(&mut *tx)
				.await
				.map_err(MetadataError::Query)?
				.rows_affected();
			if copied != 1 {
				warn!(%file, file_id, "file could not be copied to the file_history table");
				continue;
			}

			let rearm = needs_rearm(
				old_container.as_deref(),
				old_path.as_deref(),
				old_backup_status,
				file,
			);
			let mut update = "UPDATE files \
			                  SET upload_name = ?, \
			                      file_type = ?, \
			                      status = ?, \
			                      deleted_timestamp = ?, \
			                      archived_timestamp = ?, \
			                      storage_container = ?, \
			                      storage_path = ?"
				.to_owned();
			let mut values = vec![
				SqlValue::Text(file.upload_name.clone()),
				SqlValue::Int(fks.file_types.id(&file.file_type)),
				SqlValue::Int(fks.file_status.id(file.status.as_str())),
				SqlValue::Time(file.deleted_timestamp),
				SqlValue::Time(file.archived_timestamp),
				SqlValue::Int(
					file.storage_container
						.as_deref()
						.and_then(|c| fks.storage_containers.id(c)),
				),
				SqlValue::Text(file.storage_path.clone()),
			];
			if rearm {
				update.push_str(", backup_status = ?");
				values.push(SqlValue::Int(Some(pending)));
			}
			update.push_str(" WHERE id = ?");
			values.push(SqlValue::Int(Some(file_id)));

			let affected = bind_values(sqlx::query(&update), &values)
				.execute(&mut *tx)
				.await
				.map_err(MetadataError::Query)?
				.rows_affected();
			if affected != 1 {
				warn!(%file, file_id, "file could not be updated on the files table");
				continue;
			}

			tx.commit().await.map_err(MetadataError::Query)?;
			info!(%file, "file was updated correctly and its old metadata moved to history");
			success += 1;
		}
		Ok(success)
	}

	/// Reconcile a freshly-discovered batch against the live rows of a wiki:
	/// unknown records are inserted, changed ones are history-copied and
	/// updated in place, unchanged ones are left alone. Ambiguous matches are
	/// skipped with an error. Returns updated + inserted.
	#[instrument(skip_all, fields(wiki, files = files.len()))]
	pub async fn check_and_update(
		&self,
		fks: &ForeignKeys,
		wiki: &str,
		files: &[FileRecord],
	) -> Result<u64, MetadataError> {
		if files.is_empty() {
			warn!("zero files to check, doing nothing");
			return Ok(0);
		}
		let sha1list: Vec<String> = files.iter().filter_map(|f| f.sha1.clone()).collect();
		let mut matches: HashMap<String, Vec<(i64, FileRecord)>> = HashMap::new();
		if !sha1list.is_empty() {
			let sql = format!(
				"SELECT id, {} FROM files \
				 WHERE wiki = ? AND sha1 IS NOT NULL AND sha1 IN ({})",
				FileRecord::FIELDS.join(", "),
				vec!["?"; sha1list.len()].join(", "),
			);
			let mut values = vec![SqlValue::Int(Some(fks.wiki_id(wiki)?))];
			values.extend(sha1list.into_iter().map(|s| SqlValue::Text(Some(s))));
			let rows = self.query_rows(&sql, &values).await?;
			for row in &rows {
				let id = row
					.try_get::<i64, _>("id")
					.map_err(|err| RowDecodeError::Column("id", err))?;
				let existing = FileRecord::from_row(row, fks)?;
				if let Some(sha1) = existing.sha1.clone() {
					matches.entry(sha1).or_default().push((id, existing));
				}
			}
		}

		let plan = plan_reconciliation(files, &matches);
		info!(count = plan.to_add.len(), "new files found on this batch");
		info!(count = plan.to_update.len(), "files that need an update on this batch");
		Ok(self.update(fks, &plan.to_update).await? + self.add(fks, &plan.to_add).await?)
	}

	/// Claim the next batch of `pending` rows: select them with row locks in
	/// id order, flip them to `processing`, commit to release the locks, and
	/// return them keyed by row id. `None` once no pending rows remain.
	#[instrument(skip_all)]
	pub async fn next_pending_batch(
		&self,
		fks: &ForeignKeys,
	) -> Result<Option<BTreeMap<i64, FileRecord>>, MetadataError> {
		let pending = fks.backup_status_id(BackupStatus::Pending)?;
		let processing = fks.backup_status_id(BackupStatus::Processing)?;

		let mut tx = self.pool.begin().await.map_err(MetadataError::Query)?;
		let select = format!(
			"SELECT id, {} FROM files \
			 WHERE backup_status = ? \
			 ORDER BY id ASC LIMIT {} FOR UPDATE",
			FileRecord::FIELDS.join(", "),
			self.batchsize,
		);
		let rows = sqlx::query(&select)
			.bind(pending)
			.fetch_all(&mut *tx)
			.await
			.map_err(MetadataError::Query)?;
		if rows.is_empty() {
			return Ok(None);
		}

		let mut batch = BTreeMap::new();
		for row in &rows {
			let id = row
				.try_get::<i64, _>("id")
				.map_err(|err| RowDecodeError::Column("id", err))?;
			batch.insert(id, FileRecord::from_row(row, fks)?);
		}

		let ids = batch
			.keys()
			.map(i64::to_string)
			.collect::<Vec<_>>()
			.join(", ");
		let update = format!("UPDATE files SET backup_status = ? WHERE id IN ({ids})");
		let affected = sqlx::query(&update)
			.bind(processing)
			.execute(&mut *tx)
			.await
			.map_err(MetadataError::Query)?
			.rows_affected();
		if affected != batch.len() as u64 {
			return Err(MetadataError::SchemaMismatch {
				context: "claiming pending files",
				expected: batch.len() as u64,
				affected,
			});
		}
		tx.commit().await.map_err(MetadataError::Query)?;
		Ok(Some(batch))
	}

	/// Apply the terminal state of each processed file, and record successful
	/// backups on the `backups` ledger. A ledger insert colliding with an
	/// already-recorded `(wiki, sha256)` is logged and swallowed; other
	/// insert failures count the file as unsuccessful without aborting the
	/// batch. Returns the number of fully-recorded entries.
	#[instrument(skip_all, fields(entries = entries.len()))]
	pub async fn update_status(
		&self,
		fks: &ForeignKeys,
		entries: &[StatusUpdate],
	) -> Result<usize, MetadataError> {
		let mut success = 0;
		for entry in entries {
			let status = fks.backup_status_id(entry.status)?;
			let affected = self
				.execute(
					"UPDATE files SET backup_status = ? WHERE id = ?",
					&[SqlValue::Int(Some(status)), SqlValue::Int(Some(entry.id))],
				)
				.await?;
			if affected != 1 {
				return Err(MetadataError::SchemaMismatch {
					context: "updating a file's backup status",
					expected: 1,
					affected,
				});
			}
			if entry.status == BackupStatus::Backedup {
				let file = &entry.file;
				let values = [
					SqlValue::Int(entry.location),
					SqlValue::Int(Some(fks.wiki_id(&file.wiki)?)),
					SqlValue::Text(file.sha256.clone()),
					SqlValue::Text(file.sha1.clone()),
				];
				let insert = "INSERT INTO backups (location, wiki, sha256, sha1) \
				              VALUES (?, ?, ?, ?)";
				match bind_values(sqlx::query(insert), &values)
					.execute(&self.pool)
					.await
				{
					Ok(_) => {}
					Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
						warn!(
							sha256 = file.sha256.as_deref().unwrap_or(""),
							"a file with the same sha256 was already uploaded to the same wiki"
						);
					}
					Err(err) => {
						warn!(%file, file_id = entry.id, ?err, "could not record the backup on the ledger");
						continue;
					}
				}
			}
			success += 1;
		}
		Ok(success)
	}

	/// Wikis that are private, closed or deleted, which get their backups
	/// encrypted. Closed and deleted wikis are included as it is unclear
	/// whether their contents were meant to stay private.
	pub async fn get_non_public_wikis(&self) -> Result<Vec<String>, MetadataError> {
		let rows = self
			.query_rows(
				"SELECT wiki_name FROM wikis \
				 JOIN wiki_types ON wikis.type = wiki_types.id \
				 WHERE type_name <> 'public' ORDER BY wiki_name",
				&[],
			)
			.await?;
		let mut wikis = Vec::with_capacity(rows.len());
		for row in &rows {
			if let Some(name) = crate::file::get_text(row, "wiki_name")? {
				wikis.push(name);
			}
		}
		Ok(wikis)
	}

	pub async fn is_valid_wiki(&self, wiki: &str) -> Result<bool, MetadataError> {
		let rows = self
			.query_rows(
				"SELECT 1 FROM wikis WHERE wiki_name = ?",
				&[SqlValue::Text(Some(wiki.to_owned()))],
			)
			.await?;
		Ok(rows.len() == 1)
	}

	/// The watermark for incremental discovery: the latest `upload_timestamp`
	/// among the wiki's public rows.
	pub async fn get_latest_upload_time(
		&self,
		fks: &ForeignKeys,
		wiki: &str,
	) -> Result<Option<NaiveDateTime>, MetadataError> {
		let rows = self
			.query_rows(
				"SELECT max(upload_timestamp) AS upload_timestamp \
				 FROM files WHERE wiki = ? AND status = ?",
				&[
					SqlValue::Int(Some(fks.wiki_id(wiki)?)),
					SqlValue::Int(Some(fks.file_status_id(FileStatus::Public)?)),
				],
			)
			.await?;
		if rows.len() != 1 {
			warn!(wiki, "failed to query the latest upload time");
			return Ok(None);
		}
		let latest = crate::file::get_time(&rows[0], "upload_timestamp")?;
		info!(wiki, ?latest, "latest upload time of a public file");
		Ok(latest)
	}

	/// After a physical deletion: remove the ledger rows and mark the file
	/// rows `hard-deleted`. In dry-run both statements become existence
	/// probes. Returns the number of errors encountered (each file can
	/// contribute up to two).
	#[instrument(skip_all, fields(files = files.len(), dry_run))]
	pub async fn mark_as_deleted(
		&self,
		fks: &ForeignKeys,
		files: &[search::BackupSearchRow],
		dry_run: bool,
	) -> Result<usize, MetadataError> {
		let hard_deleted = fks.file_status_id(FileStatus::HardDeleted)?;
		let mut errors = 0;
		for file in files {
			let wiki_id = fks.wiki_id(&file.wiki)?;
			let backup_values = [
				SqlValue::Int(Some(wiki_id)),
				SqlValue::Text(Some(file.sha256.clone())),
			];
			let ok = if dry_run {
				let rows = self
					.query_rows(
						"SELECT 1 FROM backups WHERE wiki = ? AND sha256 = ?",
						&backup_values,
					)
					.await?;
				rows.len() == 1
			} else {
				self.execute(
					"DELETE FROM backups WHERE wiki = ? AND sha256 = ?",
					&backup_values,
				)
				.await? == 1
			};
			if !ok {
				warn!(
					wiki = file.wiki,
					sha256 = file.sha256,
					"failed to be deleted from the backups metadata"
				);
				errors += 1;
			}

			let file_values = [
				SqlValue::Int(Some(hard_deleted)),
				SqlValue::Int(file.file_id),
			];
			let ok = if dry_run {
				let rows = self
					.query_rows(
						"SELECT 1 FROM files WHERE id = ?",
						&[SqlValue::Int(file.file_id)],
					)
					.await?;
				rows.len() == 1
			} else {
				self.execute("UPDATE files SET status = ? WHERE id = ?", &file_values)
					.await? == 1
			};
			if !ok {
				warn!(file_id = ?file.file_id, "failed to update the file metadata");
				errors += 1;
			}
		}
		if errors > 0 {
			warn!(errors, "error(s) found while trying to update metadata");
		} else if dry_run {
			warn!("metadata update completed correctly, but the database was not actually touched: dry run");
		} else {
			info!("metadata update completed correctly, no database errors");
		}
		Ok(errors)
	}
}

/// A changed storage address alone must not re-arm (that would discard the
/// provenance of already-successful backups), and a prior error alone must
/// not either (that would loop on truly broken files): both are required.
fn needs_rearm(
	old_container: Option<&str>,
	old_path: Option<&str>,
	old_backup_status: Option<BackupStatus>,
	new: &FileRecord,
) -> bool {
	let address_changed = old_container != new.storage_container.as_deref()
		|| old_path != new.storage_path.as_deref();
	address_changed && old_backup_status == Some(BackupStatus::Error)
}

struct ReconciliationPlan {
	to_add: Vec<FileRecord>,
	to_update: BTreeMap<i64, FileRecord>,
}

/// Decide, for each incoming record, whether it is new, a change to exactly
/// one known row, unchanged, or ambiguous.
fn plan_reconciliation(
	files: &[FileRecord],
	matches: &HashMap<String, Vec<(i64, FileRecord)>>,
) -> ReconciliationPlan {
	let mut plan = ReconciliationPlan {
		to_add: Vec::new(),
		to_update: BTreeMap::new(),
	};
	for file in files {
		let Some(sha1) = file.sha1.as_deref() else {
			plan.to_add.push(file.clone());
			continue;
		};
		let Some(candidates) = matches.get(sha1) else {
			plan.to_add.push(file.clone());
			continue;
		};
		let found: Vec<_> = candidates
			.iter()
			.filter(|(_, m)| {
				m.sha1.as_deref() == Some(sha1)
					&& m.size == file.size
					&& file.upload_timestamp.is_some()
					&& m.upload_timestamp == file.upload_timestamp
			})
			.collect();
		match found.as_slice() {
			[] => {
				warn!(%file, "sha1 hash is on the database, but no matching record found");
				plan.to_add.push(file.clone());
			}
			[(id, existing)] => {
				if existing.status != file.status
					|| existing.upload_name != file.upload_name
					|| existing.file_type != file.file_type
					|| existing.archived_timestamp != file.archived_timestamp
					|| existing.deleted_timestamp != file.deleted_timestamp
					|| existing.storage_container != file.storage_container
					|| existing.storage_path != file.storage_path
				{
					info!(%file, id, "scheduling update");
					plan.to_update.insert(*id, file.clone());
				} else {
					debug!(%file, "file is unchanged, not doing anything");
				}
			}
			many => {
				warn!(
					%file,
					matches = many.len(),
					"several possible matches were found, not updating it"
				);
			}
		}
	}
	plan
}

#[cfg(test)]
mod tests {
	use chrono::NaiveDate;

	use super::*;

	fn record(sha1: &str) -> FileRecord {
		let mut file = FileRecord::new("testwiki", Some("Test.jpg".into()), FileStatus::Public);
		file.sha1 = Some(sha1.into());
		file.size = Some(12);
		file.upload_timestamp = NaiveDate::from_ymd_opt(2022, 11, 30)
			.unwrap()
			.and_hms_opt(11, 25, 56);
		file.file_type = "BITMAP".into();
		file.storage_container = Some("wikipedia-test-local-public".into());
		file.storage_path = Some("a/ac/Test.jpg".into());
		file
	}

	#[test]
	fn name_maps_look_up_both_ways() {
		let map = NameMap::from_pairs([("commonswiki".to_owned(), 1), ("testwiki".to_owned(), 2)]);
		assert_eq!(map.id("testwiki"), Some(2));
		assert_eq!(map.name(1), Some("commonswiki"));
		assert_eq!(map.id("nowiki"), None);
		assert_eq!(map.name(3), None);
	}

	#[test]
	fn rearm_needs_both_address_change_and_prior_error() {
		let new = record("aa");

		// address changed, but the backup had not errored
		assert!(!needs_rearm(
			Some("wikipedia-test-local-public"),
			Some("a/ab/Old.jpg"),
			Some(BackupStatus::Backedup),
			&new,
		));

		// errored, but the address is unchanged
		assert!(!needs_rearm(
			Some("wikipedia-test-local-public"),
			Some("a/ac/Test.jpg"),
			Some(BackupStatus::Error),
			&new,
		));

		// both: re-arm
		assert!(needs_rearm(
			Some("wikipedia-test-local-public"),
			Some("a/ab/Old.jpg"),
			Some(BackupStatus::Error),
			&new,
		));
	}

	#[test]
	fn unchanged_records_are_left_alone() {
		let file = record("aa");
		let mut matches = HashMap::new();
		matches.insert("aa".to_owned(), vec![(7, file.clone())]);
		let plan = plan_reconciliation(&[file], &matches);
		assert!(plan.to_add.is_empty());
		assert!(plan.to_update.is_empty());
	}

	#[test]
	fn changed_records_are_scheduled_for_update() {
		let mut incoming = record("aa");
		incoming.status = FileStatus::Archived;
		incoming.storage_path = Some("archive/a/ac/20221201000000!Test.jpg".into());
		let mut matches = HashMap::new();
		matches.insert("aa".to_owned(), vec![(7, record("aa"))]);
		let plan = plan_reconciliation(&[incoming.clone()], &matches);
		assert!(plan.to_add.is_empty());
		assert_eq!(plan.to_update.get(&7), Some(&incoming));
	}

	#[test]
	fn unknown_records_are_inserted() {
		// sha1 not in the database at all
		let plan = plan_reconciliation(&[record("bb")], &HashMap::new());
		assert_eq!(plan.to_add.len(), 1);

		// no sha1 recorded
		let mut no_hash = record("aa");
		no_hash.sha1 = None;
		let plan = plan_reconciliation(&[no_hash], &HashMap::new());
		assert_eq!(plan.to_add.len(), 1);

		// sha1 known but no candidate matches the identity tuple
		let mut other_size = record("aa");
		other_size.size = Some(99);
		let mut matches = HashMap::new();
		matches.insert("aa".to_owned(), vec![(7, record("aa"))]);
		let plan = plan_reconciliation(&[other_size], &matches);
		assert_eq!(plan.to_add.len(), 1);
		assert!(plan.to_update.is_empty());
	}

	#[test]
	fn ambiguous_matches_are_skipped() {
		let mut changed = record("aa");
		changed.upload_name = Some("Renamed.jpg".into());
		let mut matches = HashMap::new();
		matches.insert("aa".to_owned(), vec![(7, record("aa")), (8, record("aa"))]);
		let plan = plan_reconciliation(&[changed], &matches);
		assert!(plan.to_add.is_empty());
		assert!(plan.to_update.is_empty());
	}

	#[test]
	fn records_without_upload_time_never_match() {
		let mut incoming = record("aa");
		incoming.upload_timestamp = None;
		let mut existing = record("aa");
		existing.upload_timestamp = None;
		let mut matches = HashMap::new();
		matches.insert("aa".to_owned(), vec![(7, existing)]);
		let plan = plan_reconciliation(&[incoming], &matches);
		// an absent timestamp cannot prove identity, so this is an insert
		assert_eq!(plan.to_add.len(), 1);
	}
}
