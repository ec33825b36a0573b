use std::{
	fmt,
	path::{Path, PathBuf},
	time::Duration,
};

use dialoguer::{Confirm, Input, Select};
use miette::{IntoDiagnostic, Result};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{
	dates::{parse_operator_date, WIKI_DATE_FORMAT},
	encryption::Encryption,
	hashes::{base16_to_base36, base36_to_base16},
	metadata::{
		search::{BackupSearch, BackupSearchRow},
		MetadataStore,
	},
	store::BackupStore,
};

pub const DEFAULT_WIKI: &str = "commonswiki";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// What an operator session is for; deletions get extra confirmation noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
	Query,
	Recovery,
	Deletion,
}

impl fmt::Display for QueryAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Query => "query",
			Self::Recovery => "recovery",
			Self::Deletion => "deletion",
		})
	}
}

/// Ask for the wiki, the identification method and its parameter, looping on
/// invalid input, and return the search to run.
pub async fn collect_search_interactively(
	metadata: &MetadataStore,
	action: QueryAction,
) -> Result<BackupSearch> {
	let wiki = loop {
		let wiki: String = Input::new()
			.with_prompt(format!("Wiki for {action} [default: {DEFAULT_WIKI}]"))
			.allow_empty(true)
			.interact_text()
			.into_diagnostic()?;
		let wiki = if wiki.is_empty() {
			DEFAULT_WIKI.to_owned()
		} else {
			wiki
		};
		match metadata.is_valid_wiki(&wiki).await {
			Ok(true) => break wiki,
			Ok(false) => {
				error!(wiki, "not a recognized wiki in the metadata database");
			}
			Err(err) => return Err(err).into_diagnostic(),
		}
	};

	let methods = [
		"Title of the file on upload (or after rename)",
		"sha1sum hash of the file contents, in hexadecimal",
		"sha1sum hash of the file contents, in base 36",
		"Original container name and full path as stored on Swift",
		"sha256sum hash of the file contents, in hexadecimal",
		"Exact date of the original file upload, as registered on the metadata",
		"Exact date of the latest file archival, as registered on the metadata",
		"Exact date of the latest file deletion, as registered on the metadata",
	];
	let choice = Select::new()
		.with_prompt(format!("Choose a method to identify the media file to {action}"))
		.items(&methods)
		.default(0)
		.interact()
		.into_diagnostic()?;

	Ok(match choice {
		0 => BackupSearch::Title {
			wiki,
			title: normalize_title(&prompt(
				"Title (spaces will be converted to underscores, first letter normally in uppercase)",
			)?),
		},
		1 => BackupSearch::Sha1 {
			wiki,
			sha1: format!("{:0>40}", prompt("Hexadecimal string (e.g. \"182dd70b9c\")")?),
		},
		2 => loop {
			let input = prompt("Base 36 string (e.g. \"2toegxnxd\")")?;
			match base36_to_base16(&input) {
				Some(sha1) => break BackupSearch::Sha1 { wiki, sha1 },
				None => error!(input, "not a valid base 36 string"),
			}
		},
		3 => BackupSearch::SwiftPath {
			wiki,
			container: prompt(
				"Name of the container (e.g.: \"wikipedia-commons-local-public.02\")",
			)?,
			path: prompt("File path within the container (e.g.: \"2/t/o/2toe.jpeg\")")?,
		},
		4 => BackupSearch::Sha256 {
			wiki,
			sha256: format!("{:0>64}", prompt("Hexadecimal string")?),
		},
		other => {
			let date = loop {
				let input = prompt("Date in format YYYY-MM-DD hh:mm:ss or YYYYMMDDhhmmss")?;
				match parse_operator_date(&input) {
					Some(date) => break date,
					None => error!(input, "not a valid date format"),
				}
			};
			match other {
				5 => BackupSearch::UploadDate { wiki, date },
				6 => BackupSearch::ArchiveDate { wiki, date },
				_ => BackupSearch::DeleteDate { wiki, date },
			}
		}
	})
}

fn prompt(message: &str) -> Result<String> {
	let value: String = Input::new()
		.with_prompt(message)
		.interact_text()
		.into_diagnostic()?;
	Ok(value.trim().to_owned())
}

/// Titles are stored underscored and without the `File:` namespace prefix.
pub fn normalize_title(title: &str) -> String {
	let title = title.trim().replace(' ', "_");
	title.strip_prefix("File:").unwrap_or(&title).to_owned()
}

/// Print the search results for operator examination.
pub fn print_files(files: &[BackupSearchRow]) {
	println!();
	println!("This is the list of {} files found with the given criteria:", files.len());
	for (i, file) in files.iter().enumerate() {
		println!();
		println!("{i})");
		for (key, value) in file.display_fields() {
			println!("{key:<20} | {value}");
		}
	}
	println!();
}

/// Ask the operator to confirm a recovery or deletion; `false` means abort.
pub fn confirm_action(action: QueryAction, count: usize) -> Result<bool> {
	Confirm::new()
		.with_prompt(format!("Confirm {action} of {count} file(s)?"))
		.default(false)
		.interact()
		.into_diagnostic()
}

/// Download the given backups into the current directory, naming each file
/// after its production basename and suffixing `~` rather than overwriting
/// anything already there. Per-file failures are logged and skipped.
#[instrument(skip_all, fields(files = files.len()))]
pub async fn recover_to_local(
	files: &[BackupSearchRow],
	store: &BackupStore,
	encryption: &Encryption,
) -> usize {
	info!(count = files.len(), "about to recover files");
	let mut recovered = 0;
	for file in files {
		let mut target = file
			.production_path
			.as_deref()
			.and_then(|p| p.rsplit('/').next())
			.filter(|name| !name.is_empty())
			.unwrap_or("unnamed_file")
			.to_owned();
		while Path::new(&target).exists() {
			target.push('~');
		}
		let backup_name = &file.backup_path;
		let backup_shard = &file.backup_location;
		info!(backup_name, backup_shard, target, "attempting to recover");

		match store.exists(backup_name, None).await {
			Ok(true) => {}
			Ok(false) => {
				error!(backup_name, backup_shard, "not found on the backup storage");
				continue;
			}
			Err(err) => {
				error!(backup_name, ?err, "could not check the backup storage");
				continue;
			}
		}

		// encrypted backups are downloaded next to the target and decrypted
		// into it; everything else lands on the target directly
		let encrypted = backup_name.ends_with(".age");
		let download_target = if encrypted {
			PathBuf::from(format!("{target}.age"))
		} else {
			PathBuf::from(&target)
		};
		if let Err(err) = store.get(backup_shard, backup_name, &download_target).await {
			error!(backup_name, backup_shard, target, ?err, "failed to be downloaded");
			continue;
		}
		info!(backup_name, backup_shard, target, "successfully downloaded");
		if encrypted {
			let result = encryption.decrypt(Path::new(&target));
			let _ = std::fs::remove_file(&download_target);
			if let Err(err) = result {
				error!(target, ?err, "decryption failed");
				continue;
			}
		}
		recovered += 1;
	}
	info!(
		recovered,
		total = files.len(),
		"files were successfully written to the local filesystem"
	);
	recovered
}

#[derive(Debug, Error)]
pub enum ProductionProbeError {
	#[error("querying {url} timed out after {} seconds", PROBE_TIMEOUT.as_secs())]
	Timeout { url: String },
	#[error("got an HTTP status code of {status} when querying {url} from production, expected a 404")]
	StillPublic { url: String, status: u16 },
	#[error("could not build the HTTP client")]
	Client(#[source] reqwest::Error),
}

/// The failsafe before any physical deletion: every file that has a public
/// production URL must already be gone (404) there. Anything else aborts the
/// whole session.
#[instrument(skip_all, fields(files = files.len()))]
pub async fn check_deleted_from_production(
	files: &[BackupSearchRow],
) -> Result<(), ProductionProbeError> {
	let client = reqwest::Client::builder()
		.user_agent(crate::USER_AGENT)
		.timeout(PROBE_TIMEOUT)
		.build()
		.map_err(ProductionProbeError::Client)?;
	for file in files {
		let Some(url) = &file.production_url else {
			continue;
		};
		let response = match client.head(url).send().await {
			Ok(response) => response,
			Err(err) if err.is_timeout() => {
				return Err(ProductionProbeError::Timeout { url: url.clone() });
			}
			Err(err) => {
				// an unreachable production host cannot prove absence
				warn!(url, ?err, "production probe failed");
				return Err(ProductionProbeError::StillPublic {
					url: url.clone(),
					status: 0,
				});
			}
		};
		if response.status().as_u16() != 404 {
			return Err(ProductionProbeError::StillPublic {
				url: url.clone(),
				status: response.status().as_u16(),
			});
		}
	}
	info!("all files were queried from production and none were found publicly available");
	Ok(())
}

/// Physically delete the given backups (unless dry-run), tolerating keys that
/// a previous file of the same batch with the same `(wiki, sha256)` already
/// removed. Returns the files actually (or, dry-run, notionally) deleted.
#[instrument(skip_all, fields(files = files.len(), dry_run))]
pub async fn delete_files(
	files: &[BackupSearchRow],
	store: &BackupStore,
	dry_run: bool,
) -> Vec<BackupSearchRow> {
	info!(count = files.len(), "about to delete files");
	let mut deleted: Vec<BackupSearchRow> = Vec::new();
	for file in files {
		let backup_name = &file.backup_path;
		let backup_shard = &file.backup_location;
		info!(backup_name, backup_shard, "attempting to delete");
		match store.exists(backup_name, None).await {
			Ok(true) => {}
			Ok(false) => {
				// the key may be gone because an earlier file of this batch
				// shared its storage
				if deleted
					.iter()
					.any(|d| d.wiki == file.wiki && d.sha256 == file.sha256)
				{
					info!(backup_name, "was a duplicate of a previous file and already deleted");
				} else {
					error!(backup_name, backup_shard, "not found on the backup storage");
					continue;
				}
			}
			Err(err) => {
				error!(backup_name, ?err, "could not check the backup storage");
				continue;
			}
		}
		if dry_run {
			warn!(
				backup_name,
				backup_shard,
				"not actually deleting because this is a dry run, but otherwise successful"
			);
		} else {
			if let Err(err) = store.delete(backup_shard, backup_name).await {
				error!(backup_name, backup_shard, ?err, "failed to be deleted");
				continue;
			}
			info!(backup_name, backup_shard, "successfully deleted");
		}
		deleted.push(file.clone());
	}
	info!(
		deleted = deleted.len(),
		total = files.len(),
		"files were successfully deleted from backup storage"
	);
	deleted
}

/// The outcome of resolving a deletion log: the backups found, plus the
/// tuples that matched nothing or more than one backup, for the summary.
#[derive(Debug, Default)]
pub struct ParsedDeletions {
	pub found: Vec<BackupSearchRow>,
	pub missing: Vec<String>,
	pub multiple: Vec<String>,
}

/// Resolve a maintenance deletion log into backups to remove. The log names
/// the wiki on `mwscript eraseArchivedFile.php --wiki=<x> … --delete` lines,
/// and each removed revision on
/// `Deleted version '<sha1base36>.<ext>' (<timestamp>) of file '<title>'`
/// lines that follow it.
#[instrument(skip(metadata))]
pub async fn parse_deletion_log(
	path: &Path,
	metadata: &MetadataStore,
) -> Result<ParsedDeletions> {
	let wiki_pattern = Regex::new(
		r#"mwscript\s+eraseArchivedFile\.php\s+--wiki\s*=?\s*["']?([a-zA-Z0-9\-_]+)["']?\s.*--delete"#,
	)
	.into_diagnostic()?;
	let deletion_pattern =
		Regex::new(r"Deleted\sversion\s'([a-z0-9]*)\..*'\s\(([0-9]{14})\)\sof\sfile\s'(.+)'")
			.into_diagnostic()?;

	let mut parsed = ParsedDeletions::default();
	let content = match std::fs::read_to_string(path) {
		Ok(content) => content,
		Err(err) => {
			error!(path = %path.display(), ?err, "could not read the deletion log");
			return Ok(parsed);
		}
	};

	let mut wiki: Option<String> = None;
	for line in content.lines() {
		if let Some(captures) = wiki_pattern.captures(line) {
			let candidate = captures[1].to_owned();
			if metadata.is_valid_wiki(&candidate).await.into_diagnostic()? {
				wiki = Some(candidate);
				continue;
			}
		}
		let Some(captures) = deletion_pattern.captures(line) else {
			continue;
		};
		let Some(wiki) = wiki.clone() else {
			continue;
		};
		let Some(sha1) = base36_to_base16(&captures[1]) else {
			error!(sha1 = &captures[1], "bad hash found on file");
			continue;
		};
		let Ok(date) = chrono::NaiveDateTime::parse_from_str(&captures[2], WIKI_DATE_FORMAT)
		else {
			error!(date = &captures[2], "bad date found on file");
			continue;
		};
		let title = captures[3].to_owned();
		let description = format!(
			"{wiki} {title} {} {}",
			date.format(WIKI_DATE_FORMAT),
			base16_to_base36(&sha1).unwrap_or_default(),
		);

		let found = metadata
			.query_backups(&BackupSearch::TitleUploadDateSha1 { wiki, title, date, sha1 })
			.await
			.into_diagnostic()?;
		match found.len() {
			0 => {
				warn!(file = description, "no files found");
				parsed.missing.push(description);
			}
			1 => parsed.found.extend(found),
			_ => {
				warn!(file = description, "multiple files found");
				parsed.found.extend(found);
				parsed.multiple.push(description);
			}
		}
	}
	Ok(parsed)
}

/// Recoveries and deletions only touch one datacenter's worth of data; the
/// operator has to repeat them on the other site.
pub fn datacenter_reminder(action: QueryAction) {
	println!(
		"Remember to perform the same {action} on the other datacenter too \
		 (only data from one site was affected for the current session!)."
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn titles_are_normalized() {
		assert_eq!(normalize_title("File:Test image.jpg"), "Test_image.jpg");
		assert_eq!(normalize_title("  Already_fine.png "), "Already_fine.png");
	}

	#[test]
	fn deletion_log_lines_match_the_patterns() {
		let wiki_pattern = Regex::new(
			r#"mwscript\s+eraseArchivedFile\.php\s+--wiki\s*=?\s*["']?([a-zA-Z0-9\-_]+)["']?\s.*--delete"#,
		)
		.unwrap();
		let captures = wiki_pattern
			.captures("$ mwscript eraseArchivedFile.php --wiki='testwiki' --filename x --delete")
			.unwrap();
		assert_eq!(&captures[1], "testwiki");

		let deletion_pattern =
			Regex::new(r"Deleted\sversion\s'([a-z0-9]*)\..*'\s\(([0-9]{14})\)\sof\sfile\s'(.+)'")
				.unwrap();
		let captures = deletion_pattern
			.captures("Deleted version '2toegxnxd.jpg' (20221130112556) of file 'Test.jpg'")
			.unwrap();
		assert_eq!(&captures[1], "2toegxnxd");
		assert_eq!(&captures[2], "20221130112556");
		assert_eq!(&captures[3], "Test.jpg");
	}
}
