use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::debug;

/// Directory holding the deployment configuration files.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/mediabackup";

pub const PRODUCTION_DB_CONFIG: &str = "mw_db.yaml";
pub const METADATA_DB_CONFIG: &str = "mediabackups_db.yaml";
pub const STORAGE_CONFIG: &str = "mediabackups_storage.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("configuration file {path} could not be read")]
	Unreadable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("configuration file {path} could not be parsed")]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},
	#[error("encountered a dblist expression inside dblist file {path}: {line}")]
	DblistExpression { path: PathBuf, line: String },
}

/// Connection and scan settings for the production (per-wiki) databases.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductionConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_mysql_port")]
	pub port: u16,
	#[serde(default)]
	pub socket: Option<PathBuf>,
	#[serde(default = "default_user")]
	pub user: String,
	#[serde(default)]
	pub password: String,
	/// Wiki to work on, for the single-wiki entry points (the incremental
	/// updater); the full scans iterate the dblists instead.
	#[serde(default)]
	pub wiki: Option<String>,
	#[serde(default = "default_scan_batchsize")]
	pub batchsize: usize,
	#[serde(default = "default_dblists_path")]
	pub dblists_path: PathBuf,
	#[serde(default)]
	pub sections: HashMap<String, SectionConfig>,
	/// Upstream log API endpoint, e.g. `https://commons.wikimedia.org/w/api.php`.
	#[serde(default)]
	pub api_url: Option<String>,
	/// Seconds to pause between polls of the upstream log API.
	#[serde(default = "default_api_wait", rename = "api-wait-time")]
	pub api_wait_time: u64,
	/// Seconds to pause between processed batches within one poll.
	#[serde(default = "default_batch_wait", rename = "batch-wait-time")]
	pub batch_wait_time: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SectionConfig {
	/// dblist file for the section; defaults to `<section>.dblist`.
	#[serde(default)]
	pub dblist: Option<String>,
}

impl ProductionConfig {
	/// All wikis named by the configured sections' dblist files, in
	/// configuration order.
	pub fn list_wikis(&self) -> Result<Vec<String>, ConfigError> {
		let mut wikis = Vec::new();
		for (section, properties) in &self.sections {
			let dblist = properties
				.dblist
				.clone()
				.unwrap_or_else(|| format!("{section}.dblist"));
			wikis.extend(read_dblist(&self.dblists_path.join(dblist))?);
		}
		Ok(wikis)
	}
}

/// Connection settings for the internal metadata database.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_mysql_port")]
	pub port: u16,
	#[serde(default)]
	pub socket: Option<PathBuf>,
	#[serde(default = "default_metadata_database")]
	pub database: String,
	#[serde(default = "default_user")]
	pub user: String,
	#[serde(default)]
	pub password: String,
	#[serde(default = "default_metadata_batchsize")]
	pub batchsize: usize,
}

/// Backup object store, temporary download space and encryption settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	#[serde(default = "default_bucket")]
	pub bucket: String,
	/// One S3-compatible endpoint URL per shard, in shard order.
	pub endpoints: Vec<String>,
	#[serde(default)]
	pub region: Option<String>,
	pub access_key: String,
	pub secret_key: String,
	/// Parent directory for the per-process download area. Deliberately not a
	/// system temp dir: it must be real disk, and large enough for several
	/// multi-gigabyte video files.
	#[serde(default = "default_tmpdir")]
	pub tmpdir: PathBuf,
	/// age identity file used to encrypt non-public wikis' files.
	pub identity_file: PathBuf,
	/// Base URL of the production object store, up to and including the
	/// account, e.g. `https://ms-fe.svc.eqiad.wmnet/v1/AUTH_mw`.
	pub swift_url: String,
}

fn default_host() -> String {
	"localhost".into()
}

fn default_mysql_port() -> u16 {
	3306
}

fn default_user() -> String {
	"root".into()
}

fn default_scan_batchsize() -> usize {
	crate::production::DEFAULT_BATCH_SIZE
}

fn default_metadata_batchsize() -> usize {
	crate::metadata::DEFAULT_BATCH_SIZE
}

fn default_metadata_database() -> String {
	"mediabackups".into()
}

fn default_dblists_path() -> PathBuf {
	"/srv/mediawiki-config/dblists".into()
}

fn default_bucket() -> String {
	"mediabackups".into()
}

fn default_tmpdir() -> PathBuf {
	"/srv/mediabackup".into()
}

fn default_api_wait() -> u64 {
	10
}

fn default_batch_wait() -> u64 {
	1
}

/// Resolve a configuration file name against the explicit `--config-dir`, the
/// system config directory, or the operator's home directory, in that order.
pub fn resolve(config_dir: Option<&Path>, name: &str) -> PathBuf {
	if let Some(dir) = config_dir {
		return dir.join(name);
	}
	let system = Path::new(DEFAULT_CONFIG_DIR).join(name);
	if system.exists() {
		return system;
	}
	dirs::home_dir()
		.map(|home| home.join(name))
		.unwrap_or(system)
}

/// Read and parse a YAML configuration file.
pub fn read_yaml_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
	debug!(path = %path.display(), "reading configuration");
	let content = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
		path: path.to_owned(),
		source,
	})?;
	serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
		path: path.to_owned(),
		source,
	})
}

/// Read a dblist file: one wiki per line, `#` starts a comment. Expression
/// files (`%%`-prefixed lines) must be expanded before deployment and are
/// rejected here.
pub fn read_dblist(path: &Path) -> Result<Vec<String>, ConfigError> {
	let content = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
		path: path.to_owned(),
		source,
	})?;
	let mut wikis = Vec::new();
	for line in content.lines() {
		let wiki = line.split('#').next().unwrap_or("").trim();
		if wiki.starts_with("%%") {
			return Err(ConfigError::DblistExpression {
				path: path.to_owned(),
				line: wiki.to_owned(),
			});
		}
		if !wiki.is_empty() {
			wikis.push(wiki.to_owned());
		}
	}
	Ok(wikis)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn dblist_with(content: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(content.as_bytes()).unwrap();
		file.flush().unwrap();
		file
	}

	#[test]
	fn dblists_strip_comments_and_blanks() {
		let file = dblist_with(
			"# list of wikis\n\
			 ## that are to be backed # up\n\
			 enwiki\n\
			 \t\n\n\n\
			 frwiki\n\
			 testwiki ## this is a production wiki!\n\n",
		);
		assert_eq!(
			read_dblist(file.path()).unwrap(),
			vec!["enwiki", "frwiki", "testwiki"]
		);
	}

	#[test]
	fn dblist_expressions_are_rejected() {
		let file = dblist_with("enwiki\n%%testwikilist\n");
		assert!(matches!(
			read_dblist(file.path()),
			Err(ConfigError::DblistExpression { .. })
		));
	}

	#[test]
	fn missing_dblist_is_an_error() {
		assert!(matches!(
			read_dblist(Path::new("/nonexistent/path.dblist")),
			Err(ConfigError::Unreadable { .. })
		));
	}

	#[test]
	fn metadata_config_parses_with_defaults() {
		let file = dblist_with(
			"host: db1001.eqiad.wmnet\n\
			 password: 'a_password'\n",
		);
		let config: MetadataConfig = read_yaml_config(file.path()).unwrap();
		assert_eq!(config.host, "db1001.eqiad.wmnet");
		assert_eq!(config.port, 3306);
		assert_eq!(config.database, "mediabackups");
		assert_eq!(config.batchsize, 1000);
	}

	#[test]
	fn invalid_yaml_is_a_parse_error() {
		let file = dblist_with(":");
		assert!(matches!(
			read_yaml_config::<MetadataConfig>(file.path()),
			Err(ConfigError::Parse { .. })
		));
	}
}
