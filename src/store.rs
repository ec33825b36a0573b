use std::path::Path;

use aws_credential_types::Credentials;
use aws_sdk_s3::{
	config::{BehaviorVersion, Region},
	primitives::ByteStream,
	Client,
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("no backup endpoints configured")]
	NoEndpoints,
	#[error("key '{0}' has no hexadecimal shard prefix")]
	BadShardKey(String),
	#[error("unknown backup endpoint '{0}'")]
	UnknownEndpoint(String),
	#[error("HEAD of '{key}' failed: {message}")]
	Head { key: String, message: String },
	#[error("upload of '{key}' failed: {message}")]
	Upload { key: String, message: String },
	#[error("download of '{key}' failed: {message}")]
	Download { key: String, message: String },
	#[error("deletion of '{key}' failed: {message}")]
	Delete { key: String, message: String },
	#[error("local file error for '{path}'")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

/// Content-addressed wrapper over the (sharded) S3-compatible backup storage.
///
/// One client is opened per configured endpoint; a file's shard is derived
/// from the first hexadecimal character of the last component of its key, so
/// with four endpoints keys starting `0`-`3` go to the first one, `4`-`7` to
/// the second, and so on. Nothing here retries: callers decide what a failure
/// means for the file's workflow state.
pub struct BackupStore {
	bucket: String,
	endpoints: Vec<String>,
	clients: Vec<Client>,
}

impl BackupStore {
	pub fn new(config: &StorageConfig) -> Result<Self, StoreError> {
		if config.endpoints.is_empty() {
			return Err(StoreError::NoEndpoints);
		}
		let credentials = Credentials::from_keys(
			config.access_key.clone(),
			config.secret_key.clone(),
			None,
		);
		let clients = config
			.endpoints
			.iter()
			.map(|endpoint| {
				let conf = aws_sdk_s3::config::Builder::new()
					.behavior_version(BehaviorVersion::latest())
					.region(Region::new(
						config.region.clone().unwrap_or_else(|| "default".into()),
					))
					.endpoint_url(endpoint)
					.credentials_provider(credentials.clone())
					.force_path_style(true)
					.build();
				Client::from_conf(conf)
			})
			.collect();
		Ok(Self {
			bucket: config.bucket.clone(),
			endpoints: config.endpoints.clone(),
			clients,
		})
	}

	/// The 1-based location id and client for a given key.
	fn find_shard(&self, key: &str) -> Result<(i64, &Client), StoreError> {
		let leaf = key.rsplit('/').next().unwrap_or(key);
		let first = leaf
			.chars()
			.next()
			.and_then(|c| c.to_digit(16))
			.ok_or_else(|| StoreError::BadShardKey(key.to_owned()))?;
		let shard = first as usize / self.clients.len();
		let client = self
			.clients
			.get(shard)
			.ok_or_else(|| StoreError::BadShardKey(key.to_owned()))?;
		Ok((shard as i64 + 1, client))
	}

	fn client_for(&self, endpoint: &str) -> Result<&Client, StoreError> {
		self.endpoints
			.iter()
			.position(|e| e == endpoint)
			.map(|i| &self.clients[i])
			.ok_or_else(|| StoreError::UnknownEndpoint(endpoint.to_owned()))
	}

	/// Whether an object already exists under the given key (on its computed
	/// shard, or on an explicit endpoint), regardless of contents.
	#[instrument(skip(self))]
	pub async fn exists(&self, key: &str, endpoint: Option<&str>) -> Result<bool, StoreError> {
		let client = match endpoint {
			Some(endpoint) => self.client_for(endpoint)?,
			None => self.find_shard(key)?.1,
		};
		match client
			.head_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
		{
			Ok(_) => Ok(true),
			Err(err) => {
				let service = err.into_service_error();
				if service.is_not_found() {
					Ok(false)
				} else {
					Err(StoreError::Head {
						key: key.to_owned(),
						message: service.to_string(),
					})
				}
			}
		}
	}

	/// Upload a local file under the given key, returning the 1-based id of
	/// the shard it went to.
	#[instrument(skip(self))]
	pub async fn put(&self, local_path: &Path, key: &str) -> Result<i64, StoreError> {
		let (location, client) = self.find_shard(key)?;
		let body = ByteStream::from_path(local_path)
			.await
			.map_err(|err| StoreError::Io {
				path: local_path.display().to_string(),
				source: std::io::Error::other(err),
			})?;
		debug!(location, "uploading to backup storage");
		client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(body)
			.send()
			.await
			.map_err(|err| StoreError::Upload {
				key: key.to_owned(),
				message: err.into_service_error().to_string(),
			})?;
		Ok(location)
	}

	/// Download the given key from a specific endpoint into a local file.
	#[instrument(skip(self))]
	pub async fn get(&self, endpoint: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
		let client = self.client_for(endpoint)?;
		let response = client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| StoreError::Download {
				key: key.to_owned(),
				message: err.into_service_error().to_string(),
			})?;
		let mut body = response.body.into_async_read();
		let mut file = tokio::fs::File::create(local_path)
			.await
			.map_err(|source| StoreError::Io {
				path: local_path.display().to_string(),
				source,
			})?;
		tokio::io::copy(&mut body, &mut file)
			.await
			.map_err(|source| StoreError::Io {
				path: local_path.display().to_string(),
				source,
			})?;
		Ok(())
	}

	/// Permanently remove the given key from a specific endpoint.
	#[instrument(skip(self))]
	pub async fn delete(&self, endpoint: &str, key: &str) -> Result<(), StoreError> {
		let client = self.client_for(endpoint)?;
		client
			.delete_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| StoreError::Delete {
				key: key.to_owned(),
				message: err.into_service_error().to_string(),
			})?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store_with_endpoints(count: usize) -> BackupStore {
		let config = StorageConfig {
			bucket: "mediabackups".into(),
			endpoints: (1..=count)
				.map(|i| format!("https://backup100{i}.example.org:9000"))
				.collect(),
			region: None,
			access_key: "key".into(),
			secret_key: "secret".into(),
			tmpdir: "/srv/mediabackup".into(),
			identity_file: "/etc/mediabackup/identity.txt".into(),
			swift_url: "https://ms-fe.example.org/v1/AUTH_mw".into(),
		};
		BackupStore::new(&config).unwrap()
	}

	#[test]
	fn shards_split_the_hex_space() {
		let store = store_with_endpoints(4);
		// first hex digit 0-3 -> location 1, 4-7 -> 2, 8-b -> 3, c-f -> 4
		for (leaf, location) in [
			("0aaa", 1),
			("3fff", 1),
			("4000", 2),
			("7e57", 2),
			("8123", 3),
			("beef", 3),
			("c0de", 4),
			("ffff", 4),
		] {
			let key = format!("enwiki/{}/{leaf}", &leaf[..3]);
			assert_eq!(store.find_shard(&key).unwrap().0, location, "{key}");
		}
	}

	#[test]
	fn shard_of_a_known_key() {
		let store = store_with_endpoints(4);
		let key = "enwiki/9f8/9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
		assert_eq!(store.find_shard(key).unwrap().0, 3);
	}

	#[test]
	fn non_hex_keys_are_rejected() {
		let store = store_with_endpoints(4);
		assert!(matches!(
			store.find_shard("enwiki/xyz/xyz"),
			Err(StoreError::BadShardKey(_))
		));
	}

	#[test]
	fn unknown_endpoints_are_rejected() {
		let store = store_with_endpoints(2);
		assert!(store.client_for("https://backup1001.example.org:9000").is_ok());
		assert!(matches!(
			store.client_for("https://elsewhere.example.org"),
			Err(StoreError::UnknownEndpoint(_))
		));
	}

	#[test]
	fn empty_endpoint_lists_are_refused() {
		let config = StorageConfig {
			bucket: "mediabackups".into(),
			endpoints: vec![],
			region: None,
			access_key: "key".into(),
			secret_key: "secret".into(),
			tmpdir: "/srv/mediabackup".into(),
			identity_file: "/etc/mediabackup/identity.txt".into(),
			swift_url: "https://ms-fe.example.org/v1/AUTH_mw".into(),
		};
		assert!(matches!(BackupStore::new(&config), Err(StoreError::NoEndpoints)));
	}
}
