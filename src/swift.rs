use std::path::Path;

use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::file::{FileRecord, FileStatus};

/// Wikis whose production containers are sharded by a two-character suffix.
const BIG_WIKIS: [&str; 16] = [
	"commonswiki",
	"dewiki",
	"enwiki",
	"fiwiki",
	"frwiki",
	"hewiki",
	"huwiki",
	"idwiki",
	"itwiki",
	"jawiki",
	"rowiki",
	"ruwiki",
	"thwiki",
	"trwiki",
	"ukwiki",
	"zhwiki",
];

/// Wiki database suffix to container project name, checked in order.
const PROJECT_TYPES: [(&str, &str); 9] = [
	("wiki", "wikipedia"),
	("wikiquote", "wikiquote"),
	("wikibooks", "wikibooks"),
	("wikimedia", "wikimedia"),
	("wikisource", "wikisource"),
	("wikinews", "wikinews"),
	("wikiversity", "wikiversity"),
	("wikivoyage", "wikivoyage"),
	("wiktionary", "wiktionary"),
];

/// Characters left alone when percent-encoding a path, mirroring what the
/// production cache layer accepts (the `!` in archived names in particular
/// must be encoded exactly once).
pub(crate) const PATH_SEGMENTS: &AsciiSet = &NON_ALPHANUMERIC
	.remove(b'/')
	.remove(b'_')
	.remove(b'.')
	.remove(b'-')
	.remove(b'~');

pub(crate) fn encode_path(path: &str) -> String {
	utf8_percent_encode(path, PATH_SEGMENTS).to_string()
}

/// Whether the wiki's containers are sharded.
pub fn is_big_wiki(wiki: &str) -> bool {
	BIG_WIKIS.contains(&wiki)
}

/// The container name (without the shard suffix) for a wiki and file status.
///
/// Archived files live in the public containers. Returns `None` for a wiki
/// whose project cannot be derived from its suffix.
pub fn wiki_to_container(wiki: &str, status: FileStatus) -> Option<String> {
	let status = match status {
		FileStatus::Archived => FileStatus::Public,
		other => other,
	};
	for (suffix, project) in PROJECT_TYPES {
		if let Some(prefix) = wiki.strip_suffix(suffix) {
			return Some(format!(
				"{project}-{}-local-{status}",
				prefix.replace('_', "-"),
			));
		}
	}
	None
}

/// The wiki name (in dblist format) for a given container name.
pub fn container_to_wiki(container_name: &str) -> Option<String> {
	let mut container = container_name.split('.').next().unwrap_or(container_name);
	for postfix in ["-local-public", "-local-deleted"] {
		if let Some(stripped) = container.strip_suffix(postfix) {
			container = stripped;
			break;
		}
	}
	for (suffix, project) in PROJECT_TYPES {
		if let Some(rest) = container.strip_prefix(project) {
			let rest = rest.strip_prefix('-')?;
			return Some(format!("{}{suffix}", rest.replace('-', "_")));
		}
	}
	None
}

/// The actual container name (including the shard) and expected virtual path
/// for a file, given its title and its name as stored in production.
///
/// Yields `(container, None)` when the stored name is absent, and
/// `(None, None)` when the title is absent for a non-deleted file (a
/// metadata gap that sometimes happens for public rows).
pub fn name_to_swift(
	wiki: &str,
	status: FileStatus,
	title: Option<&str>,
	storage_name: Option<&str>,
) -> (Option<String>, Option<String>) {
	let title_md5 = if status == FileStatus::Deleted {
		None
	} else {
		match title {
			Some(title) => Some(hex::encode(Md5::digest(title.as_bytes()))),
			None => return (None, None),
		}
	};
	let Some(mut container) = wiki_to_container(wiki, status) else {
		return (None, None);
	};
	let storage_name = match storage_name {
		Some(name) if !name.is_empty() => name,
		_ => return (Some(container), None),
	};
	if is_big_wiki(wiki) {
		let shard: String = match &title_md5 {
			// deleted files shard by their stored (hash-derived) name
			None => storage_name.chars().take(2).collect(),
			Some(md5) => md5.chars().take(2).collect(),
		};
		container = format!("{container}.{shard}");
	}
	let path = match status {
		FileStatus::Public | FileStatus::Archived => {
			let md5 = title_md5.as_deref().unwrap_or_default();
			let prefix = if status == FileStatus::Archived {
				"archive/"
			} else {
				""
			};
			format!("{prefix}{}/{}/{storage_name}", &md5[..1], &md5[..2])
		}
		FileStatus::Deleted => {
			let mut chars = storage_name.chars();
			let (Some(s0), Some(s1), Some(s2)) = (chars.next(), chars.next(), chars.next()) else {
				return (Some(container), None);
			};
			format!("{s0}/{s1}/{s2}/{storage_name}")
		}
		FileStatus::HardDeleted => return (Some(container), None),
	};
	(Some(container), Some(path))
}

#[derive(Debug, Error)]
pub enum SwiftError {
	#[error("file has no storage container or path recorded")]
	MissingAddress,
	#[error("request for {url} failed")]
	Http {
		url: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("{url} answered HTTP {status}")]
	Status { url: String, status: u16 },
	#[error("could not write downloaded contents to {path}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

/// Thin download client for the production object store.
#[derive(Debug, Clone)]
pub struct SwiftClient {
	http: reqwest::Client,
	base_url: String,
}

impl SwiftClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			http: crate::http_client(),
			base_url: base_url.into().trim_end_matches('/').to_owned(),
		}
	}

	/// Download a file from production into the given local path, streaming
	/// to disk.
	#[instrument(skip(self, file), fields(file = %file))]
	pub async fn download(&self, file: &FileRecord, local_path: &Path) -> Result<(), SwiftError> {
		let (Some(container), Some(path)) = (&file.storage_container, &file.storage_path) else {
			return Err(SwiftError::MissingAddress);
		};
		let url = format!("{}/{container}/{}", self.base_url, encode_path(path));
		debug!(url, "downloading from production");

		let mut response = self
			.http
			.get(&url)
			.send()
			.await
			.map_err(|source| SwiftError::Http { url: url.clone(), source })?;
		if !response.status().is_success() {
			return Err(SwiftError::Status {
				url,
				status: response.status().as_u16(),
			});
		}

		let mut output = tokio::fs::File::create(local_path)
			.await
			.map_err(|source| SwiftError::Io {
				path: local_path.display().to_string(),
				source,
			})?;
		while let Some(chunk) = response
			.chunk()
			.await
			.map_err(|source| SwiftError::Http { url: url.clone(), source })?
		{
			output
				.write_all(&chunk)
				.await
				.map_err(|source| SwiftError::Io {
					path: local_path.display().to_string(),
					source,
				})?;
		}
		output.flush().await.map_err(|source| SwiftError::Io {
			path: local_path.display().to_string(),
			source,
		})?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn big_wikis_are_listed() {
		assert!(is_big_wiki("commonswiki"));
		assert!(is_big_wiki("enwiki"));
		assert!(!is_big_wiki("testwiki"));
	}

	#[test]
	fn containers_follow_the_project_map() {
		assert_eq!(
			wiki_to_container("commonswiki", FileStatus::Public).as_deref(),
			Some("wikipedia-commons-local-public")
		);
		// archived shares the public container
		assert_eq!(
			wiki_to_container("commonswiki", FileStatus::Archived).as_deref(),
			Some("wikipedia-commons-local-public")
		);
		assert_eq!(
			wiki_to_container("enwiktionary", FileStatus::Deleted).as_deref(),
			Some("wiktionary-en-local-deleted")
		);
		assert_eq!(
			wiki_to_container("zh_min_nanwiki", FileStatus::Public).as_deref(),
			Some("wikipedia-zh-min-nan-local-public")
		);
		assert_eq!(wiki_to_container("notaproject", FileStatus::Public), None);
	}

	#[test]
	fn containers_invert_back_to_wikis() {
		assert_eq!(
			container_to_wiki("wikipedia-commons-local-public.02").as_deref(),
			Some("commonswiki")
		);
		assert_eq!(
			container_to_wiki("wikipedia-zh-min-nan-local-public").as_deref(),
			Some("zh_min_nanwiki")
		);
		assert_eq!(
			container_to_wiki("wiktionary-en-local-deleted").as_deref(),
			Some("enwiktionary")
		);
		assert_eq!(container_to_wiki("garbage"), None);
	}

	#[test]
	fn public_paths_hash_the_title() {
		// md5("foo") = acbd18db4cc2f85cedef654fccc4a4d8
		let (container, path) = name_to_swift(
			"commonswiki",
			FileStatus::Public,
			Some("foo"),
			Some("foo"),
		);
		assert_eq!(container.as_deref(), Some("wikipedia-commons-local-public.ac"));
		assert_eq!(path.as_deref(), Some("a/ac/foo"));

		// small wikis are not sharded
		let (container, path) =
			name_to_swift("testwiki", FileStatus::Public, Some("foo"), Some("foo"));
		assert_eq!(container.as_deref(), Some("wikipedia-test-local-public"));
		assert_eq!(path.as_deref(), Some("a/ac/foo"));
	}

	#[test]
	fn archived_paths_carry_the_archive_prefix() {
		let (container, path) = name_to_swift(
			"testwiki",
			FileStatus::Archived,
			Some("foo"),
			Some("20221130132556!foo"),
		);
		assert_eq!(container.as_deref(), Some("wikipedia-test-local-public"));
		assert_eq!(path.as_deref(), Some("archive/a/ac/20221130132556!foo"));
	}

	#[test]
	fn deleted_paths_shard_by_stored_name() {
		let (container, path) = name_to_swift(
			"commonswiki",
			FileStatus::Deleted,
			None,
			Some("abc123.jpg"),
		);
		assert_eq!(
			container.as_deref(),
			Some("wikipedia-commons-local-deleted.ab")
		);
		assert_eq!(path.as_deref(), Some("a/b/c/abc123.jpg"));
	}

	#[test]
	fn metadata_gaps_degrade_gracefully() {
		// no stored name: container only
		let (container, path) =
			name_to_swift("commonswiki", FileStatus::Public, Some("foo"), None);
		assert_eq!(container.as_deref(), Some("wikipedia-commons-local-public"));
		assert_eq!(path, None);

		// no title for a public file: nothing to compute
		assert_eq!(
			name_to_swift("commonswiki", FileStatus::Public, None, Some("foo")),
			(None, None)
		);
	}

	#[test]
	fn paths_are_percent_encoded_once() {
		assert_eq!(
			encode_path("archive/a/ac/20221130132556!Test image.jpg"),
			"archive/a/ac/20221130132556%21Test%20image.jpg"
		);
	}
}
