//! Cross-module addressing laws: the production address computed for a file,
//! the public URL derived back from it, and the content-addressed backup key
//! with its shard must all agree.

use mediabackups::{
	file::FileStatus,
	metadata::search::swift_to_url,
	pipeline::backup_key,
	swift::{container_to_wiki, is_big_wiki, name_to_swift},
};

#[test]
fn computed_addresses_end_with_the_stored_name() {
	for (wiki, status, title, stored) in [
		("commonswiki", FileStatus::Public, Some("foo"), Some("foo")),
		(
			"testwiki",
			FileStatus::Archived,
			Some("foo"),
			Some("20221130132556!foo"),
		),
		("enwiki", FileStatus::Deleted, None, Some("abc123.jpg")),
	] {
		let (container, path) = name_to_swift(wiki, status, title, stored);
		let path = path.unwrap();
		assert!(
			path.ends_with(stored.unwrap()),
			"{wiki}/{status}: {path} should end with {}",
			stored.unwrap(),
		);
		assert!(container.is_some());
	}
}

#[test]
fn computed_containers_invert_to_their_wiki() {
	for wiki in ["commonswiki", "testwiki", "enwiktionary", "zh_min_nanwiki"] {
		for status in [FileStatus::Public, FileStatus::Deleted] {
			let (container, _) = name_to_swift(wiki, status, Some("foo"), Some("foo"));
			let container = container.unwrap();
			assert_eq!(
				container_to_wiki(&container).as_deref(),
				Some(wiki),
				"{container}",
			);
		}
	}
}

#[test]
fn sharded_containers_only_happen_on_big_wikis() {
	for wiki in ["commonswiki", "testwiki"] {
		let (container, _) = name_to_swift(wiki, FileStatus::Public, Some("foo"), Some("foo"));
		assert_eq!(container.unwrap().contains('.'), is_big_wiki(wiki));
	}
}

#[test]
fn production_urls_come_from_public_containers_only() {
	let (container, path) =
		name_to_swift("testwiki", FileStatus::Public, Some("foo"), Some("foo"));
	let url = swift_to_url("public", &container.unwrap(), &path.unwrap());
	assert_eq!(
		url.as_deref(),
		Some("https://upload.wikimedia.org/wikipedia/test/a/ac/foo")
	);

	let (container, path) =
		name_to_swift("testwiki", FileStatus::Deleted, None, Some("abc123.jpg"));
	assert_eq!(
		swift_to_url("deleted", &container.unwrap(), &path.unwrap()),
		None
	);
}

#[test]
fn backup_keys_for_a_known_digest() {
	let sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
	assert_eq!(
		backup_key("privatewiki", sha256, &["privatewiki".to_owned()]),
		format!("privatewiki/9f8/{sha256}.age"),
	);
	// the shard is decided by the first hex digit of the key's leaf, which is
	// the digest itself whether or not the `.age` extension is present
	let key = backup_key("enwiki", sha256, &[]);
	let leaf = key.rsplit('/').next().unwrap();
	assert!(leaf.starts_with('9'));
}
