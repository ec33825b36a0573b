use std::{
	fs::File,
	io::{self, Read},
	path::Path,
};

use num_bigint::BigUint;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Checksums are computed over fixed-size chunks so that multi-gigabyte video
/// files are never loaded into memory at once.
const CHUNK_SIZE: usize = 64 * 1024;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Streaming SHA-1 of a local file, as a lowercase hex string zero-padded to
/// 40 characters.
pub fn sha1sum(path: impl AsRef<Path>) -> io::Result<String> {
	let mut file = File::open(path)?;
	let mut hasher = Sha1::new();
	let mut chunk = vec![0u8; CHUNK_SIZE];
	loop {
		let read = file.read(&mut chunk)?;
		if read == 0 {
			break;
		}
		hasher.update(&chunk[..read]);
	}
	Ok(format!("{:0>40}", hex::encode(hasher.finalize())))
}

/// Streaming SHA-256 of a local file, as a lowercase hex string zero-padded to
/// 64 characters.
pub fn sha256sum(path: impl AsRef<Path>) -> io::Result<String> {
	let mut file = File::open(path)?;
	let mut hasher = Sha256::new();
	let mut chunk = vec![0u8; CHUNK_SIZE];
	loop {
		let read = file.read(&mut chunk)?;
		if read == 0 {
			break;
		}
		hasher.update(&chunk[..read]);
	}
	Ok(format!("{:0>64}", hex::encode(hasher.finalize())))
}

/// Convert a base-16 (hexadecimal) string to its base-36 representation, in
/// the MediaWiki style: lowercase, zero-filled to 31 characters.
///
/// Returns `None` when the input is not a valid hexadecimal string.
pub fn base16_to_base36(number: &str) -> Option<String> {
	let value = BigUint::parse_bytes(number.as_bytes(), 16)?;
	Some(format!("{:0>31}", to_radix36(&value)))
}

/// Convert a base-36 string to its base-16 (hexadecimal) representation, in
/// the MediaWiki style: lowercase, zero-filled to 40 characters.
///
/// Returns `None` when the input is not a valid base-36 string.
pub fn base36_to_base16(number: &str) -> Option<String> {
	let value = BigUint::parse_bytes(number.to_ascii_lowercase().as_bytes(), 36)?;
	Some(format!("{:0>40}", value.to_str_radix(16)))
}

fn to_radix36(value: &BigUint) -> String {
	// BigUint::to_str_radix already produces lowercase digits, but go through
	// the digit table so the alphabet is pinned in one place.
	value
		.to_radix_be(36)
		.into_iter()
		.map(|d| BASE36_DIGITS[d as usize] as char)
		.collect()
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn file_with(content: &[u8]) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(content).unwrap();
		file.flush().unwrap();
		file
	}

	#[test]
	fn sha1_of_known_contents() {
		let file = file_with(b"");
		assert_eq!(
			sha1sum(file.path()).unwrap(),
			"da39a3ee5e6b4b0d3255bfef95601890afd80709"
		);

		// a value with a leading zero, to exercise the zero-fill
		let file = file_with(b"hello2");
		assert_eq!(
			sha1sum(file.path()).unwrap(),
			"0f1defd5135596709273b3a1a07e466ea2bf4fff"
		);
	}

	#[test]
	fn sha256_of_known_contents() {
		let file = file_with(b"");
		assert_eq!(
			sha256sum(file.path()).unwrap(),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);

		let file = file_with(b"abc");
		assert_eq!(
			sha256sum(file.path()).unwrap(),
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}

	#[test]
	fn base16_to_base36_known_values() {
		for (hex, b36) in [
			("0", &"0".repeat(31)),
			("10", &"000000000000000000000000000000g".to_string()),
			(
				"2c5f4c5ff0e57ffcea85c1da92b4599336d75fb9",
				&"56le7dx4g21ssp3jyb0xc8a5vlk4fjt".to_string(),
			),
			(
				"1d93b4cfd2df055c77815f8efae13a131e2",
				&"00005j87okqh6okafuoz8j0aa2dj4de".to_string(),
			),
		] {
			assert_eq!(base16_to_base36(hex).unwrap(), *b36);
		}

		assert_eq!(base16_to_base36("not hex"), None);
	}

	#[test]
	fn base36_to_base16_known_values() {
		for (b36, hex) in [
			("0", &"0".repeat(40)),
			("z", &"0000000000000000000000000000000000000023".to_string()),
			(
				"56le7dx4g21ssp3jyb0xc8a5vlk4fjt",
				&"2c5f4c5ff0e57ffcea85c1da92b4599336d75fb9".to_string(),
			),
			(
				"5j87okqh6okafuoz8j0aa2dj4de",
				&"000001d93b4cfd2df055c77815f8efae13a131e2".to_string(),
			),
		] {
			assert_eq!(base36_to_base16(b36).unwrap(), *hex);
		}

		assert_eq!(base36_to_base16("no spaces allowed"), None);
	}

	#[test]
	fn base_conversion_round_trips() {
		for b36 in ["0", "z", "2toegxnxd", "56le7dx4g21ssp3jyb0xc8a5vlk4fjt"] {
			let hex = base36_to_base16(b36).unwrap();
			assert_eq!(base16_to_base36(&hex).unwrap(), format!("{b36:0>31}"));
		}
	}
}
