use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum EncryptionError {
	#[error("could not run the age encryption tool")]
	Spawn(#[source] std::io::Error),
	#[error("the age encryption tool exited with status {0}")]
	ExitStatus(i32),
}

/// Encryption and decryption of private wikis' files, by handing them to the
/// external `age` tool with a deployment-wide identity file.
#[derive(Debug, Clone)]
pub struct Encryption {
	identity_file: PathBuf,
}

impl Encryption {
	pub fn new(identity_file: impl Into<PathBuf>) -> Self {
		Self {
			identity_file: identity_file.into(),
		}
	}

	/// Encrypt a local file, producing a sibling named the same plus `.age`.
	#[instrument(skip(self))]
	pub fn encrypt(&self, original: &Path) -> Result<PathBuf, EncryptionError> {
		let mut encrypted = original.as_os_str().to_owned();
		encrypted.push(".age");
		let encrypted = PathBuf::from(encrypted);
		debug!(output = %encrypted.display(), "encrypting");
		let output = duct::cmd!(
			"age",
			"--encrypt",
			"--identity",
			&self.identity_file,
			"--output",
			&encrypted,
			original,
		)
		.unchecked()
		.run()
		.map_err(EncryptionError::Spawn)?;
		match output.status.code() {
			Some(0) => Ok(encrypted),
			code => Err(EncryptionError::ExitStatus(code.unwrap_or(-1))),
		}
	}

	/// Decrypt `<target>.age` into the given target file. The argument names
	/// the file to be produced, not the input.
	#[instrument(skip(self))]
	pub fn decrypt(&self, target: &Path) -> Result<(), EncryptionError> {
		let mut encrypted = target.as_os_str().to_owned();
		encrypted.push(".age");
		debug!(input = %PathBuf::from(&encrypted).display(), "decrypting");
		let output = duct::cmd!(
			"age",
			"--decrypt",
			"--identity",
			&self.identity_file,
			"--output",
			target,
			&encrypted,
		)
		.unchecked()
		.run()
		.map_err(EncryptionError::Spawn)?;
		match output.status.code() {
			Some(0) => Ok(()),
			code => Err(EncryptionError::ExitStatus(code.unwrap_or(-1))),
		}
	}
}
