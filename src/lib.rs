#![deny(rust_2018_idioms)]

pub use crate::actions::run;
pub use crate::args::get_args as args;

pub(crate) mod actions;
pub(crate) mod args;

pub mod config;
pub mod dates;
pub mod encryption;
pub mod file;
pub mod hashes;
pub mod metadata;
pub mod pipeline;
pub mod production;
pub mod recovery;
pub mod store;
pub mod swift;
pub mod updater;

#[allow(dead_code)] // some subcommands don't use it, but it's easier to have it everywhere
pub(crate) const APP_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// User agent sent on every HTTP request to production and upstream APIs.
pub(crate) const USER_AGENT: &str = concat!(
	"mediabackups/",
	env!("CARGO_PKG_VERSION"),
	" (media backups tooling)",
);

pub(crate) fn http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.build()
		.expect("default HTTP client configuration is buildable")
}
