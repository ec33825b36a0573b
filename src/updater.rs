use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{production::RecentUpload, recovery::normalize_title};

pub const DEFAULT_API_URL: &str = "https://commons.wikimedia.org/w/api.php";

#[derive(Debug, Error)]
pub enum UpdaterError {
	#[error("request to the log API failed")]
	Api(#[source] reqwest::Error),
	#[error("the log API returned an error: {code}: {info}")]
	ApiError { code: String, info: String },
}

#[derive(Debug, Deserialize)]
struct LogEventsResponse {
	error: Option<ApiError>,
	warnings: Option<Value>,
	query: Option<LogEventsQuery>,
	#[serde(rename = "continue")]
	continuation: Option<HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
	code: String,
	info: String,
}

#[derive(Debug, Deserialize)]
struct LogEventsQuery {
	#[serde(default)]
	logevents: Vec<LogEvent>,
}

#[derive(Debug, Deserialize)]
struct LogEvent {
	title: Option<String>,
	params: Option<LogEventParams>,
}

#[derive(Debug, Deserialize)]
struct LogEventParams {
	img_sha1: Option<String>,
	img_timestamp: Option<String>,
}

/// Client for the upstream media-change log API, used to discover uploads
/// newer than the metadata's watermark without a full table scan.
#[derive(Debug, Clone)]
pub struct LogEventsClient {
	http: reqwest::Client,
	api_url: String,
}

impl LogEventsClient {
	pub fn new(api_url: Option<&str>) -> Self {
		Self {
			http: crate::http_client(),
			api_url: api_url.unwrap_or(DEFAULT_API_URL).to_owned(),
		}
	}

	/// All upload log events since the given instant, one `Vec` per API
	/// page, following `continue` tokens until exhausted.
	#[instrument(skip(self))]
	pub async fn uploads_since(
		&self,
		start: NaiveDateTime,
	) -> Result<Vec<Vec<RecentUpload>>, UpdaterError> {
		let mut pages = Vec::new();
		let mut continuation: HashMap<String, Value> = HashMap::new();
		let lestart = start.format("%Y-%m-%dT%H:%M:%S").to_string();
		loop {
			let mut request = self.http.get(&self.api_url).query(&[
				("action", "query"),
				("list", "logevents"),
				("letype", "upload"),
				("leprop", "title|timestamp|user|comment|details"),
				("format", "json"),
				("lestart", lestart.as_str()),
				("ledir", "newer"),
				("lelimit", "max"),
			]);
			for (key, value) in &continuation {
				let value = match value.as_str() {
					Some(s) => s.to_owned(),
					None => value.to_string(),
				};
				request = request.query(&[(key.as_str(), value.as_str())]);
			}
			let response: LogEventsResponse = request
				.send()
				.await
				.map_err(UpdaterError::Api)?
				.json()
				.await
				.map_err(UpdaterError::Api)?;

			if let Some(error) = response.error {
				return Err(UpdaterError::ApiError {
					code: error.code,
					info: error.info,
				});
			}
			if let Some(warnings) = response.warnings {
				warn!(?warnings, "the log API returned warnings");
			}
			if let Some(query) = response.query {
				debug!(events = query.logevents.len(), "received a page of log events");
				pages.push(query.logevents.iter().map(format_api_result).collect());
			}
			match response.continuation {
				Some(next) => continuation = next,
				None => break,
			}
		}
		Ok(pages)
	}
}

/// Flatten one log event into the tuple the production lookup needs.
fn format_api_result(event: &LogEvent) -> RecentUpload {
	let title = normalize_title(event.title.as_deref().unwrap_or(""));
	let (sha1, upload_timestamp) = match &event.params {
		Some(params) => (
			params.img_sha1.clone(),
			params.img_timestamp.as_deref().and_then(|ts| {
				NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%SZ").ok()
			}),
		),
		None => (None, None),
	};
	RecentUpload {
		title,
		sha1,
		upload_timestamp,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn api_results_flatten_into_upload_tuples() {
		let event: LogEvent = serde_json::from_value(serde_json::json!({
			"title": "File:Test image.jpg",
			"params": {
				"img_sha1": "2toegxnxd",
				"img_timestamp": "2022-11-30T11:25:56Z",
			},
		}))
		.unwrap();
		let upload = format_api_result(&event);
		assert_eq!(upload.title, "Test_image.jpg");
		assert_eq!(upload.sha1.as_deref(), Some("2toegxnxd"));
		assert_eq!(
			upload.upload_timestamp,
			Some(crate::dates::wiki_date_to_datetime("20221130112556"))
		);
	}

	#[test]
	fn events_without_params_still_parse() {
		let event: LogEvent =
			serde_json::from_value(serde_json::json!({ "title": "File:X.png" })).unwrap();
		let upload = format_api_result(&event);
		assert_eq!(upload.title, "X.png");
		assert_eq!(upload.sha1, None);
		assert_eq!(upload.upload_timestamp, None);
	}

	#[test]
	fn responses_deserialize_with_continuation() {
		let response: LogEventsResponse = serde_json::from_value(serde_json::json!({
			"query": { "logevents": [] },
			"continue": { "lecontinue": "20221130112556|123", "continue": "-||" },
		}))
		.unwrap();
		assert!(response.error.is_none());
		assert!(response.warnings.is_none());
		assert_eq!(response.query.unwrap().logevents.len(), 0);
		assert_eq!(response.continuation.unwrap().len(), 2);
	}
}
