use chrono::{DateTime, NaiveDateTime};

/// The 14-digit timestamp format used throughout the wiki databases and in
/// archived storage names, e.g. `20221130112556`.
pub const WIKI_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Parse a 14-digit wiki timestamp into a datetime.
///
/// Some very old rows carry truncated or garbage timestamps; those decode to
/// one second past the epoch rather than failing, so callers never have to
/// handle a parse error in the middle of a scan.
pub fn wiki_date_to_datetime(date: &str) -> NaiveDateTime {
	NaiveDateTime::parse_from_str(date, WIKI_DATE_FORMAT).unwrap_or_else(|_| {
		DateTime::from_timestamp(1, 0)
			.expect("one second past the epoch is representable")
			.naive_utc()
	})
}

/// Parse a date as typed by an operator: either `YYYY-MM-DD HH:MM:SS` or the
/// compact wiki form `YYYYMMDDHHMMSS`.
pub fn parse_operator_date(input: &str) -> Option<NaiveDateTime> {
	let input = input.trim();
	if input.contains('-') {
		NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S").ok()
	} else {
		NaiveDateTime::parse_from_str(input, WIKI_DATE_FORMAT).ok()
	}
}

#[cfg(test)]
mod tests {
	use chrono::{Datelike, Timelike};

	use super::*;

	#[test]
	fn wiki_dates_parse() {
		let date = wiki_date_to_datetime("20221130112556");
		assert_eq!(
			(date.year(), date.month(), date.day()),
			(2022, 11, 30)
		);
		assert_eq!((date.hour(), date.minute(), date.second()), (11, 25, 56));
	}

	#[test]
	fn malformed_wiki_dates_fall_back_to_epoch() {
		for garbage in ["", "not a date", "2022", "99999999999999"] {
			assert_eq!(
				wiki_date_to_datetime(garbage),
				DateTime::from_timestamp(1, 0).unwrap().naive_utc(),
			);
		}
	}

	#[test]
	fn operator_dates_accept_both_formats() {
		let expected = wiki_date_to_datetime("20221130112556");
		assert_eq!(parse_operator_date("2022-11-30 11:25:56"), Some(expected));
		assert_eq!(parse_operator_date("20221130112556"), Some(expected));
		assert_eq!(parse_operator_date("30/11/2022"), None);
	}
}
