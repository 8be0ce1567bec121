//! Timestamp directory names.
//!
//! Sessions are grouped under a directory named for their receipt time, either
//! `yyyyMMdd_HHmmss` or `yyyyMMdd_HHmmssSSS`. The two are told apart purely by
//! length: 18 characters means millisecond precision.

use chrono::{DateTime, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PrearcError, Result};

pub const SECOND_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const MILLISECOND_FORMAT: &str = "%Y%m%d_%H%M%S%3f";
const MILLISECOND_LEN: usize = 18;

static SECOND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{8}_\d{6}$").expect("valid timestamp regex"));
static MILLISECOND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{8}_\d{9}$").expect("valid timestamp regex"));

/// True when `name` looks like a timestamp directory at either precision.
pub fn is_timestamp_dir(name: &str) -> bool {
    SECOND_PATTERN.is_match(name) || MILLISECOND_PATTERN.is_match(name)
}

/// Parses a timestamp directory name.
pub fn parse_timestamp_dir(name: &str) -> Result<NaiveDateTime> {
    let format = if name.len() == MILLISECOND_LEN && MILLISECOND_PATTERN.is_match(name) {
        MILLISECOND_FORMAT
    } else if SECOND_PATTERN.is_match(name) {
        SECOND_FORMAT
    } else {
        return Err(PrearcError::InvalidTimestamp(name.to_string()));
    };

    NaiveDateTime::parse_from_str(name, format)
        .map_err(|_| PrearcError::InvalidTimestamp(name.to_string()))
}

/// Directory name for a session received at `at`, millisecond precision.
pub fn make_timestamp_dir<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(MILLISECOND_FORMAT).to_string()
}
