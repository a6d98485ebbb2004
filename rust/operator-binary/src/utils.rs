use std::fmt::Write as _; // import without risk of name clashing
use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use openssl::asn1::{Asn1Time, Asn1TimeRef, TimeDiff};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{self, FixedOffset, TimeZone, Utc},
};
use time::OffsetDateTime;

/// Combines the messages of an error and its sources into a [`String`] of the form `"error: source 1: source 2: root error"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    // Build the full hierarchy of error messages by walking up the stack until an error
    // without `source` set is encountered and concatenating all encountered error strings.
    let mut full_msg = format!("{}", err);
    let mut curr_err = err.source();
    while let Some(curr_source) = curr_err {
        let _ = write!(full_msg, ": {}", curr_source);
        curr_err = curr_source.source();
    }
    full_msg
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeParseError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("unable to parse as OffsetDateTime"))]
    Parse { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// Converts an OpenSSL [`Asn1TimeRef`] into a Rustier [`OffsetDateTime`].
pub fn asn1time_to_offsetdatetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeParseError> {
    use asn1_time_parse_error::*;
    const SECS_PER_DAY: i64 = 60 * 60 * 24;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    OffsetDateTime::from_unix_timestamp(
        i64::from(days)
            .checked_mul(SECS_PER_DAY)
            .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
            .context(OverflowSnafu)?,
    )
    .context(ParseSnafu)
}

#[derive(Snafu, Debug)]
#[snafu(module)]
pub enum DateTimeOutOfBoundsError {
    #[snafu(display("datetime is invalid"))]
    DateTime,

    #[snafu(display("time zone is out of bounds"))]
    TimeZone,
}

pub fn time_datetime_to_chrono(
    dt: OffsetDateTime,
) -> Result<chrono::DateTime<FixedOffset>, DateTimeOutOfBoundsError> {
    let tz = chrono::FixedOffset::east_opt(dt.offset().whole_seconds())
        .context(date_time_out_of_bounds_error::TimeZoneSnafu)?;
    tz.timestamp_opt(dt.unix_timestamp(), dt.nanosecond())
        .earliest()
        .context(date_time_out_of_bounds_error::DateTimeSnafu)
}

/// Converts a timestamp into the Kubernetes API representation (always in UTC).
pub fn offsetdatetime_to_k8s_time(dt: OffsetDateTime) -> Result<Time, DateTimeOutOfBoundsError> {
    Ok(Time(time_datetime_to_chrono(dt)?.with_timezone(&Utc)))
}

/// Source of the current time for reconciliation decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Wrapper for (mostly) secret values that should not be logged.
// When/if migrating to Valuable, provide a dummy implementation of Value too
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Unloggable<T>(pub T);

impl<T> Debug for Unloggable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Deref for Unloggable<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Unloggable<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
