//! UTC timestamp validation.
//!
//! Timestamps that cross a trust boundary (deserialized rows, request input,
//! purge cutoffs) must already be UTC. A naive timestamp is ambiguous and a
//! non-zero offset means the producer is not speaking UTC; both are rejected
//! rather than converted.

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::{DomainError, DomainResult};

/// Accept an offset-carrying timestamp only if its offset is exactly UTC.
pub fn ensure_utc(field: &str, ts: DateTime<FixedOffset>) -> DomainResult<DateTime<Utc>> {
    if ts.offset().local_minus_utc() != 0 {
        return Err(DomainError::validation(format!(
            "{field} must be UTC, got offset {}",
            ts.offset()
        )));
    }
    Ok(ts.with_timezone(&Utc))
}

/// Parse an RFC 3339 timestamp that must carry a UTC offset (`Z` or `+00:00`).
pub fn parse_utc(field: &str, raw: &str) -> DomainResult<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(raw).map_err(|e| {
        DomainError::validation(format!(
            "{field} must be a timezone-aware RFC 3339 timestamp: {e}"
        ))
    })?;
    ensure_utc(field, ts)
}
