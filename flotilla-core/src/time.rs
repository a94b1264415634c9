//! Deadline parsing for operator input.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

const WALL_CLOCK_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"];

/// Parse an operator-supplied deadline into UTC.
///
/// RFC3339 input is taken as-is. Anything else is read as a wall-clock time
/// ("2026-03-14 23:59", seconds optional) in `zone`, an IANA name. A time
/// that falls in a DST fold resolves to the earlier instant, which is the
/// stricter deadline; a time inside a DST gap does not exist and is
/// rejected.
pub fn parse_deadline(input: &str, zone: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let zone: Tz = zone
        .parse()
        .ok()
        .with_context(|| format!("{zone:?} is not an IANA timezone name"))?;
    let wall = WALL_CLOCK_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .with_context(|| {
            format!("deadline {input:?} is neither RFC3339 nor a wall-clock time like \"2026-03-14 23:59\"")
        })?;

    match zone.from_local_datetime(&wall) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            bail!("deadline {input:?} does not exist in {zone} (clocks skip it for DST)")
        }
    }
}
