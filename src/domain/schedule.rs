use std::str::FromStr;

use chrono::{DateTime, Utc};
use croner::Cron;

use crate::app::{FeedpostError, Result};

/// Next cron occurrence strictly after `after`.
///
/// Runs are always rescheduled from the completion time rather than from the
/// previous `next_run`, so a long outage produces one catch-up run instead of
/// a burst of back-to-back runs.
pub fn next_run_after(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::from_str(cron_expr).map_err(|e| FeedpostError::Cron {
        expr: cron_expr.to_string(),
        reason: e.to_string(),
    })?;

    cron.find_next_occurrence(&after, false)
        .map_err(|e| FeedpostError::Cron {
            expr: cron_expr.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_run_is_after_reference() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap();
        let next = next_run_after("0 8 * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_excludes_exact_match() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let next = next_run_after("0 8 * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression() {
        let err = next_run_after("not a cron", Utc::now()).unwrap_err();
        assert!(matches!(err, FeedpostError::Cron { .. }));
    }
}
