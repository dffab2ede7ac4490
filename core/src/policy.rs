//! Business policy knobs shared by hosting and participation flows.

use crate::error::{LifecycleError, Result};
use crate::matches::MatchDraft;
use chrono::{DateTime, Duration, Utc};

/// Time windows and capacity bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Cancellations are rejected once less than this remains before start.
    pub cancel_deadline: Duration,
    /// How long after cancelling a host may reactivate.
    pub reactivate_window: Duration,
    /// Smallest allowed capacity.
    pub min_capacity: u32,
    /// Largest allowed capacity.
    pub max_capacity: u32,
    /// Earliest start relative to creation.
    pub min_lead_time: Duration,
    /// Latest match date relative to creation.
    pub max_days_ahead: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            cancel_deadline: Duration::hours(2),
            reactivate_window: Duration::hours(1),
            min_capacity: 4,
            max_capacity: 20,
            min_lead_time: Duration::hours(1),
            max_days_ahead: 14,
        }
    }
}

impl LifecyclePolicy {
    /// Check a capacity against the allowed bounds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidMatch`] outside `min_capacity..=max_capacity`.
    pub fn validate_capacity(&self, capacity: u32) -> Result<()> {
        if (self.min_capacity..=self.max_capacity).contains(&capacity) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidMatch(format!(
                "capacity {capacity} outside {}..={}",
                self.min_capacity, self.max_capacity
            )))
        }
    }

    /// Validate a new match against capacity and scheduling bounds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidMatch`] describing the first violated rule.
    pub fn validate_draft(&self, draft: &MatchDraft, now: DateTime<Utc>) -> Result<()> {
        self.validate_capacity(draft.max_participants)?;
        if draft.schedule.start_at() < now + self.min_lead_time {
            return Err(LifecycleError::InvalidMatch(format!(
                "match must start at least {} minutes from now",
                self.min_lead_time.num_minutes()
            )));
        }
        let horizon = now.date_naive() + Duration::days(self.max_days_ahead);
        if draft.schedule.date() > horizon {
            return Err(LifecycleError::InvalidMatch(format!(
                "match date must be within {} days",
                self.max_days_ahead
            )));
        }
        if draft.title.trim().is_empty() {
            return Err(LifecycleError::InvalidMatch("title is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ids::UserId;
    use crate::matches::{GeoPoint, MatchSchedule};
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn draft(day: u32, hour: u32, capacity: u32) -> MatchDraft {
        MatchDraft {
            host_id: UserId::new(),
            title: "Pickup".to_string(),
            description: String::new(),
            address: "Gym".to_string(),
            location: GeoPoint::new(0.0, 0.0).unwrap(),
            schedule: MatchSchedule::new(
                NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
                NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(hour + 2, 0, 0).unwrap(),
            )
            .unwrap(),
            max_participants: capacity,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn accepts_reasonable_draft() {
        assert!(LifecyclePolicy::default().validate_draft(&draft(3, 18, 10), now()).is_ok());
    }

    #[test]
    fn rejects_capacity_out_of_bounds() {
        let policy = LifecyclePolicy::default();
        assert!(policy.validate_draft(&draft(3, 18, 3), now()).is_err());
        assert!(policy.validate_draft(&draft(3, 18, 21), now()).is_err());
        assert!(policy.validate_draft(&draft(3, 18, 4), now()).is_ok());
    }

    #[test]
    fn rejects_too_soon_and_too_far() {
        let policy = LifecyclePolicy::default();
        assert!(policy.validate_draft(&draft(1, 12, 8), now()).is_err());
        assert!(policy.validate_draft(&draft(16, 12, 8), now()).is_err());
        assert!(policy.validate_draft(&draft(15, 12, 8), now()).is_ok());
    }
}
