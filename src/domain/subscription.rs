use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inline content is forced off above this many new items unless the
/// subscription says otherwise.
pub const DEFAULT_INLINE_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    /// Owning subscriber handle; also the dashboard path segment.
    pub subscriber: String,
    pub name: String,
    pub recipient: String,
    pub cron_expr: String,
    pub inline_content: bool,
    pub inline_threshold: usize,
    pub last_run: Option<DateTime<Utc>>,
    /// `None` means the subscription is paused and never selected as due.
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_engagement_at: Option<DateTime<Utc>>,
}

/// Scheduling state derived from `next_run`. It is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Pending,
    Due,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.next_run.is_some()
    }

    pub fn state(&self, now: DateTime<Utc>) -> ScheduleState {
        match self.next_run {
            None => ScheduleState::Unscheduled,
            Some(next) if next <= now => ScheduleState::Due,
            Some(_) => ScheduleState::Pending,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.recipient
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscriber: String,
    pub name: String,
    pub recipient: String,
    pub cron_expr: String,
    pub inline_content: bool,
    pub inline_threshold: usize,
    pub next_run: Option<DateTime<Utc>>,
}

impl NewSubscription {
    pub fn new(subscriber: &str, recipient: &str, cron_expr: &str) -> Self {
        Self {
            subscriber: subscriber.to_string(),
            name: String::new(),
            recipient: recipient.to_string(),
            cron_expr: cron_expr.to_string(),
            inline_content: false,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            next_run: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription(next_run: Option<DateTime<Utc>>) -> Subscription {
        Subscription {
            id: 1,
            subscriber: "alice".into(),
            name: String::new(),
            recipient: "alice@example.com".into(),
            cron_expr: "0 8 * * *".into(),
            inline_content: false,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            last_run: None,
            next_run,
            created_at: Utc::now(),
            last_engagement_at: None,
        }
    }

    #[test]
    fn test_state_transitions_follow_next_run() {
        let now = Utc::now();
        assert_eq!(subscription(None).state(now), ScheduleState::Unscheduled);
        assert_eq!(
            subscription(Some(now + Duration::minutes(5))).state(now),
            ScheduleState::Pending
        );
        assert_eq!(subscription(Some(now)).state(now), ScheduleState::Due);
        assert_eq!(
            subscription(Some(now - Duration::hours(1))).state(now),
            ScheduleState::Due
        );
    }

    #[test]
    fn test_display_name_falls_back_to_recipient() {
        let mut sub = subscription(None);
        assert_eq!(sub.display_name(), "alice@example.com");
        sub.name = "morning.txt".into();
        assert_eq!(sub.display_name(), "morning.txt");
    }
}
