use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRecord {
    pub id: i64,
    pub subscription_id: i64,
    pub recipient: String,
    pub subject: String,
    pub tracking_token: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub bounced: bool,
    pub bounce_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSendRecord {
    pub subscription_id: i64,
    pub recipient: String,
    pub subject: String,
    pub tracking_token: Option<String>,
}

/// Send/open/bounce counts over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Engagement {
    pub total_sends: usize,
    pub opens: usize,
    pub bounces: usize,
    pub last_open: Option<DateTime<Utc>>,
}
