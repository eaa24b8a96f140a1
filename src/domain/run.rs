use serde::{Deserialize, Serialize};

/// Summary of one pipeline run, returned to manual callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_sources: usize,
    pub fetched: usize,
    pub failed: usize,
    pub new_items: usize,
    pub notification_sent: bool,
}

impl RunStats {
    pub fn all_failed(&self) -> bool {
        self.total_sources > 0 && self.fetched == 0
    }
}
