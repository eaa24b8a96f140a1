pub mod item;
pub mod log;
pub mod run;
pub mod schedule;
pub mod send;
pub mod source;
pub mod subscription;

pub use item::{FetchedItem, SeenItem};
pub use log::{LogEntry, LogLevel};
pub use run::RunStats;
pub use schedule::next_run_after;
pub use send::{Engagement, NewSendRecord, SendRecord};
pub use source::{CacheValidators, NewSource, Source};
pub use subscription::{NewSubscription, ScheduleState, Subscription};
