pub mod history;
pub mod schedules;

pub use history::{HistoryEntry, JsonHistoryStore};
pub use schedules::ScheduleStore;
