pub mod adamw;
pub mod schedule;

pub use adamw::{split_decay_groups, AdamWConfig, GroupStats, GroupedAdamW};
pub use schedule::CosineSchedule;
