//! Background scheduling: boundary-aligned price collection and cache sweeps.

pub mod collector;
pub mod jobs;
pub mod scheduler;
pub mod universe;

pub use collector::{CollectionScheduler, SchedulerState};
pub use jobs::collect_prices::CollectionStats;
pub use scheduler::{CronScheduler, CronSettings};
pub use universe::{TokenUniverse, WatchList};
