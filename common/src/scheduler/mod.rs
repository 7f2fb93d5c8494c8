// Scheduler module for due-job detection and launching

pub mod engine;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine};
