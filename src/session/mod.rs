//! Match session lifecycle
//!
//! `instance` holds the pure transition rules, `manager` applies them
//! transactionally and `scheduler` drives time-based advancement.

pub mod instance;
pub mod manager;
pub mod matching;
pub mod scheduler;
pub mod seed;

pub use manager::{validate_name, SessionManager, TickReport};
pub use matching::{Matchmaker, RandomMatchmaker};
pub use scheduler::{Scheduler, SchedulerConfig, TickResult};
pub use seed::{GeneratedSeed, SeedGenerator, UnpatchedSeedGenerator};
