//! Job execution: the scheduler claims pending jobs from the store and hands
//! each one to an [`Executor`].

pub mod executor;
pub mod scheduler;

pub use executor::{ArticleExecutor, ExecuteError, Executor};
pub use scheduler::{Scheduler, SchedulerSettings};
