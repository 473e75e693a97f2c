//! Hunt modules and the step scheduler.

pub mod loader;
mod models;
mod repository;
pub mod scheduler;

pub use loader::ModuleRegistry;
pub use models::{HuntModule, HuntRecord, HuntStatus, HuntStep, Observation, StartHuntRequest};
pub use repository::HuntRepository;
pub use scheduler::{HuntScheduler, SchedulerError, StepExecutor};
