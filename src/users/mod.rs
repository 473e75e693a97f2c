//! Analyst accounts.

mod models;
mod repository;

pub use models::{Role, User};
pub use repository::UserRepository;
