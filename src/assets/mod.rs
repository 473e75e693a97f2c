//! Asset records: the remote hosts hunts run against.

mod models;
mod repository;

pub use models::{Asset, CreateAssetRequest, OsType, PatchAssetRequest};
pub use repository::AssetRepository;
