//! Commit-with-confirmation for connection sharing.

pub mod manager;
pub mod model;
pub mod store;
pub mod timer;

pub use manager::{ManagerOptions, SharingManager};
pub use model::{ConfirmOutcome, SharingConfig, SharingState, SharingStatus};
pub use store::{ConfigStore, JsonFileStore};
