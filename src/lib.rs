pub mod config;
pub mod error;
pub mod master;
pub mod remote;

pub use config::{MasterConfig, MediumDefinition, PeerCell};
pub use error::{MasterError, Result};
pub use master::Master;

// Re-export key types from workspace crates
pub use api;
pub use model;
pub use placement;
pub use replicator;
