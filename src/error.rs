use thiserror::Error;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model error: {0}")]
    Model(#[from] model::ModelError),

    #[error("Replicator error: {0}")]
    Replicator(#[from] replicator::ReplicatorError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MasterError>;
